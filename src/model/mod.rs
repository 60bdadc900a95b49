//! Separate encoder model
//!
//! - `config` - Configuration and layer shape plans
//! - `layers` - Linear, dropout and activation helpers
//! - `attention` - Attention trait and multi-head full attention
//! - `correlation` - Cross-correlation trait and FFT time delay correlation
//! - `decomposition` - Moving average and series decomposition
//! - `block` - Block transform layer
//! - `encoder` - Hierarchical separate encoder

pub mod attention;
pub mod block;
pub mod config;
pub mod correlation;
pub mod decomposition;
pub mod encoder;
pub mod layers;

pub use attention::{Attention, AttentionMask, AttentionWeights, FullAttention};
pub use block::BlockTransformLayer;
pub use config::{EncoderConfig, LayerPlan, LayerSpec, Precision, TradeOffSharing};
pub use correlation::{CrossCorrelation, TimeDelayCorrelation};
pub use decomposition::{MovingAverage, SeriesDecomposition};
pub use encoder::{BlockPath, EncoderOutput, HierarchicalEncoder, TradeOff};
pub use layers::{Dropout, Linear};
