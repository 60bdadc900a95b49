//! # Separate Encoder
//!
//! Hierarchical encoder for multivariate time series. Each layer cuts the
//! sequence into fixed-size blocks, splits every block into its mean and its
//! deviation from that mean, transforms both with attention, shrinks the time
//! axis by a separation factor and fuses neighbouring blocks through a
//! weighted cross-correlation. The shortened mean path feeds the next layer.
//!
//! ## Modules
//!
//! - `model` - Encoder, block layers, attention and correlation primitives
//! - `data` - Synthetic seasonal series for demos and benchmarks
//! - `error` - Error type shared by the crate
//!
//! ## Example
//!
//! ```
//! use ndarray::Array3;
//! use separate_encoder::{EncoderConfig, HierarchicalEncoder};
//!
//! let config = EncoderConfig {
//!     d_model: 8,
//!     n_heads: 2,
//!     ..Default::default()
//! };
//! let encoder = HierarchicalEncoder::new(config).unwrap();
//!
//! // 192 = 8 blocks of 24 steps
//! let x = Array3::from_elem((2, 192, 8), 0.5);
//! let (output, layers) = encoder.forward(&x, None).unwrap().into_parts();
//!
//! assert_eq!(output.dim(), (2, 32, 8));
//! assert_eq!(layers[0].dim(), (2, 64, 8));
//! ```

pub mod data;
pub mod error;
pub mod model;

pub use data::synthetic_sequence;
pub use error::{EncoderError, Result};
pub use model::{
    Attention, AttentionMask, AttentionWeights, BlockPath, BlockTransformLayer,
    CrossCorrelation, EncoderConfig, EncoderOutput, FullAttention, HierarchicalEncoder,
    LayerPlan, LayerSpec, MovingAverage, Precision, SeriesDecomposition, TimeDelayCorrelation,
    TradeOff, TradeOffSharing,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default settings
pub mod defaults {
    /// Model width (channels)
    pub const D_MODEL: usize = 512;

    /// Number of attention heads
    pub const N_HEADS: usize = 8;

    /// Number of encoder layers
    pub const N_LAYERS: usize = 2;

    /// Block length per layer
    pub const STEPS: [usize; 3] = [24, 8, 4];

    /// Time reduction per layer
    pub const SEPARATE_FACTORS: [usize; 2] = [3, 2];

    /// Dropout rate
    pub const DROPOUT: f64 = 0.01;

    /// Top-k lag factor for time delay correlation (k = factor * ln L)
    pub const CORRELATION_FACTOR: f64 = 1.0;

    /// Moving average kernel for series decomposition
    pub const DECOMPOSITION_KERNEL: usize = 25;
}
