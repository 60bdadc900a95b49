//! Encoder configuration
//!
//! Holds the block schedule (step and separation factor per layer) together
//! with the attention, correlation and trade-off settings.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{EncoderError, Result};

/// How trade-off weights are shared between layers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeOffSharing {
    /// One (mean, deviation) pair used by every layer
    #[default]
    Shared,
    /// An independent pair for each layer
    PerLayer,
}

/// Floating point precision requested for the numeric backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Float64,
    Float32,
    Float16,
}

/// Configuration of the hierarchical separate encoder
///
/// # Example
///
/// ```
/// use separate_encoder::EncoderConfig;
///
/// let config = EncoderConfig {
///     d_model: 64,
///     n_heads: 4,
///     ..Default::default()
/// };
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.output_len(192).unwrap(), 32);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Channel width of the sequence
    pub d_model: usize,
    /// Number of attention heads
    pub n_heads: usize,
    /// Number of encoder layers
    pub n_layers: usize,
    /// Block length for each layer (may list more entries than layers)
    pub steps: Vec<usize>,
    /// Time reduction factor for each layer
    pub separate_factors: Vec<usize>,
    /// Dropout rate for residual, projection and attention dropout
    pub dropout: f64,
    /// Interleave heads when merging attention output
    pub mix: bool,
    /// Apply a triangular causal mask inside every block
    pub causal: bool,
    /// Top-k lag factor for the time delay correlation
    pub correlation_factor: f64,
    /// Trade-off sharing policy
    pub trade_off_sharing: TradeOffSharing,
    /// Initial value of every trade-off weight
    pub trade_off_init: f64,
    /// Kernel of the series decomposition moving average
    pub decomposition_kernel: usize,
    /// Numeric precision
    pub precision: Precision,
    /// Seed for parameter initialisation
    pub seed: Option<u64>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            d_model: defaults::D_MODEL,
            n_heads: defaults::N_HEADS,
            n_layers: defaults::N_LAYERS,
            steps: defaults::STEPS.to_vec(),
            separate_factors: defaults::SEPARATE_FACTORS.to_vec(),
            dropout: defaults::DROPOUT,
            mix: false,
            causal: false,
            correlation_factor: defaults::CORRELATION_FACTOR,
            trade_off_sharing: TradeOffSharing::Shared,
            trade_off_init: 0.0,
            decomposition_kernel: defaults::DECOMPOSITION_KERNEL,
            precision: Precision::Float64,
            seed: None,
        }
    }
}

/// Static description of one encoder layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpec {
    /// Layer index
    pub index: usize,
    /// Input block length
    pub step: usize,
    /// Time reduction factor
    pub separate_factor: usize,
    /// Output block length (`step / separate_factor`)
    pub output_step: usize,
}

/// Shape bookkeeping of one layer for a concrete input length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerPlan {
    pub layer: usize,
    /// Sequence length entering the layer
    pub input_len: usize,
    pub step: usize,
    /// Number of full blocks
    pub block_count: usize,
    /// Trailing time steps that fall outside the last full block
    pub dropped: usize,
    pub output_step: usize,
    /// Sequence length leaving the layer
    pub output_len: usize,
}

impl EncoderConfig {
    /// Creates a configuration with default parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Small model for tests and demos
    pub fn small() -> Self {
        Self {
            d_model: 16,
            n_heads: 2,
            ..Default::default()
        }
    }

    /// Parses a JSON configuration; missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 {
            return Err(EncoderError::InvalidConfig("d_model must be > 0".to_string()));
        }

        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(EncoderError::InvalidConfig(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            )));
        }

        if self.n_layers == 0 {
            return Err(EncoderError::InvalidConfig("n_layers must be > 0".to_string()));
        }

        if self.steps.len() < self.n_layers || self.separate_factors.len() < self.n_layers {
            return Err(EncoderError::InvalidConfig(format!(
                "{} layers need as many steps and separate factors, got {} and {}",
                self.n_layers,
                self.steps.len(),
                self.separate_factors.len()
            )));
        }

        for layer in 0..self.n_layers {
            let step = self.steps[layer];
            let factor = self.separate_factors[layer];
            if step == 0 || factor == 0 {
                return Err(EncoderError::InvalidConfig(format!(
                    "layer {}: step ({}) and separate factor ({}) must be > 0",
                    layer, step, factor
                )));
            }
            if step % factor != 0 {
                return Err(EncoderError::shape(
                    format!("layer {} block projection", layer),
                    format!("step divisible by separate factor {}", factor),
                    format!("step {}", step),
                ));
            }
        }

        if !(0.0..=1.0).contains(&self.dropout) {
            return Err(EncoderError::InvalidConfig(format!(
                "dropout ({}) must be in [0, 1]",
                self.dropout
            )));
        }

        if self.correlation_factor.is_nan() || self.correlation_factor <= 0.0 {
            return Err(EncoderError::InvalidConfig(format!(
                "correlation_factor ({}) must be positive",
                self.correlation_factor
            )));
        }

        if self.decomposition_kernel == 0 {
            return Err(EncoderError::InvalidConfig(
                "decomposition_kernel must be > 0".to_string(),
            ));
        }

        if self.precision != Precision::Float64 {
            return Err(EncoderError::DeviceOrDType(format!(
                "{:?} is not supported by the f64 ndarray backend",
                self.precision
            )));
        }

        Ok(())
    }

    /// Returns the attention head size
    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    /// Per-layer block schedule
    pub fn layer_specs(&self) -> Vec<LayerSpec> {
        (0..self.n_layers)
            .map(|index| {
                let step = self.steps[index];
                let separate_factor = self.separate_factors[index];
                LayerSpec {
                    index,
                    step,
                    separate_factor,
                    output_step: step / separate_factor,
                }
            })
            .collect()
    }

    /// Number of trade-off pairs the encoder holds
    pub fn trade_off_count(&self) -> usize {
        match self.trade_off_sharing {
            TradeOffSharing::Shared => 1,
            TradeOffSharing::PerLayer => self.n_layers,
        }
    }

    /// Traces sequence lengths through every layer
    ///
    /// Trailing steps that do not fill a block are dropped. A layer that would
    /// receive fewer steps than one block is an error.
    pub fn layer_plan(&self, seq_len: usize) -> Result<Vec<LayerPlan>> {
        let mut plans = Vec::with_capacity(self.n_layers);
        let mut input_len = seq_len;

        for spec in self.layer_specs() {
            let block_count = input_len / spec.step;
            if block_count == 0 {
                return Err(EncoderError::shape(
                    format!("layer {} input length", spec.index),
                    format!("at least one block of {} steps", spec.step),
                    format!("{} steps", input_len),
                ));
            }

            let output_len = block_count * spec.output_step;
            plans.push(LayerPlan {
                layer: spec.index,
                input_len,
                step: spec.step,
                block_count,
                dropped: input_len - block_count * spec.step,
                output_step: spec.output_step,
                output_len,
            });
            input_len = output_len;
        }

        Ok(plans)
    }

    /// Final sequence length for a given input length
    pub fn output_len(&self, seq_len: usize) -> Result<usize> {
        let plans = self.layer_plan(seq_len)?;
        Ok(plans.last().map(|p| p.output_len).unwrap_or(seq_len))
    }
}
