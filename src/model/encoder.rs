//! Hierarchical separate encoder
//!
//! Every layer cuts its input into blocks of `step` time steps. For each block
//! the per-channel mean (broadcast over the block) and the deviation from it
//! go through two independent [`BlockTransformLayer`]s, which shrink the block
//! to `step / separate_factor` steps. From the second block on, each path is
//! fused with the previous block's output of the same path:
//!
//! ```text
//! out_i = base_i + trade_off * fuse(base_{i-1}, base_i)
//! ```
//!
//! The mean path becomes the next layer's input; the deviation path of every
//! layer is returned alongside the final output.

use ndarray::{s, Array3, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, trace};

use crate::error::{EncoderError, Result};
use crate::model::attention::{Attention, AttentionMask, FullAttention};
use crate::model::block::BlockTransformLayer;
use crate::model::config::{EncoderConfig, LayerPlan, LayerSpec, TradeOffSharing};
use crate::model::correlation::{CrossCorrelation, TimeDelayCorrelation};

/// Which half of a block a layer transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPath {
    /// Block mean (raw block for the first block of a layer)
    Mean,
    /// Block minus its mean
    Deviation,
}

/// Learned fusion weights for the mean and deviation paths
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeOff {
    pub mean: f64,
    pub deviation: f64,
}

impl TradeOff {
    pub fn new(mean: f64, deviation: f64) -> Self {
        Self { mean, deviation }
    }

    pub fn splat(value: f64) -> Self {
        Self::new(value, value)
    }
}

/// Result of a forward pass
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// Mean path of the last layer [batch, final_len, d_model]
    pub output: Array3<f64>,
    /// Deviation path of every layer, in layer order
    pub layer_outputs: Vec<Array3<f64>>,
}

impl EncoderOutput {
    pub fn into_parts(self) -> (Array3<f64>, Vec<Array3<f64>>) {
        (self.output, self.layer_outputs)
    }
}

/// Mean and deviation transforms plus the fusion primitive of one layer
#[derive(Debug)]
struct EncoderLayer {
    spec: LayerSpec,
    mean: BlockTransformLayer,
    deviation: BlockTransformLayer,
    correlation: Box<dyn CrossCorrelation>,
}

/// Pre-fusion outputs of the previous block
struct BlockCarry {
    output: Array3<f64>,
    deviation: Array3<f64>,
}

/// Multi-layer block-wise encoder
#[derive(Debug)]
pub struct HierarchicalEncoder {
    config: EncoderConfig,
    layers: Vec<EncoderLayer>,
    trade_offs: Vec<TradeOff>,
    training: bool,
}

impl HierarchicalEncoder {
    /// Builds an encoder with [`FullAttention`] and [`TimeDelayCorrelation`]
    pub fn new(config: EncoderConfig) -> Result<Self> {
        config.validate()?;

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (d_model, n_heads, dropout) = (config.d_model, config.n_heads, config.dropout);
        let (causal, mix, factor) = (config.causal, config.mix, config.correlation_factor);

        let mut attention_rng = StdRng::from_rng(&mut rng)
            .map_err(|e| EncoderError::InvalidConfig(format!("rng initialisation: {}", e)))?;

        Self::build(
            config,
            &mut rng,
            |_, _| -> Result<Box<dyn Attention>> {
                Ok(Box::new(FullAttention::new(
                    d_model,
                    n_heads,
                    dropout,
                    causal,
                    mix,
                    &mut attention_rng,
                )?))
            },
            |spec| -> Result<Box<dyn CrossCorrelation>> {
                Ok(Box::new(TimeDelayCorrelation::new(spec.output_step, factor)?))
            },
        )
    }

    /// Builds an encoder with caller-supplied primitives
    ///
    /// `make_attention` is called once per layer and path, `make_correlation`
    /// once per layer.
    pub fn with_components<A, C>(config: EncoderConfig, make_attention: A, make_correlation: C) -> Result<Self>
    where
        A: FnMut(&LayerSpec, BlockPath) -> Result<Box<dyn Attention>>,
        C: FnMut(&LayerSpec) -> Result<Box<dyn CrossCorrelation>>,
    {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::build(config, &mut rng, make_attention, make_correlation)
    }

    fn build<A, C>(
        config: EncoderConfig,
        rng: &mut StdRng,
        mut make_attention: A,
        mut make_correlation: C,
    ) -> Result<Self>
    where
        A: FnMut(&LayerSpec, BlockPath) -> Result<Box<dyn Attention>>,
        C: FnMut(&LayerSpec) -> Result<Box<dyn CrossCorrelation>>,
    {
        let mut layers = Vec::with_capacity(config.n_layers);
        for spec in config.layer_specs() {
            let mean = BlockTransformLayer::new(
                make_attention(&spec, BlockPath::Mean)?,
                config.d_model,
                spec.step,
                spec.separate_factor,
                config.dropout,
                rng,
            )?;
            let deviation = BlockTransformLayer::new(
                make_attention(&spec, BlockPath::Deviation)?,
                config.d_model,
                spec.step,
                spec.separate_factor,
                config.dropout,
                rng,
            )?;
            let correlation = make_correlation(&spec)?;
            layers.push(EncoderLayer {
                spec,
                mean,
                deviation,
                correlation,
            });
        }

        let trade_offs = vec![TradeOff::splat(config.trade_off_init); config.trade_off_count()];

        info!(
            layers = layers.len(),
            d_model = config.d_model,
            sharing = ?config.trade_off_sharing,
            "built hierarchical encoder"
        );

        Ok(Self {
            config,
            layers,
            trade_offs,
            training: false,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Mean-path transform of a layer
    pub fn mean_layer(&self, layer: usize) -> Option<&BlockTransformLayer> {
        self.layers.get(layer).map(|l| &l.mean)
    }

    /// Deviation-path transform of a layer
    pub fn deviation_layer(&self, layer: usize) -> Option<&BlockTransformLayer> {
        self.layers.get(layer).map(|l| &l.deviation)
    }

    /// Fusion primitive of a layer
    pub fn correlation(&self, layer: usize) -> Option<&dyn CrossCorrelation> {
        self.layers.get(layer).map(|l| l.correlation.as_ref())
    }

    pub fn trade_offs(&self) -> &[TradeOff] {
        &self.trade_offs
    }

    /// Trade-off pair used by `layer`, `None` when the layer does not exist
    pub fn trade_off(&self, layer: usize) -> Option<TradeOff> {
        if layer >= self.layers.len() {
            return None;
        }
        match self.config.trade_off_sharing {
            TradeOffSharing::Shared => self.trade_offs.first().copied(),
            TradeOffSharing::PerLayer => self.trade_offs.get(layer).copied(),
        }
    }

    /// Sets the trade-off pair used by `layer`
    ///
    /// With shared trade-offs this changes the pair of every layer.
    pub fn set_trade_off(&mut self, layer: usize, trade_off: TradeOff) -> Result<()> {
        if layer >= self.layers.len() {
            return Err(EncoderError::InvalidConfig(format!(
                "layer {} out of range ({} layers)",
                layer,
                self.layers.len()
            )));
        }
        let index = match self.config.trade_off_sharing {
            TradeOffSharing::Shared => 0,
            TradeOffSharing::PerLayer => layer,
        };
        self.trade_offs[index] = trade_off;
        Ok(())
    }

    /// Enables dropout
    pub fn train(&mut self) {
        self.set_training(true);
    }

    /// Disables dropout
    pub fn eval(&mut self) {
        self.set_training(false);
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        for layer in &mut self.layers {
            layer.mean.set_training(training);
            layer.deviation.set_training(training);
        }
    }

    /// Total number of trainable scalars
    pub fn num_parameters(&self) -> usize {
        let layers: usize = self
            .layers
            .iter()
            .map(|l| l.mean.num_parameters() + l.deviation.num_parameters())
            .sum();
        layers + 2 * self.trade_offs.len()
    }

    /// Shape plan for an input of `seq_len` steps
    pub fn plan(&self, seq_len: usize) -> Result<Vec<LayerPlan>> {
        self.config.layer_plan(seq_len)
    }

    /// Checks input and masks against every layer before any computation
    fn validate_input(&self, x: &Array3<f64>, masks: Option<&[AttentionMask]>) -> Result<Vec<LayerPlan>> {
        let (_, seq_len, channels) = x.dim();
        if channels != self.config.d_model {
            return Err(EncoderError::shape("encoder input channels", self.config.d_model, channels));
        }

        if let Some(masks) = masks {
            if masks.len() != self.layers.len() {
                return Err(EncoderError::shape("attention masks", self.layers.len(), masks.len()));
            }
            for (layer, mask) in self.layers.iter().zip(masks) {
                if mask.dim() != (layer.spec.step, layer.spec.step) {
                    return Err(EncoderError::shape(
                        format!("layer {} attention mask", layer.spec.index),
                        format!("({0}, {0})", layer.spec.step),
                        format!("{:?}", mask.dim()),
                    ));
                }
            }
        }

        self.plan(seq_len)
    }

    /// Encodes `x` [batch, time, d_model]
    ///
    /// Trailing steps that do not fill a whole block are ignored at every
    /// layer. `masks`, when given, holds one `(step, step)` mask per layer,
    /// applied inside every block of that layer.
    pub fn forward(&self, x: &Array3<f64>, masks: Option<&[AttentionMask]>) -> Result<EncoderOutput> {
        let plans = self.validate_input(x, masks)?;

        let mut current = x.to_owned();
        let mut layer_outputs = Vec::with_capacity(self.layers.len());

        for (layer, plan) in self.layers.iter().zip(plans.iter()) {
            if plan.dropped > 0 {
                debug!(
                    layer = plan.layer,
                    dropped = plan.dropped,
                    "trailing steps do not fill a block"
                );
            }
            debug!(
                layer = plan.layer,
                input_len = plan.input_len,
                block_count = plan.block_count,
                output_len = plan.output_len,
                "encoding layer"
            );

            let mask = masks.map(|m| &m[plan.layer]);
            let (output, deviation) = self.encode_layer(layer, plan, current.view(), mask)?;
            layer_outputs.push(deviation);
            current = output;
        }

        Ok(EncoderOutput {
            output: current,
            layer_outputs,
        })
    }

    /// Runs the block chain of one layer into pre-sized buffers
    fn encode_layer(
        &self,
        layer: &EncoderLayer,
        plan: &LayerPlan,
        x: ArrayView3<f64>,
        mask: Option<&AttentionMask>,
    ) -> Result<(Array3<f64>, Array3<f64>)> {
        let (batch, _, channels) = x.dim();
        let (step, out_step) = (plan.step, plan.output_step);
        let trade_off = self.trade_off(plan.layer).ok_or_else(|| {
            EncoderError::InvalidConfig(format!("no trade-off for layer {}", plan.layer))
        })?;

        let mut output = Array3::zeros((batch, plan.output_len, channels));
        let mut output_div = Array3::zeros((batch, plan.output_len, channels));

        (0..plan.block_count).try_fold(None::<BlockCarry>, |carry, i| -> Result<Option<BlockCarry>> {
            let block = x.slice(s![.., i * step..(i + 1) * step, ..]);
            let block_mean = block
                .mean_axis(Axis(1))
                .ok_or_else(|| EncoderError::shape("block mean", step, 0))?
                .insert_axis(Axis(1));
            let mean = block_mean
                .broadcast((batch, step, channels))
                .ok_or_else(|| EncoderError::shape("block mean broadcast", step, 1))?
                .to_owned();
            let deviation = &block - &mean;

            let mean_input = if i == 0 { block.to_owned() } else { mean };
            let (base, _) = layer.mean.forward(&mean_input, mask)?;
            let (base_div, _) = layer.deviation.forward(&deviation, mask)?;

            let (fused, fused_div) = match &carry {
                None => (base.clone(), base_div.clone()),
                Some(prev) => {
                    trace!(layer = plan.layer, block = i, "fusing with previous block");
                    let delta = layer.correlation.fuse(&prev.output, &base)?;
                    let delta_div = layer.correlation.fuse(&prev.deviation, &base_div)?;
                    (
                        &base + &(delta * trade_off.mean),
                        &base_div + &(delta_div * trade_off.deviation),
                    )
                }
            };

            let range = i * out_step..(i + 1) * out_step;
            output.slice_mut(s![.., range.clone(), ..]).assign(&fused);
            output_div.slice_mut(s![.., range, ..]).assign(&fused_div);

            Ok(Some(BlockCarry {
                output: base,
                deviation: base_div,
            }))
        })?;

        Ok((output, output_div))
    }
}
