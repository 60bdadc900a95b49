//! Attention primitive
//!
//! The encoder only depends on the [`Attention`] trait. [`FullAttention`] is the
//! default implementation: multi-head scaled dot-product attention with
//! query/key/value/output projections, an optional causal mask and optional
//! head mixing when the heads are merged back together.

use std::cmp::Ordering;
use std::fmt::Debug;

use ndarray::{s, Array2, Array3, Array4, Axis};
use rand::Rng;

use crate::error::{EncoderError, Result};
use crate::model::layers::{softmax_rows, Dropout, Linear};

/// Boolean attention mask [query_len, key_len]; `true` blocks a position
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMask {
    blocked: Array2<bool>,
}

impl AttentionMask {
    pub fn new(blocked: Array2<bool>) -> Self {
        Self { blocked }
    }

    /// Triangular mask: position `i` may only attend to `j <= i`
    pub fn causal(len: usize) -> Self {
        Self {
            blocked: Array2::from_shape_fn((len, len), |(i, j)| j > i),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.blocked.dim()
    }

    pub fn is_blocked(&self, query: usize, key: usize) -> bool {
        self.blocked[[query, key]]
    }
}

/// Attention weights returned for interpretation
#[derive(Debug, Clone)]
pub struct AttentionWeights {
    /// Weights [batch, n_heads, query_len, key_len]
    pub weights: Array4<f64>,
}

impl AttentionWeights {
    pub fn new(weights: Array4<f64>) -> Self {
        Self { weights }
    }

    /// Averages the weights over heads: [batch, query_len, key_len]
    pub fn mean_attention(&self) -> Option<Array3<f64>> {
        self.weights.mean_axis(Axis(1))
    }

    /// Top-k key positions for every query, averaged over batch and heads
    pub fn top_k_positions(&self, k: usize) -> Vec<Vec<(usize, f64)>> {
        let mean = match self
            .weights
            .mean_axis(Axis(0))
            .and_then(|w| w.mean_axis(Axis(0)))
        {
            Some(mean) => mean,
            None => return Vec::new(),
        };

        mean.outer_iter()
            .map(|row| {
                let mut positions: Vec<(usize, f64)> = row.iter().cloned().enumerate().collect();
                positions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
                positions.truncate(k);
                positions
            })
            .collect()
    }
}

/// Attention capability injected into the block layers
pub trait Attention: Debug + Send + Sync {
    /// Attends `queries` over `keys`/`values`
    ///
    /// Returns the output [batch, query_len, d_model] and the weights.
    fn attend(
        &self,
        queries: &Array3<f64>,
        keys: &Array3<f64>,
        values: &Array3<f64>,
        mask: Option<&AttentionMask>,
    ) -> Result<(Array3<f64>, AttentionWeights)>;

    /// Switches dropout on or off
    fn set_training(&mut self, _training: bool) {}

    /// Number of trainable scalars
    fn num_parameters(&self) -> usize {
        0
    }
}

/// Multi-head full attention with learned projections
#[derive(Debug, Clone)]
pub struct FullAttention {
    query_proj: Linear,
    key_proj: Linear,
    value_proj: Linear,
    output_proj: Linear,
    d_model: usize,
    n_heads: usize,
    head_dim: usize,
    /// 1 / sqrt(head_dim)
    scale: f64,
    /// Apply a causal mask when none is given
    causal: bool,
    /// Interleave heads when merging
    mix: bool,
    dropout: Dropout,
    training: bool,
}

impl FullAttention {
    /// Creates a new attention layer
    ///
    /// Fails with [`EncoderError::InvalidConfig`] unless `n_heads` is non-zero
    /// and divides `d_model`.
    pub fn new<R: Rng + ?Sized>(
        d_model: usize,
        n_heads: usize,
        dropout: f64,
        causal: bool,
        mix: bool,
        rng: &mut R,
    ) -> Result<Self> {
        if n_heads == 0 || d_model % n_heads != 0 {
            return Err(EncoderError::InvalidConfig(format!(
                "d_model ({}) must be divisible by a non-zero n_heads ({})",
                d_model, n_heads
            )));
        }
        let head_dim = d_model / n_heads;
        Ok(Self {
            query_proj: Linear::new(d_model, d_model, rng),
            key_proj: Linear::new(d_model, d_model, rng),
            value_proj: Linear::new(d_model, d_model, rng),
            output_proj: Linear::new(d_model, d_model, rng),
            d_model,
            n_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
            causal,
            mix,
            dropout: Dropout::with_rng(dropout, rng),
            training: false,
        })
    }

    pub fn n_heads(&self) -> usize {
        self.n_heads
    }

    fn check_input(&self, name: &str, x: &Array3<f64>, batch: usize) -> Result<()> {
        let (b, _, d) = x.dim();
        if b != batch || d != self.d_model {
            return Err(EncoderError::shape(
                format!("attention {}", name),
                format!("(batch {}, _, {})", batch, self.d_model),
                format!("{:?}", x.dim()),
            ));
        }
        Ok(())
    }

    /// Projects [batch, len, d_model] row by row
    fn project(linear: &Linear, x: &Array3<f64>) -> Array3<f64> {
        let (batch, len, _) = x.dim();
        let mut output = Array3::zeros((batch, len, linear.out_features()));
        for b in 0..batch {
            let projected = linear.forward(&x.slice(s![b, .., ..]));
            output.slice_mut(s![b, .., ..]).assign(&projected);
        }
        output
    }

    /// Merges [batch, len, heads, head_dim] into [batch, len, d_model]
    ///
    /// With `mix` the head axis is swapped in front of time before the
    /// flattening, so heads are interleaved across time positions.
    fn merge_heads(&self, heads: Array4<f64>) -> Result<Array3<f64>> {
        let (batch, len, _, _) = heads.dim();
        let merged = if self.mix {
            let mixed = heads.permuted_axes([0, 2, 1, 3]);
            mixed.as_standard_layout().to_owned().into_shape((batch, len, self.d_model))
        } else {
            heads.into_shape((batch, len, self.d_model))
        };
        merged.map_err(|e| EncoderError::shape("attention head merge", self.d_model, e))
    }
}

impl Attention for FullAttention {
    fn attend(
        &self,
        queries: &Array3<f64>,
        keys: &Array3<f64>,
        values: &Array3<f64>,
        mask: Option<&AttentionMask>,
    ) -> Result<(Array3<f64>, AttentionWeights)> {
        let (batch, q_len, _) = queries.dim();
        let k_len = keys.dim().1;
        self.check_input("queries", queries, batch)?;
        self.check_input("keys", keys, batch)?;
        self.check_input("values", values, batch)?;
        if values.dim().1 != k_len {
            return Err(EncoderError::shape("attention values", k_len, values.dim().1));
        }

        let owned_mask;
        let mask = match mask {
            Some(mask) => Some(mask),
            None if self.causal => {
                owned_mask = AttentionMask::causal(q_len.max(k_len));
                Some(&owned_mask)
            }
            None => None,
        };
        if let Some(mask) = mask {
            let (mq, mk) = mask.dim();
            if mq < q_len || mk < k_len {
                return Err(EncoderError::shape(
                    "attention mask",
                    format!("at least ({}, {})", q_len, k_len),
                    format!("({}, {})", mq, mk),
                ));
            }
        }

        let q = Self::project(&self.query_proj, queries);
        let k = Self::project(&self.key_proj, keys);
        let v = Self::project(&self.value_proj, values);

        let mut heads = Array4::zeros((batch, q_len, self.n_heads, self.head_dim));
        let mut weights = Array4::zeros((batch, self.n_heads, q_len, k_len));

        for b in 0..batch {
            for h in 0..self.n_heads {
                let range = h * self.head_dim..(h + 1) * self.head_dim;
                let q_h = q.slice(s![b, .., range.clone()]);
                let k_h = k.slice(s![b, .., range.clone()]);
                let v_h = v.slice(s![b, .., range]);

                let mut scores = q_h.dot(&k_h.t()) * self.scale;
                if let Some(mask) = mask {
                    for ((i, j), score) in scores.indexed_iter_mut() {
                        if mask.is_blocked(i, j) {
                            *score = f64::NEG_INFINITY;
                        }
                    }
                }
                softmax_rows(&mut scores);
                weights.slice_mut(s![b, h, .., ..]).assign(&scores);

                let probs = self.dropout.apply(scores, self.training);
                heads.slice_mut(s![b, .., h, ..]).assign(&probs.dot(&v_h));
            }
        }

        let merged = self.merge_heads(heads)?;
        let output = Self::project(&self.output_proj, &merged);

        Ok((output, AttentionWeights::new(weights)))
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn num_parameters(&self) -> usize {
        self.query_proj.num_parameters()
            + self.key_proj.num_parameters()
            + self.value_proj.num_parameters()
            + self.output_proj.num_parameters()
    }
}
