//! Block transform layer
//!
//! Self-attention over one block followed by a learned projection of the time
//! axis from `step` to `step / separate_factor` steps.

use ndarray::{s, Array3};
use rand::Rng;

use crate::error::{EncoderError, Result};
use crate::model::attention::{Attention, AttentionMask, AttentionWeights};
use crate::model::layers::{elu, Dropout, Linear};

/// Attention + time-axis reduction for a single block
///
/// ```text
/// y = x + dropout(attention(x, x, x))
/// z = dropout(elu(W · y + b))        W: [step / separate_factor, step]
/// ```
#[derive(Debug)]
pub struct BlockTransformLayer {
    attention: Box<dyn Attention>,
    /// Time projection step -> step / separate_factor
    projection: Linear,
    dropout: Dropout,
    d_model: usize,
    step: usize,
    separate_factor: usize,
    training: bool,
}

impl BlockTransformLayer {
    /// Creates a layer for blocks of `step` time steps
    pub fn new<R: Rng + ?Sized>(
        attention: Box<dyn Attention>,
        d_model: usize,
        step: usize,
        separate_factor: usize,
        dropout: f64,
        rng: &mut R,
    ) -> Result<Self> {
        if step == 0 || separate_factor == 0 {
            return Err(EncoderError::InvalidConfig(format!(
                "step ({}) and separate factor ({}) must be > 0",
                step, separate_factor
            )));
        }
        if step % separate_factor != 0 {
            return Err(EncoderError::shape(
                "block projection",
                format!("step divisible by {}", separate_factor),
                step,
            ));
        }

        Ok(Self {
            attention,
            projection: Linear::new(step, step / separate_factor, rng),
            dropout: Dropout::with_rng(dropout, rng),
            d_model,
            step,
            separate_factor,
            training: false,
        })
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn separate_factor(&self) -> usize {
        self.separate_factor
    }

    pub fn output_step(&self) -> usize {
        self.projection.out_features()
    }

    pub fn projection(&self) -> &Linear {
        &self.projection
    }

    /// Replaces the time projection, e.g. with trained weights
    pub fn set_projection(&mut self, projection: Linear) -> Result<()> {
        if projection.in_features() != self.step || projection.out_features() != self.output_step() {
            return Err(EncoderError::shape(
                "block projection weights",
                format!("[{}, {}]", self.output_step(), self.step),
                format!("[{}, {}]", projection.out_features(), projection.in_features()),
            ));
        }
        self.projection = projection;
        Ok(())
    }

    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        self.attention.set_training(training);
    }

    pub fn num_parameters(&self) -> usize {
        self.attention.num_parameters() + self.projection.num_parameters()
    }

    /// Transforms a block [batch, step, d_model] into [batch, step / separate_factor, d_model]
    pub fn forward(
        &self,
        x: &Array3<f64>,
        mask: Option<&AttentionMask>,
    ) -> Result<(Array3<f64>, AttentionWeights)> {
        let (batch, len, channels) = x.dim();
        if len != self.step || channels != self.d_model {
            return Err(EncoderError::shape(
                "block transform input",
                format!("(_, {}, {})", self.step, self.d_model),
                format!("{:?}", x.dim()),
            ));
        }

        let (attended, weights) = self.attention.attend(x, x, x, mask)?;
        let y = x + &self.dropout.apply(attended, self.training);

        let mut output = Array3::zeros((batch, self.output_step(), channels));
        for b in 0..batch {
            let projected = self
                .projection
                .forward_columns(&y.slice(s![b, .., ..]))
                .mapv_into(elu);
            output.slice_mut(s![b, .., ..]).assign(&projected);
        }

        Ok((self.dropout.apply(output, self.training), weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::attention::FullAttention;
    use ndarray::{Array1, Array2, Array4};
    use ndarray_rand::RandomExt;
    use rand::distributions::Uniform;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Attention that contributes nothing
    #[derive(Debug)]
    struct ZeroAttention;

    impl Attention for ZeroAttention {
        fn attend(
            &self,
            queries: &Array3<f64>,
            _keys: &Array3<f64>,
            _values: &Array3<f64>,
            _mask: Option<&AttentionMask>,
        ) -> Result<(Array3<f64>, AttentionWeights)> {
            let (b, l, _) = queries.dim();
            Ok((Array3::zeros(queries.dim()), AttentionWeights::new(Array4::zeros((b, 1, l, l)))))
        }
    }

    fn layer(step: usize, factor: usize) -> BlockTransformLayer {
        let mut rng = StdRng::seed_from_u64(3);
        let attention = FullAttention::new(8, 2, 0.1, false, false, &mut rng).unwrap();
        BlockTransformLayer::new(Box::new(attention), 8, step, factor, 0.1, &mut rng).unwrap()
    }

    #[test]
    fn test_output_shape() {
        for (step, factor) in [(24, 3), (8, 2), (4, 4), (6, 1)] {
            let layer = layer(step, factor);
            let x = Array3::random((2, step, 8), Uniform::new(-1.0, 1.0));

            let (y, weights) = layer.forward(&x, None).unwrap();

            assert_eq!(y.dim(), (2, step / factor, 8));
            assert_eq!(weights.weights.dim(), (2, 2, step, step));
        }
    }

    #[test]
    fn test_indivisible_step_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let attention = FullAttention::new(8, 2, 0.0, false, false, &mut rng).unwrap();
        let err = BlockTransformLayer::new(Box::new(attention), 8, 10, 3, 0.0, &mut rng).unwrap_err();
        assert!(err.is_shape_error());
    }

    #[test]
    fn test_wrong_block_length() {
        let layer = layer(24, 3);
        let x = Array3::zeros((1, 23, 8));
        assert!(layer.forward(&x, None).unwrap_err().is_shape_error());
    }

    #[test]
    fn test_projection_then_elu() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut layer =
            BlockTransformLayer::new(Box::new(ZeroAttention), 2, 4, 2, 0.0, &mut rng).unwrap();
        // first output step averages the first half, second takes minus the second half
        let weight = Array2::from_shape_vec(
            (2, 4),
            vec![0.5, 0.5, 0.0, 0.0, 0.0, 0.0, -1.0, -1.0],
        )
        .unwrap();
        layer.set_projection(Linear::from_parts(weight, Array1::zeros(2))).unwrap();

        let x = Array3::from_shape_vec((1, 4, 2), vec![1.0, 2.0, 3.0, 4.0, 0.5, 0.5, 1.0, 1.0]).unwrap();
        let (y, _) = layer.forward(&x, None).unwrap();

        assert!((y[[0, 0, 0]] - 2.0).abs() < 1e-12);
        assert!((y[[0, 0, 1]] - 3.0).abs() < 1e-12);
        assert!((y[[0, 1, 0]] - elu(-1.5)).abs() < 1e-12);
        assert!((y[[0, 1, 1]] - elu(-1.5)).abs() < 1e-12);
    }

    #[test]
    fn test_eval_is_deterministic() {
        let layer = layer(8, 2);
        let x = Array3::random((1, 8, 8), Uniform::new(-1.0, 1.0));
        let (a, _) = layer.forward(&x, None).unwrap();
        let (b, _) = layer.forward(&x, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_set_projection_shape_check() {
        let mut layer = layer(8, 2);
        let wrong = Linear::from_parts(Array2::zeros((3, 8)), Array1::zeros(3));
        assert!(layer.set_projection(wrong).is_err());
    }
}
