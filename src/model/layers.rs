//! Small numeric building blocks shared by the encoder layers

use std::sync::Mutex;

use ndarray::{Array, Array1, Array2, ArrayView2, Axis, Dimension};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Linear layer `y = W x + b`
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weights [out_features, in_features]
    weight: Array2<f64>,
    /// Bias [out_features]
    bias: Array1<f64>,
}

impl Linear {
    /// Creates a linear layer with Xavier uniform initialization
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let scale = (6.0 / (in_features + out_features) as f64).sqrt();
        let weight = Array2::random_using((out_features, in_features), Uniform::new(-scale, scale), rng);
        let bias = Array1::zeros(out_features);
        Self { weight, bias }
    }

    /// Builds a layer from explicit parameters
    pub fn from_parts(weight: Array2<f64>, bias: Array1<f64>) -> Self {
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn weight(&self) -> &Array2<f64> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f64> {
        &self.bias
    }

    /// Forward pass over rows: [n, in] -> [n, out]
    pub fn forward(&self, x: &ArrayView2<f64>) -> Array2<f64> {
        x.dot(&self.weight.t()) + &self.bias
    }

    /// Forward pass over columns: [in, n] -> [out, n]
    ///
    /// Used to project the time axis of a [time, channels] matrix.
    pub fn forward_columns(&self, x: &ArrayView2<f64>) -> Array2<f64> {
        self.weight.dot(x) + &self.bias.view().insert_axis(Axis(1))
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Inverted dropout; identity outside training
///
/// Masks are drawn from the layer's own generator, so a seeded layer yields
/// the same sequence of masks on every run.
#[derive(Debug)]
pub struct Dropout {
    rate: f64,
    rng: Mutex<StdRng>,
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        let rng = self.rng.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Self {
            rate: self.rate,
            rng: Mutex::new(rng),
        }
    }
}

impl Dropout {
    /// Dropout seeded from entropy
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Dropout seeded from `rng`
    pub fn with_rng<R: Rng + ?Sized>(rate: f64, rng: &mut R) -> Self {
        Self {
            rate,
            rng: Mutex::new(StdRng::seed_from_u64(rng.gen())),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Zeroes elements with probability `rate` and rescales the rest
    pub fn apply<D: Dimension>(&self, mut x: Array<f64, D>, training: bool) -> Array<f64, D> {
        if !training || self.rate <= 0.0 {
            return x;
        }
        if self.rate >= 1.0 {
            x.fill(0.0);
            return x;
        }

        let keep = 1.0 - self.rate;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        x.mapv_inplace(|v| if rng.gen::<f64>() < keep { v / keep } else { 0.0 });
        x
    }
}

/// Exponential linear unit with alpha = 1
pub fn elu(x: f64) -> f64 {
    if x > 0.0 {
        x
    } else {
        x.exp() - 1.0
    }
}

/// Row-wise softmax; rows that are entirely `-inf` become zeros
pub fn softmax_rows(scores: &mut Array2<f64>) {
    for mut row in scores.axis_iter_mut(Axis(0)) {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if max == f64::NEG_INFINITY {
            row.fill(0.0);
            continue;
        }
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
}
