//! Synthetic seasonal series
//!
//! Daily and weekly cycles on top of a slow trend with Gaussian noise, one
//! phase per channel. Used by the demo binary and the benchmark.

use std::f64::consts::PI;

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Hourly-style series [batch, len, channels] with periods of 24 and 168 steps
pub fn synthetic_sequence(batch: usize, len: usize, channels: usize, seed: u64) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);

    Array3::from_shape_fn((batch, len, channels), |(b, t, d)| {
        let phase = (b * channels + d) as f64 * 0.37;
        let t = t as f64;
        let daily = (2.0 * PI * t / 24.0 + phase).sin();
        let weekly = 0.5 * (2.0 * PI * t / 168.0 + phase).cos();
        let trend = 0.002 * t;
        let noise: f64 = rng.sample(StandardNormal);
        daily + weekly + trend + 0.1 * noise
    })
}
