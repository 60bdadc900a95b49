//! Cross-correlation fusion primitive
//!
//! [`TimeDelayCorrelation`] measures how well the current block lines up with
//! circular shifts of the reference block, keeps the `k = factor * ln(L)`
//! strongest lags and returns the softmax-weighted sum of the reference
//! rolled by those lags. Correlations are computed with an FFT:
//! `corr[tau] = IFFT(FFT(current) * conj(FFT(reference)))[tau] / L`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use ndarray::{s, Array1, Array3};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::error::{EncoderError, Result};

/// Fusion capability injected into the encoder
pub trait CrossCorrelation: fmt::Debug + Send + Sync {
    /// Returns a delta with the same shape as `current`, built from
    /// `reference` (the preceding block's output)
    fn fuse(&self, reference: &Array3<f64>, current: &Array3<f64>) -> Result<Array3<f64>>;
}

/// FFT-based time delay aggregation over a fixed block length
#[derive(Clone)]
pub struct TimeDelayCorrelation {
    len: usize,
    top_k: usize,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl fmt::Debug for TimeDelayCorrelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeDelayCorrelation")
            .field("len", &self.len)
            .field("top_k", &self.top_k)
            .finish()
    }
}

impl TimeDelayCorrelation {
    /// Plans the transforms for blocks of `len` time steps
    pub fn new(len: usize, factor: f64) -> Result<Self> {
        if len == 0 {
            return Err(EncoderError::InvalidConfig(
                "correlation length must be > 0".to_string(),
            ));
        }
        if factor.is_nan() || factor <= 0.0 {
            return Err(EncoderError::InvalidConfig(format!(
                "correlation factor ({}) must be positive",
                factor
            )));
        }

        let top_k = ((factor * (len as f64).ln()).floor() as usize).clamp(1, len);

        let mut planner = FftPlanner::new();
        Ok(Self {
            len,
            top_k,
            forward: planner.plan_fft_forward(len),
            inverse: planner.plan_fft_inverse(len),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    fn spectrum(&self, series: impl Iterator<Item = f64>) -> Vec<Complex<f64>> {
        let mut buffer: Vec<Complex<f64>> = series.map(|x| Complex::new(x, 0.0)).collect();
        self.forward.process(&mut buffer);
        buffer
    }

    /// Channel-averaged circular correlation per lag for one batch item
    pub fn lag_correlation(&self, reference: &Array3<f64>, current: &Array3<f64>, batch: usize) -> Array1<f64> {
        let channels = current.dim().2;
        let norm = self.len as f64;
        let mut mean_corr = Array1::<f64>::zeros(self.len);

        for d in 0..channels {
            let r = self.spectrum(reference.slice(s![batch, .., d]).iter().cloned());
            let c = self.spectrum(current.slice(s![batch, .., d]).iter().cloned());

            let mut cross: Vec<Complex<f64>> =
                c.iter().zip(r.iter()).map(|(c, r)| c * r.conj()).collect();
            self.inverse.process(&mut cross);

            for (tau, value) in cross.iter().enumerate() {
                mean_corr[tau] += value.re / norm;
            }
        }

        if channels > 0 {
            mean_corr /= channels as f64;
        }
        mean_corr
    }
}

impl CrossCorrelation for TimeDelayCorrelation {
    fn fuse(&self, reference: &Array3<f64>, current: &Array3<f64>) -> Result<Array3<f64>> {
        if reference.dim() != current.dim() {
            return Err(EncoderError::shape(
                "cross-correlation inputs",
                format!("{:?}", current.dim()),
                format!("{:?}", reference.dim()),
            ));
        }
        let (batch, len, channels) = current.dim();
        if len != self.len {
            return Err(EncoderError::shape("cross-correlation block length", self.len, len));
        }

        let mut output = Array3::zeros((batch, len, channels));

        for b in 0..batch {
            let corr = self.lag_correlation(reference, current, b);

            let mut lags: Vec<(usize, f64)> = corr.iter().cloned().enumerate().collect();
            lags.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
            lags.truncate(self.top_k);

            // softmax over the selected correlations
            let max = lags.iter().map(|l| l.1).fold(f64::NEG_INFINITY, f64::max);
            let exp: Vec<f64> = lags.iter().map(|l| (l.1 - max).exp()).collect();
            let total: f64 = exp.iter().sum();

            for ((tau, _), e) in lags.iter().zip(exp.iter()) {
                let weight = e / total;
                // a peak at tau means current[t] follows reference[t - tau]
                for t in 0..len {
                    let source = (t + len - tau) % len;
                    for d in 0..channels {
                        output[[b, t, d]] += weight * reference[[b, source, d]];
                    }
                }
            }
        }

        Ok(output)
    }
}
