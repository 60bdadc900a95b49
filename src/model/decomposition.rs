//! Moving average and seasonal-trend decomposition
//!
//! Neither primitive is used by [`HierarchicalEncoder`](crate::HierarchicalEncoder);
//! they are exposed for callers that want to split a series into trend and
//! residual before or after encoding.

use ndarray::{concatenate, s, Array3, Axis};

use crate::error::{EncoderError, Result};

/// Sliding-window mean over the time axis with edge replication padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovingAverage {
    kernel_size: usize,
    stride: usize,
}

impl MovingAverage {
    pub fn new(kernel_size: usize, stride: usize) -> Result<Self> {
        if kernel_size == 0 || stride == 0 {
            return Err(EncoderError::InvalidConfig(format!(
                "moving average kernel ({}) and stride ({}) must be > 0",
                kernel_size, stride
            )));
        }
        Ok(Self { kernel_size, stride })
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Steps replicated on each end: `(kernel_size - 1) / 2`
    pub fn padding(&self) -> usize {
        (self.kernel_size - 1) / 2
    }

    /// Replicates the first and last time step `padding()` times
    pub fn pad(&self, x: &Array3<f64>) -> Result<Array3<f64>> {
        let (batch, len, channels) = x.dim();
        if len == 0 {
            return Err(EncoderError::shape("moving average input", "at least 1 time step", 0));
        }

        let pad = self.padding();
        if pad == 0 {
            return Ok(x.to_owned());
        }

        let first = x.slice(s![.., 0..1, ..]);
        let last = x.slice(s![.., len - 1..len, ..]);
        let front = first
            .broadcast((batch, pad, channels))
            .ok_or_else(|| EncoderError::shape("moving average front padding", pad, len))?;
        let end = last
            .broadcast((batch, pad, channels))
            .ok_or_else(|| EncoderError::shape("moving average end padding", pad, len))?;

        concatenate(Axis(1), &[front, x.view(), end])
            .map_err(|e| EncoderError::shape("moving average padding", "matching batch/channels", e))
    }

    /// Output length for an input of `len` steps
    pub fn output_len(&self, len: usize) -> Option<usize> {
        let padded = len + 2 * self.padding();
        if padded < self.kernel_size {
            return None;
        }
        Some((padded - self.kernel_size) / self.stride + 1)
    }

    /// Averages windows of `kernel_size` steps taken every `stride` steps
    pub fn forward(&self, x: &Array3<f64>) -> Result<Array3<f64>> {
        let (batch, len, channels) = x.dim();
        let out_len = self.output_len(len).ok_or_else(|| {
            EncoderError::shape(
                "moving average window",
                format!("padded length >= kernel {}", self.kernel_size),
                len + 2 * self.padding(),
            )
        })?;

        let padded = self.pad(x)?;
        let mut output = Array3::zeros((batch, out_len, channels));

        for t in 0..out_len {
            let start = t * self.stride;
            let window = padded.slice(s![.., start..start + self.kernel_size, ..]);
            if let Some(mean) = window.mean_axis(Axis(1)) {
                output.slice_mut(s![.., t, ..]).assign(&mean);
            }
        }

        Ok(output)
    }
}

/// Splits a series into `(residual, trend)` with a stride-1 moving average
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeriesDecomposition {
    moving_avg: MovingAverage,
}

impl SeriesDecomposition {
    pub fn new(kernel_size: usize) -> Result<Self> {
        Ok(Self {
            moving_avg: MovingAverage::new(kernel_size, 1)?,
        })
    }

    pub fn moving_average(&self) -> &MovingAverage {
        &self.moving_avg
    }

    /// Returns `(x - trend, trend)`
    pub fn forward(&self, x: &Array3<f64>) -> Result<(Array3<f64>, Array3<f64>)> {
        let trend = self.moving_avg.forward(x)?;
        if trend.dim() != x.dim() {
            return Err(EncoderError::shape(
                "series decomposition trend",
                format!("{:?}", x.dim()),
                format!("{:?} (use an odd kernel)", trend.dim()),
            ));
        }
        let residual = x - &trend;
        Ok((residual, trend))
    }
}
