//! A 1-D lowpass Overlap-Add resampler: a Kaiser-windowed FIR lowpass
//! filter, decimated by an integer factor `D` (§4.5).

use streamboard_foundation::alignment::ProcessorAlignment;
use streamboard_foundation::continuity::Continuity;
use streamboard_foundation::error::ResourceError;

use crate::overlap_add::OlaFilter1D;

/// Design a Kaiser-windowed lowpass FIR of `len` taps with normalized
/// cutoff `cutoff` (fraction of Nyquist) and shape parameter `beta`.
pub fn kaiser_lowpass_fir(len: usize, cutoff: f64, beta: f64) -> Vec<f64> {
    if len == 0 {
        return Vec::new();
    }
    let m = (len - 1) as f64;
    (0..len)
        .map(|n| {
            let x = n as f64 - m / 2.0;
            let sinc = if x.abs() < 1e-12 {
                2.0 * cutoff
            } else {
                (2.0 * std::f64::consts::PI * cutoff * x).sin() / (std::f64::consts::PI * x)
            };
            sinc * kaiser_window(n, len, beta)
        })
        .collect()
}

fn kaiser_window(n: usize, len: usize, beta: f64) -> f64 {
    if len <= 1 {
        return 1.0;
    }
    let alpha = (len - 1) as f64 / 2.0;
    let x = (n as f64 - alpha) / alpha;
    bessel_i0(beta * (1.0 - x * x).max(0.0).sqrt()) / bessel_i0(beta)
}

fn bessel_i0(x: f64) -> f64 {
    let mut sum = 1.0;
    let mut term = 1.0;
    for k in 1..25 {
        term *= (x / (2.0 * k as f64)).powi(2);
        sum += term;
    }
    sum
}

/// Streaming integer-ratio decimator. `filter_length % decimation == 0` is
/// enforced at construction (§7 `ResourceError::FilterLengthNotMultiple`).
pub struct Resampler {
    filter: OlaFilter1D,
    decimation: usize,
    /// Decimation phase carried across chunks: `offset = (offset -
    /// last_axis_len) mod D`.
    offset: i64,
    fs_in: f64,
}

impl Resampler {
    pub fn new(
        filter_len: usize,
        cutoff: f64,
        decimation: usize,
        target_latency_seconds: f64,
        fs_in: f64,
    ) -> Result<Self, ResourceError> {
        if decimation == 0 || filter_len % decimation != 0 {
            return Err(ResourceError::FilterLengthNotMultiple {
                filter_len,
                decimation,
            });
        }
        let h = kaiser_lowpass_fir(filter_len, cutoff, 8.0);
        let filter = OlaFilter1D::new(&h, target_latency_seconds, fs_in);
        Ok(Self {
            filter,
            decimation,
            offset: 0,
            fs_in,
        })
    }

    pub fn fs_out(&self) -> f64 {
        self.fs_in / self.decimation as f64
    }

    pub fn process(&mut self, x: &[f64], continuity: Continuity) -> Vec<f64> {
        if !continuity.at_least_with_previous() {
            self.offset = 0;
        }

        let filtered = self.filter.process(x, continuity);
        let d = self.decimation as i64;
        let mut out = Vec::new();
        let mut i = self.offset.rem_euclid(d);
        let len = filtered.len() as i64;
        while i < len {
            out.push(filtered[i as usize]);
            i += d;
        }
        self.offset = (self.offset - filtered.len() as i64).rem_euclid(d);
        out
    }

    pub fn processor_alignment(&self) -> ProcessorAlignment {
        ProcessorAlignment::new(0, 0, 0, 0, self.fs_out())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_filter_length_not_a_multiple_of_decimation() {
        let err = Resampler::new(10, 0.4, 3, 0.01, 16_000.0);
        assert!(err.is_err());
    }

    #[test]
    fn decimates_output_rate_by_the_configured_factor() {
        let mut r = Resampler::new(12, 0.4, 4, 0.01, 16_000.0).unwrap();
        assert_eq!(r.fs_out(), 4_000.0);
        let x: Vec<f64> = (0..4096).map(|i| (i as f64 * 0.05).sin()).collect();
        let out = r.process(&x, Continuity::Discontinuous);
        // Roughly 1/4 the samples (phase bookkeeping makes it exact but not
        // worth pinning beyond an order-of-magnitude check here).
        assert!(out.len() > 900 && out.len() < 1100);
    }

    #[test]
    fn phase_offset_stays_in_range_and_resets_on_discontinuity() {
        let mut r = Resampler::new(12, 0.4, 4, 0.01, 16_000.0).unwrap();
        let x = vec![0.0; 10];
        let _ = r.process(&x, Continuity::Discontinuous);
        assert!((0..4).contains(&r.offset));
        let _ = r.process(&x, Continuity::WithPrevious);
        assert!((0..4).contains(&r.offset));

        let _ = r.process(&x, Continuity::Discontinuous);
        // A fresh discontinuity always starts decimation at phase 0.
        assert_eq!(r.offset, (0i64 - 10i64).rem_euclid(4));
    }
}
