//! PTN / MaxTract feature aggregators (§4.8): blockwise band aggregation
//! of energy/pulse/tone/noise with soft (tanh) gating.

use streamboard_foundation::continuity::Continuity;

use crate::dither::safe_log2;

/// `gate(x) = (1 + tanh((x - threshold) * slope)) / 2`.
#[derive(Debug, Clone, Copy)]
pub struct GateParams {
    pub threshold: f64,
    pub slope: f64,
}

pub fn gate(x: f64, params: &GateParams) -> f64 {
    (1.0 + ((x - params.threshold) * params.slope).tanh()) / 2.0
}

/// Split points along the scale axis; bands are `[0..s0) [s0..s1) ...
/// [sn..S)`, and the first and last band are discarded (§4.8).
#[derive(Debug, Clone)]
pub struct BandSplit {
    pub splits: Vec<usize>,
}

/// Partition `values` (one sample per scale row) into bands and take each
/// band's mean, discarding the first and last band.
pub fn bandmean(values: &[f64], splits: &BandSplit) -> Vec<f64> {
    let mut bounds = vec![0usize];
    bounds.extend(splits.splits.iter().copied());
    bounds.push(values.len());

    let bands: Vec<f64> = bounds
        .windows(2)
        .map(|w| {
            let (lo, hi) = (w[0], w[1]);
            if hi <= lo {
                0.0
            } else {
                values[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
            }
        })
        .collect();

    if bands.len() > 2 {
        bands[1..bands.len() - 1].to_vec()
    } else {
        Vec::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PtnOutput {
    pub energy: Vec<f64>,
    pub pulse: Vec<f64>,
    pub tone: Vec<f64>,
    pub noise: Vec<f64>,
}

fn append_columns(buffer: &mut Vec<Vec<f64>>, data: &[Vec<f64>]) {
    if buffer.is_empty() {
        buffer.resize(data.len(), Vec::new());
    }
    for (row, incoming) in buffer.iter_mut().zip(data.iter()) {
        row.extend_from_slice(incoming);
    }
}

/// Receives `{E, f_tract, s_tract}` at a common rate and emits one
/// [`PtnOutput`] every `block_width` samples.
pub struct PtnAggregator {
    block_width: usize,
    splits: BandSplit,
    gate_params: GateParams,
    log_compress: bool,
    log_offset: f64,
    buffer_e: Vec<Vec<f64>>,
    buffer_f: Vec<Vec<f64>>,
    buffer_s: Vec<Vec<f64>>,
    accumulated: usize,
}

impl PtnAggregator {
    pub fn new(
        block_width: usize,
        splits: BandSplit,
        gate_params: GateParams,
        log_compress: bool,
        log_offset: f64,
    ) -> Self {
        Self {
            block_width: block_width.max(1),
            splits,
            gate_params,
            log_compress,
            log_offset,
            buffer_e: Vec::new(),
            buffer_f: Vec::new(),
            buffer_s: Vec::new(),
            accumulated: 0,
        }
    }

    /// Discontinuity resets the buffer and restarts the block boundary at
    /// the arriving chunk's first aligned sample.
    pub fn reset(&mut self) {
        self.buffer_e.clear();
        self.buffer_f.clear();
        self.buffer_s.clear();
        self.accumulated = 0;
    }

    pub fn process(
        &mut self,
        e: &[Vec<f64>],
        f_tract: &[Vec<f64>],
        s_tract: &[Vec<f64>],
        continuity: Continuity,
    ) -> Vec<PtnOutput> {
        if !continuity.at_least_with_previous() {
            self.reset();
        }

        append_columns(&mut self.buffer_e, e);
        append_columns(&mut self.buffer_f, f_tract);
        append_columns(&mut self.buffer_s, s_tract);
        self.accumulated += e.first().map(|r| r.len()).unwrap_or(0);

        let mut outputs = Vec::new();
        while self.accumulated >= self.block_width {
            let scale_rows = self.buffer_e.len();
            let mut energy_row = vec![0.0; scale_rows];
            let mut pulse_row = vec![0.0; scale_rows];
            let mut tone_row = vec![0.0; scale_rows];
            let mut noise_row = vec![0.0; scale_rows];

            for row in 0..scale_rows {
                let e_block = &self.buffer_e[row][..self.block_width];
                let f_block = &self.buffer_f[row][..self.block_width];
                let s_block = &self.buffer_s[row][..self.block_width];

                let mut e_sum = 0.0;
                let mut pulse_sum = 0.0;
                let mut tone_sum = 0.0;
                let mut noise_sum = 0.0;
                for i in 0..self.block_width {
                    let gf = gate(f_block[i], &self.gate_params);
                    let gs = gate(s_block[i], &self.gate_params);
                    e_sum += e_block[i];
                    pulse_sum += e_block[i] * gf;
                    tone_sum += e_block[i] * gs;
                    noise_sum += e_block[i] * (1.0 - gf) * (1.0 - gs);
                }
                let n = self.block_width as f64;
                energy_row[row] = e_sum / n;
                pulse_row[row] = pulse_sum / n;
                tone_row[row] = tone_sum / n;
                noise_row[row] = noise_sum / n;
            }

            let mut energy = bandmean(&energy_row, &self.splits);
            if self.log_compress {
                energy = energy.into_iter().map(|v| safe_log2(v) + self.log_offset).collect();
            }

            outputs.push(PtnOutput {
                energy,
                pulse: bandmean(&pulse_row, &self.splits),
                tone: bandmean(&tone_row, &self.splits),
                noise: bandmean(&noise_row, &self.splits),
            });

            for row in self.buffer_e.iter_mut() {
                row.drain(..self.block_width);
            }
            for row in self.buffer_f.iter_mut() {
                row.drain(..self.block_width);
            }
            for row in self.buffer_s.iter_mut() {
                row.drain(..self.block_width);
            }
            self.accumulated -= self.block_width;
        }

        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_saturates_toward_zero_and_one() {
        let p = GateParams {
            threshold: 0.0,
            slope: 10.0,
        };
        assert!(gate(-5.0, &p) < 0.01);
        assert!(gate(5.0, &p) > 0.99);
        assert!((gate(0.0, &p) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn bandmean_discards_first_and_last_band() {
        let values = vec![1.0; 10];
        let splits = BandSplit { splits: vec![2, 5, 8] };
        let bands = bandmean(&values, &splits);
        // 4 total bands (0-2, 2-5, 5-8, 8-10); first and last discarded.
        assert_eq!(bands.len(), 2);
    }

    #[test]
    fn emits_one_block_per_block_width_samples() {
        let mut agg = PtnAggregator::new(
            4,
            BandSplit { splits: vec![1] },
            GateParams {
                threshold: 0.5,
                slope: 4.0,
            },
            false,
            0.0,
        );
        let e = vec![vec![1.0; 4]; 3];
        let f = vec![vec![0.6; 4]; 3];
        let s = vec![vec![0.2; 4]; 3];
        let out = agg.process(&e, &f, &s, Continuity::Discontinuous);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn discontinuity_resets_partial_block_accumulation() {
        let mut agg = PtnAggregator::new(
            8,
            BandSplit { splits: vec![1] },
            GateParams {
                threshold: 0.5,
                slope: 4.0,
            },
            false,
            0.0,
        );
        let e = vec![vec![1.0; 4]; 3];
        let f = vec![vec![0.6; 4]; 3];
        let s = vec![vec![0.2; 4]; 3];
        let out = agg.process(&e, &f, &s, Continuity::Discontinuous);
        assert!(out.is_empty());
        assert_eq!(agg.accumulated, 4);

        agg.process(&e, &f, &s, Continuity::Discontinuous);
        // A second discontinuity resets the partial accumulation rather
        // than completing the pending block.
        assert_eq!(agg.accumulated, 4);
    }
}
