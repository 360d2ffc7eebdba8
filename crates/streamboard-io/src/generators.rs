//! Synthetic input generators (sine tone, white noise): the simplest
//! possible [`InputProcessor`] implementations, useful for exercising the
//! Board/composite-manager machinery without real audio hardware.

use std::collections::BTreeMap;
use std::f64::consts::PI;

use async_trait::async_trait;
use rand::Rng;

use streamboard_foundation::alignment::ProcessorAlignment;
use streamboard_foundation::chunk::ChunkPayload;
use streamboard_foundation::continuity::Continuity;
use streamboard_foundation::error::BoardError;
use streamboard_runtime::processor::{InputProcessor, ProducedData};

/// Output key both generators publish under.
pub const SIGNAL_KEY: &str = "signal";

/// Emits a pure sine tone, one chunk of `chunk_size` samples at a time.
pub struct SineGenerator {
    name: String,
    fs: f64,
    freq: f64,
    amplitude: f64,
    chunk_size: usize,
    /// Total samples to emit before publishing `Last`; `None` runs forever.
    total_samples: Option<u64>,
    phase: f64,
    number: u64,
    samples_emitted: u64,
}

impl SineGenerator {
    pub fn new(
        name: impl Into<String>,
        fs: f64,
        freq: f64,
        amplitude: f64,
        chunk_size: usize,
        total_samples: Option<u64>,
    ) -> Self {
        Self {
            name: name.into(),
            fs,
            freq,
            amplitude,
            chunk_size,
            total_samples,
            phase: 0.0,
            number: 0,
            samples_emitted: 0,
        }
    }
}

#[async_trait]
impl InputProcessor for SineGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn processor_alignments(&self) -> BTreeMap<String, ProcessorAlignment> {
        BTreeMap::from([(SIGNAL_KEY.to_string(), ProcessorAlignment::identity(self.fs))])
    }

    async fn generate_data(
        &mut self,
    ) -> Result<Option<(ProducedData, Continuity, u64, f64, Option<String>)>, BoardError> {
        if let Some(total) = self.total_samples {
            if self.samples_emitted >= total {
                let produced: ProducedData =
                    BTreeMap::from([(SIGNAL_KEY.to_string(), ChunkPayload::Series1(Vec::new()))]);
                let number = self.number;
                self.number += 1;
                return Ok(Some((produced, Continuity::Last, number, 0.0, None)));
            }
        }

        let omega = 2.0 * PI * self.freq / self.fs;
        let samples: Vec<f64> = (0..self.chunk_size)
            .map(|_| {
                let v = self.amplitude * self.phase.sin();
                self.phase = (self.phase + omega) % (2.0 * PI);
                v
            })
            .collect();

        let continuity = if self.number == 0 {
            Continuity::Discontinuous
        } else {
            Continuity::WithPrevious
        };

        let start_time = self.samples_emitted as f64 / self.fs;
        self.samples_emitted += samples.len() as u64;

        let produced: ProducedData =
            BTreeMap::from([(SIGNAL_KEY.to_string(), ChunkPayload::Series1(samples))]);
        let number = self.number;
        self.number += 1;
        Ok(Some((produced, continuity, number, start_time, None)))
    }
}

/// Emits uniform white noise in `[-amplitude, amplitude]`.
pub struct NoiseGenerator {
    name: String,
    fs: f64,
    amplitude: f64,
    chunk_size: usize,
    total_samples: Option<u64>,
    number: u64,
    samples_emitted: u64,
}

impl NoiseGenerator {
    pub fn new(
        name: impl Into<String>,
        fs: f64,
        amplitude: f64,
        chunk_size: usize,
        total_samples: Option<u64>,
    ) -> Self {
        Self {
            name: name.into(),
            fs,
            amplitude,
            chunk_size,
            total_samples,
            number: 0,
            samples_emitted: 0,
        }
    }
}

#[async_trait]
impl InputProcessor for NoiseGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn processor_alignments(&self) -> BTreeMap<String, ProcessorAlignment> {
        BTreeMap::from([(SIGNAL_KEY.to_string(), ProcessorAlignment::identity(self.fs))])
    }

    async fn generate_data(
        &mut self,
    ) -> Result<Option<(ProducedData, Continuity, u64, f64, Option<String>)>, BoardError> {
        if let Some(total) = self.total_samples {
            if self.samples_emitted >= total {
                let produced: ProducedData =
                    BTreeMap::from([(SIGNAL_KEY.to_string(), ChunkPayload::Series1(Vec::new()))]);
                let number = self.number;
                self.number += 1;
                return Ok(Some((produced, Continuity::Last, number, 0.0, None)));
            }
        }

        let mut rng = rand::thread_rng();
        let samples: Vec<f64> = (0..self.chunk_size)
            .map(|_| rng.gen_range(-self.amplitude..=self.amplitude))
            .collect();

        let continuity = if self.number == 0 {
            Continuity::Discontinuous
        } else {
            Continuity::WithPrevious
        };

        let start_time = self.samples_emitted as f64 / self.fs;
        self.samples_emitted += samples.len() as u64;

        let produced: ProducedData =
            BTreeMap::from([(SIGNAL_KEY.to_string(), ChunkPayload::Series1(samples))]);
        let number = self.number;
        self.number += 1;
        Ok(Some((produced, continuity, number, start_time, None)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sine_generator_first_chunk_is_discontinuous() {
        let mut gen = SineGenerator::new("sine", 8_000.0, 440.0, 1.0, 64, None);
        let (_produced, continuity, number, _start, _id) =
            gen.generate_data().await.unwrap().unwrap();
        assert_eq!(continuity, Continuity::Discontinuous);
        assert_eq!(number, 0);

        let (_produced, continuity, number, _start, _id) =
            gen.generate_data().await.unwrap().unwrap();
        assert_eq!(continuity, Continuity::WithPrevious);
        assert_eq!(number, 1);
    }

    #[tokio::test]
    async fn sine_generator_emits_last_once_total_is_reached() {
        let mut gen = SineGenerator::new("sine", 8_000.0, 440.0, 1.0, 64, Some(64));
        let (_produced, continuity, _number, _start, _id) =
            gen.generate_data().await.unwrap().unwrap();
        assert_eq!(continuity, Continuity::WithPrevious.min(continuity), "sanity");

        let (_produced, continuity, _number, _start, _id) =
            gen.generate_data().await.unwrap().unwrap();
        assert_eq!(continuity, Continuity::Last);
    }

    #[tokio::test]
    async fn noise_generator_samples_stay_within_amplitude() {
        let mut gen = NoiseGenerator::new("noise", 8_000.0, 0.5, 128, None);
        let (produced, _continuity, _number, _start, _id) =
            gen.generate_data().await.unwrap().unwrap();
        if let ChunkPayload::Series1(samples) = &produced[SIGNAL_KEY] {
            assert!(samples.iter().all(|&v| v.abs() <= 0.5 + 1e-9));
        } else {
            panic!("expected Series1 payload");
        }
    }
}
