//! WAV file input (§6.1): reads an entire file up front and replays it as
//! fixed-size chunks, the simplest possible stand-in for a live capture
//! device when a recording needs to be run through the board.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hound::{SampleFormat, WavReader as HoundReader};

use streamboard_foundation::alignment::ProcessorAlignment;
use streamboard_foundation::chunk::ChunkPayload;
use streamboard_foundation::continuity::Continuity;
use streamboard_foundation::error::{BoardError, ResourceError};
use streamboard_runtime::processor::{InputProcessor, ProducedData};

pub const SIGNAL_KEY: &str = "signal";

/// Replays a mono or multi-channel WAV file as a sequence of fixed-size
/// [`Chunk`](streamboard_foundation::chunk::Chunk)s. Multi-channel files are
/// averaged down to mono: per-channel fan-out is a separate processor's
/// concern, not this source's.
pub struct WavSource {
    name: String,
    path: PathBuf,
    chunk_size: usize,
    fs: f64,
    samples: Vec<f64>,
    cursor: usize,
    number: u64,
}

impl WavSource {
    /// Opens and fully decodes `path` up front; `prerun` is where decode
    /// errors would normally surface, but eager construction keeps the
    /// sample rate available for `processor_alignments` immediately.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, ResourceError> {
        let path = path.as_ref().to_path_buf();
        let mut reader = HoundReader::open(&path)
            .map_err(|e| ResourceError::FileUnwritable(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f64> = match spec.sample_format {
            SampleFormat::Int => {
                let max_value = (1i64 << (spec.bits_per_sample - 1)) as f64;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f64 / max_value))
                    .collect::<Result<Vec<f64>, _>>()
                    .map_err(|e| ResourceError::FileUnwritable(format!("decode error: {e}")))?
            }
            SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map(|v| v as f64))
                .collect::<Result<Vec<f64>, _>>()
                .map_err(|e| ResourceError::FileUnwritable(format!("decode error: {e}")))?,
        };

        let samples = if channels == 1 {
            interleaved
        } else {
            interleaved
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f64>() / channels as f64)
                .collect()
        };

        Ok(Self {
            name: name.into(),
            path,
            chunk_size: chunk_size.max(1),
            fs: spec.sample_rate as f64,
            samples,
            cursor: 0,
            number: 0,
        })
    }
}

#[async_trait]
impl InputProcessor for WavSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn processor_alignments(&self) -> BTreeMap<String, ProcessorAlignment> {
        BTreeMap::from([(SIGNAL_KEY.to_string(), ProcessorAlignment::identity(self.fs))])
    }

    async fn generate_data(
        &mut self,
    ) -> Result<Option<(ProducedData, Continuity, u64, f64, Option<String>)>, BoardError> {
        if self.cursor >= self.samples.len() {
            let produced: ProducedData =
                BTreeMap::from([(SIGNAL_KEY.to_string(), ChunkPayload::Series1(Vec::new()))]);
            let number = self.number;
            self.number += 1;
            return Ok(Some((produced, Continuity::Last, number, 0.0, None)));
        }

        let end = (self.cursor + self.chunk_size).min(self.samples.len());
        let slice = self.samples[self.cursor..end].to_vec();
        let start_time = self.cursor as f64 / self.fs;
        self.cursor = end;

        let continuity = if self.number == 0 {
            Continuity::NewFile
        } else {
            Continuity::WithPrevious
        };

        let identifier = Some(self.path.to_string_lossy().into_owned());
        let produced: ProducedData =
            BTreeMap::from([(SIGNAL_KEY.to_string(), ChunkPayload::Series1(slice))]);
        let number = self.number;
        self.number += 1;
        Ok(Some((produced, continuity, number, start_time, identifier)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_test_wav(path: &Path, fs: u32, samples: &[i16]) {
        let spec = WavSpec {
            channels: 1,
            sample_rate: fs,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test]
    async fn reads_back_whole_file_in_fixed_size_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let samples: Vec<i16> = (0..100).map(|i| (i * 100) as i16).collect();
        write_test_wav(&path, 8_000, &samples);

        let mut source = WavSource::open("wav", &path, 40).unwrap();
        assert_eq!(source.fs, 8_000.0);

        let (_p, c0, _n, _s, id0) = source.generate_data().await.unwrap().unwrap();
        assert_eq!(c0, Continuity::NewFile);
        assert!(id0.is_some());

        let (_p, c1, _n, _s, _id) = source.generate_data().await.unwrap().unwrap();
        assert_eq!(c1, Continuity::WithPrevious);

        let (_p, c2, _n, _s, _id) = source.generate_data().await.unwrap().unwrap();
        assert_eq!(c2, Continuity::WithPrevious);

        let (produced, c3, _n, _s, _id) = source.generate_data().await.unwrap().unwrap();
        assert_eq!(c3, Continuity::Last);
        if let ChunkPayload::Series1(samples) = &produced[SIGNAL_KEY] {
            assert!(samples.is_empty());
        }
    }

    #[tokio::test]
    async fn stereo_file_is_averaged_down_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for _ in 0..10 {
            writer.write_sample(100i16).unwrap();
            writer.write_sample(-100i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut source = WavSource::open("wav", &path, 10).unwrap();
        let (produced, _c, _n, _s, _id) = source.generate_data().await.unwrap().unwrap();
        if let ChunkPayload::Series1(samples) = &produced[SIGNAL_KEY] {
            assert!(samples.iter().all(|&v| v.abs() < 1e-6));
        } else {
            panic!("expected Series1 payload");
        }
    }
}
