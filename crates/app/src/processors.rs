//! Concrete DAG stages assembled from the library crates' kernels: a
//! demonstration band-pass filter stage and a terminal persistence sink.
//! Neither kernel here is novel; this module only wires them up as
//! `Processor` implementors the Board can run.

use std::collections::BTreeMap;

use async_trait::async_trait;

use streamboard_dsp::resampler::kaiser_lowpass_fir;
use streamboard_dsp::OlaFilter1D;
use streamboard_foundation::alignment::ProcessorAlignment;
use streamboard_foundation::chunk::ChunkPayload;
use streamboard_foundation::error::{BoardError, ConfigError};
use streamboard_io::hdf::ChunkSink;
use streamboard_runtime::composite::CompositeChunk;
use streamboard_runtime::processor::{Processor, ProducedData};

pub const SIGNAL_KEY: &str = "signal";
pub const FILTERED_KEY: &str = "filtered";

/// A single band-pass demonstration filter run through the overlap-add
/// machinery. Band edges are fixed fractions of Nyquist: wide enough to
/// leave audible content untouched, narrow enough that the filter's effect
/// is visible in the persisted output.
pub struct BandpassFilterProcessor {
    name: String,
    filter: OlaFilter1D,
    n_overlap: usize,
    fs: f64,
}

impl BandpassFilterProcessor {
    pub fn new(name: impl Into<String>, filter_len: usize, target_latency_seconds: f64, fs: f64) -> Self {
        let low = kaiser_lowpass_fir(filter_len, 0.35, 8.0);
        let wide = kaiser_lowpass_fir(filter_len, 0.05, 8.0);
        let h: Vec<f64> = low.iter().zip(wide.iter()).map(|(a, b)| a - b).collect();
        let filter = OlaFilter1D::new(&h, target_latency_seconds, fs);
        let n_overlap = filter.n_overlap();
        Self {
            name: name.into(),
            filter,
            n_overlap,
            fs,
        }
    }
}

#[async_trait]
impl Processor for BandpassFilterProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_keys(&self) -> Vec<String> {
        vec![SIGNAL_KEY.to_string()]
    }

    fn processor_alignments(&self) -> BTreeMap<String, ProcessorAlignment> {
        BTreeMap::from([(
            FILTERED_KEY.to_string(),
            ProcessorAlignment::new(0, self.n_overlap as i64, 0, 0, self.fs),
        )])
    }

    async fn process(&mut self, composite: &CompositeChunk) -> Result<ProducedData, BoardError> {
        let chunk = composite.received.get(SIGNAL_KEY).ok_or_else(|| {
            BoardError::Config(ConfigError::EmptyResult {
                processor: self.name.clone(),
                key: SIGNAL_KEY.to_string(),
            })
        })?;

        let samples = match &chunk.payload {
            ChunkPayload::Series1(v) => v.as_slice(),
            _ => &[],
        };

        let filtered = self.filter.process(samples, composite.continuity);
        Ok(BTreeMap::from([(
            FILTERED_KEY.to_string(),
            ChunkPayload::Series1(filtered),
        )]))
    }
}

/// Terminal stage: persists every completed composite's payload and
/// produces nothing downstream.
pub struct PersistProcessor {
    name: String,
    sink: Box<dyn ChunkSink>,
    input_key: String,
}

impl PersistProcessor {
    pub fn new(name: impl Into<String>, input_key: impl Into<String>, sink: Box<dyn ChunkSink>) -> Self {
        Self {
            name: name.into(),
            sink,
            input_key: input_key.into(),
        }
    }
}

#[async_trait]
impl Processor for PersistProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_keys(&self) -> Vec<String> {
        vec![self.input_key.clone()]
    }

    fn processor_alignments(&self) -> BTreeMap<String, ProcessorAlignment> {
        BTreeMap::new()
    }

    async fn process(&mut self, composite: &CompositeChunk) -> Result<ProducedData, BoardError> {
        if let Some(chunk) = composite.received.get(&self.input_key) {
            self.sink.write_chunk(chunk).await?;
        }
        Ok(BTreeMap::new())
    }

    async fn finalize(&mut self) -> Result<(), BoardError> {
        self.sink.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap as Map, BTreeSet};
    use streamboard_foundation::alignment::ChunkAlignment;
    use streamboard_foundation::chunk::Chunk;
    use streamboard_foundation::continuity::Continuity;

    fn signal_composite(samples: Vec<f64>, continuity: Continuity) -> CompositeChunk {
        let chunk = Chunk {
            payload: ChunkPayload::Series1(samples),
            start_time: 0.0,
            fs: 8_000.0,
            number: 0,
            continuity,
            alignment: ChunkAlignment::new(0, 0, 0, 0, 8_000.0),
            processor_name: "gen".into(),
            sources: BTreeSet::new(),
            identifier: None,
            data_generation_time: Map::new(),
            metadata: Map::new(),
            initial_sample_time: None,
        };
        CompositeChunk {
            number: 0,
            continuity,
            chunk_continuity: continuity,
            alignment: ChunkAlignment::new(0, 0, 0, 0, 8_000.0),
            start_time: 0.0,
            initial_sample_time: 0.0,
            identifier: None,
            sources: BTreeSet::new(),
            data_generation_time: Map::new(),
            metadata: Map::new(),
            received: Map::from([("signal".to_string(), chunk)]),
        }
    }

    #[tokio::test]
    async fn bandpass_processor_emits_a_filtered_series() {
        let mut proc = BandpassFilterProcessor::new("bp", 63, 0.01, 8_000.0);
        let x: Vec<f64> = (0..512).map(|i| (i as f64 * 0.2).sin()).collect();
        let composite = signal_composite(x, Continuity::Discontinuous);
        let produced = proc.process(&composite).await.unwrap();
        match &produced[FILTERED_KEY] {
            ChunkPayload::Series1(v) => assert!(!v.is_empty()),
            _ => panic!("expected Series1"),
        }
    }

    #[tokio::test]
    async fn persist_processor_writes_every_composite_to_its_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = streamboard_io::hdf::RotatingFileSink::open(dir.path(), "out", 1 << 20).unwrap();
        let mut proc = PersistProcessor::new("persist", "signal", Box::new(sink));

        let composite = signal_composite(vec![1.0, 2.0, 3.0], Continuity::WithPrevious);
        proc.process(&composite).await.unwrap();
        proc.finalize().await.unwrap();

        let records = streamboard_io::hdf::read_all_records(dir.path(), "out").unwrap();
        assert_eq!(records.len(), 1);
    }
}
