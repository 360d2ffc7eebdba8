use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::alignment::ChunkAlignment;
use crate::continuity::Continuity;
use crate::error::ConfigError;

/// Per-processor metadata attached to a chunk: a hash of the producing
/// config, the config itself as JSON, and an optional free-form annotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    pub config_hash: u64,
    pub config_json: serde_json::Value,
    pub annotation_json: Option<serde_json::Value>,
}

/// The payload carried by a chunk. Time runs along the last axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChunkPayload {
    /// Rank-1 signal, e.g. a single-channel energy trace.
    Series1(Vec<f64>),
    /// Rank-2 signal: `rows` scale/channel rows, each a time series of equal
    /// length. Stored row-major (one `Vec<f64>` per scale) to make the
    /// per-row slicing used throughout the DSP and patch kernels direct.
    Series2(Vec<Vec<f64>>),
    /// Event-like payload (patch lists, join matrices, ...). Never aligned.
    Event(serde_json::Value),
}

impl ChunkPayload {
    /// Length along the last (time) axis. `None` for event payloads.
    pub fn time_len(&self) -> Option<usize> {
        match self {
            ChunkPayload::Series1(v) => Some(v.len()),
            ChunkPayload::Series2(rows) => Some(rows.first().map(|r| r.len()).unwrap_or(0)),
            ChunkPayload::Event(_) => None,
        }
    }

    pub fn is_empty_last_axis(&self) -> bool {
        matches!(self.time_len(), Some(0))
    }
}

/// A time-contiguous fragment of a stream, immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub payload: ChunkPayload,
    /// Wall-clock time of the first valid sample.
    pub start_time: f64,
    pub fs: f64,
    /// Per-producer, strictly increasing sequence number.
    pub number: u64,
    pub continuity: Continuity,
    pub alignment: ChunkAlignment,
    pub processor_name: String,
    pub sources: BTreeSet<String>,
    pub identifier: Option<String>,
    /// processor name -> publish timestamp, for latency tracing.
    pub data_generation_time: BTreeMap<String, f64>,
    pub metadata: BTreeMap<String, ConfigMetadata>,
    /// Wall-clock time of the first sample after trimming; set by the
    /// composite manager once a composite completes.
    pub initial_sample_time: Option<f64>,
}

impl Chunk {
    /// Enforce: empty-payload chunks are legal only with `continuity >=
    /// WithPrevious`. Returns a `ConfigError` otherwise, mirroring the
    /// "empty 2-D result is a fatal configuration error" rule from the
    /// publish contract.
    pub fn validate_empty_payload_rule(&self) -> Result<(), ConfigError> {
        if self.payload.is_empty_last_axis() && !self.continuity.at_least_with_previous() {
            return Err(ConfigError::EmptyResult {
                processor: self.processor_name.clone(),
                key: "<payload>".into(),
            });
        }
        Ok(())
    }

    /// True if `self` may legally follow `previous` as a `WithPrevious`
    /// chunk from the same producer.
    pub fn continues(&self, previous_number: u64) -> bool {
        self.number == previous_number + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_chunk(continuity: Continuity, data_len: usize) -> Chunk {
        Chunk {
            payload: ChunkPayload::Series1(vec![0.0; data_len]),
            start_time: 0.0,
            fs: 16_000.0,
            number: 1,
            continuity,
            alignment: ChunkAlignment::new(0, 0, 0, 0, 16_000.0),
            processor_name: "test".into(),
            sources: BTreeSet::new(),
            identifier: None,
            data_generation_time: BTreeMap::new(),
            metadata: BTreeMap::new(),
            initial_sample_time: None,
        }
    }

    #[test]
    fn empty_payload_requires_with_previous() {
        let bad = base_chunk(Continuity::Discontinuous, 0);
        assert!(bad.validate_empty_payload_rule().is_err());

        let good = base_chunk(Continuity::WithPrevious, 0);
        assert!(good.validate_empty_payload_rule().is_ok());
    }

    #[test]
    fn nonempty_payload_always_legal() {
        let c = base_chunk(Continuity::Discontinuous, 10);
        assert!(c.validate_empty_payload_rule().is_ok());
    }

    #[test]
    fn continues_checks_successor_number() {
        let c = base_chunk(Continuity::WithPrevious, 10);
        assert!(c.continues(0));
        assert!(!c.continues(5));
    }
}
