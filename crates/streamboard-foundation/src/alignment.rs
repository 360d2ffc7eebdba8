use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Per-chunk metadata describing which samples are truly valid given filter
/// history, and the stream's sample rate. Attached to every chunk alongside
/// its [`crate::continuity::Continuity`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkAlignment {
    /// Leading samples taken from the prior chunk to provide filter warmup.
    pub included_past: i64,
    /// Leading samples to discard after a discontinuity reset.
    pub dropped_after_discontinuity: i64,
    /// Band margin (large-scale / low-frequency side) that carries no meaning.
    pub invalid_large_scales: i64,
    /// Band margin (small-scale / high-frequency side) that carries no meaning.
    pub invalid_small_scales: i64,
    /// False for event-like features (e.g. patch lists) that are not samplewise.
    pub alignable: bool,
    /// Sample rate of this stream. Required whenever `alignable` is true.
    pub fsampling: Option<f64>,
}

impl ChunkAlignment {
    pub fn new(
        included_past: i64,
        dropped_after_discontinuity: i64,
        invalid_large_scales: i64,
        invalid_small_scales: i64,
        fsampling: f64,
    ) -> Self {
        Self {
            included_past,
            dropped_after_discontinuity,
            invalid_large_scales,
            invalid_small_scales,
            alignable: true,
            fsampling: Some(fsampling),
        }
    }

    /// Construct an alignment for an event-like, non-samplewise feature.
    pub fn not_alignable() -> Self {
        Self {
            included_past: 0,
            dropped_after_discontinuity: 0,
            invalid_large_scales: 0,
            invalid_small_scales: 0,
            alignable: false,
            fsampling: None,
        }
    }

    /// Merge with another alignment of the same sample rate, taking the max
    /// of every integer field. Both inputs must be alignable.
    pub fn merge(&self, other: &ChunkAlignment) -> Result<ChunkAlignment, ProtocolError> {
        if !(self.alignable && other.alignable) {
            return Err(ProtocolError::AlignmentMismatch(
                "cannot merge: at least one side is not alignable".into(),
            ));
        }
        if self.fsampling != other.fsampling {
            return Err(ProtocolError::AlignmentMismatch(format!(
                "cannot merge: incompatible sampling frequencies {:?} vs {:?}",
                self.fsampling, other.fsampling
            )));
        }
        Ok(ChunkAlignment {
            included_past: self.included_past.max(other.included_past),
            dropped_after_discontinuity: self
                .dropped_after_discontinuity
                .max(other.dropped_after_discontinuity),
            invalid_large_scales: self.invalid_large_scales.max(other.invalid_large_scales),
            invalid_small_scales: self.invalid_small_scales.max(other.invalid_small_scales),
            alignable: true,
            fsampling: self.fsampling,
        })
    }

    /// Apply an output-side delta (a [`ProcessorAlignment`]), adding deltas
    /// and performing a sample-rate conversion when the rates differ.
    pub fn impose_processor_alignment(
        &self,
        processor_alignment: &ProcessorAlignment,
    ) -> ChunkAlignment {
        let pa = &processor_alignment.0;
        let (included_past, dropped_after_discontinuity) = match (self.fsampling, pa.fsampling) {
            (Some(in_fs), Some(out_fs)) if in_fs == out_fs => (
                self.included_past + pa.included_past,
                self.dropped_after_discontinuity + pa.dropped_after_discontinuity,
            ),
            (Some(in_fs), Some(out_fs)) => (
                ((self.included_past as f64 * out_fs) / in_fs) as i64 + pa.included_past,
                ((self.dropped_after_discontinuity as f64 * out_fs) / in_fs) as i64
                    + pa.dropped_after_discontinuity,
            ),
            _ => (pa.included_past, pa.dropped_after_discontinuity),
        };

        ChunkAlignment {
            included_past,
            dropped_after_discontinuity,
            invalid_large_scales: self.invalid_large_scales + pa.invalid_large_scales,
            invalid_small_scales: self.invalid_small_scales + pa.invalid_small_scales,
            alignable: true,
            fsampling: pa.fsampling,
        }
    }
}

/// The delta a single processor output introduces relative to its merged
/// input alignment. Distinct type from [`ChunkAlignment`] so that `merge`
/// (defined only between chunk alignments) and `impose` (defined only
/// between a chunk alignment and a processor alignment) cannot be confused,
/// mirroring the source's `processorAlignment(chunkAlignment)` subclass via
/// a thin composition wrapper instead of inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProcessorAlignment(pub ChunkAlignment);

impl ProcessorAlignment {
    pub fn new(
        included_past: i64,
        dropped_after_discontinuity: i64,
        invalid_large_scales: i64,
        invalid_small_scales: i64,
        fsampling: f64,
    ) -> Self {
        Self(ChunkAlignment::new(
            included_past,
            dropped_after_discontinuity,
            invalid_large_scales,
            invalid_small_scales,
            fsampling,
        ))
    }

    pub fn identity(fsampling: f64) -> Self {
        Self::new(0, 0, 0, 0, fsampling)
    }

    pub fn fsampling(&self) -> Option<f64> {
        self.0.fsampling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_takes_max_of_each_field() {
        let a = ChunkAlignment::new(15, 37, 0, 0, 41_000.0);
        let b = ChunkAlignment::new(13, 27, 0, 5, 41_000.0);
        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.included_past, 15);
        assert_eq!(merged.dropped_after_discontinuity, 37);
        assert_eq!(merged.invalid_small_scales, 5);
        assert_eq!(merged.fsampling, Some(41_000.0));
    }

    #[test]
    fn merge_rejects_mismatched_rates() {
        let a = ChunkAlignment::new(0, 0, 0, 0, 16_000.0);
        let b = ChunkAlignment::new(0, 0, 0, 0, 8_000.0);
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn impose_same_rate_adds_deltas() {
        let input = ChunkAlignment::new(10, 5, 0, 0, 16_000.0);
        let delta = ProcessorAlignment::new(0, 3, 0, 0, 16_000.0);
        let out = input.impose_processor_alignment(&delta);
        assert_eq!(out.included_past, 10);
        assert_eq!(out.dropped_after_discontinuity, 8);
        assert_eq!(out.fsampling, Some(16_000.0));
    }

    #[test]
    fn impose_converts_sample_rate() {
        let input = ChunkAlignment::new(100, 0, 0, 0, 48_000.0);
        let delta = ProcessorAlignment::new(0, 0, 0, 0, 16_000.0);
        let out = input.impose_processor_alignment(&delta);
        // 100 samples at 48k correspond to ~33 samples at 16k.
        assert_eq!(out.included_past, 33);
        assert_eq!(out.fsampling, Some(16_000.0));
    }
}
