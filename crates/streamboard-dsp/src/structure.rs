//! Structure extractor wrapper (§4.6): calibration-loaded coefficients
//! plus per-chunk remainder buffering. The numeric kernel itself (the
//! horizontal/vertical tract computation) is out of scope beyond its
//! alignment contract, so it is a pluggable [`StructureKernel`]; this
//! module owns everything around it — calibration persistence, remainder
//! bookkeeping, and the output key layout.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use streamboard_foundation::alignment::ProcessorAlignment;
use streamboard_foundation::continuity::Continuity;
use streamboard_foundation::error::ResourceError;

/// The four texture types the structure extractor computes tracts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TextureType {
    F,
    U,
    S,
    D,
}

impl TextureType {
    pub const ALL: [TextureType; 4] = [TextureType::F, TextureType::U, TextureType::S, TextureType::D];

    pub fn key(self) -> &'static str {
        match self {
            TextureType::F => "f",
            TextureType::U => "u",
            TextureType::S => "s",
            TextureType::D => "d",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FrameOffsets {
    pub first: usize,
    pub last: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ScaleOffsets {
    pub first: usize,
    pub last: usize,
}

/// Calibration statistics for one texture type, one of {pattern, tract}.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextureStats {
    pub mean: Vec<f64>,
    pub stddev: Vec<f64>,
    pub threshold_crossings: Vec<f64>,
    pub interpolation_deltas: Vec<f64>,
    pub area_sizes: Vec<f64>,
    pub context_area: Vec<Vec<f64>>,
    pub frame_offsets: FrameOffsets,
    pub scale_offsets: ScaleOffsets,
}

/// On-disk calibration cache keyed by texture type: `(pattern_stats,
/// tract_stats)` per §6.4, persisted at `<cache_name>.cache`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationCache {
    pub entries: BTreeMap<String, (TextureStats, TextureStats)>,
}

/// The per-texture-type numeric kernel. Implementations live outside this
/// crate's contract; only the shapes and margins it promises matter here.
pub trait StructureKernel: Send {
    /// Run once per texture type on the concatenated `remainder ++ chunk`
    /// buffer, returning `(tract, pattern)` arrays shaped like the input.
    fn run(
        &self,
        texture_type: TextureType,
        buffer: &[Vec<f64>],
        tract_stats: &TextureStats,
    ) -> (Vec<Vec<f64>>, Vec<Vec<f64>>);
}

fn concat_time(remainder: &[Vec<f64>], chunk: &[Vec<f64>]) -> Vec<Vec<f64>> {
    if remainder.is_empty() {
        return chunk.to_vec();
    }
    remainder
        .iter()
        .zip(chunk.iter())
        .map(|(r, c)| {
            let mut row = r.clone();
            row.extend_from_slice(c);
            row
        })
        .collect()
}

fn trailing_columns(buffer: &[Vec<f64>], margin: usize) -> Vec<Vec<f64>> {
    buffer
        .iter()
        .map(|row| row[row.len().saturating_sub(margin)..].to_vec())
        .collect()
}

/// Owns the calibration cache and the per-texture-type remainder buffers
/// across chunks.
pub struct StructureExtractorWrapper<K: StructureKernel> {
    kernel: K,
    cache_path: PathBuf,
    cache: Option<CalibrationCache>,
    remainders: BTreeMap<TextureType, Vec<Vec<f64>>>,
}

impl<K: StructureKernel> StructureExtractorWrapper<K> {
    pub fn new(kernel: K, cache_name: impl Into<String>) -> Self {
        Self {
            kernel,
            cache_path: PathBuf::from(format!("{}.cache", cache_name.into())),
            cache: None,
            remainders: BTreeMap::new(),
        }
    }

    pub fn with_cache_path(mut self, path: PathBuf) -> Self {
        self.cache_path = path;
        self
    }

    pub fn is_calibrated(&self) -> bool {
        self.cache.is_some()
    }

    /// `prerun`: load the persisted cache from disk.
    pub fn load_cache(&mut self) -> Result<(), ResourceError> {
        let bytes = std::fs::read(&self.cache_path)?;
        self.cache = Some(
            bincode::deserialize(&bytes)
                .map_err(|e| ResourceError::FileUnwritable(format!("corrupt calibration cache: {e}")))?,
        );
        Ok(())
    }

    /// Offline calibration phase: run on receipt of the single `Calibration`
    /// chunk, then persist.
    pub fn calibrate(
        &mut self,
        calibration_payload: &BTreeMap<TextureType, Vec<Vec<f64>>>,
        compute: impl Fn(TextureType, &[Vec<f64>]) -> (TextureStats, TextureStats),
    ) -> Result<(), ResourceError> {
        let mut entries = BTreeMap::new();
        for (&texture_type, data) in calibration_payload {
            let (pattern_stats, tract_stats) = compute(texture_type, data);
            entries.insert(texture_type.key().to_string(), (pattern_stats, tract_stats));
        }
        let cache = CalibrationCache { entries };
        let bytes = bincode::serialize(&cache)
            .map_err(|e| ResourceError::FileUnwritable(format!("failed to serialize calibration: {e}")))?;
        std::fs::write(&self.cache_path, bytes)?;
        self.cache = Some(cache);
        Ok(())
    }

    /// Online phase: per chunk, per texture type, prepend the remainder,
    /// run the kernel, and update the remainder to the trailing
    /// `frame_offsets.first + frame_offsets.last` columns.
    pub fn process_chunk(
        &mut self,
        chunk_ts_rep: &BTreeMap<TextureType, Vec<Vec<f64>>>,
        continuity: Continuity,
    ) -> BTreeMap<String, Vec<Vec<f64>>> {
        let cache = self
            .cache
            .as_ref()
            .expect("calibration cache must be loaded before online processing")
            .clone();
        let mut out = BTreeMap::new();

        for texture_type in TextureType::ALL {
            let Some(data) = chunk_ts_rep.get(&texture_type) else {
                continue;
            };
            let key = texture_type.key();
            let (_pattern_stats, tract_stats) = &cache.entries[key];
            let margin = tract_stats.frame_offsets.first + tract_stats.frame_offsets.last;

            let buffer = if continuity.at_least_with_previous() {
                let remainder = self.remainders.get(&texture_type).cloned().unwrap_or_default();
                concat_time(&remainder, data)
            } else {
                data.clone()
            };

            let (tract, pattern) = self.kernel.run(texture_type, &buffer, tract_stats);

            self.remainders.insert(texture_type, trailing_columns(&buffer, margin));

            out.insert(format!("{key}_tract"), tract);
            out.insert(format!("{key}_pattern"), pattern);
        }

        out
    }

    /// The processor alignment for `{texture_type}_tract` /
    /// `{texture_type}_pattern`: the kernel's margins encoded as an
    /// alignment delta (§4.6).
    pub fn processor_alignment(&self, texture_type: TextureType, fs: f64) -> ProcessorAlignment {
        let stats = &self.cache.as_ref().expect("cache loaded").entries[texture_type.key()].1;
        ProcessorAlignment::new(
            stats.frame_offsets.last as i64,
            stats.frame_offsets.first as i64,
            stats.scale_offsets.last as i64,
            stats.scale_offsets.first as i64,
            fs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PassthroughKernel;

    impl StructureKernel for PassthroughKernel {
        fn run(
            &self,
            _texture_type: TextureType,
            buffer: &[Vec<f64>],
            _tract_stats: &TextureStats,
        ) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
            (buffer.to_vec(), buffer.to_vec())
        }
    }

    fn stats(first: usize, last: usize) -> TextureStats {
        TextureStats {
            mean: vec![],
            stddev: vec![],
            threshold_crossings: vec![],
            interpolation_deltas: vec![],
            area_sizes: vec![],
            context_area: vec![],
            frame_offsets: FrameOffsets { first, last },
            scale_offsets: ScaleOffsets::default(),
        }
    }

    #[test]
    fn remainder_is_prepended_only_when_continuous() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let cache_path = tmp.path().to_path_buf();
        let mut wrapper = StructureExtractorWrapper::new(PassthroughKernel, "calib").with_cache_path(cache_path);

        let mut calibration = BTreeMap::new();
        calibration.insert(TextureType::F, vec![vec![0.0; 4]; 2]);
        wrapper
            .calibrate(&calibration, |_, _| (stats(2, 2), stats(2, 2)))
            .unwrap();

        let mut chunk = BTreeMap::new();
        chunk.insert(TextureType::F, vec![vec![1.0, 2.0, 3.0]; 2]);

        let out1 = wrapper.process_chunk(&chunk, Continuity::Discontinuous);
        assert_eq!(out1["f_tract"][0].len(), 3);

        let out2 = wrapper.process_chunk(&chunk, Continuity::WithPrevious);
        // The whole 3-column remainder (margin 4 exceeds its length) is
        // prepended to this chunk's 3 columns.
        assert_eq!(out2["f_tract"][0].len(), 6);
    }
}
