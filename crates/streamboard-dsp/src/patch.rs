//! Patch extractor core (§4.7): per-chunk connected-component labelling of
//! a quantised time-scale matrix, followed by a cross-chunk join that
//! stitches components split across chunk boundaries.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use streamboard_foundation::continuity::Continuity;
use streamboard_foundation::error::ProtocolError;

/// A connected component of pixels sharing the same quantised texture
/// level, possibly spanning several chunks via [`join_patches`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub identifier: Uuid,
    pub serial_number: u64,
    pub chunk_number: u64,
    /// The current label in the owning `patch_matrix`. Rewritten in place
    /// when a join collapses it onto an earlier canonical label.
    pub label: u64,
    pub level: i64,
    pub type_label: String,
    pub s_low: usize,
    pub s_high: usize,
    pub t_low: usize,
    pub t_high: usize,
    pub t_range_seconds: (f64, f64),
    pub size: usize,
    pub duration: usize,
    pub height: usize,
    pub fill_ratio: f64,
    pub in_row_count: Vec<usize>,
    pub in_col_count: Vec<usize>,
    pub scale_distribution: Option<Distribution>,
    pub frame_distribution: Option<FrameDistribution>,
}

/// A mergeable density over a scale (or similar) axis: `weight` is a
/// per-position accumulator, `density` the weighted-mean value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    pub low: usize,
    pub high: usize,
    pub density: Vec<f64>,
    pub weight: Vec<f64>,
}

/// Same as [`Distribution`] but along the frame (time) axis, carrying the
/// chunk-number span it was computed over so adjacency can be checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameDistribution {
    pub start_chunk: u64,
    pub end_chunk: u64,
    pub low: usize,
    pub high: usize,
    pub density: Vec<f64>,
    pub weight: Vec<f64>,
}

/// `Σ(weights)` is conserved: every position's weight after the merge
/// equals the sum of both inputs' weights at that position (property 8).
pub fn join_scale_distributions(d1: &Distribution, d2: &Distribution) -> Distribution {
    let low = d1.low.min(d2.low);
    let high = d1.high.max(d2.high);
    let n = high - low + 1;
    let mut weight = vec![0.0; n];
    let mut weighted = vec![0.0; n];
    for d in [d1, d2] {
        for i in 0..d.density.len() {
            let idx = (d.low + i) - low;
            weight[idx] += d.weight[i];
            weighted[idx] += d.density[i] * d.weight[i];
        }
    }
    let density = weight
        .iter()
        .zip(weighted.iter())
        .map(|(w, wd)| if *w > 0.0 { wd / w } else { 0.0 })
        .collect();
    Distribution {
        low,
        high,
        density,
        weight,
    }
}

/// Merge two frame distributions. Legal only when the chunk spans are
/// adjacent: same starting chunk, same ending chunk, or consecutive end
/// chunks (either order) — any other pairing is an unanticipated merge
/// (§4.7.3, §7 `ProtocolError::IncompatiblePatchMerge`).
pub fn join_frame_distributions(
    d1: &FrameDistribution,
    d2: &FrameDistribution,
) -> Result<FrameDistribution, ProtocolError> {
    let (a, b) = if d1.start_chunk <= d2.start_chunk {
        (d1, d2)
    } else {
        (d2, d1)
    };

    let same_start = a.start_chunk == b.start_chunk;
    let same_end = a.end_chunk == b.end_chunk;
    let consecutive = a.end_chunk + 1 == b.start_chunk;

    if !(same_start || same_end || consecutive) {
        return Err(ProtocolError::IncompatiblePatchMerge(format!(
            "frame distributions over chunks [{}..{}] and [{}..{}] are not adjacent",
            a.start_chunk, a.end_chunk, b.start_chunk, b.end_chunk
        )));
    }

    let low = a.low.min(b.low);
    let high = a.high.max(b.high);
    let n = high - low + 1;
    let mut weight = vec![0.0; n];
    let mut weighted = vec![0.0; n];
    for d in [a, b] {
        for i in 0..d.density.len() {
            let idx = (d.low + i) - low;
            weight[idx] += d.weight[i];
            weighted[idx] += d.density[i] * d.weight[i];
        }
    }
    let density = weight
        .iter()
        .zip(weighted.iter())
        .map(|(w, wd)| if *w > 0.0 { wd / w } else { 0.0 })
        .collect();

    Ok(FrameDistribution {
        start_chunk: a.start_chunk.min(b.start_chunk),
        end_chunk: a.end_chunk.max(b.end_chunk),
        low,
        high,
        density,
        weight,
    })
}

/// Bounding box and per-row/per-column counts for one freshly labelled
/// component, before it is wrapped in a full [`Patch`].
#[derive(Debug, Clone)]
pub struct PatchDescriptor {
    pub label: u64,
    pub level: i64,
    pub s_low: usize,
    pub s_high: usize,
    pub t_low: usize,
    pub t_high: usize,
    pub size: usize,
    pub in_row_count: Vec<usize>,
    pub in_col_count: Vec<usize>,
}

fn neighbors4(s: usize, t: usize, rows: usize, cols: usize) -> impl Iterator<Item = (usize, usize)> {
    let mut v = Vec::with_capacity(4);
    if s > 0 {
        v.push((s - 1, t));
    }
    if s + 1 < rows {
        v.push((s + 1, t));
    }
    if t > 0 {
        v.push((s, t - 1));
    }
    if t + 1 < cols {
        v.push((s, t + 1));
    }
    v.into_iter()
}

/// Single-chunk 4-connected labelling of `levels[S][T]` (§4.7.1). Labels
/// are assigned starting from `cumulative_patch_count + 1` in row-major
/// scan order; `0` is reserved for no-component pixels (there are none
/// here — every pixel belongs to some level-homogeneous component).
pub fn label_components(levels: &[Vec<i64>], cumulative_patch_count: u64) -> (Vec<Vec<u64>>, Vec<PatchDescriptor>) {
    let rows = levels.len();
    let cols = levels.first().map(|r| r.len()).unwrap_or(0);
    let mut labels = vec![vec![0u64; cols]; rows];
    let mut next_label = cumulative_patch_count + 1;
    let mut descriptors = Vec::new();

    for si in 0..rows {
        for ti in 0..cols {
            if labels[si][ti] != 0 {
                continue;
            }
            let level = levels[si][ti];
            let label = next_label;
            next_label += 1;

            let mut stack = vec![(si, ti)];
            labels[si][ti] = label;
            let mut size = 0usize;
            let (mut s_low, mut s_high, mut t_low, mut t_high) = (si, si, ti, ti);
            let mut row_counts: BTreeMap<usize, usize> = BTreeMap::new();
            let mut col_counts: BTreeMap<usize, usize> = BTreeMap::new();

            while let Some((cs, ct)) = stack.pop() {
                size += 1;
                s_low = s_low.min(cs);
                s_high = s_high.max(cs);
                t_low = t_low.min(ct);
                t_high = t_high.max(ct);
                *row_counts.entry(cs).or_insert(0) += 1;
                *col_counts.entry(ct).or_insert(0) += 1;

                for (ns, nt) in neighbors4(cs, ct, rows, cols) {
                    if labels[ns][nt] == 0 && levels[ns][nt] == level {
                        labels[ns][nt] = label;
                        stack.push((ns, nt));
                    }
                }
            }

            let in_row_count = (s_low..=s_high).map(|s| *row_counts.get(&s).unwrap_or(&0)).collect();
            let in_col_count = (t_low..=t_high).map(|t| *col_counts.get(&t).unwrap_or(&0)).collect();

            descriptors.push(PatchDescriptor {
                label,
                level,
                s_low,
                s_high,
                t_low,
                t_high,
                size,
                in_row_count,
                in_col_count,
            });
        }
    }

    (labels, descriptors)
}

/// Result of joining a new chunk's first column against the previous
/// chunk's last column (§4.7.2).
pub struct JoinResult {
    /// `(new_label, canonical_label)` pairs, one per scale position where
    /// `tex_before[s] == tex_after[s]`; same-component labels collapse to a
    /// single canonical id (the earliest serial number / smallest label).
    pub join_matrix: Vec<(u64, u64)>,
    pub patch_matrix: Vec<Vec<u64>>,
}

struct UnionFind {
    parent: BTreeMap<u64, u64>,
}

impl UnionFind {
    fn new() -> Self {
        Self {
            parent: BTreeMap::new(),
        }
    }

    fn find(&mut self, x: u64) -> u64 {
        let p = *self.parent.get(&x).unwrap_or(&x);
        if p == x {
            x
        } else {
            let root = self.find(p);
            self.parent.insert(x, root);
            root
        }
    }

    fn union(&mut self, a: u64, b: u64) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Canonical is whichever root has the lower label, i.e. the
            // earliest serial number encountered (§4.7.2).
            let (keep, drop) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(drop, keep);
        }
    }
}

/// Given the previous chunk's last column (`tex_before`/`patch_before`)
/// and the current chunk's first column (`tex_after`/`patch_after`),
/// rewrite `patch_matrix` in place so joined components share a single
/// canonical label.
pub fn join_patches(
    tex_before: &[i64],
    patch_before: &[u64],
    tex_after: &[i64],
    patch_after: &[u64],
    mut patch_matrix: Vec<Vec<u64>>,
) -> JoinResult {
    let mut uf = UnionFind::new();
    let mut pairs: Vec<(u64, u64)> = Vec::new();

    for s in 0..tex_before.len().min(tex_after.len()) {
        if tex_before[s] == tex_after[s] {
            let new_label = patch_after[s];
            let old_label = patch_before[s];
            if new_label != 0 && old_label != 0 {
                uf.union(new_label, old_label);
                pairs.push((new_label, old_label));
            }
        }
    }

    let mut join_matrix = Vec::new();
    let mut seen_new_labels = BTreeSet::new();
    for (new_label, _) in &pairs {
        if seen_new_labels.insert(*new_label) {
            let canonical = uf.find(*new_label);
            join_matrix.push((*new_label, canonical));
        }
    }

    for (new_label, canonical) in &join_matrix {
        if new_label != canonical {
            for row in patch_matrix.iter_mut() {
                for v in row.iter_mut() {
                    if v == new_label {
                        *v = *canonical;
                    }
                }
            }
        }
    }

    JoinResult {
        join_matrix,
        patch_matrix,
    }
}

/// Union two bounding boxes, summing size/counts and joining distributions
/// where present, for a patch that survives across a chunk boundary.
pub fn merge_patch_descriptors(previous: &Patch, current: &Patch) -> Result<Patch, ProtocolError> {
    let s_low = previous.s_low.min(current.s_low);
    let s_high = previous.s_high.max(current.s_high);
    let t_low = previous.t_low.min(current.t_low);
    let t_high = previous.t_high.max(current.t_high);

    let scale_distribution = match (&previous.scale_distribution, &current.scale_distribution) {
        (Some(a), Some(b)) => Some(join_scale_distributions(a, b)),
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    };

    let frame_distribution = match (&previous.frame_distribution, &current.frame_distribution) {
        (Some(a), Some(b)) => Some(join_frame_distributions(a, b)?),
        (Some(a), None) => Some(a.clone()),
        (None, Some(b)) => Some(b.clone()),
        (None, None) => None,
    };

    let duration = t_high - t_low + 1;
    let height = s_high - s_low + 1;
    let size = previous.size + current.size;

    Ok(Patch {
        identifier: previous.identifier,
        serial_number: previous.serial_number,
        chunk_number: current.chunk_number,
        label: current.label,
        level: previous.level,
        type_label: previous.type_label.clone(),
        s_low,
        s_high,
        t_low,
        t_high,
        t_range_seconds: (previous.t_range_seconds.0, current.t_range_seconds.1),
        size,
        duration,
        height,
        fill_ratio: size as f64 / (duration * height).max(1) as f64,
        in_row_count: previous.in_row_count.clone(),
        in_col_count: previous.in_col_count.clone(),
        scale_distribution,
        frame_distribution,
    })
}

/// Output of extracting + joining patches for one chunk (§4.7.4).
pub struct PatchExtractionOutput {
    pub matrix: Vec<Vec<u64>>,
    pub levels: Vec<Vec<i64>>,
    pub patches: Vec<Patch>,
    pub finalized: Vec<Patch>,
    pub unfinalized: Vec<Patch>,
    pub join_matrix: Vec<(u64, u64)>,
}

/// Cross-chunk join state: the previous chunk's trailing column and the
/// running label counter.
pub struct PatchExtractor {
    cumulative_patch_count: u64,
    tex_before: Option<Vec<i64>>,
    patch_before: Option<Vec<u64>>,
    /// Set to `current.number + 1` after each processed chunk; a join only
    /// fires when the next chunk's number matches this expectation.
    merge_prepared: Option<u64>,
    unfinalized_by_label: BTreeMap<u64, Patch>,
}

impl Default for PatchExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchExtractor {
    pub fn new() -> Self {
        Self {
            cumulative_patch_count: 0,
            tex_before: None,
            patch_before: None,
            merge_prepared: None,
            unfinalized_by_label: BTreeMap::new(),
        }
    }

    fn to_patch(
        &self,
        d: &PatchDescriptor,
        chunk_number: u64,
        fs: f64,
        initial_sample_time: f64,
        type_label: &str,
    ) -> Patch {
        let duration = d.t_high - d.t_low + 1;
        let height = d.s_high - d.s_low + 1;
        Patch {
            identifier: Uuid::new_v4(),
            serial_number: d.label,
            chunk_number,
            label: d.label,
            level: d.level,
            type_label: type_label.to_string(),
            s_low: d.s_low,
            s_high: d.s_high,
            t_low: d.t_low,
            t_high: d.t_high,
            t_range_seconds: (
                initial_sample_time + d.t_low as f64 / fs,
                initial_sample_time + (d.t_high + 1) as f64 / fs,
            ),
            size: d.size,
            duration,
            height,
            fill_ratio: d.size as f64 / (duration * height).max(1) as f64,
            in_row_count: d.in_row_count.clone(),
            in_col_count: d.in_col_count.clone(),
            scale_distribution: None,
            frame_distribution: None,
        }
    }

    /// Run connected-components on `levels`, join against the previous
    /// chunk's trailing column when the continuity/number conditions hold,
    /// and split the result into finalized / unfinalized patch sets.
    pub fn process_chunk(
        &mut self,
        chunk_number: u64,
        levels: Vec<Vec<i64>>,
        continuity: Continuity,
        fs: f64,
        initial_sample_time: f64,
        type_label: &str,
    ) -> PatchExtractionOutput {
        let (mut matrix, descriptors) = label_components(&levels, self.cumulative_patch_count);
        self.cumulative_patch_count += descriptors.len() as u64;

        let mut patches: Vec<Patch> = descriptors
            .iter()
            .map(|d| self.to_patch(d, chunk_number, fs, initial_sample_time, type_label))
            .collect();

        let cols = levels.first().map(|r| r.len()).unwrap_or(0);
        let should_join = continuity.at_least_with_previous() && self.merge_prepared == Some(chunk_number);

        let mut join_matrix = Vec::new();
        if should_join {
            if let (Some(tex_before), Some(patch_before)) = (self.tex_before.clone(), self.patch_before.clone()) {
                let tex_after: Vec<i64> = levels.iter().map(|row| *row.first().unwrap_or(&0)).collect();
                let patch_after: Vec<u64> = matrix.iter().map(|row| *row.first().unwrap_or(&0)).collect();

                let result = join_patches(&tex_before, &patch_before, &tex_after, &patch_after, matrix);
                matrix = result.patch_matrix;
                join_matrix = result.join_matrix;

                for (new_label, canonical) in &join_matrix {
                    if let Some(prev_patch) = self.unfinalized_by_label.remove(canonical) {
                        if let Some(new_patch) = patches.iter_mut().find(|p| p.label == *new_label) {
                            if let Ok(merged) = merge_patch_descriptors(&prev_patch, new_patch) {
                                *new_patch = merged;
                            }
                        }
                    }
                }
            }
        }

        let (finalized, unfinalized): (Vec<Patch>, Vec<Patch>) = patches
            .into_iter()
            .partition(|p| cols == 0 || p.t_high < cols - 1);

        self.unfinalized_by_label.clear();
        for p in &unfinalized {
            self.unfinalized_by_label.insert(p.label, p.clone());
        }

        self.tex_before = Some(levels.iter().map(|row| *row.last().unwrap_or(&0)).collect());
        self.patch_before = Some(matrix.iter().map(|row| *row.last().unwrap_or(&0)).collect());
        self.merge_prepared = Some(chunk_number + 1);

        let mut patches = finalized.clone();
        patches.extend(unfinalized.iter().cloned());

        PatchExtractionOutput {
            matrix,
            levels,
            patches,
            finalized,
            unfinalized,
            join_matrix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_a_single_uniform_block_as_one_component() {
        let levels = vec![vec![1, 1, 1], vec![1, 1, 1]];
        let (labels, descriptors) = label_components(&levels, 0);
        assert_eq!(descriptors.len(), 1);
        let label = descriptors[0].label;
        for row in &labels {
            for &v in row {
                assert_eq!(v, label);
            }
        }
        assert_eq!(descriptors[0].size, 6);
    }

    #[test]
    fn distinct_levels_are_distinct_components() {
        let levels = vec![vec![1, 2], vec![1, 2]];
        let (labels, descriptors) = label_components(&levels, 0);
        assert_eq!(descriptors.len(), 2);
        assert_eq!(labels[0][0], labels[1][0]);
        assert_ne!(labels[0][0], labels[0][1]);
    }

    #[test]
    fn diagonal_pixels_of_equal_level_are_not_connected() {
        let levels = vec![vec![1, 2], vec![2, 1]];
        let (_labels, descriptors) = label_components(&levels, 0);
        assert_eq!(descriptors.len(), 4);
    }

    #[test]
    fn s7_join_relabels_onto_the_earlier_canonical_id() {
        // Chunk 0: two scale rows, last column both level 5, different labels.
        let tex_before = vec![5, 5];
        let patch_before = vec![10, 11];

        // Chunk 1: first column matches level 5 at both rows but the
        // labeller (not knowing about chunk 0) assigned them one new label.
        let tex_after = vec![5, 5];
        let patch_after = vec![20, 20];
        let matrix = vec![vec![20, 21], vec![20, 21]];

        let result = join_patches(&tex_before, &patch_before, &tex_after, &patch_after, matrix);
        // Both old labels (10, 11) and the new label (20) end up under one
        // canonical id: the smallest of the set.
        assert!(result.join_matrix.iter().all(|(_, canonical)| *canonical == 10));
        assert!(result.patch_matrix[0].iter().all(|&v| v == 10 || v == 21));
    }

    #[test]
    fn join_scale_distributions_conserves_total_weight() {
        let d1 = Distribution {
            low: 0,
            high: 2,
            density: vec![1.0, 2.0, 3.0],
            weight: vec![1.0, 1.0, 1.0],
        };
        let d2 = Distribution {
            low: 1,
            high: 3,
            density: vec![4.0, 5.0, 6.0],
            weight: vec![2.0, 2.0, 2.0],
        };
        let merged = join_scale_distributions(&d1, &d2);
        let total_before: f64 = d1.weight.iter().sum::<f64>() + d2.weight.iter().sum::<f64>();
        let total_after: f64 = merged.weight.iter().sum();
        assert!((total_before - total_after).abs() < 1e-9);
    }

    #[test]
    fn join_frame_distributions_rejects_non_adjacent_spans() {
        let a = FrameDistribution {
            start_chunk: 0,
            end_chunk: 1,
            low: 0,
            high: 1,
            density: vec![1.0, 1.0],
            weight: vec![1.0, 1.0],
        };
        let b = FrameDistribution {
            start_chunk: 10,
            end_chunk: 11,
            low: 0,
            high: 1,
            density: vec![1.0, 1.0],
            weight: vec![1.0, 1.0],
        };
        assert!(join_frame_distributions(&a, &b).is_err());
    }

    #[test]
    fn join_frame_distributions_accepts_consecutive_chunks() {
        let a = FrameDistribution {
            start_chunk: 0,
            end_chunk: 1,
            low: 0,
            high: 1,
            density: vec![1.0, 1.0],
            weight: vec![1.0, 1.0],
        };
        let b = FrameDistribution {
            start_chunk: 2,
            end_chunk: 3,
            low: 0,
            high: 1,
            density: vec![1.0, 1.0],
            weight: vec![1.0, 1.0],
        };
        let merged = join_frame_distributions(&a, &b).unwrap();
        assert_eq!(merged.start_chunk, 0);
        assert_eq!(merged.end_chunk, 3);
    }
}
