//! The per-processor synchroniser: indexes pending composites by chunk
//! number, enforces ordering, computes per-output alignment once and
//! caches it, and slices incoming arrays down to the common valid region.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use streamboard_foundation::alignment::{ChunkAlignment, ProcessorAlignment};
use streamboard_foundation::chunk::{Chunk, ChunkPayload, ConfigMetadata};
use streamboard_foundation::continuity::Continuity;
use streamboard_foundation::error::ProtocolError;

use streamboard_telemetry::BoardMetrics;

/// A bundle of sibling chunks (same `number`) from all of a processor's
/// subscribed inputs, once every key has delivered.
#[derive(Debug, Clone)]
pub struct CompositeChunk {
    pub number: u64,
    /// The continuity actually emitted downstream (after the demotion rule).
    pub continuity: Continuity,
    /// The continuity implied by folding the inputs' own continuities,
    /// before demotion is applied.
    pub chunk_continuity: Continuity,
    pub alignment: ChunkAlignment,
    pub start_time: f64,
    pub initial_sample_time: f64,
    pub identifier: Option<String>,
    pub sources: BTreeSet<String>,
    pub data_generation_time: BTreeMap<String, f64>,
    pub metadata: BTreeMap<String, ConfigMetadata>,
    /// Trimmed, alignment-consistent chunk per receiver key.
    pub received: BTreeMap<String, Chunk>,
}

struct Entry {
    number: u64,
    open_keys: BTreeSet<String>,
    received: BTreeMap<String, Chunk>,
}

impl Entry {
    fn new(number: u64, required_keys: &BTreeSet<String>) -> Self {
        Self {
            number,
            open_keys: required_keys.clone(),
            received: BTreeMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.open_keys.is_empty()
    }
}

#[derive(Clone)]
struct LastCompleted {
    number: u64,
    /// Raw (untrimmed) chunk per key, retained so the next composite's
    /// "regular continuous" trim can prepend this chunk's tail.
    raw: BTreeMap<String, Chunk>,
}

pub struct CompositeManager {
    required_keys: BTreeSet<String>,
    entries: VecDeque<Entry>,
    index0_number: Option<u64>,
    last_completed: Option<LastCompleted>,
    /// Cached per the "alignment stability" property: computed once on the
    /// first processed composite and reused for every subsequent one.
    alignment_in: Option<ChunkAlignment>,
    processor_alignments: BTreeMap<String, ProcessorAlignment>,
    metrics: Option<BoardMetrics>,
}

impl CompositeManager {
    pub fn new(
        required_keys: impl IntoIterator<Item = String>,
        processor_alignments: BTreeMap<String, ProcessorAlignment>,
    ) -> Self {
        Self {
            required_keys: required_keys.into_iter().collect(),
            entries: VecDeque::new(),
            index0_number: None,
            last_completed: None,
            alignment_in: None,
            processor_alignments,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: BoardMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Output alignment per sender key, once stable. `None` before the
    /// first composite has completed.
    pub fn alignments_out(&self) -> Option<BTreeMap<String, ChunkAlignment>> {
        let alignment_in = self.alignment_in?;
        Some(
            self.processor_alignments
                .iter()
                .map(|(key, pa)| (key.clone(), alignment_in.impose_processor_alignment(pa)))
                .collect(),
        )
    }

    /// Inject a chunk arriving on `key`. Returns a completed composite when
    /// this delivery completes one.
    pub fn inject(
        &mut self,
        key: &str,
        chunk: Chunk,
    ) -> Result<Option<CompositeChunk>, ProtocolError> {
        if !self.required_keys.contains(key) {
            return Err(ProtocolError::AlignmentMismatch(format!(
                "unknown receiver key '{key}'"
            )));
        }

        let number = chunk.number;

        match self.index0_number {
            None => {
                self.index0_number = Some(number);
                self.entries.push_back(Entry::new(number, &self.required_keys));
            }
            Some(index0) => {
                if number < index0 {
                    tracing::debug!(key, number, index0, "late chunk dropped by composite manager");
                    if let Some(m) = &self.metrics {
                        m.record_composite_dropped_late();
                    }
                    return Ok(None);
                }
                let needed_len = (number - index0) as usize + 1;
                while self.entries.len() < needed_len {
                    let next_number = index0 + self.entries.len() as u64;
                    self.entries.push_back(Entry::new(next_number, &self.required_keys));
                }
            }
        }

        let index0 = self.index0_number.unwrap();
        let idx = (number - index0) as usize;
        let entry = &mut self.entries[idx];
        entry.open_keys.remove(key);
        entry.received.insert(key.to_string(), chunk);

        if entry.is_complete() {
            let completed = self.process_composite_chunk(idx)?;
            Ok(Some(completed))
        } else {
            Ok(None)
        }
    }

    fn process_composite_chunk(&mut self, idx: usize) -> Result<CompositeChunk, ProtocolError> {
        let entry = self.entries[idx].clone_shallow();

        let (chunk_continuity, worst_input_continuity) = Self::fold_continuity(&entry.received)?;

        let continuity = if worst_input_continuity == Continuity::Last {
            // A terminal composite has no successor to be contiguous with;
            // it propagates as `Last` unconditionally (spec §8 property 9).
            Continuity::Last
        } else if worst_input_continuity < Continuity::WithPrevious {
            worst_input_continuity
        } else {
            let contiguous_with_last = match &self.last_completed {
                Some(last) => entry.number == last.number + 1,
                None => false,
            };
            if contiguous_with_last {
                Continuity::WithPrevious
            } else {
                if let Some(m) = &self.metrics {
                    m.record_demotion();
                }
                Continuity::Discontinuous
            }
        };

        let alignment_in = match self.alignment_in {
            Some(a) => a,
            None => {
                let mut iter = entry.received.values();
                let first = iter
                    .next()
                    .ok_or_else(|| ProtocolError::AlignmentMismatch("empty composite".into()))?;
                let mut acc = first.alignment;
                for chunk in iter {
                    acc = acc.merge(&chunk.alignment)?;
                }
                self.alignment_in = Some(acc);
                acc
            }
        };

        let mut identifier: Option<String> = None;
        let mut sources = BTreeSet::new();
        let mut data_generation_time = BTreeMap::new();
        let mut metadata = BTreeMap::new();
        let mut trimmed = BTreeMap::new();

        for (key, chunk) in entry.received.iter() {
            if let Some(existing) = &identifier {
                if let Some(incoming) = &chunk.identifier {
                    if existing != incoming && continuity.at_least_with_previous() {
                        return Err(ProtocolError::ConflictingIdentifier {
                            a: existing.clone(),
                            b: incoming.clone(),
                        });
                    }
                }
            } else {
                identifier = chunk.identifier.clone();
            }
            sources.extend(chunk.sources.iter().cloned());
            data_generation_time.extend(chunk.data_generation_time.iter().map(|(k, v)| (k.clone(), *v)));
            metadata.extend(chunk.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

            let previous_raw = self
                .last_completed
                .as_ref()
                .and_then(|last| last.raw.get(key));

            let trimmed_chunk = trim_chunk(chunk, previous_raw, &alignment_in, continuity)?;
            trimmed.insert(key.clone(), trimmed_chunk);
        }

        let start_time = trimmed
            .values()
            .next()
            .map(|c| c.start_time)
            .unwrap_or(0.0);

        let fsampling = alignment_in.fsampling.unwrap_or(1.0);
        let delta = if continuity.at_least_with_previous() {
            -(alignment_in.included_past as f64)
        } else {
            alignment_in.dropped_after_discontinuity as f64
        };
        let initial_sample_time = start_time + delta / fsampling;

        let composite = CompositeChunk {
            number: entry.number,
            continuity,
            chunk_continuity,
            alignment: alignment_in,
            start_time,
            initial_sample_time,
            identifier,
            sources,
            data_generation_time,
            metadata,
            received: trimmed,
        };

        // Admission rule: completing this composite discards every earlier
        // uncompleted one.
        for _ in 0..=idx {
            self.entries.pop_front();
        }
        self.index0_number = Some(entry.number + 1);
        self.last_completed = Some(LastCompleted {
            number: entry.number,
            raw: entry.received,
        });

        if let Some(m) = &self.metrics {
            m.record_composite_completed();
        }

        Ok(composite)
    }

    /// Fold per-input continuities: returns `(chunk_continuity, worst)`
    /// where `worst` is the minimum continuity across all inputs (the
    /// value used to decide whether the whole composite degrades below
    /// `WithPrevious`), and `chunk_continuity` mirrors it in that case.
    fn fold_continuity(
        received: &BTreeMap<String, Chunk>,
    ) -> Result<(Continuity, Continuity), ProtocolError> {
        let worst = received
            .values()
            .map(|c| c.continuity)
            .min()
            .ok_or_else(|| ProtocolError::AlignmentMismatch("empty composite".into()))?;
        Ok((worst, worst))
    }
}

impl Entry {
    fn clone_shallow(&self) -> Entry {
        Entry {
            number: self.number,
            open_keys: self.open_keys.clone(),
            received: self.received.clone(),
        }
    }
}

/// Slice `chunk`'s payload down to the composite's common valid window,
/// per the three cross-stream trimming cases (§4.3.4).
fn trim_chunk(
    chunk: &Chunk,
    previous_raw: Option<&Chunk>,
    alignment_in: &ChunkAlignment,
    composite_continuity: Continuity,
) -> Result<Chunk, ProtocolError> {
    if !chunk.alignment.alignable {
        return Ok(chunk.clone());
    }

    let low_drop = alignment_in.dropped_after_discontinuity - chunk.alignment.dropped_after_discontinuity;
    let high_drop = alignment_in.included_past - chunk.alignment.included_past;
    let chunk_disc_low = alignment_in.dropped_after_discontinuity + chunk.alignment.included_past;

    let mut out = chunk.clone();

    let regular_continuous = composite_continuity.at_least_with_previous();
    let irregular_discontinuous =
        chunk.continuity.at_least_with_previous() && !composite_continuity.at_least_with_previous();

    out.payload = match &chunk.payload {
        ChunkPayload::Event(_) => chunk.payload.clone(),
        ChunkPayload::Series1(data) => {
            if regular_continuous {
                let prev_tail: Vec<f64> = previous_raw
                    .and_then(|p| match &p.payload {
                        ChunkPayload::Series1(d) => {
                            let take = high_drop.max(0) as usize;
                            Some(d[d.len().saturating_sub(take)..].to_vec())
                        }
                        _ => None,
                    })
                    .unwrap_or_default();
                let upper = (data.len() as i64 - high_drop).max(0) as usize;
                let mut merged = prev_tail;
                merged.extend_from_slice(&data[..upper.min(data.len())]);
                ChunkPayload::Series1(merged)
            } else if irregular_discontinuous {
                let lo = chunk_disc_low.max(0) as usize;
                let hi = (data.len() as i64 - high_drop).max(0) as usize;
                ChunkPayload::Series1(data[lo.min(data.len())..hi.min(data.len())].to_vec())
            } else {
                let lo = low_drop.max(0) as usize;
                let hi = (data.len() as i64 - high_drop).max(0) as usize;
                ChunkPayload::Series1(data[lo.min(data.len())..hi.min(data.len())].to_vec())
            }
        }
        ChunkPayload::Series2(rows) => {
            let trimmed_rows = rows
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    if regular_continuous {
                        let prev_tail: Vec<f64> = previous_raw
                            .and_then(|p| match &p.payload {
                                ChunkPayload::Series2(prows) => prows.get(i).map(|r| {
                                    let take = high_drop.max(0) as usize;
                                    r[r.len().saturating_sub(take)..].to_vec()
                                }),
                                _ => None,
                            })
                            .unwrap_or_default();
                        let upper = (row.len() as i64 - high_drop).max(0) as usize;
                        let mut merged = prev_tail;
                        merged.extend_from_slice(&row[..upper.min(row.len())]);
                        merged
                    } else if irregular_discontinuous {
                        let lo = chunk_disc_low.max(0) as usize;
                        let hi = (row.len() as i64 - high_drop).max(0) as usize;
                        row[lo.min(row.len())..hi.min(row.len())].to_vec()
                    } else {
                        let lo = low_drop.max(0) as usize;
                        let hi = (row.len() as i64 - high_drop).max(0) as usize;
                        row[lo.min(row.len())..hi.min(row.len())].to_vec()
                    }
                })
                .collect();
            ChunkPayload::Series2(trimmed_rows)
        }
    };

    out.alignment = *alignment_in;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use streamboard_foundation::chunk::ChunkPayload;

    fn chunk(
        number: u64,
        continuity: Continuity,
        alignment: ChunkAlignment,
        len: usize,
        key_fill: f64,
    ) -> Chunk {
        Chunk {
            payload: ChunkPayload::Series2(vec![vec![key_fill; len]; 100]),
            start_time: 0.0,
            fs: 41_000.0,
            number,
            continuity,
            alignment,
            processor_name: "src".into(),
            sources: BTreeSet::new(),
            identifier: None,
            data_generation_time: Map::new(),
            metadata: Map::new(),
            initial_sample_time: None,
        }
    }

    fn manager(keys: &[&str]) -> CompositeManager {
        CompositeManager::new(
            keys.iter().map(|s| s.to_string()),
            BTreeMap::from([(
                "out".to_string(),
                ProcessorAlignment::identity(41_000.0),
            )]),
        )
    }

    #[test]
    fn merges_two_siblings_and_trims_to_equal_length() {
        // Two sibling inputs into the same first composite, with differing
        // per-field margins but an equal total margin (included_past +
        // dropped_after_discontinuity) — as two branches of one upstream
        // fork would produce. See DESIGN.md for why this is the resolution
        // chosen for the merge/trim worked example.
        let mut cm = manager(&["a", "b"]);

        let align_a = ChunkAlignment::new(15, 37, 0, 0, 41_000.0);
        let align_b = ChunkAlignment::new(13, 39, 0, 5, 41_000.0);

        let ca = chunk(0, Continuity::Discontinuous, align_a, 2000, 1.0);
        let cb = chunk(0, Continuity::Discontinuous, align_b, 2000, 2.0);

        assert!(cm.inject("a", ca).unwrap().is_none());
        let done0 = cm.inject("b", cb).unwrap().unwrap();

        assert_eq!(done0.alignment.included_past, 15);
        assert_eq!(done0.alignment.dropped_after_discontinuity, 39);
        assert_eq!(done0.alignment.invalid_small_scales, 5);

        let len_a = match &done0.received["a"].payload {
            ChunkPayload::Series2(rows) => rows[0].len(),
            _ => unreachable!(),
        };
        let len_b = match &done0.received["b"].payload {
            ChunkPayload::Series2(rows) => rows[0].len(),
            _ => unreachable!(),
        };
        assert_eq!(len_a, len_b, "trimmed siblings must share last-axis length");
        assert_eq!(len_a, 1998);

        // Stability: a contiguous second composite reuses alignment_in.
        let ca1 = chunk(1, Continuity::WithPrevious, align_a, 2000, 3.0);
        let cb1 = chunk(1, Continuity::WithPrevious, align_b, 2000, 4.0);
        assert!(cm.inject("a", ca1).unwrap().is_none());
        let done1 = cm.inject("b", cb1).unwrap().unwrap();
        assert_eq!(done1.continuity, Continuity::WithPrevious);
        assert_eq!(done1.alignment, done0.alignment);
    }

    #[test]
    fn s2_gap_produces_alternating_discontinuity() {
        let mut cm = manager(&["a"]);
        let align = ChunkAlignment::new(0, 0, 0, 0, 41_000.0);
        let numbers = [0u64, 1, 2, 4, 5, 6];
        let expected = [
            Continuity::Discontinuous,
            Continuity::WithPrevious,
            Continuity::WithPrevious,
            Continuity::Discontinuous,
            Continuity::WithPrevious,
            Continuity::WithPrevious,
        ];
        for (n, exp) in numbers.iter().zip(expected.iter()) {
            let c = chunk(*n, Continuity::WithPrevious, align, 100, 1.0);
            let done = cm.inject("a", c).unwrap().unwrap();
            assert_eq!(done.continuity, *exp, "chunk {n}");
        }
    }

    #[test]
    fn s3_lost_input_drops_stale_composite_and_demotes_next() {
        let mut cm = manager(&["a", "b"]);
        let align = ChunkAlignment::new(0, 0, 0, 0, 41_000.0);

        for n in 0..2u64 {
            let ca = chunk(n, Continuity::WithPrevious, align, 100, 1.0);
            let cb = chunk(n, Continuity::WithPrevious, align, 100, 1.0);
            assert!(cm.inject("a", ca).unwrap().is_none());
            let done = cm.inject("b", cb).unwrap().unwrap();
            assert_eq!(done.number, n);
        }

        // B misses 2; A delivers 2 and 3. Composite 2 never completes.
        let a2 = chunk(2, Continuity::WithPrevious, align, 100, 1.0);
        assert!(cm.inject("a", a2).unwrap().is_none());
        let a3 = chunk(3, Continuity::WithPrevious, align, 100, 1.0);
        assert!(cm.inject("a", a3).unwrap().is_none());

        let b3 = chunk(3, Continuity::WithPrevious, align, 100, 1.0);
        let done3 = cm.inject("b", b3).unwrap().unwrap();
        assert_eq!(done3.number, 3);
        assert_eq!(done3.continuity, Continuity::Discontinuous);
    }

    #[test]
    fn s6_last_propagates_through_the_composite() {
        let mut cm = manager(&["a", "b"]);
        let align = ChunkAlignment::new(0, 0, 0, 0, 41_000.0);

        let ca0 = chunk(0, Continuity::WithPrevious, align, 100, 1.0);
        let cb0 = chunk(0, Continuity::WithPrevious, align, 100, 1.0);
        assert!(cm.inject("a", ca0).unwrap().is_none());
        let done0 = cm.inject("b", cb0).unwrap().unwrap();
        assert_eq!(done0.continuity, Continuity::WithPrevious);

        // Every sibling terminates with a `Last` mock chunk; the composite
        // must surface `Last` unconditionally, not the demotion/contiguity
        // path a non-terminal continuity would take.
        let ca1 = chunk(1, Continuity::Last, align, 0, 0.0);
        let cb1 = chunk(1, Continuity::Last, align, 0, 0.0);
        assert!(cm.inject("a", ca1).unwrap().is_none());
        let done1 = cm.inject("b", cb1).unwrap().unwrap();
        assert_eq!(done1.continuity, Continuity::Last);
    }
}
