use serde::{Deserialize, Serialize};

/// Relationship of a chunk to the one emitted before it by the same producer.
///
/// Ordering is significant: `Invalid < Discontinuous <= NewFile <= Calibration
/// < WithPrevious <= Last`. Comparisons against `Continuity::WithPrevious`
/// ("at least with-previous") are the idiom used throughout the composite
/// manager and the DSP kernels to decide whether filter state may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i8)]
pub enum Continuity {
    /// Input driver dropped samples; the next chunk must degrade to `Discontinuous`.
    Invalid = -1,
    /// Stream restart. Drop any filter/buffer state carried from the previous chunk.
    Discontinuous = 0,
    /// `Discontinuous` subtype: the source switched to a new file or identifier.
    NewFile = 1,
    /// A one-off chunk carrying calibration material, not a data chunk.
    Calibration = 2,
    /// Contiguous with the immediately preceding chunk (`number - 1`).
    WithPrevious = 10,
    /// Mock-data terminator propagated end to end so processors can flush.
    Last = 11,
}

impl Continuity {
    /// True if this continuity may be joined to its predecessor's trailing state.
    pub fn at_least_with_previous(self) -> bool {
        self >= Continuity::WithPrevious
    }
}

impl Default for Continuity {
    fn default() -> Self {
        Continuity::Discontinuous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_source_numbering() {
        assert!(Continuity::Invalid < Continuity::Discontinuous);
        assert!(Continuity::Discontinuous <= Continuity::NewFile);
        assert!(Continuity::NewFile <= Continuity::Calibration);
        assert!(Continuity::Calibration < Continuity::WithPrevious);
        assert!(Continuity::WithPrevious <= Continuity::Last);
    }

    #[test]
    fn at_least_with_previous_boundary() {
        assert!(!Continuity::Calibration.at_least_with_previous());
        assert!(Continuity::WithPrevious.at_least_with_previous());
        assert!(Continuity::Last.at_least_with_previous());
    }
}
