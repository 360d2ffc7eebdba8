//! Numerically-safe floors for log-compression of possibly-zero magnitudes.
//!
//! The terminal `Last` chunk carries mock/near-zero data that must flow
//! through every downstream kernel without raising (e.g. `log2(0)`). The
//! two floor constants below come from the source and are not semantically
//! meaningful; they exist purely so a terminal or all-silence chunk never
//! produces `-inf`/`NaN`.

/// Dither floor applied when the payload is conceptually integer-valued.
pub const TERMINAL_DITHER_INT: i64 = 3;

/// Dither floor applied when the payload is floating point (2^-100).
pub const TERMINAL_DITHER_FLOAT: f64 = 7.888_609_052_210_118e-31;

/// `log2(x.max(floor))`, guarding the zero/near-zero case the terminal
/// chunk and long silences can produce.
pub fn safe_log2(magnitude: f64) -> f64 {
    magnitude.max(TERMINAL_DITHER_FLOAT).log2()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_log2_guards_zero() {
        assert!(safe_log2(0.0).is_finite());
        assert!(safe_log2(-1.0).is_finite());
    }

    #[test]
    fn safe_log2_matches_log2_away_from_floor() {
        assert!((safe_log2(4.0) - 2.0).abs() < 1e-9);
    }
}
