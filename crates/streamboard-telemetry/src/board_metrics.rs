use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Shared, cheaply-cloneable counters for cross-task monitoring of a Board.
/// Each processor task holds a clone and updates its own slice; the host
/// process (TUI, periodic log line, `/healthz`-style endpoint) reads the
/// same atomics without a lock.
#[derive(Clone)]
pub struct BoardMetrics {
    /// Chunks injected into composite managers, per processor, keyed by
    /// registration order (index into `processor_names`).
    pub composites_completed: Arc<AtomicU64>,
    pub composites_dropped_late: Arc<AtomicU64>,
    pub composites_demoted_discontinuous: Arc<AtomicU64>,

    pub patches_created: Arc<AtomicU64>,
    pub patches_joined: Arc<AtomicU64>,

    pub oa_blocks_processed: Arc<AtomicU64>,
    pub oa_resets: Arc<AtomicU64>,

    pub channel_fill_pct: Arc<AtomicUsize>,
    pub network_reconnects: Arc<AtomicU64>,
    pub network_overflow_drops: Arc<AtomicU64>,

    pub last_error: Arc<RwLock<Option<String>>>,
    pub last_chunk_published_at: Arc<RwLock<Option<std::time::Instant>>>,

    pub processors_alive: Arc<AtomicUsize>,
    pub degraded: Arc<AtomicBool>,
}

impl Default for BoardMetrics {
    fn default() -> Self {
        Self {
            composites_completed: Arc::new(AtomicU64::new(0)),
            composites_dropped_late: Arc::new(AtomicU64::new(0)),
            composites_demoted_discontinuous: Arc::new(AtomicU64::new(0)),
            patches_created: Arc::new(AtomicU64::new(0)),
            patches_joined: Arc::new(AtomicU64::new(0)),
            oa_blocks_processed: Arc::new(AtomicU64::new(0)),
            oa_resets: Arc::new(AtomicU64::new(0)),
            channel_fill_pct: Arc::new(AtomicUsize::new(0)),
            network_reconnects: Arc::new(AtomicU64::new(0)),
            network_overflow_drops: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(RwLock::new(None)),
            last_chunk_published_at: Arc::new(RwLock::new(None)),
            processors_alive: Arc::new(AtomicUsize::new(0)),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl BoardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_composite_completed(&self) {
        self.composites_completed.fetch_add(1, Ordering::Relaxed);
        *self.last_chunk_published_at.write() = Some(std::time::Instant::now());
    }

    pub fn record_composite_dropped_late(&self) {
        self.composites_dropped_late.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotion(&self) {
        self.composites_demoted_discontinuous
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write() = Some(message.into());
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.degraded.store(degraded, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let m = BoardMetrics::new();
        assert_eq!(m.composites_completed.load(Ordering::Relaxed), 0);
        m.record_composite_completed();
        assert_eq!(m.composites_completed.load(Ordering::Relaxed), 1);
        assert!(m.last_chunk_published_at.read().is_some());
    }

    #[test]
    fn clone_shares_the_same_counters() {
        let m = BoardMetrics::new();
        let m2 = m.clone();
        m2.record_demotion();
        assert_eq!(m.composites_demoted_discontinuous.load(Ordering::Relaxed), 1);
    }
}
