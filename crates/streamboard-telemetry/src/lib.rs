pub mod board_metrics;

pub use board_metrics::BoardMetrics;
