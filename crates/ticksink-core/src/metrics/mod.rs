//! Performance counters and Prometheus export.

mod prometheus;
mod recorder;

pub use recorder::{ErrorType, FlushDurationHistogram, MetricsSnapshot, PerformanceRecorder};
