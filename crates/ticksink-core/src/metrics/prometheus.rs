//! Prometheus text exposition.

use super::recorder::{ErrorType, PerformanceRecorder};
use crate::pool::{PoolCounters, PoolStatus};
use crate::queue::DropReason;
use crate::record::RejectReason;
use std::fmt::Write;

const PREFIX: &str = "ticksink";

fn header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {PREFIX}_{name} {help}");
    let _ = writeln!(out, "# TYPE {PREFIX}_{name} {kind}");
}

fn single(out: &mut String, name: &str, help: &str, kind: &str, value: impl std::fmt::Display) {
    header(out, name, help, kind);
    let _ = writeln!(out, "{PREFIX}_{name} {value}");
    out.push('\n');
}

impl PerformanceRecorder {
    /// Export all metrics in Prometheus text format.
    ///
    /// ```
    /// use ticksink_core::metrics::PerformanceRecorder;
    /// use ticksink_core::pool::{PoolCounters, PoolStatus};
    ///
    /// let metrics = PerformanceRecorder::new();
    /// metrics.record_submitted();
    /// let text = metrics.export_prometheus_text(PoolStatus::default(), PoolCounters::default());
    /// assert!(text.contains("ticksink_records_submitted_total 1"));
    /// ```
    pub fn export_prometheus_text(&self, pool: PoolStatus, counters: PoolCounters) -> String {
        let mut out = String::with_capacity(4096);

        // === COUNTERS ===

        single(
            &mut out,
            "records_submitted_total",
            "Records accepted by submit",
            "counter",
            self.submitted(),
        );

        header(&mut out, "records_rejected", "Records refused by submit, by reason", "counter");
        for reason in RejectReason::ALL {
            let _ = writeln!(
                out,
                "{PREFIX}_records_rejected{{reason=\"{}\"}} {}",
                reason.as_label(),
                self.rejected_by_reason(reason)
            );
        }
        out.push('\n');

        single(
            &mut out,
            "records_persisted_total",
            "Records committed to the store",
            "counter",
            self.persisted_records(),
        );
        single(
            &mut out,
            "component_rows_total",
            "Component rows committed to the store",
            "counter",
            self.component_rows(),
        );
        single(
            &mut out,
            "batches_committed_total",
            "Batches committed",
            "counter",
            self.batches_committed(),
        );
        single(
            &mut out,
            "batches_rolled_back_total",
            "Batches rolled back",
            "counter",
            self.batches_rolled_back(),
        );
        single(
            &mut out,
            "records_requeued_total",
            "Records handed back to the queue after a failed batch",
            "counter",
            self.requeued(),
        );

        header(&mut out, "records_dropped", "Records dropped without being persisted, by reason", "counter");
        for reason in DropReason::ALL {
            let _ = writeln!(
                out,
                "{PREFIX}_records_dropped{{reason=\"{}\"}} {}",
                reason.as_label(),
                self.dropped_by_reason(reason)
            );
        }
        out.push('\n');

        single(
            &mut out,
            "store_calls_total",
            "Store round trips",
            "counter",
            self.calls(),
        );

        header(&mut out, "errors", "Errors by type", "counter");
        for error_type in ErrorType::ALL {
            let _ = writeln!(
                out,
                "{PREFIX}_errors{{type=\"{}\"}} {}",
                error_type.as_label(),
                self.errors_by_type(error_type)
            );
        }
        out.push('\n');

        // === GAUGES ===

        single(
            &mut out,
            "queue_depth",
            "Records waiting to be flushed",
            "gauge",
            self.queue_depth(),
        );
        single(
            &mut out,
            "store_call_avg_milliseconds",
            "Mean store round trip",
            "gauge",
            self.average_call_ms(),
        );
        single(
            &mut out,
            "pool_connections_active",
            "Checked-out pool connections",
            "gauge",
            pool.active,
        );
        single(
            &mut out,
            "pool_connections_idle",
            "Idle pool connections",
            "gauge",
            pool.idle,
        );
        single(
            &mut out,
            "pool_connections_max",
            "Pool size limit",
            "gauge",
            pool.max,
        );
        single(
            &mut out,
            "pool_connections_created_total",
            "Connections opened by the pool",
            "counter",
            counters.created,
        );
        single(
            &mut out,
            "pool_connections_closed_total",
            "Connections closed as broken, expired or idle",
            "counter",
            counters.discarded,
        );
        single(
            &mut out,
            "pool_acquire_timeouts_total",
            "Acquires that gave up waiting for a connection",
            "counter",
            counters.acquire_timeouts,
        );

        // === HISTOGRAM ===

        let hist = self.flush_duration_histogram();
        header(
            &mut out,
            "flush_duration_seconds",
            "Duration of committed batch flushes",
            "histogram",
        );
        for (le, count) in &hist.buckets {
            let _ = writeln!(out, "{PREFIX}_flush_duration_seconds_bucket{{le=\"{le}\"}} {count}");
        }
        let _ = writeln!(
            out,
            "{PREFIX}_flush_duration_seconds_bucket{{le=\"+Inf\"}} {}",
            hist.inf_bucket
        );
        let _ = writeln!(out, "{PREFIX}_flush_duration_seconds_sum {}", hist.sum_seconds);
        let _ = writeln!(out, "{PREFIX}_flush_duration_seconds_count {}", hist.count);

        out
    }
}
