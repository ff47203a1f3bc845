// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for healthing-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `healthing_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `outcome`: submitted, queued, synced, discarded, retained, deferred, ...
//! - `operation`: remote call name (key_status, consume_key, ...)
//! - `status`: success, transport, backend, circuit_open

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record the result of a live submission
pub fn record_submission(outcome: &str) {
    counter!(
        "healthing_sync_submissions_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an identifier validation (cache_hit, remote_valid, unknown, offline, unavailable, empty)
pub fn record_validation(outcome: &str) {
    counter!(
        "healthing_sync_validations_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record one queued submission's reconciliation outcome
pub fn record_reconcile_item(outcome: &str) {
    counter!(
        "healthing_sync_reconcile_items_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a completed reconciliation pass
pub fn record_reconcile_run(trigger: &str, duration: Duration) {
    counter!(
        "healthing_sync_reconcile_runs_total",
        "trigger" => trigger.to_string()
    )
    .increment(1);
    histogram!(
        "healthing_sync_reconcile_seconds",
        "trigger" => trigger.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a run request folded into an in-flight run
pub fn record_reconcile_coalesced() {
    counter!("healthing_sync_reconcile_coalesced_total").increment(1);
}

/// Set queued submissions awaiting reconciliation
pub fn set_queue_pending(count: u64) {
    gauge!("healthing_sync_queue_pending").set(count as f64);
}

/// Set cached valid identifiers
pub fn set_identifier_cache_entries(count: u64) {
    gauge!("healthing_sync_identifier_cache_entries").set(count as f64);
}

/// Record a validation cache refresh (refreshed, skipped, failed)
pub fn record_cache_refresh(status: &str) {
    counter!(
        "healthing_sync_cache_refresh_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a remote call and its latency
pub fn record_remote_call(operation: &str, status: &str, duration: Duration) {
    counter!(
        "healthing_sync_remote_calls_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!(
        "healthing_sync_remote_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set connectivity (1 = online, 0 = offline)
pub fn set_connectivity(online: bool) {
    gauge!("healthing_sync_online").set(if online { 1.0 } else { 0.0 });
}

/// Count an online/offline transition
pub fn record_connectivity_transition(to: &str) {
    counter!(
        "healthing_sync_connectivity_transitions_total",
        "to" => to.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state (0=closed, 1=half-open, 2=open)
pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!(
        "healthing_sync_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as f64);
}

/// Record a circuit breaker call outcome
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "healthing_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set client lifecycle state
pub fn set_client_state(state: &str) {
    gauge!(
        "healthing_sync_client_state",
        "state" => state.to_string()
    )
    .set(1.0);
}

/// A timing guard that records submission latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(
            "healthing_sync_operation_seconds",
            "operation" => self.operation
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recorders_do_not_panic_without_exporter() {
        record_submission("submitted");
        record_validation("cache_hit");
        record_reconcile_item("synced");
        record_reconcile_run("manual", Duration::from_millis(5));
        record_reconcile_coalesced();
        set_queue_pending(3);
        set_identifier_cache_entries(10);
        record_cache_refresh("skipped");
        record_remote_call("ping", "success", Duration::from_micros(50));
        set_connectivity(true);
        record_connectivity_transition("offline");
        set_circuit_state("remote", 2);
        record_circuit_call("remote", "rejected");
        set_client_state("Running");
    }

    #[test]
    fn test_counters_are_labelled() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_reconcile_item("synced");
            record_reconcile_item("synced");
            record_reconcile_item("retained");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let synced = snapshot.iter().find_map(|(key, _, _, value)| {
            let key = key.key();
            let is_synced = key.name() == "healthing_sync_reconcile_items_total"
                && key.labels().any(|l| l.key() == "outcome" && l.value() == "synced");
            match value {
                DebugValue::Counter(n) if is_synced => Some(*n),
                _ => None,
            }
        });
        assert_eq!(synced, Some(2));
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("submit");
            std::thread::sleep(Duration::from_micros(10));
        }
        // recorded on drop
    }
}
