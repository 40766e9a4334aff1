//! Metrics for the cluster metadata server
//!
//! Counters and gauges are recorded through the `metrics` facade. When
//! enabled, a Prometheus recorder is installed and its handle renders the
//! text exposition served at `/metrics`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::config::MetricsConfig;
use crate::error::{MetaError, Result};

pub const RECONCILE_PASSES: &str = "cluster_meta_reconcile_passes_total";
pub const RECONCILE_CHANGES: &str = "cluster_meta_reconcile_changes_total";
pub const RECONCILE_FAILURES: &str = "cluster_meta_reconcile_failures_total";
pub const EVENTS_RECEIVED: &str = "cluster_meta_events_received_total";
pub const EVENTS_APPLIED: &str = "cluster_meta_events_applied_total";
pub const PERSIST_SUCCESS: &str = "cluster_meta_persist_success_total";
pub const PERSIST_CONFLICT: &str = "cluster_meta_persist_conflict_total";
pub const PERSIST_FAILURE: &str = "cluster_meta_persist_failure_total";
pub const SKIPPED_INSTANCES: &str = "cluster_meta_persist_skipped_instances_total";
pub const META_VERSION: &str = "cluster_meta_version";
pub const META_INSTANCES: &str = "cluster_meta_instances";

/// Install the Prometheus recorder if metrics are enabled.
pub fn install_recorder(config: &MetricsConfig) -> Result<Option<PrometheusHandle>> {
    if !config.enabled {
        return Ok(None);
    }
    PrometheusBuilder::new()
        .install_recorder()
        .map(Some)
        .map_err(|e| MetaError::Config(format!("failed to install metrics recorder: {}", e)))
}

pub fn record_reconcile(changed: usize) {
    ::metrics::increment_counter!(RECONCILE_PASSES);
    ::metrics::counter!(RECONCILE_CHANGES, changed as u64);
}

pub fn record_reconcile_failure() {
    ::metrics::increment_counter!(RECONCILE_FAILURES);
}

pub fn record_event(watcher: &'static str, applied: bool) {
    ::metrics::increment_counter!(EVENTS_RECEIVED, "watcher" => watcher);
    if applied {
        ::metrics::increment_counter!(EVENTS_APPLIED, "watcher" => watcher);
    }
}

pub fn record_persist(result: &Result<()>) {
    match result {
        Ok(()) => ::metrics::increment_counter!(PERSIST_SUCCESS),
        Err(e) if e.is_conflict() => ::metrics::increment_counter!(PERSIST_CONFLICT),
        Err(_) => ::metrics::increment_counter!(PERSIST_FAILURE),
    }
}

pub fn record_skipped_instance() {
    ::metrics::increment_counter!(SKIPPED_INSTANCES);
}

pub fn record_snapshot_shape(version: u32, instances: usize) {
    ::metrics::gauge!(META_VERSION, version as f64);
    ::metrics::gauge!(META_INSTANCES, instances as f64);
}
