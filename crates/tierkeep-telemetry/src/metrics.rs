//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Collector registration stays private; callers only see typed recorders.
//! - Label values are short static strings (`freeze`, `thaw`, `ok`, `error`).

use std::sync::Arc;

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

use crate::error::{Result, TelemetryError};

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    scans_total: IntCounterVec,
    file_operations_total: IntCounterVec,
    bytes_transferred_total: IntCounterVec,
    relocations_total: IntCounterVec,
    active_scans: IntGauge,
    relocation_queue_depth: IntGauge,
}

/// Snapshot of the gauges used for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Scans currently holding a path lock.
    pub active_scans: i64,
    /// Relocation tasks waiting for the worker.
    pub relocation_queue_depth: i64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the Prometheus collectors cannot be
    /// built or registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let scans_total = counter_vec(
            &registry,
            "tierkeep_scans_total",
            "Completed path scans by outcome",
            &["outcome"],
        )?;
        let file_operations_total = counter_vec(
            &registry,
            "tierkeep_file_operations_total",
            "File freeze/thaw/relocate operations by outcome",
            &["operation", "outcome"],
        )?;
        let bytes_transferred_total = counter_vec(
            &registry,
            "tierkeep_bytes_transferred_total",
            "Bytes moved between tiers by operation",
            &["operation"],
        )?;
        let relocations_total = counter_vec(
            &registry,
            "tierkeep_relocations_total",
            "Relocation tasks reaching a terminal status",
            &["status"],
        )?;
        let active_scans = gauge(&registry, "tierkeep_active_scans", "Scans in progress")?;
        let relocation_queue_depth = gauge(
            &registry,
            "tierkeep_relocation_queue_depth",
            "Relocation tasks waiting to run",
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                scans_total,
                file_operations_total,
                bytes_transferred_total,
                relocations_total,
                active_scans,
                relocation_queue_depth,
            }),
        })
    }

    /// Record a finished scan.
    pub fn inc_scan(&self, outcome: &str) {
        self.inner.scans_total.with_label_values(&[outcome]).inc();
    }

    /// Record a per-file operation (`freeze`, `thaw`, `relocate`).
    pub fn inc_file_operation(&self, operation: &str, outcome: &str) {
        self.inner
            .file_operations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Add transferred bytes for an operation.
    pub fn add_bytes(&self, operation: &str, bytes: u64) {
        self.inner
            .bytes_transferred_total
            .with_label_values(&[operation])
            .inc_by(bytes);
    }

    /// Record a relocation task reaching a terminal status.
    pub fn inc_relocation(&self, status: &str) {
        self.inner
            .relocations_total
            .with_label_values(&[status])
            .inc();
    }

    /// Mark a scan as started.
    pub fn scan_started(&self) {
        self.inner.active_scans.inc();
    }

    /// Mark a scan as finished.
    pub fn scan_finished(&self) {
        self.inner.active_scans.dec();
    }

    /// Set the relocation queue depth gauge.
    pub fn set_relocation_queue_depth(&self, depth: usize) {
        self.inner
            .relocation_queue_depth
            .set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the gauges.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_scans: self.inner.active_scans.get(),
            relocation_queue_depth: self.inner.relocation_queue_depth.get(),
        }
    }
}

fn counter_vec(
    registry: &Registry,
    name: &'static str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec> {
    let collector = IntCounterVec::new(Opts::new(name, help), labels)
        .map_err(|source| TelemetryError::MetricsCollector { name, source })?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })?;
    Ok(collector)
}

fn gauge(registry: &Registry, name: &'static str, help: &str) -> Result<IntGauge> {
    let collector = IntGauge::with_opts(Opts::new(name, help))
        .map_err(|source| TelemetryError::MetricsCollector { name, source })?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::MetricsRegister { name, source })?;
    Ok(collector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_snapshot_reflects_updates() -> Result<()> {
        let metrics = Metrics::new()?;
        metrics.scan_started();
        metrics.scan_started();
        metrics.scan_finished();
        metrics.set_relocation_queue_depth(3);
        metrics.inc_scan("success");
        metrics.inc_file_operation("freeze", "ok");
        metrics.add_bytes("freeze", 4_096);
        metrics.inc_relocation("completed");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_scans, 1);
        assert_eq!(snapshot.relocation_queue_depth, 3);

        let rendered = metrics.render()?;
        assert!(rendered.contains("tierkeep_scans_total"));
        assert!(rendered.contains("tierkeep_bytes_transferred_total{operation=\"freeze\"} 4096"));
        assert!(rendered.contains("tierkeep_relocations_total"));
        Ok(())
    }

    #[test]
    fn duplicate_registration_is_reported() -> Result<()> {
        let registry = Registry::new();
        gauge(&registry, "tierkeep_duplicate", "duplicate")?;
        assert!(matches!(
            gauge(&registry, "tierkeep_duplicate", "duplicate"),
            Err(TelemetryError::MetricsRegister {
                name: "tierkeep_duplicate",
                ..
            })
        ));
        Ok(())
    }
}
