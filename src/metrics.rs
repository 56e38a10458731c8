// src/metrics.rs
//! Prometheus recorder and metric descriptions.

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_fetch_attempted_total", "Fetch invocations that passed the quota check.");
        describe_counter!(
            "ingest_fetch_skipped_quota_total",
            "Invocations skipped because the source quota was exhausted."
        );
        describe_counter!("ingest_fetch_succeeded_total", "Fetch invocations without error.");
        describe_counter!(
            "ingest_fetch_failed_total",
            "Fetch invocations that reported an error (including partial)."
        );
        describe_counter!("ingest_records_appended_total", "Records appended to the hot store.");
        describe_counter!(
            "ingest_records_dropped_total",
            "Records dropped by validation or store share."
        );
        describe_counter!(
            "ingest_ticks_dropped_total",
            "Timer ticks dropped because the previous invocation was still running."
        );
        describe_counter!("ingest_provider_errors_total", "Per-feed fetch/parse errors.");
        describe_histogram!("ingest_parse_ms", Unit::Milliseconds, "Feed parse time.");
        describe_gauge!("ingest_quota_remaining", "Quota units left in the current period.");
        describe_gauge!("hot_store_len", "Records held in the hot store.");
        describe_gauge!("hot_store_bytes", Unit::Bytes, "Approximate hot store payload bytes.");
        describe_counter!("export_triggered_total", "Export cycles started, by trigger reason.");
        describe_counter!("export_records_total", "Records moved from the hot store to warm files.");
        describe_counter!("export_failures_total", "Export cycles aborted by an I/O error.");
        describe_histogram!("export_duration_ms", Unit::Milliseconds, "Export cycle duration.");
        describe_counter!("retention_archived_total", "Warm files compressed into the cold archive.");
        describe_counter!("retention_deleted_total", "Warm or archive files deleted by retention.");
        describe_counter!("retention_failures_total", "Per-file retention failures.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Call once per process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_described();
        Ok(Self { handle })
    }
}
