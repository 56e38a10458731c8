// src/export/mod.rs
//! Tiered exporter: hot store → warm files → cold archive.
//!
//! A cycle evaluates the triggers, drains everything beyond `max_keep` in
//! fixed-size batches into one warm file, and pops those records only once
//! the file is durable. A crash between write and pop exports the same
//! records twice; warm entries carry a merge key so consumers can dedupe.

pub mod retention;
pub mod trigger;
pub mod warm;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::hot_store::HotStore;

pub use retention::{RetentionPolicy, SweepReport};
pub use trigger::{Thresholds, TriggerReason};
pub use warm::{WarmFileMeta, WarmFormat, WarmInventory};

/// Plain values the exporter runs with.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub dir: PathBuf,
    pub format: WarmFormat,
    pub queue_threshold: usize,
    pub memory_threshold_bytes: u64,
    pub time_interval: Duration,
    pub max_keep: usize,
    pub batch_size: usize,
    pub check_interval: Duration,
    pub retention: RetentionPolicy,
}

impl ExportSettings {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            queue_threshold: self.queue_threshold,
            memory_threshold_bytes: self.memory_threshold_bytes,
            time_interval: ChronoDuration::from_std(self.time_interval)
                .unwrap_or_else(|_| ChronoDuration::days(36_500)),
        }
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("exports"),
            format: WarmFormat::Json,
            queue_threshold: 1000,
            memory_threshold_bytes: 50 * 1024 * 1024,
            time_interval: Duration::from_secs(30 * 60),
            max_keep: 500,
            batch_size: 1000,
            check_interval: Duration::from_secs(60),
            retention: RetentionPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub reason: TriggerReason,
    pub exported: usize,
    pub file: Option<WarmFileMeta>,
    pub sweep: Option<SweepReport>,
    pub finished_at: DateTime<Utc>,
}

pub struct TieredExporter {
    store: Arc<HotStore>,
    clock: Arc<dyn Clock>,
    settings: ExportSettings,
    last_export_at: Mutex<DateTime<Utc>>,
    last_report: Mutex<Option<ExportReport>>,
    // Serializes cycles; the exporter is the only remover from the store.
    cycle: Mutex<()>,
}

impl TieredExporter {
    /// The time-trigger clock starts now.
    pub fn new(store: Arc<HotStore>, clock: Arc<dyn Clock>, settings: ExportSettings) -> Self {
        let started = clock.now();
        Self {
            store,
            clock,
            settings,
            last_export_at: Mutex::new(started),
            last_report: Mutex::new(None),
            cycle: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    pub fn dir(&self) -> &Path {
        &self.settings.dir
    }

    pub fn last_export_at(&self) -> DateTime<Utc> {
        *self.last_export_at.lock().expect("exporter clock mutex poisoned")
    }

    pub fn last_report(&self) -> Option<ExportReport> {
        self.last_report
            .lock()
            .expect("exporter report mutex poisoned")
            .clone()
    }

    pub fn inventory(&self) -> Result<WarmInventory> {
        warm::warm_inventory(&self.settings.dir)
    }

    /// Which trigger (if any) fires right now.
    pub fn evaluate(&self) -> Option<TriggerReason> {
        trigger::evaluate(
            &self.settings.thresholds(),
            self.store.length(),
            self.store.approx_memory_bytes(),
            self.last_export_at(),
            self.clock.now(),
        )
    }

    /// One export cycle. `Ok(None)` when no trigger fired.
    ///
    /// On error nothing has been popped and the time-trigger clock is left
    /// alone, so the next check retries.
    pub fn run_cycle(&self) -> Result<Option<ExportReport>> {
        let _cycle = self.cycle.lock().expect("exporter cycle mutex poisoned");
        let Some(reason) = self.evaluate() else {
            return Ok(None);
        };

        info!(target: "pipeline", reason = reason.label(), detail = %reason, "export triggered");
        counter!("export_triggered_total", "reason" => reason.label()).increment(1);

        let started = Instant::now();
        let now = self.clock.now();
        let to_export = trigger::export_count(self.store.length(), self.settings.max_keep);

        let file = if to_export == 0 {
            debug!(reason = reason.label(), "nothing beyond max_keep; resetting export clock");
            None
        } else {
            match self.drain(to_export, now) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    counter!("export_failures_total").increment(1);
                    error!(target: "pipeline", error = ?e, to_export, "export failed; records kept in hot store");
                    return Err(e);
                }
            }
        };

        *self.last_export_at.lock().expect("exporter clock mutex poisoned") = now;

        let sweep = match retention::sweep(&self.settings.dir, &self.settings.retention, now) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(error = ?e, "retention sweep failed");
                None
            }
        };

        let exported = file.as_ref().map_or(0, |f| f.record_count);
        histogram!("export_duration_ms").record(started.elapsed().as_secs_f64() * 1000.0);
        let report = ExportReport {
            reason,
            exported,
            file,
            sweep,
            finished_at: self.clock.now(),
        };
        *self.last_report.lock().expect("exporter report mutex poisoned") = Some(report.clone());
        Ok(Some(report))
    }

    /// Write the `count` oldest records to a durable warm file, then pop them.
    fn drain(&self, count: usize, now: DateTime<Utc>) -> Result<WarmFileMeta> {
        let meta = self.write_oldest(count, now)?;
        let popped = self
            .store
            .pop_oldest(meta.record_count)
            .context("popping exported records")?;
        if let Err(e) = self.store.flush() {
            // The warm file is durable; a stale snapshot only means duplicates after a crash.
            warn!(error = ?e, "hot store flush after export failed");
        }

        counter!("export_records_total").increment(popped.len() as u64);
        info!(
            target: "pipeline",
            count = popped.len(),
            path = %self.settings.dir.join(&meta.file_name).display(),
            "export completed"
        );
        Ok(meta)
    }

    /// Write the `count` oldest records to a new warm file and record it in
    /// the manifest. Does not touch the hot store.
    pub fn write_oldest(&self, count: usize, now: DateTime<Utc>) -> Result<WarmFileMeta> {
        let dir = &self.settings.dir;
        let batch = self.settings.batch_size.max(1);

        let columns = if self.settings.format == WarmFormat::Csv {
            let mut keys = BTreeSet::new();
            let mut offset = 0;
            while offset < count {
                let chunk = self.store.peek_range(offset, batch.min(count - offset))?;
                if chunk.is_empty() {
                    break;
                }
                warm::collect_columns(&chunk, &mut keys);
                offset += chunk.len();
            }
            keys.into_iter().collect()
        } else {
            Vec::new()
        };

        let mut writer = warm::WarmWriter::create(dir, self.settings.format, now, columns)?;
        let mut offset = 0;
        while offset < count {
            let chunk = self.store.peek_range(offset, batch.min(count - offset))?;
            if chunk.is_empty() {
                break;
            }
            writer.write_batch(&chunk)?;
            offset += chunk.len();
        }
        let meta = writer.finish()?;

        let mut manifest = warm::Manifest::load(dir);
        manifest.upsert(meta.clone());
        if let Err(e) = manifest.save(dir) {
            warn!(file = %meta.file_name, error = ?e, "manifest update failed; file will be aged by mtime");
        }
        Ok(meta)
    }

    /// Check on `check_interval` and whenever `nudge` fires, until `stop`.
    /// An in-flight cycle always completes.
    pub async fn run(self: Arc<Self>, stop: CancellationToken, nudge: Option<Arc<Notify>>) {
        let mut ticker =
            tokio::time::interval(self.settings.check_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            dir = %self.settings.dir.display(),
            format = self.settings.format.tag(),
            check_interval_secs = self.settings.check_interval.as_secs(),
            "exporter started"
        );

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
                _ = wait_nudge(nudge.as_deref()) => {}
            }

            let this = self.clone();
            match tokio::task::spawn_blocking(move || this.run_cycle()).await {
                Ok(Ok(_)) => {}
                // Already logged and counted inside the cycle.
                Ok(Err(_)) => {}
                Err(e) => error!(error = %e, "export task panicked"),
            }
        }
        info!("exporter stopped");
    }
}

async fn wait_nudge(nudge: Option<&Notify>) {
    match nudge {
        Some(n) => n.notified().await,
        None => std::future::pending().await,
    }
}
