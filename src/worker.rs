// src/worker.rs
//! Source workers: one per source, wrapping an external `Fetcher`.
//!
//! One invocation is: quota check → fetch → debit → validate → append.
//! The fetcher is never called when the quota says no, and the debit
//! always happens once the fetcher has run, even on partial failure.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::hot_store::HotStore;
use crate::quota::LedgerHandle;
use crate::record::{Record, RecordError, SourceKind};

/// Read-only hint handed to the fetcher: how many quota units are left in
/// the current period (`None` = unbounded). Fetchers may use it to bound
/// their own request count but must not do any bookkeeping of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchBudget {
    pub remaining: Option<u64>,
}

impl FetchBudget {
    pub fn unbounded() -> Self {
        Self { remaining: None }
    }

    /// Clamp a desired request count to the budget.
    pub fn clamp(&self, wanted: u64) -> u64 {
        match self.remaining {
            Some(r) => wanted.min(r),
            None => wanted,
        }
    }
}

/// What one fetch attempt produced. `error` may be set alongside records
/// (partial failure); `units_consumed` is charged either way.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub records: Vec<Record>,
    pub units_consumed: u64,
    pub error: Option<anyhow::Error>,
}

impl FetchOutcome {
    pub fn ok(records: Vec<Record>, units_consumed: u64) -> Self {
        Self {
            records,
            units_consumed,
            error: None,
        }
    }

    pub fn failed(error: anyhow::Error, units_consumed: u64) -> Self {
        Self {
            records: Vec::new(),
            units_consumed,
            error: Some(error),
        }
    }

    pub fn partial(records: Vec<Record>, units_consumed: u64, error: anyhow::Error) -> Self {
        Self {
            records,
            units_consumed,
            error: Some(error),
        }
    }
}

/// Source-specific fetch logic. Must be callable repeatedly.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn source(&self) -> SourceKind;
    async fn fetch(&self, budget: FetchBudget) -> FetchOutcome;
}

/// Cumulative per-source run statistics.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SourceStats {
    pub invocations: u64,
    pub skipped: u64,
    pub fetched: u64,
    pub appended: u64,
    pub dropped: u64,
    pub errors: u64,
    pub units: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReport {
    /// Quota exhausted; the fetcher was not called.
    Skipped { remaining: Option<u64> },
    Completed(RunSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub fetched: usize,
    pub appended: usize,
    pub dropped_invalid: usize,
    pub dropped_share: usize,
    pub units_consumed: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerOptions {
    /// Project payloads onto the slim field set before appending.
    pub slim_mode: bool,
    /// Max records of this source allowed in the hot store at once.
    pub share_limit: Option<usize>,
}

pub struct SourceWorker {
    source: SourceKind,
    fetcher: Arc<dyn Fetcher>,
    ledger: Arc<LedgerHandle>,
    store: Arc<HotStore>,
    clock: Arc<dyn Clock>,
    options: WorkerOptions,
    export_nudge: Option<Arc<Notify>>,
    last_fetched_at: Mutex<Option<DateTime<Utc>>>,
    stats: Mutex<SourceStats>,
}

impl SourceWorker {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        ledger: Arc<LedgerHandle>,
        store: Arc<HotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source: fetcher.source(),
            fetcher,
            ledger,
            store,
            clock,
            options: WorkerOptions::default(),
            export_nudge: None,
            last_fetched_at: Mutex::new(None),
            stats: Mutex::new(SourceStats::default()),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Wake the exporter after every non-empty append.
    pub fn with_export_nudge(mut self, notify: Arc<Notify>) -> Self {
        self.export_nudge = Some(notify);
        self
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub fn stats(&self) -> SourceStats {
        self.stats.lock().expect("worker stats mutex poisoned").clone()
    }

    /// Run one invocation to completion.
    pub async fn run_once(&self) -> WorkerReport {
        let source = self.source;
        let label = source.as_str();

        let decision = self.ledger.check(source, self.clock.now());
        if !decision.allowed {
            info!(
                target: "pipeline",
                %source,
                remaining = ?decision.remaining,
                "fetch skipped: quota exhausted"
            );
            counter!("ingest_fetch_skipped_quota_total", "source" => label).increment(1);
            self.bump(|s| s.skipped += 1);
            return WorkerReport::Skipped {
                remaining: decision.remaining,
            };
        }

        info!(target: "pipeline", %source, remaining = ?decision.remaining, "fetch attempted");
        counter!("ingest_fetch_attempted_total", "source" => label).increment(1);

        let outcome = self
            .fetcher
            .fetch(FetchBudget {
                remaining: decision.remaining,
            })
            .await;

        // Partial attempts still consumed external quota.
        self.ledger.debit(source, outcome.units_consumed);

        let mut summary = RunSummary {
            fetched: outcome.records.len(),
            units_consumed: outcome.units_consumed,
            ..Default::default()
        };

        let accepted = self.admit(outcome.records, &mut summary);
        if !accepted.is_empty() {
            match self.store.append_batch(accepted) {
                Ok(n) => summary.appended = n,
                Err(e) => {
                    warn!(target: "pipeline", %source, error = ?e, "hot store append failed");
                    summary.error = Some(format!("append failed: {e:#}"));
                }
            }
            if let Err(e) = self.store.flush_blocking().await {
                warn!(%source, error = ?e, "hot store flush failed");
            }
            if let Some(n) = &self.export_nudge {
                n.notify_one();
            }
        }

        counter!("ingest_records_appended_total", "source" => label)
            .increment(summary.appended as u64);
        let dropped = (summary.dropped_invalid + summary.dropped_share) as u64;
        if dropped > 0 {
            counter!("ingest_records_dropped_total", "source" => label).increment(dropped);
        }

        match outcome.error {
            Some(e) => {
                warn!(
                    target: "pipeline",
                    %source,
                    error = ?e,
                    fetched = summary.fetched,
                    appended = summary.appended,
                    units = summary.units_consumed,
                    "fetch failed"
                );
                counter!("ingest_fetch_failed_total", "source" => label).increment(1);
                summary.error.get_or_insert_with(|| format!("{e:#}"));
            }
            None => {
                info!(
                    target: "pipeline",
                    %source,
                    fetched = summary.fetched,
                    appended = summary.appended,
                    dropped = dropped,
                    units = summary.units_consumed,
                    "fetch succeeded"
                );
                counter!("ingest_fetch_succeeded_total", "source" => label).increment(1);
            }
        }

        self.bump(|s| {
            s.invocations += 1;
            s.fetched += summary.fetched as u64;
            s.appended += summary.appended as u64;
            s.dropped += dropped;
            s.units += summary.units_consumed;
            if summary.error.is_some() {
                s.errors += 1;
            }
        });

        WorkerReport::Completed(summary)
    }

    /// Validate, stamp and filter one batch. Bad records are dropped one by
    /// one; the rest of the batch goes through.
    fn admit(&self, records: Vec<Record>, summary: &mut RunSummary) -> Vec<Record> {
        let mut out = Vec::with_capacity(records.len());
        let mut last = self
            .last_fetched_at
            .lock()
            .expect("worker clock mutex poisoned");

        let share_room = self.options.share_limit.map(|limit| {
            limit.saturating_sub(self.store.source_count(self.source))
        });

        for mut rec in records {
            if rec.source != self.source {
                let err = RecordError::SourceMismatch {
                    expected: self.source,
                    found: rec.source,
                };
                debug!(source = %self.source, error = %err, "dropping record");
                summary.dropped_invalid += 1;
                continue;
            }
            if self.options.slim_mode {
                rec = rec.into_slim();
            }
            if let Err(err) = rec.validate() {
                debug!(source = %self.source, error = %err, "dropping record");
                summary.dropped_invalid += 1;
                continue;
            }
            if let Some(room) = share_room {
                if out.len() >= room {
                    summary.dropped_share += 1;
                    continue;
                }
            }
            // fetched_at never goes backwards within this worker's sequence.
            if let Some(prev) = *last {
                if rec.fetched_at < prev {
                    rec.fetched_at = prev;
                }
            }
            *last = Some(rec.fetched_at);
            out.push(rec);
        }

        if summary.dropped_share > 0 {
            warn!(
                source = %self.source,
                dropped = summary.dropped_share,
                "store share exhausted; dropping new records"
            );
        }
        out
    }

    fn bump(&self, f: impl FnOnce(&mut SourceStats)) {
        let mut g = self.stats.lock().expect("worker stats mutex poisoned");
        f(&mut g);
    }
}
