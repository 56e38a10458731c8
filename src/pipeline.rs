// src/pipeline.rs
//! Wiring: config → ledger, hot store, workers, scheduler, exporter.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::AppState;
use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::export::TieredExporter;
use crate::hot_store::HotStore;
use crate::quota::{LedgerHandle, QuotaLedger};
use crate::scheduler::{Scheduler, StatusBoard};
use crate::sources;
use crate::worker::{Fetcher, SourceWorker};

pub struct Pipeline {
    pub store: Arc<HotStore>,
    pub ledger: Arc<LedgerHandle>,
    pub exporter: Option<Arc<TieredExporter>>,
    scheduler: Scheduler,
    board: StatusBoard,
    nudge: Option<Arc<Notify>>,
}

impl Pipeline {
    /// Build with the shipped fetchers. Enabled sources without one are
    /// logged and left unscheduled.
    pub fn build(cfg: &PipelineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut fetchers = Vec::new();
        for sc in cfg.enabled_sources() {
            match sources::build_fetcher(sc, clock.clone())? {
                Some(f) => fetchers.push(f),
                None => info!(source = %sc.name, "no fetcher ships for this source; not scheduled"),
            }
        }
        Self::with_fetchers(cfg, clock, fetchers)
    }

    /// Build around caller-supplied fetchers. Each fetcher's source must
    /// have an enabled `[[sources]]` entry.
    pub fn with_fetchers(
        cfg: &PipelineConfig,
        clock: Arc<dyn Clock>,
        fetchers: Vec<Arc<dyn Fetcher>>,
    ) -> Result<Self> {
        cfg.validate()?;

        let now = clock.now();
        let mut ledger = QuotaLedger::new();
        let mut plans = Vec::with_capacity(fetchers.len());
        for f in fetchers {
            let kind = f.source();
            let Some(sc) = cfg
                .enabled_sources()
                .find(|s| s.kind().ok() == Some(kind))
            else {
                bail!("fetcher for `{kind}` has no enabled [[sources]] entry");
            };
            ledger.register(kind, sc.quota_spec(), now);
            plans.push((f, sc.interval()));
        }
        let ledger = Arc::new(match &cfg.quota.state_path {
            Some(p) => LedgerHandle::with_snapshot(ledger, p.clone()),
            None => LedgerHandle::new(ledger),
        });

        let store = Arc::new(match &cfg.store.snapshot_path {
            Some(p) => HotStore::open(p.clone())
                .with_context(|| format!("opening hot store at {}", p.display()))?,
            None => HotStore::in_memory(),
        });

        let exporter = cfg.export.enabled.then(|| {
            Arc::new(TieredExporter::new(
                store.clone(),
                clock.clone(),
                cfg.export_settings(),
            ))
        });
        if exporter.is_none() {
            warn!("export disabled; hot store will grow without bound");
        }
        let nudge = (exporter.is_some() && cfg.export.export_on_append).then(|| Arc::new(Notify::new()));

        let mut scheduler = Scheduler::new();
        for (fetcher, interval) in plans {
            let kind = fetcher.source();
            let mut worker = SourceWorker::new(fetcher, ledger.clone(), store.clone(), clock.clone())
                .with_options(cfg.worker_options(kind));
            if let Some(n) = &nudge {
                worker = worker.with_export_nudge(n.clone());
            }
            scheduler.add(Arc::new(worker), interval);
        }
        let board = scheduler.board();

        Ok(Self {
            store,
            ledger,
            exporter,
            scheduler,
            board,
            nudge,
        })
    }

    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn scheduled_sources(&self) -> usize {
        self.scheduler.len()
    }

    pub fn api_state(&self, metrics: Option<PrometheusHandle>) -> AppState {
        AppState {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            board: self.board.clone(),
            exporter: self.exporter.clone(),
            metrics,
        }
    }

    /// Run until `stop`. In-flight fetches and the in-flight export cycle
    /// finish; the hot store and ledger snapshots are flushed last.
    pub async fn run(self, stop: CancellationToken) -> Result<()> {
        let exporter_task = self.exporter.clone().map(|ex| {
            let stop = stop.clone();
            let nudge = self.nudge.clone();
            tokio::spawn(ex.run(stop, nudge))
        });

        self.scheduler.run(stop.clone()).await;

        if let Some(t) = exporter_task {
            if let Err(e) = t.await {
                warn!(error = %e, "exporter task ended abnormally");
            }
        }

        self.store
            .flush_blocking()
            .await
            .context("final hot store flush")?;
        self.ledger.flush().context("final quota snapshot flush")?;
        info!(hot_store_len = self.store.length(), "pipeline stopped");
        Ok(())
    }
}
