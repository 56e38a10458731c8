// src/scheduler.rs
//! Per-source timers with an Idle → Running → Idle state machine.
//!
//! Every source gets its own interval; sources run concurrently with each
//! other but never with themselves. A tick that lands while the previous
//! invocation is still running is dropped, not queued. On stop, timers quit
//! scheduling and the scheduler waits for in-flight invocations to finish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::record::SourceKind;
use crate::worker::{SourceStats, SourceWorker, WorkerReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
}

/// Point-in-time view of one scheduled source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: SourceKind,
    pub state: RunState,
    pub interval_secs: u64,
    pub dropped_ticks: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stats: SourceStats,
}

#[derive(Debug, Default)]
struct LastRun {
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

/// Shared per-source slot: the Running flag plus bookkeeping.
pub struct SourceSlot {
    worker: Arc<SourceWorker>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    running: AtomicBool,
    dropped_ticks: AtomicU64,
    last: Mutex<LastRun>,
}

impl SourceSlot {
    fn status(&self) -> SourceStatus {
        let last = self.last.lock().expect("slot mutex poisoned");
        SourceStatus {
            source: self.worker.source(),
            state: if self.running.load(Ordering::Acquire) {
                RunState::Running
            } else {
                RunState::Idle
            },
            interval_secs: self.interval.as_secs(),
            dropped_ticks: self.dropped_ticks.load(Ordering::Relaxed),
            last_started_at: last.started_at,
            last_finished_at: last.finished_at,
            last_error: last.error.clone(),
            stats: self.worker.stats(),
        }
    }
}

/// Clears the Running flag even if the invocation panics.
struct RunningGuard(Arc<SourceSlot>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
    }
}

/// Read-only view over all slots, cheap to clone into the HTTP layer.
#[derive(Clone, Default)]
pub struct StatusBoard {
    slots: Arc<Vec<Arc<SourceSlot>>>,
}

impl StatusBoard {
    pub fn statuses(&self) -> Vec<SourceStatus> {
        self.slots.iter().map(|s| s.status()).collect()
    }
}

#[derive(Default)]
pub struct Scheduler {
    slots: Vec<Arc<SourceSlot>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, worker: Arc<SourceWorker>, interval: Duration) {
        let interval = interval.max(Duration::from_millis(1));
        self.slots.push(Arc::new(SourceSlot {
            clock: worker.clock(),
            worker,
            interval,
            running: AtomicBool::new(false),
            dropped_ticks: AtomicU64::new(0),
            last: Mutex::new(LastRun::default()),
        }));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn board(&self) -> StatusBoard {
        StatusBoard {
            slots: Arc::new(self.slots.clone()),
        }
    }

    /// Drive all sources until `stop` is cancelled, then wait for in-flight
    /// invocations to complete.
    pub async fn run(self, stop: CancellationToken) {
        let tracker = TaskTracker::new();
        let mut timers = Vec::with_capacity(self.slots.len());

        for slot in &self.slots {
            info!(
                source = %slot.worker.source(),
                interval_secs = slot.interval.as_secs(),
                "scheduling source"
            );
            timers.push(tokio::spawn(timer_loop(
                slot.clone(),
                tracker.clone(),
                stop.clone(),
            )));
        }

        for t in timers {
            let _ = t.await;
        }

        tracker.close();
        if !tracker.is_empty() {
            info!(in_flight = tracker.len(), "waiting for in-flight fetches to finish");
        }
        tracker.wait().await;
        info!("scheduler stopped");
    }
}

async fn timer_loop(slot: Arc<SourceSlot>, tracker: TaskTracker, stop: CancellationToken) {
    let source = slot.worker.source();
    let mut ticker = tokio::time::interval(slot.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if slot
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            slot.dropped_ticks.fetch_add(1, Ordering::Relaxed);
            counter!("ingest_ticks_dropped_total", "source" => source.as_str()).increment(1);
            debug!(
                target: "pipeline",
                %source,
                "tick dropped: previous invocation still running"
            );
            continue;
        }

        let guard = RunningGuard(slot.clone());
        tracker.spawn(async move {
            let slot = guard.0.clone();
            slot.last.lock().expect("slot mutex poisoned").started_at = Some(slot.clock.now());
            let report = slot.worker.run_once().await;
            let mut last = slot.last.lock().expect("slot mutex poisoned");
            last.finished_at = Some(slot.clock.now());
            last.error = match report {
                WorkerReport::Completed(summary) => summary.error,
                WorkerReport::Skipped { .. } => None,
            };
            drop(last);
            drop(guard);
        });
    }
    debug!(%source, "timer stopped");
}
