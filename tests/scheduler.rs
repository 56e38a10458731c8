// tests/scheduler.rs
//
// Timer behaviour on paused tokio time: independent sources, dropped ticks
// while a fetch is still running, and graceful drain on stop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feed_ingest::clock::SystemClock;
use feed_ingest::record::{payload, Scalar};
use feed_ingest::scheduler::{RunState, Scheduler};
use feed_ingest::{
    FetchBudget, FetchOutcome, Fetcher, HotStore, LedgerHandle, QuotaLedger, Record, SourceKind,
    SourceWorker,
};
use tokio_util::sync::CancellationToken;

/// Sleeps for `stall` on every call, then returns one record.
struct Slow {
    source: SourceKind,
    stall: Duration,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl Slow {
    fn new(source: SourceKind, stall: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            stall,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        })
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for Slow {
    fn source(&self) -> SourceKind {
        self.source
    }

    async fn fetch(&self, _budget: FetchBudget) -> FetchOutcome {
        let n = self.started.fetch_add(1, Ordering::SeqCst) as i64;
        tokio::time::sleep(self.stall).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        let rec = Record::new(
            self.source,
            payload([
                ("title", Scalar::from(format!("{} #{n}", self.source))),
                ("url", Scalar::from(format!("https://s.test/{}/{n}", self.source))),
                ("timestamp", Scalar::from(n)),
            ]),
        );
        FetchOutcome::ok(vec![rec], 1)
    }
}

fn worker(f: Arc<Slow>, store: &Arc<HotStore>, ledger: &Arc<LedgerHandle>) -> Arc<SourceWorker> {
    Arc::new(SourceWorker::new(
        f,
        ledger.clone(),
        store.clone(),
        Arc::new(SystemClock),
    ))
}

fn shared() -> (Arc<HotStore>, Arc<LedgerHandle>) {
    (
        Arc::new(HotStore::in_memory()),
        Arc::new(LedgerHandle::new(QuotaLedger::new())),
    )
}

#[tokio::test(start_paused = true)]
async fn stalled_source_does_not_block_another() {
    let (store, ledger) = shared();
    let minutely = Slow::new(SourceKind::NewsApi, Duration::from_secs(5));
    let daily = Slow::new(SourceKind::Rss, Duration::from_millis(10));

    let mut s = Scheduler::new();
    s.add(worker(minutely.clone(), &store, &ledger), Duration::from_secs(60));
    s.add(worker(daily.clone(), &store, &ledger), Duration::from_secs(24 * 3600));
    let board = s.board();
    let stop = CancellationToken::new();
    let run = tokio::spawn(s.run(stop.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(minutely.started(), 1);
    assert_eq!(minutely.finished(), 0, "minutely source is still stalled");
    assert_eq!(daily.finished(), 1, "daily source ran while the other stalled");
    let states: Vec<_> = board.statuses().into_iter().map(|s| s.state).collect();
    assert_eq!(states, vec![RunState::Running, RunState::Idle]);

    tokio::time::sleep(Duration::from_secs(125)).await;
    assert_eq!(minutely.finished(), 3);
    assert_eq!(daily.started(), 1);

    stop.cancel();
    run.await.unwrap();
    assert_eq!(store.source_count(SourceKind::NewsApi), 3);
    assert_eq!(store.source_count(SourceKind::Rss), 1);
}

#[tokio::test(start_paused = true)]
async fn ticks_during_a_running_invocation_are_dropped() {
    let (store, ledger) = shared();
    let slow = Slow::new(SourceKind::Reddit, Duration::from_secs(150));

    let mut s = Scheduler::new();
    s.add(worker(slow.clone(), &store, &ledger), Duration::from_secs(60));
    let board = s.board();
    let stop = CancellationToken::new();
    let run = tokio::spawn(s.run(stop.clone()));

    // Ticks at 0 (runs until 150), 60 and 120 (dropped), 180 (runs).
    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(slow.started(), 2, "never two in flight, no queued catch-up");
    assert_eq!(slow.finished(), 1);

    let st = &board.statuses()[0];
    assert_eq!(st.dropped_ticks, 2);
    assert_eq!(st.state, RunState::Running);
    assert_eq!(st.stats.invocations, 1);

    stop.cancel();
    run.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_in_flight_invocations() {
    let (store, ledger) = shared();
    let slow = Slow::new(SourceKind::Twitter, Duration::from_secs(30));

    let mut s = Scheduler::new();
    s.add(worker(slow.clone(), &store, &ledger), Duration::from_secs(3600));
    let stop = CancellationToken::new();
    let t0 = tokio::time::Instant::now();
    let run = tokio::spawn(s.run(stop.clone()));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(slow.started(), 1);
    stop.cancel();
    run.await.unwrap();

    assert!(t0.elapsed() >= Duration::from_secs(30));
    assert_eq!(slow.finished(), 1, "in-flight fetch completed");
    assert_eq!(store.length(), 1, "its records were appended");
    // No new invocation after the stop.
    assert_eq!(slow.started(), 1);
}

#[tokio::test(start_paused = true)]
async fn run_timestamps_come_from_the_worker_clock() {
    use chrono::{TimeZone, Utc};
    use feed_ingest::clock::ManualClock;

    let (store, ledger) = shared();
    let t = Utc.with_ymd_and_hms(2025, 4, 1, 8, 0, 0).unwrap();
    let w = Arc::new(SourceWorker::new(
        Slow::new(SourceKind::Rss, Duration::from_millis(10)),
        ledger,
        store,
        Arc::new(ManualClock::new(t)),
    ));

    let mut s = Scheduler::new();
    s.add(w, Duration::from_secs(3600));
    let board = s.board();
    let stop = CancellationToken::new();
    let run = tokio::spawn(s.run(stop.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    stop.cancel();
    run.await.unwrap();

    let st = &board.statuses()[0];
    assert_eq!(st.last_started_at, Some(t));
    assert_eq!(st.last_finished_at, Some(t));
}
