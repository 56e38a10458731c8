// tests/export_pipeline.rs
//
// Exporter cycles end to end: threshold drains, the time trigger, write
// failures, the crash-duplicate window, formats and retention.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use feed_ingest::clock::ManualClock;
use feed_ingest::export::retention::archive_dir;
use feed_ingest::export::warm::{list_warm_files, read_warm_file, Manifest};
use feed_ingest::export::{ExportSettings, TriggerReason, WarmFormat};
use feed_ingest::record::{payload, Scalar};
use feed_ingest::{HotStore, Record, SourceKind, TieredExporter};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 2, 9, 30, 0).unwrap()
}

fn rec(i: i64) -> Record {
    let source = if i % 2 == 0 {
        SourceKind::Rss
    } else {
        SourceKind::Reddit
    };
    Record::at(
        source,
        t0(),
        payload([
            ("title", Scalar::from(format!("headline {i}"))),
            ("url", Scalar::from(format!("https://e.test/{i}"))),
            ("timestamp", Scalar::from(i)),
            ("score", Scalar::from(i as f64 / 10.0)),
        ]),
    )
}

fn fill(store: &HotStore, range: std::ops::Range<i64>) {
    store.append_batch(range.map(rec).collect()).unwrap();
}

fn settings(dir: &Path) -> ExportSettings {
    ExportSettings {
        dir: dir.to_path_buf(),
        queue_threshold: 50,
        max_keep: 10,
        batch_size: 16,
        time_interval: Duration::from_secs(30 * 60),
        ..Default::default()
    }
}

fn timestamps(path: &Path) -> Vec<i64> {
    read_warm_file(path)
        .unwrap()
        .into_iter()
        .map(|e| match e.record.payload["timestamp"] {
            Scalar::Int(i) => i,
            ref other => panic!("unexpected timestamp {other:?}"),
        })
        .collect()
}

#[test]
fn length_trigger_keeps_the_newest_max_keep() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HotStore::in_memory());
    fill(&store, 0..73);
    let clock = Arc::new(ManualClock::new(t0()));
    let ex = TieredExporter::new(store.clone(), clock, settings(dir.path()));

    let report = ex.run_cycle().unwrap().expect("length trigger fires");
    assert_eq!(
        report.reason,
        TriggerReason::Length {
            len: 73,
            threshold: 50
        }
    );
    assert_eq!(report.exported, 63);
    assert_eq!(store.length(), 10);

    let file = report.file.unwrap();
    assert!(file.file_name.starts_with("data_20250602_093000_63"));
    assert_eq!(timestamps(&dir.path().join(&file.file_name)), (0..63).collect::<Vec<_>>());
    let left: Vec<_> = store
        .peek_oldest(10)
        .unwrap()
        .iter()
        .map(|r| r.payload["timestamp"].clone())
        .collect();
    assert_eq!(left.first(), Some(&Scalar::Int(63)));
    assert_eq!(left.last(), Some(&Scalar::Int(72)));

    let manifest = Manifest::load(dir.path());
    assert_eq!(manifest.get(&file.file_name).unwrap().record_count, 63);
}

#[test]
fn time_trigger_without_excess_only_resets_the_clock() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HotStore::in_memory());
    fill(&store, 0..5);
    let clock = Arc::new(ManualClock::new(t0()));
    let ex = TieredExporter::new(store.clone(), clock.clone(), settings(dir.path()));

    assert!(ex.run_cycle().unwrap().is_none());

    clock.advance(ChronoDuration::minutes(30));
    let report = ex.run_cycle().unwrap().expect("time trigger fires");
    assert!(matches!(report.reason, TriggerReason::Time { elapsed_secs: 1800 }));
    assert_eq!(report.exported, 0);
    assert!(report.file.is_none());
    assert_eq!(store.length(), 5);
    assert_eq!(ex.last_export_at(), t0() + ChronoDuration::minutes(30));

    // Clock was reset: nothing fires right after.
    clock.advance(ChronoDuration::minutes(1));
    assert!(ex.run_cycle().unwrap().is_none());
    assert!(list_warm_files(dir.path(), &Manifest::load(dir.path()))
        .unwrap()
        .is_empty());
}

#[test]
fn memory_trigger_fires_below_length_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HotStore::in_memory());
    fill(&store, 0..20);
    let clock = Arc::new(ManualClock::new(t0()));
    let ex = TieredExporter::new(
        store.clone(),
        clock,
        ExportSettings {
            memory_threshold_bytes: 1024,
            ..settings(dir.path())
        },
    );

    let report = ex.run_cycle().unwrap().expect("memory trigger fires");
    assert!(matches!(report.reason, TriggerReason::Memory { threshold: 1024, .. }));
    assert_eq!(report.exported, 10);
    assert_eq!(store.length(), 10);
}

#[test]
fn failed_write_keeps_records_and_the_clock() {
    let root = tempfile::tempdir().unwrap();
    // A regular file where the export dir should be.
    let blocked = root.path().join("exports");
    std::fs::write(&blocked, b"not a directory").unwrap();

    let store = Arc::new(HotStore::in_memory());
    fill(&store, 0..60);
    let clock = Arc::new(ManualClock::new(t0()));
    let ex = TieredExporter::new(store.clone(), clock.clone(), settings(&blocked));

    clock.advance(ChronoDuration::minutes(5));
    assert!(ex.run_cycle().is_err());
    assert_eq!(store.length(), 60);
    assert_eq!(ex.last_export_at(), t0());
    assert!(ex.last_report().is_none());

    // Fix the path; the next cycle retries and succeeds.
    std::fs::remove_file(&blocked).unwrap();
    let report = ex.run_cycle().unwrap().expect("retry fires");
    assert_eq!(report.exported, 50);
    assert_eq!(store.length(), 10);
    assert_eq!(ex.last_export_at(), t0() + ChronoDuration::minutes(5));
}

#[test]
fn crash_between_write_and_pop_duplicates_but_never_loses() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HotStore::in_memory());
    fill(&store, 0..60);
    let clock = Arc::new(ManualClock::new(t0()));
    let ex = TieredExporter::new(store.clone(), clock.clone(), settings(dir.path()));

    // Durable file written, process "dies" before the pop.
    let orphan = ex.write_oldest(50, t0()).unwrap();
    assert_eq!(store.length(), 60);

    clock.advance(ChronoDuration::seconds(1));
    let report = ex.run_cycle().unwrap().unwrap();
    let second = report.file.unwrap();
    assert_ne!(orphan.file_name, second.file_name);

    let a = read_warm_file(&dir.path().join(&orphan.file_name)).unwrap();
    let b = read_warm_file(&dir.path().join(&second.file_name)).unwrap();
    let keys_a: HashSet<_> = a.iter().map(|e| e.merge_key.clone()).collect();
    let keys_b: HashSet<_> = b.iter().map(|e| e.merge_key.clone()).collect();
    assert_eq!(keys_a, keys_b, "duplicates share merge keys");

    // Every record is either still hot or in a warm file.
    let mut seen: HashSet<String> = keys_a;
    seen.extend(store.peek_oldest(100).unwrap().iter().map(|r| r.merge_key()));
    let all: HashSet<String> = (0..60).map(|i| rec(i).merge_key()).collect();
    assert_eq!(seen, all);
}

#[test]
fn csv_export_has_union_of_payload_columns() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HotStore::in_memory());
    fill(&store, 0..55);
    // One record with an extra key late in the drain range.
    let mut odd = rec(100);
    odd.payload.insert("flair".into(), Scalar::from("DD"));
    store.append(odd).unwrap();
    fill(&store, 55..65);

    let clock = Arc::new(ManualClock::new(t0()));
    let ex = TieredExporter::new(
        store.clone(),
        clock,
        ExportSettings {
            format: WarmFormat::Csv,
            ..settings(dir.path())
        },
    );
    let report = ex.run_cycle().unwrap().unwrap();
    let file = report.file.unwrap();
    assert!(file.file_name.ends_with(".csv"));
    assert_eq!(report.exported, 56);

    let body = std::fs::read_to_string(dir.path().join(&file.file_name)).unwrap();
    let header = body.lines().next().unwrap();
    assert_eq!(
        header,
        "merge_key,source,fetched_at,flair,score,timestamp,title,url"
    );
    assert_eq!(body.lines().count(), 57);
    assert_eq!(read_warm_file(&dir.path().join(&file.file_name)).unwrap().len(), 56);
}

#[test]
fn retention_runs_after_export_and_archives_old_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(HotStore::in_memory());
    fill(&store, 0..60);
    let clock = Arc::new(ManualClock::new(t0()));
    let ex = TieredExporter::new(store.clone(), clock.clone(), settings(dir.path()));

    let first = ex.run_cycle().unwrap().unwrap().file.unwrap();
    let sweep = ex.last_report().unwrap().sweep.unwrap();
    assert_eq!(sweep.archived, 0);

    // Eight days on, the time trigger fires and the sweep picks up the old file.
    clock.advance(ChronoDuration::days(8));
    let report = ex.run_cycle().unwrap().unwrap();
    assert!(report.file.is_none());
    let sweep = report.sweep.unwrap();
    assert_eq!(sweep.archived, 1);
    assert_eq!(sweep.failed, 0);

    assert!(!dir.path().join(&first.file_name).exists());
    let archived = archive_dir(dir.path()).join(format!("{}.gz", first.file_name));
    assert!(archived.exists());
    assert_eq!(timestamps(&archived), (0..50).collect::<Vec<_>>());
    assert!(Manifest::load(dir.path()).get(&first.file_name).is_none());

    let inv = ex.inventory().unwrap();
    assert_eq!(inv.total_files, 0);
}
