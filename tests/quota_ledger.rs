// tests/quota_ledger.rs
//
// Ledger behaviour across whole periods: the monthly 100/3 scenario,
// idempotent resets, the overage bound and restart persistence.

use chrono::{Duration, TimeZone, Utc};
use feed_ingest::quota::{LedgerHandle, QuotaLedger, QuotaPeriod, QuotaSpec};
use feed_ingest::SourceKind;

fn monthly(capacity: u64, units: u64) -> QuotaSpec {
    QuotaSpec {
        capacity: Some(capacity),
        period: QuotaPeriod::Monthly,
        units_per_fetch: units,
    }
}

#[test]
fn capacity_100_at_3_units_allows_33_then_blocks_until_rollover() {
    let t = Utc.with_ymd_and_hms(2025, 1, 5, 10, 0, 0).unwrap();
    let mut l = QuotaLedger::new();
    l.register(SourceKind::NewsApi, monthly(100, 3), t);

    let mut allowed = 0;
    for i in 0..40 {
        let now = t + Duration::hours(i);
        let d = l.check(SourceKind::NewsApi, now);
        if !d.allowed {
            break;
        }
        l.debit(SourceKind::NewsApi, 3);
        allowed += 1;
    }
    assert_eq!(allowed, 33);

    let st = l.state(SourceKind::NewsApi).unwrap();
    assert_eq!(st.consumed_units, 99);
    assert_eq!(st.remaining(), Some(1));

    // Still January: blocked.
    let late_jan = Utc.with_ymd_and_hms(2025, 1, 31, 23, 59, 59).unwrap();
    assert!(!l.check(SourceKind::NewsApi, late_jan).allowed);

    // February: fresh period.
    let feb = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
    let d = l.check(SourceKind::NewsApi, feb);
    assert!(d.allowed);
    assert!(d.reset);
    assert_eq!(l.state(SourceKind::NewsApi).unwrap().last_reset_at, feb);
}

#[test]
fn reset_is_idempotent_within_the_new_period() {
    let t = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
    let mut l = QuotaLedger::new();
    l.register(
        SourceKind::Twitter,
        QuotaSpec {
            capacity: Some(10),
            period: QuotaPeriod::Daily,
            units_per_fetch: 1,
        },
        t,
    );
    l.debit(SourceKind::Twitter, 10);
    assert!(!l.check(SourceKind::Twitter, t + Duration::hours(2)).allowed);

    let next_day = t + Duration::days(1) + Duration::minutes(5);
    let resets = (0..5)
        .map(|i| l.check(SourceKind::Twitter, next_day + Duration::minutes(i)))
        .filter(|d| d.reset)
        .count();
    assert_eq!(resets, 1);
    assert_eq!(l.state(SourceKind::Twitter).unwrap().consumed_units, 0);
}

#[test]
fn consumption_never_exceeds_capacity_by_more_than_one_attempt() {
    let t = Utc.with_ymd_and_hms(2025, 5, 1, 0, 0, 0).unwrap();
    // Attempts cost a varying number of real units.
    let costs = [1u64, 4, 2, 7, 1, 3, 5, 2, 6, 1, 1, 8, 2, 2, 9];
    let mut l = QuotaLedger::new();
    l.register(
        SourceKind::StockTwits,
        QuotaSpec {
            capacity: Some(20),
            period: QuotaPeriod::Hourly,
            units_per_fetch: 1,
        },
        t,
    );
    for c in costs {
        if l.check(SourceKind::StockTwits, t).allowed {
            l.debit(SourceKind::StockTwits, c);
        }
        let st = l.state(SourceKind::StockTwits).unwrap();
        assert!(st.consumed_units <= 20 + 9, "consumed {}", st.consumed_units);
    }
    let st = l.state(SourceKind::StockTwits).unwrap();
    assert!(st.consumed_units >= 20);
    assert!(!l.check(SourceKind::StockTwits, t).allowed);
}

#[test]
fn usage_survives_restart_through_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quota.json");
    let t = Utc.with_ymd_and_hms(2025, 8, 14, 12, 0, 0).unwrap();

    {
        let mut l = QuotaLedger::new();
        l.register(SourceKind::Reddit, monthly(50, 1), t);
        let h = LedgerHandle::with_snapshot(l, path.clone());
        for _ in 0..7 {
            assert!(h.check(SourceKind::Reddit, t).allowed);
            h.debit(SourceKind::Reddit, 1);
        }
    }

    let mut l = QuotaLedger::new();
    // Capacity changed in config: config wins, usage is restored.
    l.register(SourceKind::Reddit, monthly(8, 1), t);
    let h = LedgerHandle::with_snapshot(l, path);
    let st = h.state(SourceKind::Reddit).unwrap();
    assert_eq!(st.consumed_units, 7);
    assert_eq!(st.capacity, Some(8));
    assert!(h.check(SourceKind::Reddit, t).allowed);
    h.debit(SourceKind::Reddit, 1);
    assert!(!h.check(SourceKind::Reddit, t).allowed);
}

#[test]
fn unregistered_and_unbounded_sources_always_pass() {
    let t = Utc::now();
    let mut l = QuotaLedger::new();
    l.register(SourceKind::Rss, QuotaSpec::unbounded(), t);
    for _ in 0..1000 {
        l.debit(SourceKind::Rss, 5);
    }
    assert!(l.check(SourceKind::Rss, t).allowed);
    assert_eq!(l.check(SourceKind::Rss, t).remaining, None);
    assert!(l.check(SourceKind::AlphaVantage, t).allowed);
}
