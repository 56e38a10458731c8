//! # Quota Ledger
//! Per-source usage accounting against an external allowance that resets
//! on calendar boundaries (hourly, daily, monthly; UTC).
//!
//! `QuotaLedger` is pure state + arithmetic; every operation takes `now`
//! explicitly so it can be tested without touching the system clock.
//! `LedgerHandle` wraps it for sharing between workers and adds best-effort
//! JSON persistence so usage survives restarts.
//!
//! Policy:
//! - `check` first rolls the period over if `now` has crossed into a new one,
//!   then allows iff `consumed + units_per_fetch <= capacity`.
//! - `debit` records what an attempt really consumed, even past capacity; the
//!   overage stays visible and blocks the next `check`.
//! - If `now` is earlier than `last_reset_at` (clock skew) nothing resets.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::record::SourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    Hourly,
    #[default]
    Daily,
    Monthly,
}

impl QuotaPeriod {
    /// Start of the calendar period containing `t`.
    pub fn start_of(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let day = t.date_naive();
        match self {
            QuotaPeriod::Hourly => day
                .and_hms_opt(t.hour(), 0, 0)
                .map(|n| n.and_utc())
                .unwrap_or(t),
            QuotaPeriod::Daily => day
                .and_hms_opt(0, 0, 0)
                .map(|n| n.and_utc())
                .unwrap_or(t),
            QuotaPeriod::Monthly => NaiveDate::from_ymd_opt(day.year(), day.month(), 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|n| n.and_utc())
                .unwrap_or(t),
        }
    }

    /// Start of the period following the one that begins at `start`.
    pub fn next_start(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.start_of(start);
        match self {
            QuotaPeriod::Hourly => start + ChronoDuration::hours(1),
            QuotaPeriod::Daily => start + ChronoDuration::days(1),
            QuotaPeriod::Monthly => {
                let (y, m) = if start.month() == 12 {
                    (start.year() + 1, 1)
                } else {
                    (start.year(), start.month() + 1)
                };
                NaiveDate::from_ymd_opt(y, m, 1)
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|n| n.and_utc())
                    .unwrap_or(start + ChronoDuration::days(31))
            }
        }
    }
}

/// Static quota declaration for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSpec {
    /// `None` means unbounded.
    pub capacity: Option<u64>,
    pub period: QuotaPeriod,
    /// Units one invocation is expected to cost; used to reject attempts
    /// that would overrun the allowance before they run.
    pub units_per_fetch: u64,
}

impl QuotaSpec {
    pub fn unbounded() -> Self {
        Self {
            capacity: None,
            period: QuotaPeriod::Daily,
            units_per_fetch: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    pub capacity: Option<u64>,
    pub period: QuotaPeriod,
    pub units_per_fetch: u64,
    pub consumed_units: u64,
    pub last_reset_at: DateTime<Utc>,
}

impl QuotaState {
    fn new(spec: QuotaSpec, now: DateTime<Utc>) -> Self {
        Self {
            capacity: spec.capacity,
            period: spec.period,
            units_per_fetch: spec.units_per_fetch.max(1),
            consumed_units: 0,
            last_reset_at: spec.period.start_of(now),
        }
    }

    /// Roll over if `now` lies in a later period than `last_reset_at`.
    /// Returns true when a reset happened.
    fn roll_over(&mut self, now: DateTime<Utc>) -> bool {
        if now < self.last_reset_at {
            return false;
        }
        let current = self.period.start_of(now);
        if current > self.last_reset_at && now >= self.period.next_start(self.last_reset_at) {
            self.consumed_units = 0;
            self.last_reset_at = current;
            return true;
        }
        false
    }

    pub fn remaining(&self) -> Option<u64> {
        self.capacity
            .map(|cap| cap.saturating_sub(self.consumed_units))
    }

    /// Units consumed beyond capacity (attempts already made cannot be undone).
    pub fn overage(&self) -> u64 {
        self.capacity
            .map(|cap| self.consumed_units.saturating_sub(cap))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// `None` for unbounded sources.
    pub remaining: Option<u64>,
    /// Whether this check rolled the period over.
    pub reset: bool,
}

#[derive(Debug, Default, Clone)]
pub struct QuotaLedger {
    states: HashMap<SourceKind, QuotaState>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare (or re-declare) the quota for `source`. Existing usage is kept
    /// when the source was already registered.
    pub fn register(&mut self, source: SourceKind, spec: QuotaSpec, now: DateTime<Utc>) {
        match self.states.get_mut(&source) {
            Some(st) => {
                st.capacity = spec.capacity;
                st.units_per_fetch = spec.units_per_fetch.max(1);
                if st.period != spec.period {
                    st.period = spec.period;
                    st.last_reset_at = spec.period.start_of(st.last_reset_at);
                }
            }
            None => {
                self.states.insert(source, QuotaState::new(spec, now));
            }
        }
    }

    pub fn check(&mut self, source: SourceKind, now: DateTime<Utc>) -> QuotaDecision {
        let Some(st) = self.states.get_mut(&source) else {
            return QuotaDecision {
                allowed: true,
                remaining: None,
                reset: false,
            };
        };
        let reset = st.roll_over(now);
        let allowed = match st.capacity {
            None => true,
            Some(cap) => st.consumed_units.saturating_add(st.units_per_fetch) <= cap,
        };
        QuotaDecision {
            allowed,
            remaining: st.remaining(),
            reset,
        }
    }

    /// Add `units` to the consumed counter. Never decreases; never errors.
    pub fn debit(&mut self, source: SourceKind, units: u64) -> Option<u64> {
        let st = self.states.get_mut(&source)?;
        st.consumed_units = st.consumed_units.saturating_add(units);
        Some(st.consumed_units)
    }

    pub fn state(&self, source: SourceKind) -> Option<&QuotaState> {
        self.states.get(&source)
    }

    pub fn sources(&self) -> impl Iterator<Item = (&SourceKind, &QuotaState)> {
        self.states.iter()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut entries: Vec<SnapshotEntry> = self
            .states
            .iter()
            .map(|(k, st)| SnapshotEntry {
                source: *k,
                consumed_units: st.consumed_units,
                last_reset_at: st.last_reset_at,
            })
            .collect();
        entries.sort_by_key(|e| e.source);
        LedgerSnapshot { entries }
    }

    /// Restore usage for already-registered sources. Capacity and period stay
    /// as declared; unknown sources in the snapshot are ignored.
    pub fn restore(&mut self, snap: &LedgerSnapshot) {
        for e in &snap.entries {
            if let Some(st) = self.states.get_mut(&e.source) {
                st.consumed_units = e.consumed_units;
                st.last_reset_at = st.period.start_of(e.last_reset_at);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub entries: Vec<SnapshotEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub source: SourceKind,
    pub consumed_units: u64,
    pub last_reset_at: DateTime<Utc>,
}

// ------------------------------------------------------------
// Shared handle + persistence
// ------------------------------------------------------------

/// Thread-safe ledger shared by all source workers.
#[derive(Debug)]
pub struct LedgerHandle {
    inner: Mutex<QuotaLedger>,
    snapshot_path: Option<PathBuf>,
}

impl LedgerHandle {
    pub fn new(ledger: QuotaLedger) -> Self {
        Self {
            inner: Mutex::new(ledger),
            snapshot_path: None,
        }
    }

    /// Persist after every mutation to `path`; restores usage from it if present.
    pub fn with_snapshot(mut ledger: QuotaLedger, path: PathBuf) -> Self {
        match load_snapshot(&path) {
            Ok(Some(snap)) => {
                ledger.restore(&snap);
                info!(path = %path.display(), entries = snap.entries.len(), "quota ledger restored");
            }
            Ok(None) => {}
            Err(e) => warn!(error = ?e, path = %path.display(), "quota snapshot unreadable; starting fresh"),
        }
        Self {
            inner: Mutex::new(ledger),
            snapshot_path: Some(path),
        }
    }

    pub fn check(&self, source: SourceKind, now: DateTime<Utc>) -> QuotaDecision {
        let mut g = self.inner.lock().expect("quota ledger mutex poisoned");
        let decision = g.check(source, now);
        if decision.reset {
            info!(target: "pipeline", %source, "quota period rolled over");
            self.persist(&g);
        }
        if let Some(rem) = decision.remaining {
            gauge!("ingest_quota_remaining", "source" => source.as_str()).set(rem as f64);
        }
        decision
    }

    pub fn debit(&self, source: SourceKind, units: u64) -> Option<u64> {
        let mut g = self.inner.lock().expect("quota ledger mutex poisoned");
        let consumed = g.debit(source, units);
        if consumed.is_some() && units > 0 {
            self.persist(&g);
        }
        if let Some(rem) = g.state(source).and_then(QuotaState::remaining) {
            gauge!("ingest_quota_remaining", "source" => source.as_str()).set(rem as f64);
        }
        consumed
    }

    pub fn state(&self, source: SourceKind) -> Option<QuotaState> {
        let g = self.inner.lock().expect("quota ledger mutex poisoned");
        g.state(source).cloned()
    }

    /// All registered sources, sorted by name.
    pub fn states(&self) -> Vec<(SourceKind, QuotaState)> {
        let g = self.inner.lock().expect("quota ledger mutex poisoned");
        let mut v: Vec<_> = g.sources().map(|(k, s)| (*k, s.clone())).collect();
        v.sort_by_key(|(k, _)| *k);
        v
    }

    /// Write the snapshot now (used on shutdown).
    pub fn flush(&self) -> io::Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let g = self.inner.lock().expect("quota ledger mutex poisoned");
        save_snapshot(path, &g.snapshot())
    }

    fn persist(&self, ledger: &QuotaLedger) {
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = save_snapshot(path, &ledger.snapshot()) {
                warn!(error = ?e, path = %path.display(), "failed to persist quota snapshot");
            }
        }
    }
}

pub fn load_snapshot(path: &Path) -> io::Result<Option<LedgerSnapshot>> {
    let s = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let snap: LedgerSnapshot =
        serde_json::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(snap))
}

pub fn save_snapshot(path: &Path, snap: &LedgerSnapshot) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    let s = serde_json::to_string_pretty(snap)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut f = fs::File::create(&tmp)?;
    f.write_all(s.as_bytes())?;
    f.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}
