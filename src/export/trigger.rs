// src/export/trigger.rs
// Export triggers: length, memory, time. Independent OR; first match wins.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub queue_threshold: usize,
    pub memory_threshold_bytes: u64,
    pub time_interval: ChronoDuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TriggerReason {
    Length { len: usize, threshold: usize },
    Memory { bytes: u64, threshold: u64 },
    Time { elapsed_secs: i64 },
}

impl TriggerReason {
    pub fn label(&self) -> &'static str {
        match self {
            TriggerReason::Length { .. } => "length",
            TriggerReason::Memory { .. } => "memory",
            TriggerReason::Time { .. } => "time",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::Length { len, threshold } => write!(f, "length {len} > {threshold}"),
            TriggerReason::Memory { bytes, threshold } => {
                write!(f, "memory {bytes}B > {threshold}B")
            }
            TriggerReason::Time { elapsed_secs } => write!(f, "time {elapsed_secs}s since last export"),
        }
    }
}

/// First trigger that fires, checked length → memory → time.
///
/// A clock that reads earlier than `last_export_at` never fires the time
/// trigger.
pub fn evaluate(
    th: &Thresholds,
    len: usize,
    bytes: u64,
    last_export_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<TriggerReason> {
    if len > th.queue_threshold {
        return Some(TriggerReason::Length {
            len,
            threshold: th.queue_threshold,
        });
    }
    if bytes > th.memory_threshold_bytes {
        return Some(TriggerReason::Memory {
            bytes,
            threshold: th.memory_threshold_bytes,
        });
    }
    let elapsed = now - last_export_at;
    if elapsed >= th.time_interval {
        return Some(TriggerReason::Time {
            elapsed_secs: elapsed.num_seconds(),
        });
    }
    None
}

/// Records to drain: everything beyond `max_keep`.
pub fn export_count(len: usize, max_keep: usize) -> usize {
    len.saturating_sub(max_keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn th() -> Thresholds {
        Thresholds {
            queue_threshold: 50,
            memory_threshold_bytes: 10_000,
            time_interval: ChronoDuration::minutes(30),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn nothing_fires_inside_envelope() {
        assert_eq!(evaluate(&th(), 50, 10_000, t0(), t0()), None);
    }

    #[test]
    fn length_wins_over_memory() {
        let r = evaluate(&th(), 73, 20_000, t0(), t0()).unwrap();
        assert_eq!(r.label(), "length");
    }

    #[test]
    fn memory_alone_fires() {
        let r = evaluate(&th(), 5, 10_001, t0(), t0()).unwrap();
        assert_eq!(
            r,
            TriggerReason::Memory {
                bytes: 10_001,
                threshold: 10_000
            }
        );
    }

    #[test]
    fn time_fires_at_exact_interval() {
        let now = t0() + ChronoDuration::minutes(30);
        assert_eq!(
            evaluate(&th(), 0, 0, t0(), now),
            Some(TriggerReason::Time { elapsed_secs: 1800 })
        );
        assert_eq!(evaluate(&th(), 0, 0, t0(), now - ChronoDuration::seconds(1)), None);
    }

    #[test]
    fn backward_clock_does_not_fire_time() {
        let now = t0() - ChronoDuration::hours(5);
        assert_eq!(evaluate(&th(), 0, 0, t0(), now), None);
    }

    #[test]
    fn export_count_keeps_max_keep() {
        assert_eq!(export_count(73, 10), 63);
        assert_eq!(export_count(7, 10), 0);
    }
}
