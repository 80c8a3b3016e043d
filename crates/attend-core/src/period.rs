//! Attendance period boundaries.
//!
//! Presence is tracked per period and resets to `Outside` at each boundary.
//! Boundaries are wall-clock times at a fixed UTC offset so that the same
//! timestamps always land in the same period regardless of host timezone.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Largest UTC offset magnitude a fixed offset can express.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 24 * 60 - 1;

/// Half-open time window `[start, end)`; `None` means unbounded on that side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl PeriodWindow {
    pub const UNBOUNDED: PeriodWindow = PeriodWindow { start: None, end: None };

    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| ts >= s) && self.end.map_or(true, |e| ts < e)
    }
}

/// Reset rule for the attendance period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PeriodKind {
    /// One period per day, starting at `reset_at` local time.
    Daily {
        #[serde(default = "midnight")]
        reset_at: NaiveTime,
    },
    /// Several periods per day, one starting at each listed local time.
    Shifts { starts: Vec<NaiveTime> },
    /// A single period spanning all time.
    Never,
}

fn midnight() -> NaiveTime {
    NaiveTime::MIN
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodPolicy {
    #[serde(flatten)]
    pub kind: PeriodKind,
    /// Offset of the local wall clock from UTC, in minutes.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for PeriodPolicy {
    fn default() -> Self {
        Self {
            kind: PeriodKind::Daily { reset_at: midnight() },
            utc_offset_minutes: 0,
        }
    }
}

impl PeriodPolicy {
    pub fn daily(reset_at: NaiveTime, utc_offset_minutes: i32) -> Self {
        Self {
            kind: PeriodKind::Daily { reset_at },
            utc_offset_minutes,
        }
    }

    pub fn never() -> Self {
        Self {
            kind: PeriodKind::Never,
            utc_offset_minutes: 0,
        }
    }

    /// Offset actually applied; out-of-range values are clamped.
    fn offset_minutes(&self) -> i32 {
        self.utc_offset_minutes
            .clamp(-MAX_UTC_OFFSET_MINUTES, MAX_UTC_OFFSET_MINUTES)
    }

    fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.offset_minutes() * 60).unwrap_or_else(|| Utc.fix())
    }

    /// Sorted, de-duplicated local boundary times; empty for `Never`.
    fn boundaries(&self) -> Vec<NaiveTime> {
        let mut times = match &self.kind {
            PeriodKind::Daily { reset_at } => vec![*reset_at],
            PeriodKind::Shifts { starts } if starts.is_empty() => vec![midnight()],
            PeriodKind::Shifts { starts } => starts.clone(),
            PeriodKind::Never => Vec::new(),
        };
        times.sort();
        times.dedup();
        times
    }

    fn at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time) - Duration::minutes(i64::from(self.offset_minutes()));
        Utc.from_utc_datetime(&naive)
    }

    /// The period containing `ts`.
    pub fn window_for(&self, ts: DateTime<Utc>) -> PeriodWindow {
        let boundaries = self.boundaries();
        let (Some(&first), Some(&last)) = (boundaries.first(), boundaries.last()) else {
            return PeriodWindow::UNBOUNDED;
        };

        let local = ts.with_timezone(&self.offset());
        let date = local.date_naive();
        let time = local.time();

        // Latest boundary at or before the local time, else yesterday's last one.
        let start = match boundaries.iter().rev().find(|&&b| b <= time) {
            Some(&b) => self.at(date, b),
            None => self.at(date - Duration::days(1), last),
        };
        // Earliest boundary after the local time, else tomorrow's first one.
        let end = match boundaries.iter().find(|&&b| b > time) {
            Some(&b) => self.at(date, b),
            None => self.at(date + Duration::days(1), first),
        };

        PeriodWindow::new(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_daily_midnight() {
        let p = PeriodPolicy::default();
        let w = p.window_for(utc(2026, 3, 2, 14, 30));
        assert_eq!(w, PeriodWindow::new(utc(2026, 3, 2, 0, 0), utc(2026, 3, 3, 0, 0)));
        assert!(w.contains(utc(2026, 3, 2, 0, 0)));
        assert!(!w.contains(utc(2026, 3, 3, 0, 0)));
    }

    #[test]
    fn test_daily_with_offset_and_early_reset() {
        // Local = UTC+2, reset at 04:00 local = 02:00 UTC.
        let p = PeriodPolicy::daily(hm(4, 0), 120);
        let before = p.window_for(utc(2026, 3, 2, 1, 0)); // 03:00 local
        assert_eq!(
            before,
            PeriodWindow::new(utc(2026, 3, 1, 2, 0), utc(2026, 3, 2, 2, 0))
        );
        let after = p.window_for(utc(2026, 3, 2, 2, 0));
        assert_eq!(after.start, Some(utc(2026, 3, 2, 2, 0)));
    }

    #[test]
    fn test_shifts() {
        let p = PeriodPolicy {
            kind: PeriodKind::Shifts { starts: vec![hm(14, 0), hm(6, 0), hm(22, 0)] },
            utc_offset_minutes: 0,
        };
        assert_eq!(
            p.window_for(utc(2026, 3, 2, 10, 0)),
            PeriodWindow::new(utc(2026, 3, 2, 6, 0), utc(2026, 3, 2, 14, 0))
        );
        assert_eq!(
            p.window_for(utc(2026, 3, 2, 3, 0)),
            PeriodWindow::new(utc(2026, 3, 1, 22, 0), utc(2026, 3, 2, 6, 0))
        );
        assert_eq!(
            p.window_for(utc(2026, 3, 2, 23, 0)),
            PeriodWindow::new(utc(2026, 3, 2, 22, 0), utc(2026, 3, 3, 6, 0))
        );
    }

    #[test]
    fn test_window_always_contains_timestamp() {
        let shifts = PeriodKind::Shifts { starts: vec![hm(6, 0), hm(14, 0), hm(22, 0)] };
        let daily = PeriodKind::Daily { reset_at: hm(4, 30) };
        for kind in [daily, shifts] {
            for offset in [0, 90, -300, 1439, -1439, 1500, -2000, i32::MAX, i32::MIN] {
                let p = PeriodPolicy { kind: kind.clone(), utc_offset_minutes: offset };
                for hour in [0, 5, 12, 23] {
                    let ts = utc(2026, 3, 2, hour, 15);
                    let w = p.window_for(ts);
                    assert!(w.contains(ts), "offset {offset} hour {hour}: {w:?}");
                }
            }
        }
    }

    #[test]
    fn test_never_is_unbounded() {
        let w = PeriodPolicy::never().window_for(utc(2026, 3, 2, 10, 0));
        assert_eq!(w, PeriodWindow::UNBOUNDED);
        assert!(w.contains(utc(1999, 1, 1, 0, 0)));
    }

    #[test]
    fn test_policy_from_toml() {
        let p: PeriodPolicy = toml::from_str(
            "kind = \"daily\"\nreset_at = \"05:30:00\"\nutc_offset_minutes = -300\n",
        )
        .unwrap();
        assert_eq!(p, PeriodPolicy::daily(hm(5, 30), -300));

        let p: PeriodPolicy = toml::from_str("kind = \"never\"\n").unwrap();
        assert_eq!(p.kind, PeriodKind::Never);
    }
}
