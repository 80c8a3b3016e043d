//! Attendance report rows derived from ledger events.

use crate::period::PeriodPolicy;
use crate::types::{AttendanceEvent, Direction, IdentityId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttendanceStatus {
    /// Checked in, not (yet) out.
    Present,
    /// Last event of the period was OUT.
    Completed,
}

/// One identity's attendance within one period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRow {
    pub identity: IdentityId,
    /// `None` under a never-resetting policy.
    pub period_start: Option<DateTime<Utc>>,
    pub first_in: Option<DateTime<Utc>>,
    pub last_out: Option<DateTime<Utc>>,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    /// Distinct identities with at least one event.
    pub total_identities: usize,
    /// Identities with at least one event in the period containing `now`.
    pub attended_current_period: usize,
    /// Identities currently inside.
    pub present_now: usize,
}

/// Fold events into per-identity, per-period rows, newest period first.
pub fn attendance_rows(events: &[AttendanceEvent], policy: &PeriodPolicy) -> Vec<AttendanceRow> {
    let mut rows: BTreeMap<(Option<DateTime<Utc>>, IdentityId), AttendanceRow> = BTreeMap::new();

    let mut ordered: Vec<&AttendanceEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.timestamp);

    for event in ordered {
        let period_start = policy.window_for(event.timestamp).start;
        let row = rows
            .entry((period_start, event.identity.clone()))
            .or_insert_with(|| AttendanceRow {
                identity: event.identity.clone(),
                period_start,
                first_in: None,
                last_out: None,
                status: AttendanceStatus::Present,
            });
        match event.direction {
            Direction::In => {
                row.first_in.get_or_insert(event.timestamp);
                row.status = AttendanceStatus::Present;
            }
            Direction::Out => {
                row.last_out = Some(event.timestamp);
                row.status = AttendanceStatus::Completed;
            }
        }
    }

    let mut out: Vec<AttendanceRow> = rows.into_values().collect();
    out.sort_by(|a, b| {
        b.period_start
            .cmp(&a.period_start)
            .then_with(|| a.identity.cmp(&b.identity))
    });
    out
}

pub fn summary(events: &[AttendanceEvent], policy: &PeriodPolicy, now: DateTime<Utc>) -> ReportSummary {
    let window = policy.window_for(now);
    let total: BTreeSet<&IdentityId> = events.iter().map(|e| &e.identity).collect();

    let mut latest: BTreeMap<&IdentityId, &AttendanceEvent> = BTreeMap::new();
    for e in events.iter().filter(|e| window.contains(e.timestamp) && e.timestamp <= now) {
        match latest.get(&e.identity) {
            Some(prev) if prev.timestamp > e.timestamp => {}
            _ => {
                latest.insert(&e.identity, e);
            }
        }
    }

    ReportSummary {
        total_identities: total.len(),
        attended_current_period: latest.len(),
        present_now: latest.values().filter(|e| e.direction == Direction::In).count(),
    }
}
