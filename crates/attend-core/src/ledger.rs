//! Append-only attendance ledger.

use crate::period::PeriodWindow;
use crate::types::{AttendanceEvent, Direction, IdentityId};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("ledger write failed: {0}")]
    WriteFailure(String),
    #[error("ledger read failed: {0}")]
    ReadFailure(String),
    #[error("event for {identity} at {timestamp} precedes latest event at {latest}")]
    OutOfOrder {
        identity: IdentityId,
        timestamp: DateTime<Utc>,
        latest: DateTime<Utc>,
    },
    #[error("event {0} already recorded")]
    DuplicateEventId(Uuid),
}

/// Read filter for the reporting surface.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub identity: Option<IdentityId>,
    pub window: Option<PeriodWindow>,
}

impl EventFilter {
    pub fn matches(&self, event: &AttendanceEvent) -> bool {
        self.identity.as_ref().map_or(true, |id| *id == event.identity)
            && self.window.map_or(true, |w| w.contains(event.timestamp))
    }
}

/// Ordered, append-only store of attendance events.
///
/// `append` is the only mutator. It must be atomic: on error the ledger is
/// unchanged, and on success the event is durable. Implementations reject
/// duplicate event IDs and events older than the identity's latest entry.
pub trait AttendanceLedger {
    fn append(&mut self, event: AttendanceEvent) -> Result<(), LedgerError>;

    /// Most recent event for `identity` inside `window`.
    fn query_last_event(
        &self,
        identity: &IdentityId,
        window: &PeriodWindow,
    ) -> Result<Option<AttendanceEvent>, LedgerError>;

    /// Most recent event for `identity` with the given direction inside `window`.
    fn query_last_in_direction(
        &self,
        identity: &IdentityId,
        direction: Direction,
        window: &PeriodWindow,
    ) -> Result<Option<AttendanceEvent>, LedgerError>;

    /// Events matching `filter`, oldest first.
    fn events(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, LedgerError>;
}

/// In-process ledger. Durable only for the lifetime of the value.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    events: Vec<AttendanceEvent>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn as_slice(&self) -> &[AttendanceEvent] {
        &self.events
    }
}

impl AttendanceLedger for MemoryLedger {
    fn append(&mut self, event: AttendanceEvent) -> Result<(), LedgerError> {
        if self.events.iter().any(|e| e.event_id == event.event_id) {
            return Err(LedgerError::DuplicateEventId(event.event_id));
        }
        if let Some(latest) = self
            .events
            .iter()
            .rev()
            .find(|e| e.identity == event.identity)
        {
            if event.timestamp < latest.timestamp {
                return Err(LedgerError::OutOfOrder {
                    identity: event.identity,
                    timestamp: event.timestamp,
                    latest: latest.timestamp,
                });
            }
        }
        self.events.push(event);
        Ok(())
    }

    fn query_last_event(
        &self,
        identity: &IdentityId,
        window: &PeriodWindow,
    ) -> Result<Option<AttendanceEvent>, LedgerError> {
        Ok(self
            .events
            .iter()
            .rev()
            .find(|e| e.identity == *identity && window.contains(e.timestamp))
            .cloned())
    }

    fn query_last_in_direction(
        &self,
        identity: &IdentityId,
        direction: Direction,
        window: &PeriodWindow,
    ) -> Result<Option<AttendanceEvent>, LedgerError> {
        Ok(self
            .events
            .iter()
            .rev()
            .find(|e| {
                e.identity == *identity && e.direction == direction && window.contains(e.timestamp)
            })
            .cloned())
    }

    fn events(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let mut out: Vec<_> = self.events.iter().filter(|e| filter.matches(e)).cloned().collect();
        out.sort_by_key(|e| e.timestamp);
        Ok(out)
    }
}
