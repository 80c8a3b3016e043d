//! Attendance state machine — decides whether an identified observation
//! becomes a ledger event.
//!
//! Per identity and per attendance period the state is `Outside` (initial)
//! or `Inside`. Only `Outside + In` and `Inside + Out` append; everything
//! else is reported as a non-fatal [`Decision`]. The machine owns its ledger,
//! so it is the only component able to append to it.

use crate::ledger::{AttendanceLedger, LedgerError};
use crate::period::{PeriodPolicy, PeriodWindow};
use crate::types::{AttendanceEvent, Direction, IdentityId, PresenceState};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Default suppression window for repeated same-direction events.
pub const DEFAULT_COOLDOWN_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Same-direction events for one identity closer than this are duplicates.
    pub cooldown: Duration,
    pub period: PeriodPolicy,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::seconds(DEFAULT_COOLDOWN_SECS),
            period: PeriodPolicy::default(),
        }
    }
}

/// One observation after matching, with its explicit context.
#[derive(Debug, Clone)]
pub struct AttendanceRequest {
    /// `None` when the matcher rejected the observation.
    pub identity: Option<IdentityId>,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub camera_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DuplicateReason {
    /// IN requested while already inside.
    AlreadyInside,
    /// OUT requested without a preceding IN in this period.
    NotInside,
    /// Same direction already accepted within the cooldown window.
    Cooldown { since: DateTime<Utc> },
    /// An event with the same identity, direction and timestamp is already
    /// in the ledger.
    AlreadyRecorded { event_id: Uuid },
}

/// Outcome of evaluating one observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Decision {
    Accepted { event: AttendanceEvent, state: PresenceState },
    /// DuplicateAttendanceEvent: nothing appended.
    Duplicate {
        #[serde(flatten)]
        reason: DuplicateReason,
        state: PresenceState,
    },
    /// UnidentifiedObservation: nothing appended.
    Unidentified,
    /// Observation older than the identity's latest ledger entry.
    OutOfOrder { latest: DateTime<Utc> },
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accepted { .. })
    }
}

pub struct AttendanceStateMachine<L> {
    ledger: L,
    config: StateMachineConfig,
}

impl<L: AttendanceLedger> AttendanceStateMachine<L> {
    pub fn new(ledger: L, config: StateMachineConfig) -> Self {
        Self { ledger, config }
    }

    /// Read-only access to the ledger.
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    pub fn into_ledger(self) -> L {
        self.ledger
    }

    /// Presence of `identity` in the period containing `at`.
    pub fn presence(
        &self,
        identity: &IdentityId,
        at: DateTime<Utc>,
    ) -> Result<PresenceState, LedgerError> {
        let window = self.config.period.window_for(at);
        let last = self.ledger.query_last_event(identity, &window)?;
        Ok(PresenceState::from_last(last.as_ref()))
    }

    /// Evaluate one observation and append to the ledger when it is a valid
    /// transition. Only ledger failures are errors; a failed append leaves
    /// the ledger and derived state unchanged.
    pub fn evaluate(&mut self, request: AttendanceRequest) -> Result<Decision, LedgerError> {
        let Some(identity) = request.identity else {
            tracing::debug!(camera = %request.camera_id, "unidentified observation");
            return Ok(Decision::Unidentified);
        };
        let ts = request.timestamp;

        if let Some(latest) = self
            .ledger
            .query_last_event(&identity, &PeriodWindow::UNBOUNDED)?
        {
            if ts < latest.timestamp {
                tracing::warn!(
                    identity = %identity,
                    timestamp = %ts,
                    latest = %latest.timestamp,
                    "observation older than latest event"
                );
                return Ok(Decision::OutOfOrder { latest: latest.timestamp });
            }
        }

        let state = self.presence(&identity, ts)?;
        let conflict = match (state, request.direction) {
            (PresenceState::Inside, Direction::In) => Some(DuplicateReason::AlreadyInside),
            (PresenceState::Outside, Direction::Out) => Some(DuplicateReason::NotInside),
            _ => None,
        };
        if let Some(reason) = conflict {
            tracing::debug!(identity = %identity, direction = %request.direction, ?reason, "duplicate");
            return Ok(Decision::Duplicate { reason, state });
        }

        if self.config.cooldown > Duration::zero() {
            let cooldown = PeriodWindow {
                start: Some(ts - self.config.cooldown),
                end: None,
            };
            if let Some(prev) =
                self.ledger
                    .query_last_in_direction(&identity, request.direction, &cooldown)?
            {
                if ts - prev.timestamp < self.config.cooldown {
                    tracing::debug!(identity = %identity, since = %prev.timestamp, "within cooldown");
                    return Ok(Decision::Duplicate {
                        reason: DuplicateReason::Cooldown { since: prev.timestamp },
                        state,
                    });
                }
            }
        }

        let event = AttendanceEvent::new(identity, request.direction, ts, request.camera_id);
        match self.ledger.append(event.clone()) {
            Ok(()) => {}
            Err(LedgerError::DuplicateEventId(event_id)) => {
                tracing::debug!(identity = %event.identity, %event_id, "event already recorded");
                return Ok(Decision::Duplicate {
                    reason: DuplicateReason::AlreadyRecorded { event_id },
                    state,
                });
            }
            Err(e) => return Err(e),
        }

        let state = match event.direction {
            Direction::In => PresenceState::Inside,
            Direction::Out => PresenceState::Outside,
        };
        tracing::info!(
            identity = %event.identity,
            direction = %event.direction,
            camera = %event.camera_id,
            event_id = %event.event_id,
            "attendance recorded"
        );
        Ok(Decision::Accepted { event, state })
    }
}
