//! Per-observation pipeline: match → confirm → state machine.

use crate::confirm::{Confirmation, ConfirmationConfig, ConfirmationTracker};
use crate::enrollment::Gallery;
use crate::ledger::{AttendanceLedger, LedgerError};
use crate::matcher::{MatchError, Matcher, NearestIdentityMatcher};
use crate::state_machine::{AttendanceRequest, AttendanceStateMachine, Decision};
use crate::types::{Direction, Embedding, MatchResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckpointError {
    #[error("embedding has {actual} dimensions, gallery expects {expected}")]
    InvalidEmbeddingDimension { expected: usize, actual: usize },
    #[error("embedding contains a non-finite value")]
    NonFiniteEmbedding,
    #[error("attendance not recorded: {0}")]
    LedgerWriteFailure(#[from] LedgerError),
}

impl From<MatchError> for CheckpointError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::InvalidEmbeddingDimension { expected, actual } => {
                CheckpointError::InvalidEmbeddingDimension { expected, actual }
            }
            MatchError::NonFiniteEmbedding => CheckpointError::NonFiniteEmbedding,
        }
    }
}

/// One detected face from the capture/extraction collaborator.
#[derive(Debug, Clone)]
pub struct Observation {
    pub embedding: Embedding,
    pub timestamp: DateTime<Utc>,
    pub camera_id: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    /// Matched, but not yet seen enough consecutive times.
    Pending { seen: u32, required: u32 },
    Decided(Decision),
}

/// What the UI collaborator is told about one observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    #[serde(rename = "match")]
    pub match_result: MatchResult,
    pub verdict: Verdict,
}

impl Outcome {
    pub fn decision(&self) -> Option<&Decision> {
        match &self.verdict {
            Verdict::Decided(d) => Some(d),
            Verdict::Pending { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CheckpointConfig {
    /// Largest accepted distance.
    pub threshold: f32,
    pub confirmation: ConfirmationConfig,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            threshold: 0.55,
            confirmation: ConfirmationConfig::default(),
        }
    }
}

pub struct Checkpoint<L, M = NearestIdentityMatcher> {
    matcher: M,
    threshold: f32,
    tracker: ConfirmationTracker,
    machine: AttendanceStateMachine<L>,
}

impl<L: AttendanceLedger, M: Matcher> Checkpoint<L, M> {
    pub fn new(matcher: M, machine: AttendanceStateMachine<L>, config: CheckpointConfig) -> Self {
        Self {
            matcher,
            threshold: config.threshold,
            tracker: ConfirmationTracker::new(config.confirmation),
            machine,
        }
    }

    pub fn machine(&self) -> &AttendanceStateMachine<L> {
        &self.machine
    }

    pub fn matcher(&self) -> &M {
        &self.matcher
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Resolve and evaluate one observation.
    ///
    /// A malformed embedding is fatal to this observation only. A ledger
    /// failure means the observation was neither recorded nor dropped;
    /// the confirmation streak is kept, so the caller can retry or alert.
    pub fn observe(
        &mut self,
        gallery: &Gallery,
        observation: Observation,
    ) -> Result<Outcome, CheckpointError> {
        let match_result = self
            .matcher
            .compare(&observation.embedding, gallery, self.threshold)
            .map_err(|e| {
                tracing::warn!(camera = %observation.camera_id, error = %e, "observation discarded");
                CheckpointError::from(e)
            })?;

        self.tracker.prune(observation.timestamp);

        if let Some(identity) = &match_result.identity {
            let confirmation =
                self.tracker
                    .sighting(&observation.camera_id, identity, observation.timestamp);
            if let Confirmation::Pending { seen, required } = confirmation {
                tracing::debug!(identity = %identity, seen, required, "awaiting confirmation");
                return Ok(Outcome {
                    match_result,
                    verdict: Verdict::Pending { seen, required },
                });
            }
        }

        let request = AttendanceRequest {
            identity: match_result.identity.clone(),
            direction: observation.direction,
            timestamp: observation.timestamp,
            camera_id: observation.camera_id.clone(),
        };
        let decision = self.machine.evaluate(request).map_err(|e| {
            tracing::error!(error = %e, "ledger append failed");
            CheckpointError::from(e)
        })?;
        if let Some(identity) = &match_result.identity {
            self.tracker.release(&observation.camera_id, identity);
        }

        Ok(Outcome {
            match_result,
            verdict: Verdict::Decided(decision),
        })
    }

    /// Evaluate every face of one frame as an independent observation.
    ///
    /// An unrecognised face on a single-face frame breaks the camera's
    /// confirmation streaks, since it is most likely the same person.
    pub fn observe_frame(
        &mut self,
        gallery: &Gallery,
        observations: Vec<Observation>,
    ) -> Vec<Result<Outcome, CheckpointError>> {
        let single_face = observations.len() == 1;
        observations
            .into_iter()
            .map(|obs| {
                let camera_id = obs.camera_id.clone();
                let result = self.observe(gallery, obs);
                if single_face
                    && matches!(&result, Ok(o) if o.match_result.identity.is_none())
                {
                    self.tracker.reset_camera(&camera_id);
                }
                result
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{EventFilter, MemoryLedger};
    use crate::period::PeriodWindow;
    use crate::state_machine::{DuplicateReason, StateMachineConfig};
    use crate::types::{AttendanceEvent, IdentityId, PresenceState};
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    /// Identity "alice" clustered around v = (0, 0, 0, 0) and "bob" around (1, 1, 1, 1).
    fn gallery() -> Gallery {
        let mut g = Gallery::new(5, Some(4));
        for (id, base) in [("alice", 0.0f32), ("bob", 1.0f32)] {
            let id = IdentityId::from(id);
            for i in 0..5 {
                let jitter = i as f32 * 0.001;
                g.add(&id, Embedding::new(vec![base + jitter, base, base, base])).unwrap();
            }
            g.finalize(&id).unwrap();
        }
        g
    }

    fn checkpoint(required: u32) -> Checkpoint<MemoryLedger> {
        Checkpoint::new(
            NearestIdentityMatcher::default(),
            AttendanceStateMachine::new(MemoryLedger::new(), StateMachineConfig::default()),
            CheckpointConfig {
                threshold: 0.4,
                confirmation: ConfirmationConfig { required, max_gap: Duration::seconds(2) },
            },
        )
    }

    fn obs(x: f32, direction: Direction, secs: i64) -> Observation {
        Observation {
            embedding: Embedding::new(vec![x, 0.0, 0.0, 0.0]),
            timestamp: t(secs),
            camera_id: "door".into(),
            direction,
        }
    }

    #[test]
    fn test_attendance_scenario() {
        let g = gallery();
        let mut cp = checkpoint(1);

        // Distance 0.1 from alice's cluster, threshold 0.4.
        let out = cp.observe(&g, obs(0.1, Direction::In, 0)).unwrap();
        assert_eq!(out.match_result.identity, Some("alice".into()));
        assert!(matches!(
            out.decision(),
            Some(Decision::Accepted { state: PresenceState::Inside, .. })
        ));

        let out = cp.observe(&g, obs(0.1, Direction::In, 2)).unwrap();
        assert!(matches!(out.decision(), Some(Decision::Duplicate { .. })));
        assert_eq!(cp.machine().ledger().len(), 1);

        let out = cp.observe(&g, obs(0.1, Direction::In, 120)).unwrap();
        assert!(matches!(
            out.decision(),
            Some(Decision::Duplicate { reason: DuplicateReason::AlreadyInside, .. })
        ));

        let out = cp.observe(&g, obs(0.1, Direction::Out, 121)).unwrap();
        assert!(matches!(
            out.decision(),
            Some(Decision::Accepted { state: PresenceState::Outside, .. })
        ));
        assert_eq!(cp.machine().ledger().len(), 2);
    }

    #[test]
    fn test_far_observation_is_unidentified() {
        let g = gallery();
        let mut cp = checkpoint(1);
        let out = cp.observe(&g, obs(-0.9, Direction::In, 0)).unwrap();
        assert!(!out.match_result.accepted);
        assert_eq!(out.decision(), Some(&Decision::Unidentified));
        assert!(cp.machine().ledger().is_empty());
    }

    #[test]
    fn test_confirmation_before_decision() {
        let g = gallery();
        let mut cp = checkpoint(3);
        let first = cp.observe(&g, obs(0.05, Direction::In, 0)).unwrap();
        assert_eq!(first.verdict, Verdict::Pending { seen: 1, required: 3 });
        cp.observe(&g, obs(0.05, Direction::In, 1)).unwrap();
        let third = cp.observe(&g, obs(0.05, Direction::In, 2)).unwrap();
        assert!(third.decision().is_some_and(Decision::is_accepted));
    }

    /// Fails the first append, then behaves like a memory ledger.
    struct FlakyLedger {
        inner: MemoryLedger,
        failures_left: u32,
    }

    impl AttendanceLedger for FlakyLedger {
        fn append(&mut self, event: AttendanceEvent) -> Result<(), LedgerError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(LedgerError::WriteFailure("disk full".into()));
            }
            self.inner.append(event)
        }

        fn query_last_event(
            &self,
            identity: &IdentityId,
            window: &PeriodWindow,
        ) -> Result<Option<AttendanceEvent>, LedgerError> {
            self.inner.query_last_event(identity, window)
        }

        fn query_last_in_direction(
            &self,
            identity: &IdentityId,
            direction: Direction,
            window: &PeriodWindow,
        ) -> Result<Option<AttendanceEvent>, LedgerError> {
            self.inner.query_last_in_direction(identity, direction, window)
        }

        fn events(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, LedgerError> {
            self.inner.events(filter)
        }
    }

    #[test]
    fn test_failed_append_keeps_confirmation() {
        let g = gallery();
        let mut cp = Checkpoint::new(
            NearestIdentityMatcher::default(),
            AttendanceStateMachine::new(
                FlakyLedger { inner: MemoryLedger::new(), failures_left: 1 },
                StateMachineConfig::default(),
            ),
            CheckpointConfig {
                threshold: 0.4,
                confirmation: ConfirmationConfig { required: 3, max_gap: Duration::seconds(2) },
            },
        );
        cp.observe(&g, obs(0.05, Direction::In, 0)).unwrap();
        cp.observe(&g, obs(0.05, Direction::In, 1)).unwrap();
        assert!(matches!(
            cp.observe(&g, obs(0.05, Direction::In, 2)),
            Err(CheckpointError::LedgerWriteFailure(_))
        ));

        let retry = cp.observe(&g, obs(0.05, Direction::In, 2)).unwrap();
        assert!(retry.decision().is_some_and(Decision::is_accepted));

        // Released after the decision.
        let next = cp.observe(&g, obs(0.05, Direction::In, 3)).unwrap();
        assert_eq!(next.verdict, Verdict::Pending { seen: 1, required: 3 });
    }

    #[test]
    fn test_non_finite_embedding_is_local() {
        let g = gallery();
        let mut cp = checkpoint(1);
        let mut bad = obs(0.0, Direction::In, 0);
        bad.embedding = Embedding::new(vec![f32::NAN, 0.0, 0.0, 0.0]);
        assert_eq!(cp.observe(&g, bad).unwrap_err(), CheckpointError::NonFiniteEmbedding);
        assert!(cp.observe(&g, obs(0.0, Direction::In, 1)).unwrap().decision().is_some());
    }

    #[test]
    fn test_unknown_single_face_breaks_streak() {
        let g = gallery();
        let mut cp = checkpoint(2);
        cp.observe_frame(&g, vec![obs(0.05, Direction::In, 0)]);
        cp.observe_frame(&g, vec![obs(-0.9, Direction::In, 1)]);
        let out = cp.observe_frame(&g, vec![obs(0.05, Direction::In, 2)]);
        assert_eq!(
            out[0].as_ref().unwrap().verdict,
            Verdict::Pending { seen: 1, required: 2 }
        );
    }

    #[test]
    fn test_multiple_faces_are_independent() {
        let g = gallery();
        let mut cp = checkpoint(1);
        let mut bob = obs(0.0, Direction::In, 0);
        bob.embedding = Embedding::new(vec![1.05, 1.0, 1.0, 1.0]);
        let results = cp.observe_frame(&g, vec![obs(0.05, Direction::In, 0), bob, obs(5.0, Direction::In, 0)]);

        assert_eq!(results.len(), 3);
        assert!(results[0].as_ref().unwrap().decision().unwrap().is_accepted());
        assert!(results[1].as_ref().unwrap().decision().unwrap().is_accepted());
        assert_eq!(results[2].as_ref().unwrap().decision(), Some(&Decision::Unidentified));
        assert_eq!(cp.machine().ledger().len(), 2);
    }

    #[test]
    fn test_dimension_mismatch_is_local() {
        let g = gallery();
        let mut cp = checkpoint(1);
        let mut bad = obs(0.0, Direction::In, 0);
        bad.embedding = Embedding::new(vec![0.0; 3]);
        assert_eq!(
            cp.observe(&g, bad).unwrap_err(),
            CheckpointError::InvalidEmbeddingDimension { expected: 4, actual: 3 }
        );
        // Capture continues.
        assert!(cp.observe(&g, obs(0.0, Direction::In, 1)).unwrap().decision().is_some());
    }
}
