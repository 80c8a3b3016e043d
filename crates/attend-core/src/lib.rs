//! attend-core — Identity matching and attendance state machine.
//!
//! Resolves externally extracted face embeddings to enrolled identities
//! (open-set, ambiguity-rejecting) and decides whether each observation
//! becomes an IN/OUT event on an append-only ledger.

pub mod checkpoint;
pub mod confirm;
pub mod enrollment;
pub mod ledger;
pub mod matcher;
pub mod period;
pub mod report;
pub mod state_machine;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointError, Observation, Outcome, Verdict};
pub use confirm::ConfirmationConfig;
pub use enrollment::{EmbeddingSet, EnrollError, EnrollmentSummary, Gallery};
pub use ledger::{AttendanceLedger, EventFilter, LedgerError, MemoryLedger};
pub use matcher::{Aggregation, MatchError, Matcher, NearestIdentityMatcher};
pub use period::{PeriodKind, PeriodPolicy, PeriodWindow};
pub use state_machine::{
    AttendanceRequest, AttendanceStateMachine, Decision, DuplicateReason, StateMachineConfig,
};
pub use types::{
    AttendanceEvent, Direction, DistanceMetric, Embedding, IdentityId, MatchResult, PresenceState,
};
