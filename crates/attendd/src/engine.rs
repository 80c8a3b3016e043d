use crate::config::Config;
use crate::inbox::{Closed, Inbox, Item};
use attend_core::report::{self, AttendanceRow, ReportSummary};
use attend_core::{
    AttendanceLedger, AttendanceStateMachine, Checkpoint, CheckpointError, DistanceMetric,
    Embedding, EnrollError, EnrollmentSummary, EventFilter, Gallery, IdentityId, LedgerError,
    NearestIdentityMatcher, Observation, Outcome, PeriodPolicy, PeriodWindow,
};
use attend_store::{SqliteStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("enrollment error: {0}")]
    Enroll(#[from] EnrollError),
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("observation dropped: engine queue full")]
    ObservationDropped,
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<Closed> for EngineError {
    fn from(_: Closed) -> Self {
        EngineError::ChannelClosed
    }
}

/// Per-face result of an observed frame.
pub type FaceResult = Result<Outcome, CheckpointError>;

#[derive(Debug, Clone, Default)]
pub struct ReportQuery {
    pub identity: Option<IdentityId>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub rows: Vec<AttendanceRow>,
    pub summary: ReportSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub version: &'static str,
    pub identities: usize,
    pub finalized: usize,
    pub events: usize,
    pub dimension: Option<usize>,
    pub threshold: f32,
    pub metric: DistanceMetric,
    pub period: PeriodPolicy,
    pub frames_queued: usize,
    pub frames_dropped: u64,
    pub sealed: bool,
}

/// Requests that must never be dropped.
enum EngineRequest {
    Enroll {
        identity: IdentityId,
        embeddings: Vec<Embedding>,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    Finalize {
        identity: IdentityId,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Report {
        query: ReportQuery,
        reply: oneshot::Sender<Result<Report, EngineError>>,
    },
    ListIdentities {
        reply: oneshot::Sender<Vec<EnrollmentSummary>>,
    },
    Status {
        reply: oneshot::Sender<Result<Status, EngineError>>,
    },
}

/// All faces detected in one captured frame.
struct PendingFrame {
    observations: Vec<Observation>,
    reply: oneshot::Sender<Result<Vec<FaceResult>, EngineError>>,
}

type EngineInbox = Inbox<EngineRequest, PendingFrame>;

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    inbox: Arc<EngineInbox>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inbox.push_control(build(reply_tx))?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Add enrollment samples. Returns the identity's total sample count.
    pub async fn enroll(
        &self,
        identity: IdentityId,
        embeddings: Vec<Embedding>,
    ) -> Result<usize, EngineError> {
        self.call(|reply| EngineRequest::Enroll {
            identity,
            embeddings,
            reply,
        })
        .await?
    }

    /// Make an identity matchable. `false` if it already was.
    pub async fn finalize(&self, identity: IdentityId) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::Finalize { identity, reply })
            .await?
    }

    pub async fn report(&self, query: ReportQuery) -> Result<Report, EngineError> {
        self.call(|reply| EngineRequest::Report { query, reply }).await?
    }

    pub async fn list_identities(&self) -> Result<Vec<EnrollmentSummary>, EngineError> {
        self.call(|reply| EngineRequest::ListIdentities { reply })
            .await
    }

    pub async fn status(&self) -> Result<Status, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await?
    }

    /// Queue a frame without waiting for its result.
    ///
    /// If the queue is full the oldest waiting frame is evicted and its
    /// caller receives `ObservationDropped`.
    fn submit_frame(
        &self,
        observations: Vec<Observation>,
    ) -> Result<oneshot::Receiver<Result<Vec<FaceResult>, EngineError>>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let frame = PendingFrame {
            observations,
            reply: reply_tx,
        };
        if let Some(evicted) = self.inbox.push_frame(frame)? {
            tracing::warn!(
                faces = evicted.observations.len(),
                dropped_total = self.inbox.dropped(),
                "engine queue full; dropping oldest frame"
            );
            let _ = evicted.reply.send(Err(EngineError::ObservationDropped));
        }
        Ok(reply_rx)
    }

    /// Evaluate every face of one frame.
    pub async fn observe_frame(
        &self,
        observations: Vec<Observation>,
    ) -> Result<Vec<FaceResult>, EngineError> {
        let rx = self.submit_frame(observations)?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop accepting work, drain what is queued, and wait for the thread.
    pub async fn shutdown(&self) {
        self.inbox.close();
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                tracing::error!("engine thread panicked");
            }
        }
    }
}

/// State owned by the engine thread.
struct Engine {
    gallery: Gallery,
    store: SqliteStore,
    checkpoint: Checkpoint<SqliteStore, NearestIdentityMatcher>,
    inbox: Arc<EngineInbox>,
}

/// Spawn the engine on a dedicated OS thread.
///
/// `store` holds enrollment data; `ledger` is handed to the state machine,
/// which becomes the only writer of attendance events. Both may point at the
/// same database file. The gallery is loaded before the thread starts so a
/// corrupt or unreadable store fails startup.
pub fn spawn_engine(
    config: &Config,
    store: SqliteStore,
    ledger: SqliteStore,
) -> Result<EngineHandle, EngineError> {
    let gallery = store.load_gallery(config.min_enrollment_samples, config.embedding_dim)?;
    tracing::info!(
        identities = gallery.summaries().len(),
        finalized = gallery.finalized().count(),
        dimension = ?gallery.dimension(),
        "gallery loaded"
    );

    let machine = AttendanceStateMachine::new(ledger, config.state_machine());
    let checkpoint = Checkpoint::new(config.matcher(), machine, config.checkpoint());
    let inbox = Arc::new(EngineInbox::new(config.queue_capacity));

    let mut engine = Engine {
        gallery,
        store,
        checkpoint,
        inbox: Arc::clone(&inbox),
    };

    let queue = Arc::clone(&inbox);
    let thread = std::thread::Builder::new()
        .name("attend-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(item) = queue.next() {
                match item {
                    Item::Control(req) => engine.handle(req),
                    Item::Frame(frame) => {
                        let results = engine
                            .checkpoint
                            .observe_frame(&engine.gallery, frame.observations);
                        let _ = frame.reply.send(Ok(results));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        inbox,
        thread: Arc::new(Mutex::new(Some(thread))),
    })
}

impl Engine {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Enroll {
                identity,
                embeddings,
                reply,
            } => {
                let _ = reply.send(self.run_enroll(&identity, embeddings));
            }
            EngineRequest::Finalize { identity, reply } => {
                let _ = reply.send(self.run_finalize(&identity));
            }
            EngineRequest::Report { query, reply } => {
                let _ = reply.send(self.run_report(query));
            }
            EngineRequest::ListIdentities { reply } => {
                let _ = reply.send(self.gallery.summaries());
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.run_status());
            }
        }
    }

    /// Validate the whole batch, then persist each sample before adding it.
    fn run_enroll(
        &mut self,
        identity: &IdentityId,
        embeddings: Vec<Embedding>,
    ) -> Result<usize, EngineError> {
        let batch_dim = embeddings.first().map(Embedding::dim);
        for embedding in &embeddings {
            self.gallery.check_add(identity, embedding)?;
            if let Some(expected) = batch_dim.filter(|d| *d != embedding.dim()) {
                return Err(EnrollError::InvalidEmbeddingDimension {
                    expected,
                    actual: embedding.dim(),
                }
                .into());
            }
        }

        let added = embeddings.len();
        for embedding in embeddings {
            self.store.insert_sample(identity, &embedding)?;
            self.gallery.add(identity, embedding)?;
        }

        let total = self.gallery.get(identity).map_or(0, |s| s.len());
        tracing::info!(identity = %identity, added, total, "enrollment samples stored");
        Ok(total)
    }

    fn run_finalize(&mut self, identity: &IdentityId) -> Result<bool, EngineError> {
        if self.gallery.check_finalize(identity)? {
            tracing::debug!(identity = %identity, "already finalized");
            return Ok(false);
        }
        self.store.mark_finalized(identity)?;
        self.gallery.finalize(identity)?;
        Ok(true)
    }

    fn run_report(&self, query: ReportQuery) -> Result<Report, EngineError> {
        let window = match (query.from, query.to) {
            (None, None) => None,
            (start, end) => Some(PeriodWindow { start, end }),
        };
        let filter = EventFilter {
            identity: query.identity,
            window,
        };
        let machine = self.checkpoint.machine();
        let events = machine.ledger().events(&filter)?;
        let policy = &machine.config().period;

        Ok(Report {
            rows: report::attendance_rows(&events, policy),
            summary: report::summary(&events, policy, Utc::now()),
        })
    }

    fn run_status(&self) -> Result<Status, EngineError> {
        let machine = self.checkpoint.machine();
        Ok(Status {
            version: env!("CARGO_PKG_VERSION"),
            identities: self.gallery.summaries().len(),
            finalized: self.gallery.finalized().count(),
            events: machine.ledger().event_count()?,
            dimension: self.gallery.dimension(),
            threshold: self.checkpoint.threshold(),
            metric: self.checkpoint.matcher().metric,
            period: machine.config().period.clone(),
            frames_queued: self.inbox.frames_queued(),
            frames_dropped: self.inbox.dropped(),
            sealed: self.store.is_sealed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attend_core::{Decision, Direction, DuplicateReason, PresenceState, Verdict};
    use chrono::{Duration, TimeZone};

    fn test_config() -> Config {
        Config {
            min_enrollment_samples: 2,
            embedding_dim: Some(3),
            confirmations_required: 1,
            queue_capacity: 4,
            ..Config::default()
        }
    }

    fn spawn(config: &Config) -> EngineHandle {
        let store = SqliteStore::open_in_memory(None).unwrap();
        let ledger = SqliteStore::open_in_memory(None).unwrap();
        spawn_engine(config, store, ledger).unwrap()
    }

    fn emb(v: [f32; 3]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn obs(v: [f32; 3], direction: Direction, at: DateTime<Utc>) -> Observation {
        Observation {
            embedding: emb(v),
            timestamp: at,
            camera_id: "gate-1".into(),
            direction,
        }
    }

    async fn enrolled(config: &Config) -> EngineHandle {
        let engine = spawn(config);
        let alice = IdentityId::from("alice");
        let n = engine
            .enroll(alice.clone(), vec![emb([0.0, 0.0, 0.0]), emb([0.05, 0.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert!(engine.finalize(alice).await.unwrap());
        engine
    }

    fn decision(results: &[FaceResult]) -> &Decision {
        results[0].as_ref().unwrap().decision().unwrap()
    }

    #[tokio::test]
    async fn test_check_in_then_duplicate_then_out() {
        let engine = enrolled(&test_config()).await;

        let r = engine.observe_frame(vec![obs([0.1, 0.0, 0.0], Direction::In, t(0))]).await.unwrap();
        assert!(matches!(decision(&r), Decision::Accepted { state: PresenceState::Inside, .. }));

        let r = engine.observe_frame(vec![obs([0.1, 0.0, 0.0], Direction::In, t(2))]).await.unwrap();
        assert!(matches!(
            decision(&r),
            Decision::Duplicate { reason: DuplicateReason::AlreadyInside, .. }
        ));

        let r = engine.observe_frame(vec![obs([0.1, 0.0, 0.0], Direction::Out, t(90))]).await.unwrap();
        assert!(matches!(decision(&r), Decision::Accepted { state: PresenceState::Outside, .. }));

        let status = engine.status().await.unwrap();
        assert_eq!(status.events, 2);
        assert_eq!(status.finalized, 1);
        assert_eq!(status.dimension, Some(3));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stranger_is_unidentified() {
        let engine = enrolled(&test_config()).await;
        let r = engine.observe_frame(vec![obs([0.9, 0.9, 0.9], Direction::In, t(0))]).await.unwrap();
        assert_eq!(decision(&r), &Decision::Unidentified);
        assert_eq!(engine.status().await.unwrap().events, 0);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_per_face() {
        let engine = enrolled(&test_config()).await;
        let bad = Observation {
            embedding: Embedding::new(vec![0.0; 5]),
            ..obs([0.0; 3], Direction::In, t(0))
        };
        let r = engine
            .observe_frame(vec![bad, obs([0.0, 0.0, 0.0], Direction::In, t(0))])
            .await
            .unwrap();
        assert!(matches!(
            r[0],
            Err(CheckpointError::InvalidEmbeddingDimension { expected: 3, actual: 5 })
        ));
        assert!(r[1].as_ref().unwrap().decision().unwrap().is_accepted());
    }

    #[tokio::test]
    async fn test_pending_until_confirmed() {
        let config = Config {
            confirmations_required: 2,
            ..test_config()
        };
        let engine = enrolled(&config).await;
        let r = engine.observe_frame(vec![obs([0.0; 3], Direction::In, t(0))]).await.unwrap();
        assert!(matches!(
            r[0].as_ref().unwrap().verdict,
            Verdict::Pending { seen: 1, required: 2 }
        ));
        let r = engine.observe_frame(vec![obs([0.0; 3], Direction::In, t(1))]).await.unwrap();
        assert!(decision(&r).is_accepted());
    }

    #[tokio::test]
    async fn test_enroll_rejects_whole_batch_on_bad_dimension() {
        let engine = spawn(&test_config());
        let bob = IdentityId::from("bob");
        let err = engine
            .enroll(bob.clone(), vec![emb([0.0; 3]), Embedding::new(vec![0.0; 2])])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Enroll(EnrollError::InvalidEmbeddingDimension { expected: 3, actual: 2 })
        ));
        assert!(engine.list_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_rejects_non_finite_batch() {
        let engine = spawn(&test_config());
        let bob = IdentityId::from("bob");
        let err = engine
            .enroll(bob.clone(), vec![emb([0.0; 3]), Embedding::new(vec![f32::NAN, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Enroll(EnrollError::NonFiniteEmbedding)));
        assert!(engine.list_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_needs_enough_samples() {
        let engine = spawn(&test_config());
        let bob = IdentityId::from("bob");
        engine.enroll(bob.clone(), vec![emb([1.0; 3])]).await.unwrap();
        let err = engine.finalize(bob.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Enroll(EnrollError::InsufficientEnrollmentSamples { have: 1, need: 2, .. })
        ));

        engine.enroll(bob.clone(), vec![emb([1.0; 3])]).await.unwrap();
        assert!(engine.finalize(bob.clone()).await.unwrap());
        assert!(!engine.finalize(bob.clone()).await.unwrap());

        let list = engine.list_identities().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].samples, 2);
        assert!(list[0].finalized);
    }

    #[tokio::test]
    async fn test_report_filters_by_identity_and_window() {
        let engine = enrolled(&test_config()).await;
        engine.observe_frame(vec![obs([0.0; 3], Direction::In, t(0))]).await.unwrap();
        engine.observe_frame(vec![obs([0.0; 3], Direction::Out, t(3_600))]).await.unwrap();

        let all = engine.report(ReportQuery::default()).await.unwrap();
        assert_eq!(all.rows.len(), 1);
        assert_eq!(all.rows[0].first_in, Some(t(0)));
        assert_eq!(all.rows[0].last_out, Some(t(3_600)));
        assert_eq!(all.summary.total_identities, 1);

        let later = engine
            .report(ReportQuery {
                from: Some(t(7_200)),
                ..ReportQuery::default()
            })
            .await
            .unwrap();
        assert!(later.rows.is_empty());

        let other = engine
            .report(ReportQuery {
                identity: Some("bob".into()),
                ..ReportQuery::default()
            })
            .await
            .unwrap();
        assert!(other.rows.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_frame() {
        // No engine thread: frames stay queued.
        let handle = EngineHandle {
            inbox: Arc::new(EngineInbox::new(1)),
            thread: Arc::new(Mutex::new(None)),
        };
        let first = handle.submit_frame(vec![obs([0.0; 3], Direction::In, t(0))]).unwrap();
        let _second = handle.submit_frame(vec![obs([0.0; 3], Direction::In, t(1))]).unwrap();

        assert!(matches!(first.await, Ok(Err(EngineError::ObservationDropped))));
        assert_eq!(handle.inbox.dropped(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let engine = spawn(&test_config());
        engine.shutdown().await;
        assert!(matches!(
            engine.list_identities().await,
            Err(EngineError::ChannelClosed)
        ));
    }
}
