//! SQLite-backed enrollment store and attendance ledger.
//!
//! # Schema
//!
//! - `embedding_sets(identity, finalized, created_at)`
//! - `embeddings(identity, seq, vector, sealed, model_version)`: vectors are
//!   little-endian `f32` bytes, optionally sealed with [`Seal`].
//! - `attendance_events(event_id, identity, direction, timestamp_ns, camera_id)`:
//!   append-only, enforced by triggers.

use crate::seal::{Seal, SealError};
use attend_core::{
    AttendanceEvent, AttendanceLedger, Direction, EmbeddingSet, Embedding, EnrollError,
    EventFilter, Gallery, IdentityId, LedgerError, PeriodWindow,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS embedding_sets (
    identity TEXT PRIMARY KEY,
    finalized INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS embeddings (
    identity TEXT NOT NULL REFERENCES embedding_sets(identity),
    seq INTEGER NOT NULL,
    vector BLOB NOT NULL,
    sealed INTEGER NOT NULL,
    model_version TEXT,
    PRIMARY KEY (identity, seq)
);
CREATE TABLE IF NOT EXISTS attendance_events (
    event_id TEXT PRIMARY KEY,
    identity TEXT NOT NULL,
    direction TEXT NOT NULL CHECK (direction IN ('in', 'out')),
    timestamp_ns INTEGER NOT NULL,
    camera_id TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attendance_identity_ts
    ON attendance_events(identity, timestamp_ns);
CREATE TRIGGER IF NOT EXISTS attendance_events_no_update
    BEFORE UPDATE ON attendance_events
    BEGIN SELECT RAISE(ABORT, 'attendance_events is append-only'); END;
CREATE TRIGGER IF NOT EXISTS attendance_events_no_delete
    BEFORE DELETE ON attendance_events
    BEGIN SELECT RAISE(ABORT, 'attendance_events is append-only'); END;
";

const EVENT_COLUMNS: &str = "event_id, identity, direction, timestamp_ns, camera_id";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("seal: {0}")]
    Seal(#[from] SealError),
    #[error("enrollment: {0}")]
    Enroll(#[from] EnrollError),
    #[error("identity {0} has sealed embeddings but no key is configured")]
    MissingKey(String),
    #[error("corrupt embedding for {identity}: {reason}")]
    Corrupt { identity: String, reason: String },
}

/// Durable store for embedding sets and attendance events.
pub struct SqliteStore {
    conn: Connection,
    seal: Option<Seal>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path, seal: Option<Seal>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "database opened");
        Self::init(conn, seal)
    }

    pub fn open_in_memory(seal: Option<Seal>) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, seal)
    }

    fn init(conn: Connection, seal: Option<Seal>) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, seal })
    }

    pub fn is_sealed(&self) -> bool {
        self.seal.is_some()
    }

    /// Persist one enrollment sample. Returns its sequence number.
    pub fn insert_sample(
        &mut self,
        identity: &IdentityId,
        embedding: &Embedding,
    ) -> Result<usize, StoreError> {
        let bytes: Vec<u8> = embedding
            .values
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let (blob, sealed) = match &self.seal {
            Some(seal) => (seal.seal(&bytes)?, true),
            None => (bytes, false),
        };

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT OR IGNORE INTO embedding_sets (identity, finalized, created_at)
             VALUES (?1, 0, ?2)",
            params![identity.as_str(), Utc::now().to_rfc3339()],
        )?;
        let seq: i64 = tx.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE identity = ?1",
            params![identity.as_str()],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO embeddings (identity, seq, vector, sealed, model_version)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![identity.as_str(), seq, blob, sealed, embedding.model_version],
        )?;
        tx.commit()?;

        Ok(seq as usize)
    }

    pub fn mark_finalized(&mut self, identity: &IdentityId) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE embedding_sets SET finalized = 1 WHERE identity = ?1",
            params![identity.as_str()],
        )?;
        if updated == 0 {
            return Err(EnrollError::UnknownIdentity(identity.clone()).into());
        }
        Ok(())
    }

    /// Read every stored embedding set, embeddings in insertion order.
    pub fn load_sets(&self) -> Result<Vec<EmbeddingSet>, StoreError> {
        let mut sets_stmt = self
            .conn
            .prepare("SELECT identity, finalized FROM embedding_sets ORDER BY identity")?;
        let headers: Vec<(String, bool)> = sets_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;

        let mut emb_stmt = self.conn.prepare(
            "SELECT vector, sealed, model_version FROM embeddings
             WHERE identity = ?1 ORDER BY seq",
        )?;

        let mut sets = Vec::with_capacity(headers.len());
        for (identity, finalized) in headers {
            let rows: Vec<(Vec<u8>, bool, Option<String>)> = emb_stmt
                .query_map(params![identity], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<_, _>>()?;

            let mut embeddings = Vec::with_capacity(rows.len());
            for (blob, sealed, model_version) in rows {
                let bytes = match (sealed, &self.seal) {
                    (false, _) => blob,
                    (true, Some(seal)) => seal.open(&blob)?,
                    (true, None) => return Err(StoreError::MissingKey(identity)),
                };
                embeddings.push(Embedding {
                    values: decode_vector(&identity, &bytes)?,
                    model_version,
                });
            }
            sets.push(EmbeddingSet::from_parts(IdentityId::new(identity), embeddings, finalized));
        }
        Ok(sets)
    }

    /// Rebuild the in-memory gallery from stored sets.
    pub fn load_gallery(
        &self,
        min_samples: usize,
        dimension: Option<usize>,
    ) -> Result<Gallery, StoreError> {
        let mut gallery = Gallery::new(min_samples, dimension);
        for set in self.load_sets()? {
            gallery.restore(set)?;
        }
        Ok(gallery)
    }

    pub fn event_count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM attendance_events", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn query_events(
        &self,
        sql_tail: &str,
        identity: Option<&str>,
        direction: Option<Direction>,
        window: Option<&PeriodWindow>,
    ) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM attendance_events
             WHERE (?1 IS NULL OR identity = ?1)
               AND (?2 IS NULL OR direction = ?2)
               AND (?3 IS NULL OR timestamp_ns >= ?3)
               AND (?4 IS NULL OR timestamp_ns < ?4)
             {sql_tail}"
        );
        let start = window.and_then(|w| w.start).map(to_nanos);
        let end = window.and_then(|w| w.end).map(to_nanos);

        let read = |e: rusqlite::Error| LedgerError::ReadFailure(e.to_string());
        let mut stmt = self.conn.prepare(&sql).map_err(read)?;
        let rows: Vec<RawEvent> = stmt
            .query_map(
                params![identity, direction.map(|d| d.as_str()), start, end],
                |row| {
                    Ok(RawEvent {
                        event_id: row.get(0)?,
                        identity: row.get(1)?,
                        direction: row.get(2)?,
                        timestamp_ns: row.get(3)?,
                        camera_id: row.get(4)?,
                    })
                },
            )
            .map_err(read)?
            .collect::<Result<_, _>>()
            .map_err(read)?;

        rows.into_iter().map(RawEvent::into_event).collect()
    }
}

impl AttendanceLedger for SqliteStore {
    fn append(&mut self, event: AttendanceEvent) -> Result<(), LedgerError> {
        let write = |e: rusqlite::Error| LedgerError::WriteFailure(e.to_string());

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(write)?;

        let latest: Option<i64> = tx
            .query_row(
                "SELECT timestamp_ns FROM attendance_events WHERE identity = ?1
                 ORDER BY timestamp_ns DESC, rowid DESC LIMIT 1",
                params![event.identity.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(write)?;

        let ts = to_nanos(event.timestamp);
        if let Some(latest) = latest {
            if ts < latest {
                return Err(LedgerError::OutOfOrder {
                    identity: event.identity,
                    timestamp: event.timestamp,
                    latest: from_nanos(latest),
                });
            }
        }

        let inserted = tx.execute(
            "INSERT INTO attendance_events (event_id, identity, direction, timestamp_ns, camera_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.event_id.to_string(),
                event.identity.as_str(),
                event.direction.as_str(),
                ts,
                event.camera_id,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(LedgerError::DuplicateEventId(event.event_id));
            }
            Err(e) => return Err(write(e)),
        }

        tx.commit().map_err(write)?;
        tracing::debug!(event_id = %event.event_id, "event persisted");
        Ok(())
    }

    fn query_last_event(
        &self,
        identity: &IdentityId,
        window: &PeriodWindow,
    ) -> Result<Option<AttendanceEvent>, LedgerError> {
        Ok(self
            .query_events(
                "ORDER BY timestamp_ns DESC, rowid DESC LIMIT 1",
                Some(identity.as_str()),
                None,
                Some(window),
            )?
            .pop())
    }

    fn query_last_in_direction(
        &self,
        identity: &IdentityId,
        direction: Direction,
        window: &PeriodWindow,
    ) -> Result<Option<AttendanceEvent>, LedgerError> {
        Ok(self
            .query_events(
                "ORDER BY timestamp_ns DESC, rowid DESC LIMIT 1",
                Some(identity.as_str()),
                Some(direction),
                Some(window),
            )?
            .pop())
    }

    fn events(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, LedgerError> {
        self.query_events(
            "ORDER BY timestamp_ns, rowid",
            filter.identity.as_ref().map(IdentityId::as_str),
            None,
            filter.window.as_ref(),
        )
    }
}

struct RawEvent {
    event_id: String,
    identity: String,
    direction: String,
    timestamp_ns: i64,
    camera_id: String,
}

impl RawEvent {
    fn into_event(self) -> Result<AttendanceEvent, LedgerError> {
        let event_id = Uuid::parse_str(&self.event_id)
            .map_err(|e| LedgerError::ReadFailure(format!("bad event id {}: {e}", self.event_id)))?;
        let direction: Direction = self.direction.parse().map_err(LedgerError::ReadFailure)?;
        Ok(AttendanceEvent {
            event_id,
            identity: IdentityId::new(self.identity),
            timestamp: from_nanos(self.timestamp_ns),
            direction,
            camera_id: self.camera_id,
        })
    }
}

fn to_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp_micros().saturating_mul(1_000))
}

fn from_nanos(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}

fn decode_vector(identity: &str, bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(StoreError::Corrupt {
            identity: identity.to_string(),
            reason: format!("vector blob of {} bytes", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
