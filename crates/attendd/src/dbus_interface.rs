use crate::engine::{EngineError, EngineHandle, FaceResult, ReportQuery};
use attend_core::{Direction, Embedding, IdentityId, Observation};
use chrono::{DateTime, Utc};
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.Attend1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Attend1";

/// D-Bus interface for the attendance daemon.
///
/// Embeddings travel as `aad` (one `f64` array per face) and are narrowed to
/// `f32`. Timestamps are Unix milliseconds; `0` means "now" for observations
/// and "unbounded" for report windows.
pub struct AttendService {
    engine: EngineHandle,
}

impl AttendService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.freedesktop.Attend1")]
impl AttendService {
    /// Add enrollment samples for an identity. Returns its total sample count.
    async fn enroll(&self, identity: &str, embeddings: Vec<Vec<f64>>) -> zbus::fdo::Result<u32> {
        let identity = parse_identity(identity)?;
        tracing::info!(identity = %identity, samples = embeddings.len(), "enroll requested");
        let total = self
            .engine
            .enroll(identity, to_embeddings(embeddings))
            .await
            .map_err(to_fdo)?;
        Ok(u32::try_from(total).unwrap_or(u32::MAX))
    }

    /// Make an identity matchable. `false` if it was already finalized.
    async fn finalize(&self, identity: &str) -> zbus::fdo::Result<bool> {
        let identity = parse_identity(identity)?;
        tracing::info!(identity = %identity, "finalize requested");
        self.engine.finalize(identity).await.map_err(to_fdo)
    }

    /// Evaluate the faces of one captured frame.
    ///
    /// Returns a JSON array with one entry per face, in input order: the
    /// match and verdict, or `{"error": ...}` for a face that was discarded.
    async fn observe(
        &self,
        camera_id: &str,
        direction: &str,
        timestamp_ms: i64,
        embeddings: Vec<Vec<f64>>,
    ) -> zbus::fdo::Result<String> {
        let direction: Direction = direction
            .parse()
            .map_err(|e: String| zbus::fdo::Error::InvalidArgs(e))?;
        let timestamp = if timestamp_ms <= 0 {
            Utc::now()
        } else {
            from_millis(timestamp_ms)?
        };

        let observations = to_embeddings(embeddings)
            .into_iter()
            .map(|embedding| Observation {
                embedding,
                timestamp,
                camera_id: camera_id.to_string(),
                direction,
            })
            .collect();

        let results = self
            .engine
            .observe_frame(observations)
            .await
            .map_err(to_fdo)?;
        Ok(serde_json::Value::Array(results.iter().map(face_json).collect()).to_string())
    }

    /// Attendance rows and summary. Empty `identity` means everyone.
    async fn report(&self, identity: &str, from_ms: i64, to_ms: i64) -> zbus::fdo::Result<String> {
        let query = ReportQuery {
            identity: (!identity.is_empty()).then(|| IdentityId::new(identity)),
            from: optional_millis(from_ms)?,
            to: optional_millis(to_ms)?,
        };
        let report = self.engine.report(query).await.map_err(to_fdo)?;
        to_json(&report)
    }

    /// Enrolled identities with sample counts and finalization state.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let list = self.engine.list_identities().await.map_err(to_fdo)?;
        to_json(&list)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}

fn parse_identity(identity: &str) -> zbus::fdo::Result<IdentityId> {
    let trimmed = identity.trim();
    if trimmed.is_empty() {
        return Err(zbus::fdo::Error::InvalidArgs("identity must not be empty".into()));
    }
    Ok(IdentityId::new(trimmed))
}

fn to_embeddings(raw: Vec<Vec<f64>>) -> Vec<Embedding> {
    raw.into_iter()
        .map(|v| Embedding::new(v.into_iter().map(|x| x as f32).collect()))
        .collect()
}

fn from_millis(ms: i64) -> zbus::fdo::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("timestamp {ms} out of range")))
}

fn optional_millis(ms: i64) -> zbus::fdo::Result<Option<DateTime<Utc>>> {
    if ms <= 0 {
        Ok(None)
    } else {
        from_millis(ms).map(Some)
    }
}

fn face_json(result: &FaceResult) -> serde_json::Value {
    match result {
        Ok(outcome) => serde_json::to_value(outcome)
            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() })),
        Err(e) => serde_json::json!({ "error": e.to_string() }),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Enroll(_) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        EngineError::ObservationDropped => zbus::fdo::Error::LimitsExceeded(e.to_string()),
        EngineError::ChannelClosed => zbus::fdo::Error::NoServer(e.to_string()),
        _ => zbus::fdo::Error::Failed(e.to_string()),
    }
}
