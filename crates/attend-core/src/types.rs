use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Namespace for deterministic attendance event IDs.
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6a1f_3c2e_9b4d_4f7a_8e21_5d0c_b7a9_e413);

/// Face embedding vector (128-dimensional for dlib-style extractors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "dlib_resnet_v1").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Distance under the given metric. Lower = more similar.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::Cosine => 1.0 - self.similarity(other),
        }
    }
}

/// Distance metric used to compare embeddings.
///
/// Must match the metric the external extractor's embeddings were trained for:
/// dlib/face_recognition vectors are Euclidean, ArcFace vectors are cosine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    /// `1 - cosine similarity`, in [0, 2].
    Cosine,
}

/// Enrolled person identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched identity, `None` on open-set rejection or ambiguity.
    pub identity: Option<IdentityId>,
    /// Best distance found; `f32::INFINITY` when no finalized identity exists.
    pub distance: f32,
    pub accepted: bool,
}

impl MatchResult {
    pub fn rejected(distance: f32) -> Self {
        Self {
            identity: None,
            distance,
            accepted: false,
        }
    }
}

/// Attendance direction requested for an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

/// An immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub event_id: Uuid,
    pub identity: IdentityId,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    /// Camera (or other source) that produced the observation.
    pub camera_id: String,
}

impl AttendanceEvent {
    /// Build an event whose ID is derived from `(identity, direction, timestamp)`,
    /// so replaying the same inputs yields byte-identical ledgers.
    pub fn new(
        identity: IdentityId,
        direction: Direction,
        timestamp: DateTime<Utc>,
        camera_id: impl Into<String>,
    ) -> Self {
        let name = format!(
            "{}|{}|{}",
            identity,
            direction,
            timestamp.timestamp_nanos_opt().unwrap_or_else(|| timestamp.timestamp_millis())
        );
        Self {
            event_id: Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes()),
            identity,
            timestamp,
            direction,
            camera_id: camera_id.into(),
        }
    }
}

/// Derived presence of an identity within the current attendance period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    /// No events yet in the period, or the last one was OUT.
    Outside,
    /// Last event in the period was IN.
    Inside,
}

impl PresenceState {
    pub fn from_last(last: Option<&AttendanceEvent>) -> Self {
        match last.map(|e| e.direction) {
            Some(Direction::In) => PresenceState::Inside,
            _ => PresenceState::Outside,
        }
    }
}
