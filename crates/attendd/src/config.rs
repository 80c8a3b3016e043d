use attend_core::period::MAX_UTC_OFFSET_MINUTES;
use attend_core::{
    Aggregation, CheckpointConfig, ConfirmationConfig, DistanceMetric, NearestIdentityMatcher,
    PeriodKind, PeriodPolicy, StateMachineConfig,
};
use chrono::NaiveTime;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Session,
    System,
}

/// Daemon configuration: defaults, then an optional TOML file named by
/// `ATTEND_CONFIG`, then `ATTEND_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Largest embedding distance accepted as a match.
    pub threshold: f32,
    pub metric: DistanceMetric,
    pub aggregation: Aggregation,
    /// Identities whose distances differ by at most this are ambiguous.
    pub tie_epsilon: f32,
    /// Same-direction suppression window per identity.
    pub cooldown_secs: u64,
    /// Samples required before an identity can be finalized.
    pub min_enrollment_samples: usize,
    /// Extractor dimensionality; inferred from the first enrollment when unset.
    pub embedding_dim: Option<usize>,
    /// Consecutive sightings on one camera before an observation counts.
    pub confirmations_required: u32,
    /// Largest gap between sightings that keeps a streak alive.
    pub confirmation_gap_ms: u64,
    /// Frames buffered between capture and matching; oldest dropped beyond this.
    pub queue_capacity: usize,
    pub period: PeriodPolicy,
    /// Secret used to seal stored embeddings; plaintext storage when unset.
    pub embedding_key_file: Option<PathBuf>,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("attendance.db"),
            threshold: 0.55,
            metric: DistanceMetric::Euclidean,
            aggregation: Aggregation::Min,
            tie_epsilon: 0.02,
            cooldown_secs: 60,
            min_enrollment_samples: attend_core::enrollment::DEFAULT_MIN_SAMPLES,
            embedding_dim: None,
            confirmations_required: 3,
            confirmation_gap_ms: 2_000,
            queue_capacity: 32,
            period: PeriodPolicy::default(),
            embedding_key_file: None,
            bus: BusKind::Session,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("attend")
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ATTEND_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Some((path, text))
            }
            Err(_) => None,
        };
        Self::from_sources(
            file.as_ref().map(|(p, t)| (p.as_str(), t.as_str())),
            |key| std::env::var(key).ok(),
        )
    }

    /// Build from an optional `(path, toml text)` and an environment lookup.
    pub fn from_sources(
        file: Option<(&str, &str)>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some((path, text)) => toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.to_string(),
                source,
            })?,
            None => Config::default(),
        };
        config.apply_env(&env);
        config.validate()?;
        Ok(config)
    }

    /// Reject values the matcher or period policy cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }
        if !self.tie_epsilon.is_finite() || self.tie_epsilon < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "tie_epsilon must be a non-negative number, got {}",
                self.tie_epsilon
            )));
        }
        let offset = self.period.utc_offset_minutes;
        if !(-MAX_UTC_OFFSET_MINUTES..=MAX_UTC_OFFSET_MINUTES).contains(&offset) {
            return Err(ConfigError::Invalid(format!(
                "period.utc_offset_minutes must be within ±{MAX_UTC_OFFSET_MINUTES}, got {offset}"
            )));
        }
        Ok(())
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("ATTEND_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        self.threshold = env_parse(env, "ATTEND_THRESHOLD", self.threshold);
        self.tie_epsilon = env_parse(env, "ATTEND_TIE_EPSILON", self.tie_epsilon);
        self.cooldown_secs = env_parse(env, "ATTEND_COOLDOWN_SECS", self.cooldown_secs);
        self.min_enrollment_samples =
            env_parse(env, "ATTEND_MIN_ENROLLMENT_SAMPLES", self.min_enrollment_samples);
        self.confirmations_required =
            env_parse(env, "ATTEND_CONFIRMATIONS", self.confirmations_required);
        self.confirmation_gap_ms =
            env_parse(env, "ATTEND_CONFIRMATION_GAP_MS", self.confirmation_gap_ms);
        self.queue_capacity = env_parse(env, "ATTEND_QUEUE_CAPACITY", self.queue_capacity);
        self.period.utc_offset_minutes =
            env_parse(env, "ATTEND_UTC_OFFSET_MINUTES", self.period.utc_offset_minutes);

        if let Some(dim) = env("ATTEND_EMBEDDING_DIM").and_then(|v| v.parse().ok()) {
            self.embedding_dim = Some(dim);
        }
        if let Some(v) = env("ATTEND_METRIC") {
            match v.to_ascii_lowercase().as_str() {
                "euclidean" => self.metric = DistanceMetric::Euclidean,
                "cosine" => self.metric = DistanceMetric::Cosine,
                other => tracing::warn!(value = other, "ignoring unknown ATTEND_METRIC"),
            }
        }
        if let Some(v) = env("ATTEND_AGGREGATION") {
            match v.to_ascii_lowercase().as_str() {
                "min" => self.aggregation = Aggregation::Min,
                "mean" => self.aggregation = Aggregation::Mean,
                other => tracing::warn!(value = other, "ignoring unknown ATTEND_AGGREGATION"),
            }
        }
        if let Some(v) = env("ATTEND_PERIOD") {
            match v.to_ascii_lowercase().as_str() {
                "daily" => {
                    let reset_at = env("ATTEND_PERIOD_RESET_AT")
                        .and_then(|t| NaiveTime::parse_from_str(&t, "%H:%M").ok())
                        .unwrap_or(NaiveTime::MIN);
                    self.period.kind = PeriodKind::Daily { reset_at };
                }
                "never" => self.period.kind = PeriodKind::Never,
                other => tracing::warn!(value = other, "ignoring unknown ATTEND_PERIOD"),
            }
        }
        if let Some(v) = env("ATTEND_EMBEDDING_KEY_FILE") {
            self.embedding_key_file = Some(PathBuf::from(v));
        }
        if let Some(v) = env("ATTEND_BUS") {
            self.bus = if v.eq_ignore_ascii_case("system") {
                BusKind::System
            } else {
                BusKind::Session
            };
        }
    }

    pub fn matcher(&self) -> NearestIdentityMatcher {
        NearestIdentityMatcher {
            metric: self.metric,
            aggregation: self.aggregation,
            tie_epsilon: self.tie_epsilon,
        }
    }

    pub fn state_machine(&self) -> StateMachineConfig {
        StateMachineConfig {
            cooldown: chrono::Duration::seconds(clamp_i64(self.cooldown_secs, i64::MAX / 1_000)),
            period: self.period.clone(),
        }
    }

    pub fn checkpoint(&self) -> CheckpointConfig {
        CheckpointConfig {
            threshold: self.threshold,
            confirmation: ConfirmationConfig {
                required: self.confirmations_required,
                max_gap: chrono::Duration::milliseconds(clamp_i64(
                    self.confirmation_gap_ms,
                    i64::MAX / 1_000,
                )),
            },
        }
    }
}

fn clamp_i64(v: u64, max: i64) -> i64 {
    i64::try_from(v).unwrap_or(max).min(max)
}

fn env_parse<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
