//! Open-set identity matching against the finalized gallery.

use crate::enrollment::{EmbeddingSet, Gallery};
use crate::types::{DistanceMetric, Embedding, IdentityId, MatchResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("probe has {actual} dimensions, gallery expects {expected}")]
    InvalidEmbeddingDimension { expected: usize, actual: usize },
    #[error("embedding contains a non-finite value")]
    NonFiniteEmbedding,
}

/// How per-identity distances are reduced over an identity's reference set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Distance to the closest reference embedding.
    #[default]
    Min,
    /// Mean distance over all reference embeddings.
    Mean,
}

/// Strategy for resolving a probe embedding to an enrolled identity.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Nearest-identity matcher with open-set rejection and ambiguity rejection.
///
/// Visits every finalized identity and every reference embedding; there is
/// no early exit on a good-enough candidate.
#[derive(Debug, Clone, Copy)]
pub struct NearestIdentityMatcher {
    pub metric: DistanceMetric,
    pub aggregation: Aggregation,
    /// Runner-up identities closer than this to the best are treated as a tie.
    pub tie_epsilon: f32,
}

impl Default for NearestIdentityMatcher {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::Euclidean,
            aggregation: Aggregation::Min,
            tie_epsilon: 0.02,
        }
    }
}

impl NearestIdentityMatcher {
    /// Reduced distance between the probe and one identity's reference set.
    fn identity_distance(&self, probe: &Embedding, set: &EmbeddingSet) -> f32 {
        let distances = set
            .embeddings()
            .iter()
            .map(|reference| probe.distance(reference, self.metric));

        let d = match self.aggregation {
            Aggregation::Min => distances.fold(f32::INFINITY, f32::min),
            Aggregation::Mean => {
                let (sum, n) = distances.fold((0.0f32, 0usize), |(s, n), d| (s + d, n + 1));
                if n == 0 { f32::INFINITY } else { sum / n as f32 }
            }
        };
        // A NaN must never win the comparison below.
        if d.is_nan() { f32::INFINITY } else { d }
    }
}

impl Matcher for NearestIdentityMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &Gallery,
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        if let Some(expected) = gallery.dimension() {
            if probe.dim() != expected {
                return Err(MatchError::InvalidEmbeddingDimension {
                    expected,
                    actual: probe.dim(),
                });
            }
        }
        if !probe.is_finite() {
            return Err(MatchError::NonFiniteEmbedding);
        }

        let mut best: Option<(&IdentityId, f32)> = None;
        let mut runner_up = f32::INFINITY;

        for set in gallery.finalized() {
            let d = self.identity_distance(probe, set);
            match best {
                Some((_, best_d)) if d >= best_d => runner_up = runner_up.min(d),
                Some((_, best_d)) => {
                    runner_up = best_d;
                    best = Some((set.identity(), d));
                }
                None => best = Some((set.identity(), d)),
            }
        }

        let Some((identity, distance)) = best else {
            return Ok(MatchResult::rejected(f32::INFINITY));
        };

        if !distance.is_finite() || distance > threshold {
            tracing::debug!(distance, threshold, "open-set rejection");
            return Ok(MatchResult::rejected(distance));
        }

        if runner_up - distance <= self.tie_epsilon {
            tracing::debug!(distance, runner_up, epsilon = self.tie_epsilon, "ambiguous match rejected");
            return Ok(MatchResult::rejected(distance));
        }

        Ok(MatchResult {
            identity: Some(identity.clone()),
            distance,
            accepted: true,
        })
    }
}
