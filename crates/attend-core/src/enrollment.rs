//! Enrollment gallery — per-identity reference embeddings.
//!
//! Sets grow only while an identity is being enrolled. Once finalized a set
//! is frozen and becomes visible to the matcher; there is no global retrain.

use crate::types::{Embedding, IdentityId};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Samples the enrollment workflow is expected to supply per identity.
pub const DEFAULT_MIN_SAMPLES: usize = 50;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("identity {identity} has {have} enrollment samples, need at least {need}")]
    InsufficientEnrollmentSamples {
        identity: IdentityId,
        have: usize,
        need: usize,
    },
    #[error("embedding has {actual} dimensions, gallery expects {expected}")]
    InvalidEmbeddingDimension { expected: usize, actual: usize },
    #[error("embedding is empty")]
    EmptyEmbedding,
    #[error("embedding contains a non-finite value")]
    NonFiniteEmbedding,
    #[error("identity {0} is already finalized")]
    AlreadyFinalized(IdentityId),
    #[error("identity {0} is not enrolled")]
    UnknownIdentity(IdentityId),
}

/// Ordered reference embeddings for one identity.
#[derive(Debug, Clone)]
pub struct EmbeddingSet {
    identity: IdentityId,
    embeddings: Vec<Embedding>,
    finalized: bool,
}

impl EmbeddingSet {
    pub fn new(identity: IdentityId) -> Self {
        Self {
            identity,
            embeddings: Vec::new(),
            finalized: false,
        }
    }

    /// Rebuild a set from stored rows.
    pub fn from_parts(identity: IdentityId, embeddings: Vec<Embedding>, finalized: bool) -> Self {
        Self {
            identity,
            embeddings,
            finalized,
        }
    }

    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    pub fn embeddings(&self) -> &[Embedding] {
        &self.embeddings
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Listing entry for an enrolled identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentSummary {
    pub identity: IdentityId,
    pub samples: usize,
    pub finalized: bool,
}

/// All embedding sets plus the common embedding dimension.
#[derive(Debug, Clone)]
pub struct Gallery {
    sets: BTreeMap<IdentityId, EmbeddingSet>,
    dimension: Option<usize>,
    min_samples: usize,
}

impl Default for Gallery {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SAMPLES, None)
    }
}

impl Gallery {
    /// `dimension` pins the extractor's dimensionality up front; when `None`
    /// the first stored embedding fixes it.
    pub fn new(min_samples: usize, dimension: Option<usize>) -> Self {
        Self {
            sets: BTreeMap::new(),
            dimension,
            min_samples: min_samples.max(1),
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Check an embedding's shape and values without storing it.
    pub fn check_dimension(&self, embedding: &Embedding) -> Result<(), EnrollError> {
        if embedding.values.is_empty() {
            return Err(EnrollError::EmptyEmbedding);
        }
        if !embedding.is_finite() {
            return Err(EnrollError::NonFiniteEmbedding);
        }
        match self.dimension {
            Some(expected) if expected != embedding.dim() => {
                Err(EnrollError::InvalidEmbeddingDimension {
                    expected,
                    actual: embedding.dim(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Validate a sample without storing it, so callers can persist first.
    pub fn check_add(&self, identity: &IdentityId, embedding: &Embedding) -> Result<(), EnrollError> {
        self.check_dimension(embedding)?;
        if self.get(identity).is_some_and(EmbeddingSet::is_finalized) {
            return Err(EnrollError::AlreadyFinalized(identity.clone()));
        }
        Ok(())
    }

    /// Append an enrollment sample. Returns the new sample count.
    pub fn add(&mut self, identity: &IdentityId, embedding: Embedding) -> Result<usize, EnrollError> {
        self.check_add(identity, &embedding)?;

        self.dimension.get_or_insert(embedding.dim());
        let set = self
            .sets
            .entry(identity.clone())
            .or_insert_with(|| EmbeddingSet::new(identity.clone()));
        set.embeddings.push(embedding);
        Ok(set.embeddings.len())
    }

    /// Validate a finalize without applying it. `Ok(true)` if already finalized.
    pub fn check_finalize(&self, identity: &IdentityId) -> Result<bool, EnrollError> {
        let set = self
            .get(identity)
            .ok_or_else(|| EnrollError::UnknownIdentity(identity.clone()))?;

        if set.finalized {
            return Ok(true);
        }
        if set.embeddings.len() < self.min_samples {
            return Err(EnrollError::InsufficientEnrollmentSamples {
                identity: identity.clone(),
                have: set.embeddings.len(),
                need: self.min_samples,
            });
        }
        Ok(false)
    }

    /// Mark an identity ready for matching. Idempotent once finalized.
    pub fn finalize(&mut self, identity: &IdentityId) -> Result<(), EnrollError> {
        if self.check_finalize(identity)? {
            return Ok(());
        }
        if let Some(set) = self.sets.get_mut(identity) {
            set.finalized = true;
            tracing::info!(identity = %identity, samples = set.embeddings.len(), "enrollment finalized");
        }
        Ok(())
    }

    /// Insert a set restored from persistent storage as-is.
    ///
    /// Restored sets skip the sample-count policy: a set finalized under an
    /// older, lower minimum stays matchable.
    pub fn restore(&mut self, set: EmbeddingSet) -> Result<(), EnrollError> {
        for embedding in &set.embeddings {
            self.check_dimension(embedding)?;
            self.dimension.get_or_insert(embedding.dim());
        }
        self.sets.insert(set.identity.clone(), set);
        Ok(())
    }

    pub fn get(&self, identity: &IdentityId) -> Option<&EmbeddingSet> {
        self.sets.get(identity)
    }

    /// Sets visible to the matcher.
    pub fn finalized(&self) -> impl Iterator<Item = &EmbeddingSet> {
        self.sets.values().filter(|s| s.finalized)
    }

    pub fn summaries(&self) -> Vec<EnrollmentSummary> {
        self.sets
            .values()
            .map(|s| EnrollmentSummary {
                identity: s.identity.clone(),
                samples: s.len(),
                finalized: s.finalized,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    #[test]
    fn test_first_embedding_fixes_dimension() {
        let mut g = Gallery::new(1, None);
        g.add(&"a".into(), emb(&[0.0, 1.0])).unwrap();
        assert_eq!(g.dimension(), Some(2));

        let err = g.add(&"b".into(), emb(&[0.0, 1.0, 2.0])).unwrap_err();
        assert_eq!(
            err,
            EnrollError::InvalidEmbeddingDimension { expected: 2, actual: 3 }
        );
    }

    #[test]
    fn test_finalize_requires_min_samples() {
        let mut g = Gallery::new(3, Some(2));
        let id = IdentityId::from("alice");
        g.add(&id, emb(&[0.0, 1.0])).unwrap();
        g.add(&id, emb(&[0.1, 1.0])).unwrap();

        let err = g.finalize(&id).unwrap_err();
        assert_eq!(
            err,
            EnrollError::InsufficientEnrollmentSamples { identity: id.clone(), have: 2, need: 3 }
        );
        assert_eq!(g.finalized().count(), 0);

        g.add(&id, emb(&[0.2, 1.0])).unwrap();
        g.finalize(&id).unwrap();
        assert_eq!(g.finalized().count(), 1);
        // Idempotent.
        g.finalize(&id).unwrap();
    }

    #[test]
    fn test_finalized_set_is_frozen() {
        let mut g = Gallery::new(1, None);
        let id = IdentityId::from("alice");
        g.add(&id, emb(&[1.0])).unwrap();
        g.finalize(&id).unwrap();
        assert_eq!(
            g.add(&id, emb(&[2.0])).unwrap_err(),
            EnrollError::AlreadyFinalized(id.clone())
        );
        assert_eq!(g.get(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_unfinalized_sets_hidden_from_matcher() {
        let mut g = Gallery::new(1, None);
        g.add(&"alice".into(), emb(&[1.0])).unwrap();
        g.add(&"bob".into(), emb(&[2.0])).unwrap();
        g.finalize(&"bob".into()).unwrap();

        let visible: Vec<_> = g.finalized().map(|s| s.identity().as_str()).collect();
        assert_eq!(visible, vec!["bob"]);
    }

    #[test]
    fn test_finalize_unknown_identity() {
        let mut g = Gallery::default();
        assert_eq!(
            g.finalize(&"ghost".into()).unwrap_err(),
            EnrollError::UnknownIdentity("ghost".into())
        );
    }

    #[test]
    fn test_non_finite_embedding_rejected() {
        let mut g = Gallery::new(1, None);
        let id = IdentityId::from("zed");
        assert_eq!(g.add(&id, emb(&[f32::NAN, 5.0])).unwrap_err(), EnrollError::NonFiniteEmbedding);
        assert_eq!(
            g.add(&id, emb(&[f32::INFINITY, 0.0])).unwrap_err(),
            EnrollError::NonFiniteEmbedding
        );
        assert!(g.get(&id).is_none());
        assert_eq!(g.dimension(), None);
    }

    #[test]
    fn test_empty_embedding_rejected() {
        let mut g = Gallery::default();
        assert_eq!(g.add(&"a".into(), emb(&[])).unwrap_err(), EnrollError::EmptyEmbedding);
    }
}
