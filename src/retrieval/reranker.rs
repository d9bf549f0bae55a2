//! Pluggable reranking of fused hits.

use async_trait::async_trait;
use std::sync::Arc;

use crate::backends::{BackendError, EmbeddingBackend};
use crate::retrieval::FusedHit;
use crate::utils::collections::cosine_similarity;

/// Reorders fused hits by relevance to the query.
///
/// Implementations replace each hit's `score` with their own relevance
/// estimate and return the hits sorted best-first. The fused scores are
/// left untouched for telemetry.
#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query_vector: &[f32],
        hits: Vec<FusedHit>,
    ) -> Result<Vec<FusedHit>, BackendError>;
}

/// Default reranker: cosine similarity between the query vector and a
/// fresh embedding of each hit text.
pub struct EmbeddingReranker {
    embeddings: Arc<dyn EmbeddingBackend>,
}

impl EmbeddingReranker {
    #[must_use]
    pub fn new(embeddings: Arc<dyn EmbeddingBackend>) -> Self {
        Self { embeddings }
    }
}

#[async_trait]
impl Reranker for EmbeddingReranker {
    async fn rerank(
        &self,
        query_vector: &[f32],
        mut hits: Vec<FusedHit>,
    ) -> Result<Vec<FusedHit>, BackendError> {
        if hits.is_empty() {
            return Ok(hits);
        }
        let texts: Vec<String> = hits.iter().map(|h| h.text.clone()).collect();
        let vectors = self.embeddings.embed(&texts).await?;
        if vectors.len() != hits.len() {
            return Err(BackendError::Malformed {
                backend: "embeddings",
                message: format!(
                    "expected {} vectors, got {}",
                    hits.len(),
                    vectors.len()
                ),
            });
        }
        for (hit, vector) in hits.iter_mut().zip(vectors.iter()) {
            hit.score = cosine_similarity(query_vector, vector);
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(hits)
    }
}

/// Keeps the fused order and scores as-is. Used when the fusion scores
/// are already trusted, and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReranker;

#[async_trait]
impl Reranker for NoopReranker {
    async fn rerank(
        &self,
        _query_vector: &[f32],
        hits: Vec<FusedHit>,
    ) -> Result<Vec<FusedHit>, BackendError> {
        Ok(hits)
    }
}
