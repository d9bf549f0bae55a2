//! Reciprocal-rank fusion of dense and lexical search.
//!
//! [`RetrievalFusionEngine::retrieve`] is the single entry point nodes
//! use to gather evidence. It never errors: an unreachable backend, a
//! failed embedding, or zero hits all produce an empty
//! [`RetrievalOutcome`] that downstream nodes grade and react to.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::backends::{EmbeddingBackend, LexicalSearch, ScoredPoint, VectorSearch};
use crate::config::FusionConfig;
use crate::governor::{ConcurrencyGovernor, ResourceClass};
use crate::retrieval::{
    is_short_query, FusedHit, Reranker, RetrievalMode, RetrievalOutcome, RetrievalRequest,
    StageScores,
};

/// Fuses ranked result lists from the configured search backends.
pub struct RetrievalFusionEngine {
    vector: Arc<dyn VectorSearch>,
    lexical: Option<Arc<dyn LexicalSearch>>,
    embeddings: Arc<dyn EmbeddingBackend>,
    reranker: Arc<dyn Reranker>,
    governor: Arc<ConcurrencyGovernor>,
    config: FusionConfig,
}

impl RetrievalFusionEngine {
    #[must_use]
    pub fn new(
        vector: Arc<dyn VectorSearch>,
        embeddings: Arc<dyn EmbeddingBackend>,
        reranker: Arc<dyn Reranker>,
        governor: Arc<ConcurrencyGovernor>,
        config: FusionConfig,
    ) -> Self {
        Self {
            vector,
            lexical: None,
            embeddings,
            reranker,
            governor,
            config,
        }
    }

    /// Enables hybrid retrieval through a lexical index.
    #[must_use]
    pub fn with_lexical(mut self, lexical: Arc<dyn LexicalSearch>) -> Self {
        self.lexical = Some(lexical);
        self
    }

    /// Retrieves, fuses, reranks, and widens at most once.
    ///
    /// The returned outcome records the `k_base` originally requested
    /// (`k_requested`), the `k_base` used on the last issue
    /// (`k_effective`), whether widening happened, and per-stage score
    /// summaries for telemetry.
    #[instrument(skip(self), fields(query = %request.query_text, k_base = request.k_base))]
    pub async fn retrieve(&self, request: &RetrievalRequest) -> RetrievalOutcome {
        let mut outcome = RetrievalOutcome {
            query_text: request.query_text.clone(),
            filter: request.filter.clone(),
            k_requested: request.k_base,
            k_effective: request.k_base,
            ..RetrievalOutcome::default()
        };

        let query_vector = match self.embed_query(&request.query_text).await {
            Some(vector) => vector,
            None => return outcome,
        };

        let mode = self.pick_mode(&request.query_text);
        outcome.mode = Some(mode);

        let (hits, stage) = self
            .issue(request, &query_vector, mode, request.k_base, request.k_final)
            .await;

        let should_widen = request.widen_hint
            || hits.len() < request.k_final
            || hits
                .first()
                .is_none_or(|top| top.score < self.config.score_threshold);

        if !should_widen {
            outcome.hits = hits;
            outcome.stage = stage;
            return outcome;
        }

        let widened_k_base =
            ((request.k_base as f32) * self.config.widen_factor).round() as usize;
        let widened_k_final =
            ((request.k_final as f32) * self.config.widen_k_final_factor).ceil() as usize;
        debug!(
            widened_k_base,
            widened_k_final, "widening retrieval once"
        );

        let (hits, stage) = self
            .issue(request, &query_vector, mode, widened_k_base, widened_k_final)
            .await;
        outcome.hits = hits;
        outcome.stage = stage;
        outcome.widened = true;
        outcome.k_effective = widened_k_base;
        outcome
    }

    async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let texts = vec![query.to_string()];
        let result = self
            .governor
            .run_under(
                ResourceClass::Retrieval,
                self.config.search_timeout,
                self.embeddings.embed(&texts),
            )
            .await;
        match result {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.swap_remove(0)),
            Ok(_) => {
                warn!("embedding backend returned no vector for the query");
                None
            }
            Err(err) => {
                warn!(error = %err, "query embedding failed; empty retrieval");
                None
            }
        }
    }

    fn pick_mode(&self, query: &str) -> RetrievalMode {
        if self.lexical.is_none() {
            return RetrievalMode::Dense;
        }
        let short = is_short_query(
            query,
            self.config.short_query_max_words,
            self.config.short_query_max_chars,
        );
        if self.config.hybrid || (self.config.prefer_hybrid_for_short_queries && short) {
            RetrievalMode::Hybrid
        } else {
            RetrievalMode::Dense
        }
    }

    /// One search-fuse-rerank pass at the given sizes.
    async fn issue(
        &self,
        request: &RetrievalRequest,
        query_vector: &[f32],
        mode: RetrievalMode,
        k_base: usize,
        k_final: usize,
    ) -> (Vec<FusedHit>, StageScores) {
        let dense_fut = self.governor.run_under(
            ResourceClass::Retrieval,
            self.config.search_timeout,
            self.vector.search(query_vector, &request.filter, k_base),
        );

        let (dense, lexical) = match (mode, &self.lexical) {
            (RetrievalMode::Hybrid, Some(lexical)) => {
                let lexical_fut = self.governor.run_under(
                    ResourceClass::Retrieval,
                    self.config.search_timeout,
                    lexical.search(&request.query_text, &request.filter, k_base),
                );
                let (dense, lexical) =
                    futures_util::future::join(dense_fut, lexical_fut).await;
                (dense, Some(lexical))
            }
            _ => (dense_fut.await, None),
        };

        let dense = dense.unwrap_or_else(|err| {
            warn!(error = %err, "dense search failed; contributing no hits");
            Vec::new()
        });
        let lexical = lexical.map(|result| {
            result.unwrap_or_else(|err| {
                warn!(error = %err, "lexical search failed; contributing no hits");
                Vec::new()
            })
        });

        let stage = StageScores {
            dense_hits: dense.len(),
            dense_top: dense.first().map(|p| p.score),
            lexical_hits: lexical.as_ref().map_or(0, Vec::len),
            lexical_top: lexical.as_ref().and_then(|l| l.first().map(|p| p.score)),
        };

        let mut lists = vec![dense];
        if let Some(lexical) = lexical {
            lists.push(lexical);
        }
        let fused = rrf_fuse(&lists, self.config.k_rrf);

        // Rerank runs under the same permit pool and deadline as the
        // searches; a slow or failed reranker keeps the fused order.
        let reranked = self
            .governor
            .run_under(
                ResourceClass::Retrieval,
                self.config.search_timeout,
                self.reranker.rerank(query_vector, fused.clone()),
            )
            .await;

        let mut hits = match reranked {
            Ok(hits) => hits,
            Err(err) => {
                warn!(error = %err, "rerank failed; keeping fused order");
                fused
            }
        };
        hits.truncate(k_final);
        (hits, stage)
    }
}

/// Reciprocal-rank fusion across result lists.
///
/// Each chunk contributes `1 / (k_rrf + rank)` per list it appears in,
/// with rank 1-based and deduplication keeping the best rank per list.
/// The hit keeps the best backend-native score seen for it and the
/// payload from its first appearance. Output is sorted by fused score,
/// ties broken by chunk id for determinism.
#[must_use]
pub fn rrf_fuse(lists: &[Vec<ScoredPoint>], k_rrf: f32) -> Vec<FusedHit> {
    let mut by_chunk: Vec<FusedHit> = Vec::new();
    let mut index: rustc_hash::FxHashMap<String, usize> = rustc_hash::FxHashMap::default();

    for list in lists {
        let mut seen_in_list: rustc_hash::FxHashSet<&str> = rustc_hash::FxHashSet::default();
        for (rank0, point) in list.iter().enumerate() {
            // Duplicate chunk later in the same list has a worse rank;
            // only the first occurrence contributes.
            if !seen_in_list.insert(point.chunk_id.as_str()) {
                continue;
            }
            let contribution = 1.0 / (k_rrf + (rank0 + 1) as f32);
            match index.get(&point.chunk_id) {
                Some(&at) => {
                    let hit = &mut by_chunk[at];
                    hit.fused_score += contribution;
                    if point.score > hit.score {
                        hit.score = point.score;
                    }
                }
                None => {
                    index.insert(point.chunk_id.clone(), by_chunk.len());
                    by_chunk.push(FusedHit {
                        chunk_id: point.chunk_id.clone(),
                        text: point.text.clone(),
                        score: point.score,
                        fused_score: contribution,
                        payload: point.payload.clone(),
                    });
                }
            }
        }
    }

    by_chunk.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    by_chunk
}
