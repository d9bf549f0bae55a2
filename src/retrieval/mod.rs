//! Retrieval data model, filters, and context assembly.
//!
//! The fusion engine itself lives in [`fusion`]; reranking strategies in
//! [`reranker`]. This module holds the request/outcome types shared with
//! the recorder and the nodes, plus the helpers that turn ranked hits
//! into prompt context.

pub mod fusion;
pub mod reranker;

pub use fusion::RetrievalFusionEngine;
pub use reranker::{EmbeddingReranker, NoopReranker, Reranker};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata filter applied to every search call.
///
/// `must` clauses are exact-match equality on payload fields; `any_of`
/// clauses match when the payload field equals any listed value. An empty
/// filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub must: Vec<(String, Value)>,
    pub any_of: Vec<(String, Vec<Value>)>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn must_equal(mut self, field: impl Into<String>, value: Value) -> Self {
        self.must.push((field.into(), value));
        self
    }

    #[must_use]
    pub fn any_of(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.any_of.push((field.into(), values));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.any_of.is_empty()
    }

    /// Returns `true` when `payload` satisfies every clause.
    #[must_use]
    pub fn matches(&self, payload: &serde_json::Map<String, Value>) -> bool {
        for (field, expected) in &self.must {
            if payload.get(field) != Some(expected) {
                return false;
            }
        }
        for (field, allowed) in &self.any_of {
            match payload.get(field) {
                Some(actual) if allowed.contains(actual) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Search mode used for one retrieval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Dense,
    Hybrid,
}

/// A retrieval request as issued by a node.
#[derive(Clone, Debug)]
pub struct RetrievalRequest {
    pub query_text: String,
    pub filter: Filter,
    /// Candidates requested from each backend list.
    pub k_base: usize,
    /// Hits kept after fusion and rerank.
    pub k_final: usize,
    /// Caller-driven widening (generation signalled insufficient context).
    pub widen_hint: bool,
}

impl RetrievalRequest {
    #[must_use]
    pub fn new(query_text: impl Into<String>, k_base: usize, k_final: usize) -> Self {
        Self {
            query_text: query_text.into(),
            filter: Filter::default(),
            k_base,
            k_final,
            widen_hint: false,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn with_widen_hint(mut self, hint: bool) -> Self {
        self.widen_hint = hint;
        self
    }
}

/// One fused hit: the best backend score seen for the chunk plus its
/// reciprocal-rank fusion score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FusedHit {
    pub chunk_id: String,
    pub text: String,
    /// Best backend-native score across the contributing lists.
    pub score: f32,
    /// Reciprocal-rank fusion score.
    pub fused_score: f32,
    pub payload: serde_json::Map<String, Value>,
}

/// Raw score summary for one retrieval stage, kept for telemetry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageScores {
    pub dense_hits: usize,
    pub dense_top: Option<f32>,
    pub lexical_hits: usize,
    pub lexical_top: Option<f32>,
}

/// The result of one [`RetrievalFusionEngine::retrieve`] call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub query_text: String,
    pub filter: Filter,
    /// `k_base` as originally requested.
    pub k_requested: usize,
    /// `k_base` actually used on the last issue (widened after a widen).
    pub k_effective: usize,
    pub mode: Option<RetrievalMode>,
    pub hits: Vec<FusedHit>,
    pub widened: bool,
    pub stage: StageScores,
}

impl RetrievalOutcome {
    /// Top post-rerank score, if any hit survived.
    #[must_use]
    pub fn top_score(&self) -> Option<f32> {
        self.hits.first().map(|h| h.score)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Graded sufficiency of an assembled context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sufficiency {
    Insufficient,
    Low,
    Medium,
    High,
}

impl Sufficiency {
    /// Grades hit count and assembled text length.
    ///
    /// No hits or almost no text is insufficient; a single short hit is
    /// low; a handful of hits with moderate text is medium; anything
    /// beyond that is high.
    #[must_use]
    pub fn assess(hit_count: usize, context_chars: usize) -> Self {
        if hit_count == 0 || context_chars < 200 {
            Self::Insufficient
        } else if hit_count < 2 || context_chars < 800 {
            Self::Low
        } else if hit_count < 4 || context_chars < 2400 {
            Self::Medium
        } else {
            Self::High
        }
    }

    #[must_use]
    pub fn is_sufficient(&self) -> bool {
        !matches!(self, Self::Insufficient)
    }
}

/// Context assembled from ranked hits for a generation prompt.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub text: String,
    /// Chunk ids included, in rank order.
    pub refs: Vec<String>,
    pub sufficiency: Sufficiency,
}

impl Default for Sufficiency {
    fn default() -> Self {
        Self::Insufficient
    }
}

/// Joins ranked hit texts under a character budget.
///
/// Hits are taken in rank order; a hit that would overflow the budget is
/// dropped along with everything after it. The ids of included chunks are
/// collected for telemetry.
#[must_use]
pub fn build_context(hits: &[FusedHit], max_chars: usize) -> AssembledContext {
    let mut text = String::new();
    let mut refs = Vec::new();
    for hit in hits {
        let addition = if text.is_empty() {
            hit.text.len()
        } else {
            hit.text.len() + 2
        };
        if text.len() + addition > max_chars {
            break;
        }
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(&hit.text);
        refs.push(hit.chunk_id.clone());
    }
    let sufficiency = Sufficiency::assess(refs.len(), text.len());
    AssembledContext {
        text,
        refs,
        sufficiency,
    }
}

/// Short queries carry little lexical signal per word, so keyword search
/// tends to complement dense retrieval well for them.
#[must_use]
pub fn is_short_query(query: &str, max_words: usize, max_chars: usize) -> bool {
    query.split_whitespace().count() <= max_words || query.chars().count() <= max_chars
}
