//! Cross-candidate consistency checking.
//!
//! Given several independently generated answers to the same question,
//! [`ConsistencyChecker::check`] measures how much they agree: pairwise
//! cosine similarity over embeddings, plus one LLM judgment call scoring
//! agreement on a 0-10 scale. The verdict is permutation-stable: any
//! ordering of the same candidate set yields the same result.

use std::sync::Arc;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::backends::{ChatMessage, EmbeddingBackend, GenerationBackend};
use crate::config::ConsistencyConfig;
use crate::governor::{ConcurrencyGovernor, GovernorError, ResourceClass};
use crate::utils::collections::cosine_similarity;

/// How the pairwise similarity matrix is reduced to one score.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    /// Worst pair governs: one contradicting candidate flags divergence
    /// even when the rest agree.
    #[default]
    Min,
    /// Average over all pairs.
    Mean,
}

/// The result of one consistency check.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyVerdict {
    /// Reduced pairwise cosine similarity, in `[0, 1]`.
    pub similarity_score: f32,
    /// LLM agreement score, in `[0, 10]`.
    pub judgment_score: f32,
    pub divergent: bool,
    pub notes: Vec<String>,
}

/// Errors from [`ConsistencyChecker::check`].
///
/// Only embedding failures surface as errors; a failed or unparsable
/// judgment call degrades to a similarity-derived score instead.
#[derive(Debug, Error, Diagnostic)]
pub enum ConsistencyError {
    #[error("embedding candidates failed: {message}")]
    #[diagnostic(
        code(ragweave::consistency::embedding),
        help("The embedding backend is down or rejecting requests.")
    )]
    Embedding { message: String },

    /// The embedding backend returned a vector count that does not match
    /// the candidate count.
    #[error("embedding backend returned {got} vectors for {expected} candidates")]
    #[diagnostic(code(ragweave::consistency::embedding_shape))]
    EmbeddingShape { expected: usize, got: usize },
}

/// Scores agreement between candidate answers.
pub struct ConsistencyChecker {
    embeddings: Arc<dyn EmbeddingBackend>,
    generation: Arc<dyn GenerationBackend>,
    governor: Arc<ConcurrencyGovernor>,
    config: ConsistencyConfig,
}

impl ConsistencyChecker {
    #[must_use]
    pub fn new(
        embeddings: Arc<dyn EmbeddingBackend>,
        generation: Arc<dyn GenerationBackend>,
        governor: Arc<ConcurrencyGovernor>,
        config: ConsistencyConfig,
    ) -> Self {
        Self {
            embeddings,
            generation,
            governor,
            config,
        }
    }

    /// Checks agreement across `candidates`.
    ///
    /// Zero or one candidate is trivially consistent: similarity 1.0,
    /// judgment 10, no backend calls. Otherwise all candidates are
    /// embedded, every pair's cosine similarity is reduced per the
    /// configured [`Reduction`], and one judgment call scores agreement.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub async fn check(
        &self,
        candidates: &[String],
    ) -> Result<ConsistencyVerdict, ConsistencyError> {
        if candidates.len() <= 1 {
            return Ok(ConsistencyVerdict {
                similarity_score: 1.0,
                judgment_score: 10.0,
                divergent: false,
                notes: vec!["fewer than two candidates; trivially consistent".into()],
            });
        }

        let similarity = self.pairwise_similarity(candidates).await?;
        let mut notes = Vec::new();
        let judgment = self.judge(candidates, similarity, &mut notes).await;

        let divergent = similarity < self.config.similarity_threshold
            || judgment < self.config.judgment_threshold;

        debug!(similarity, judgment, divergent, "consistency verdict");
        Ok(ConsistencyVerdict {
            similarity_score: similarity,
            judgment_score: judgment,
            divergent,
            notes,
        })
    }

    async fn pairwise_similarity(&self, candidates: &[String]) -> Result<f32, ConsistencyError> {
        let vectors = self
            .governor
            .run_under(
                ResourceClass::Retrieval,
                self.config.embed_timeout,
                self.embeddings.embed(candidates),
            )
            .await
            .map_err(|err| ConsistencyError::Embedding {
                message: err.to_string(),
            })?;

        if vectors.len() != candidates.len() {
            return Err(ConsistencyError::EmbeddingShape {
                expected: candidates.len(),
                got: vectors.len(),
            });
        }

        let mut pairs = Vec::new();
        for i in 0..vectors.len() {
            for j in (i + 1)..vectors.len() {
                pairs.push(cosine_similarity(&vectors[i], &vectors[j]));
            }
        }

        let reduced = match self.config.reduction {
            Reduction::Min => pairs.iter().copied().fold(f32::INFINITY, f32::min),
            Reduction::Mean => pairs.iter().sum::<f32>() / pairs.len() as f32,
        };
        Ok(reduced.clamp(0.0, 1.0))
    }

    /// One judgment call scoring agreement 0-10. Candidates are sorted
    /// before prompt assembly so the score is independent of input order.
    /// A failed or unparsable call degrades to `similarity * 10`.
    async fn judge(&self, candidates: &[String], similarity: f32, notes: &mut Vec<String>) -> f32 {
        let mut ordered: Vec<&String> = candidates.iter().collect();
        ordered.sort();

        let mut listing = String::new();
        for (i, candidate) in ordered.iter().enumerate() {
            listing.push_str(&format!("Answer {}:\n{}\n\n", i + 1, candidate));
        }
        let prompt = vec![
            ChatMessage::system(
                "You compare candidate answers to the same question. \
                 Rate how consistent they are with each other on a scale \
                 from 0 (contradictory) to 10 (fully consistent). \
                 Reply with the number only.",
            ),
            ChatMessage::user(listing),
        ];

        let reply = self
            .governor
            .run_under(
                ResourceClass::Generation,
                self.config.judge_timeout,
                self.generation.complete(&prompt),
            )
            .await;

        match reply {
            Ok(text) => match parse_score(&text) {
                Some(score) => score,
                None => {
                    warn!(reply = %text, "unparsable judgment reply; deriving from similarity");
                    notes.push("judgment reply unparsable; derived from similarity".into());
                    similarity * 10.0
                }
            },
            Err(err) => {
                let reason = match &err {
                    GovernorError::Timeout { .. } => "timed out",
                    GovernorError::Rejected { .. } => "rejected by breaker",
                    GovernorError::Inner(_) => "failed",
                };
                warn!(reason, "judgment call unavailable; deriving from similarity");
                notes.push(format!("judgment call {reason}; derived from similarity"));
                similarity * 10.0
            }
        }
    }
}

/// Extracts the first number from a judgment reply, clamped to `[0, 10]`.
fn parse_score(reply: &str) -> Option<f32> {
    let mut start = None;
    for (idx, ch) in reply.char_indices() {
        if ch.is_ascii_digit() {
            start = Some(idx);
            break;
        }
    }
    let start = start?;
    let tail = &reply[start..];
    let end = tail
        .char_indices()
        .find(|(_, ch)| !ch.is_ascii_digit() && *ch != '.')
        .map_or(tail.len(), |(idx, _)| idx);
    tail[..end]
        .trim_end_matches('.')
        .parse::<f32>()
        .ok()
        .map(|score| score.clamp(0.0, 10.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_score_accepts_plain_and_embedded_numbers() {
        assert_eq!(parse_score("8"), Some(8.0));
        assert_eq!(parse_score("Score: 7.5"), Some(7.5));
        assert_eq!(parse_score("I'd rate this 9."), Some(9.0));
        assert_eq!(parse_score("no digits here"), None);
    }

    #[test]
    fn parse_score_clamps_out_of_range() {
        assert_eq!(parse_score("42"), Some(10.0));
    }
}
