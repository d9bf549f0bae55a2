//! External interface traits.
//!
//! The pipeline core consumes vector stores, lexical indexes, embedding
//! providers, and generation providers through the narrow traits defined
//! here. Transport, authentication, and wire formats live behind these
//! seams; the core never sees them.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retrieval::Filter;

/// One scored hit returned by a search backend.
///
/// `score` is backend-native (cosine similarity for dense, BM25-like for
/// lexical) and only comparable within one result list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    /// Stable identifier of the indexed chunk.
    pub chunk_id: String,
    /// Backend-native relevance score.
    pub score: f32,
    /// The chunk text.
    pub text: String,
    /// Backend payload fields (source, section, tags).
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl ScoredPoint {
    #[must_use]
    pub fn new(chunk_id: impl Into<String>, score: f32, text: impl Into<String>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            score,
            text: text.into(),
            payload: serde_json::Map::new(),
        }
    }
}

/// One message of a generation prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Error surfaced by any backend implementation.
#[derive(Debug, Error, Diagnostic)]
pub enum BackendError {
    /// The backend could not be reached or refused the request.
    #[error("backend unavailable ({backend}): {message}")]
    #[diagnostic(
        code(ragweave::backends::unavailable),
        help("Check connectivity and backend health before retrying.")
    )]
    Unavailable {
        backend: &'static str,
        message: String,
    },

    /// The backend answered with something the core cannot use.
    #[error("malformed backend response ({backend}): {message}")]
    #[diagnostic(code(ragweave::backends::malformed))]
    Malformed {
        backend: &'static str,
        message: String,
    },
}

/// Dense similarity search over a vector index.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(
        &self,
        vector: &[f32],
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, BackendError>;
}

/// Keyword search over a lexical index.
#[async_trait]
pub trait LexicalSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, BackendError>;
}

/// Text embedding provider.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embeds each input text; the output vector count matches the input
    /// text count, in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError>;
}

/// Chat-completion provider.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, BackendError>;
}
