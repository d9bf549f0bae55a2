//! Scripted backend doubles shared across the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use ragweave::backends::{
    BackendError, ChatMessage, EmbeddingBackend, GenerationBackend, LexicalSearch, ScoredPoint,
    VectorSearch,
};
use ragweave::recorder::{GraphEvent, SinkError, TelemetrySink};
use ragweave::retrieval::Filter;

/// Vector search over a fixed point set; applies the filter, truncates
/// to the limit, and counts calls.
pub struct StaticVectorSearch {
    points: Vec<ScoredPoint>,
    pub calls: AtomicUsize,
}

impl StaticVectorSearch {
    pub fn new(points: Vec<ScoredPoint>) -> Self {
        Self {
            points,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorSearch for StaticVectorSearch {
    async fn search(
        &self,
        _vector: &[f32],
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut hits: Vec<ScoredPoint> = self
            .points
            .iter()
            .filter(|p| filter.matches(&p.payload))
            .cloned()
            .collect();
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Lexical counterpart of [`StaticVectorSearch`].
pub struct StaticLexicalSearch {
    points: Vec<ScoredPoint>,
    pub calls: AtomicUsize,
}

impl StaticLexicalSearch {
    pub fn new(points: Vec<ScoredPoint>) -> Self {
        Self {
            points,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LexicalSearch for StaticLexicalSearch {
    async fn search(
        &self,
        _query: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<ScoredPoint>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut hits: Vec<ScoredPoint> = self
            .points
            .iter()
            .filter(|p| filter.matches(&p.payload))
            .cloned()
            .collect();
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Vector search that always fails, for degradation paths.
pub struct FailingVectorSearch;

#[async_trait]
impl VectorSearch for FailingVectorSearch {
    async fn search(
        &self,
        _vector: &[f32],
        _filter: &Filter,
        _limit: usize,
    ) -> Result<Vec<ScoredPoint>, BackendError> {
        Err(BackendError::Unavailable {
            backend: "qdrant",
            message: "connection refused".into(),
        })
    }
}

/// Deterministic embeddings: known texts map through the table, unknown
/// texts hash to a stable unit vector.
pub struct StubEmbeddings {
    table: FxHashMap<String, Vec<f32>>,
}

impl StubEmbeddings {
    pub fn new() -> Self {
        Self {
            table: FxHashMap::default(),
        }
    }

    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.table.insert(text.into(), vector);
        self
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.table.get(text) {
            return v.clone();
        }
        let mut acc: u32 = 17;
        for b in text.bytes() {
            acc = acc.wrapping_mul(31).wrapping_add(u32::from(b));
        }
        let x = (acc % 1000) as f32 / 1000.0;
        vec![x, 1.0 - x, 0.5]
    }
}

#[async_trait]
impl EmbeddingBackend for StubEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Embedding backend that answers correctly but far too late.
pub struct SlowEmbeddings {
    delay: Duration,
}

impl SlowEmbeddings {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl EmbeddingBackend for SlowEmbeddings {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        tokio::time::sleep(self.delay).await;
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
    }
}

/// Embedding backend that always fails.
pub struct FailingEmbeddings;

#[async_trait]
impl EmbeddingBackend for FailingEmbeddings {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        Err(BackendError::Unavailable {
            backend: "embeddings",
            message: "model not loaded".into(),
        })
    }
}

/// Generation backend replaying queued replies; the last received
/// prompt set is kept for assertions.
pub struct ScriptedGeneration {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGeneration {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: fallback.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        self.replies.lock().unwrap().push_back(reply.into());
        self
    }

    pub fn recorded_prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedGeneration {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, BackendError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        let reply = self.replies.lock().unwrap().pop_front();
        Ok(reply.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Generation backend that fails its first `failures` calls, then
/// answers normally. For backoff-retry paths.
pub struct FlakyGeneration {
    failures: AtomicUsize,
    reply: String,
}

impl FlakyGeneration {
    pub fn new(failures: usize, reply: impl Into<String>) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl GenerationBackend for FlakyGeneration {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, BackendError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Unavailable {
                backend: "llm",
                message: "overloaded".into(),
            });
        }
        Ok(self.reply.clone())
    }
}

/// Generation backend that never answers within a test timeout.
pub struct StalledGeneration;

#[async_trait]
impl GenerationBackend for StalledGeneration {
    async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, BackendError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(String::new())
    }
}

/// Telemetry sink that always fails, to prove recording stays
/// best-effort.
pub struct FailingSink;

#[async_trait]
impl TelemetrySink for FailingSink {
    async fn append(&self, _event: &GraphEvent) -> Result<(), SinkError> {
        Err(SinkError::new("disk full"))
    }
}

/// Builds a scored point with the given payload fields.
pub fn point_with_payload(
    id: &str,
    score: f32,
    text: &str,
    payload: &[(&str, serde_json::Value)],
) -> ScoredPoint {
    let mut p = ScoredPoint::new(id, score, text);
    for (k, v) in payload {
        p.payload.insert((*k).to_string(), v.clone());
    }
    p
}

/// Shares a backend double behind the `Arc` the engines expect while
/// keeping a handle for assertions.
pub fn shared<T>(value: T) -> (Arc<T>, Arc<T>) {
    let arc = Arc::new(value);
    (Arc::clone(&arc), arc)
}
