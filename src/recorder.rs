//! Append-only, correlated event recording.
//!
//! Every pipeline variant records through the same generic
//! [`GraphEvent`] schema: the correlation triple, a graph name, a
//! free-form step label, and optional payloads. Recording is strictly
//! best-effort; a failing sink is logged at warn and never propagates
//! into the run.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::consistency::ConsistencyVerdict;
use crate::retrieval::RetrievalOutcome;
use crate::types::CorrelationIds;
use crate::utils::id_generator::IdGenerator;

/// One recorded pipeline event.
///
/// The schema is deliberately generic: new pipeline variants add new
/// `step` labels and metadata keys, never new columns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphEvent {
    pub event_id: String,
    pub ids: CorrelationIds,
    pub graph_name: String,
    /// Free-form step label ("retrieve", "generate", "judge", ...).
    pub step: String,
    pub node_name: Option<String>,
    pub branch_key: Option<String>,
    /// 1-based attempt number of the originating node execution.
    pub attempt: Option<u32>,
    pub query: Option<String>,
    pub prompt: Option<String>,
    pub response: Option<String>,
    pub duration_ms: Option<u64>,
    pub retrieval: Option<RetrievalOutcome>,
    pub consistency: Option<ConsistencyVerdict>,
    pub metadata: FxHashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl GraphEvent {
    /// A new event for the given correlation triple and step label.
    #[must_use]
    pub fn new(ids: CorrelationIds, graph_name: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            event_id: String::new(),
            ids,
            graph_name: graph_name.into(),
            step: step.into(),
            node_name: None,
            branch_key: None,
            attempt: None,
            query: None,
            prompt: None,
            response: None,
            duration_ms: None,
            retrieval: None,
            consistency: None,
            metadata: FxHashMap::default(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    #[must_use]
    pub fn with_branch(mut self, branch_key: impl Into<String>) -> Self {
        self.branch_key = Some(branch_key.into());
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_retrieval(mut self, outcome: RetrievalOutcome) -> Self {
        self.retrieval = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_consistency(mut self, verdict: ConsistencyVerdict) -> Self {
        self.consistency = Some(verdict);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Error surfaced by a telemetry sink.
#[derive(Debug, Error, Diagnostic)]
#[error("telemetry sink failed: {message}")]
#[diagnostic(
    code(ragweave::recorder::sink),
    help("Sink failures never fail the run; events are dropped.")
)]
pub struct SinkError {
    pub message: String,
}

impl SinkError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Abstraction over an append-only event store.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn append(&self, event: &GraphEvent) -> Result<(), SinkError>;
}

/// In-memory sink for tests and snapshots, queryable by correlation key.
#[derive(Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<GraphEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured events in append order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<GraphEvent> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Events belonging to one graph invocation.
    #[must_use]
    pub fn events_for_graph(&self, graph_id: &str) -> Vec<GraphEvent> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.ids.graph_id == graph_id)
            .collect()
    }

    /// Events belonging to one node execution.
    #[must_use]
    pub fn events_for_run(&self, graph_id: &str, run_id: &str) -> Vec<GraphEvent> {
        self.snapshot()
            .into_iter()
            .filter(|e| e.ids.graph_id == graph_id && e.ids.run_id == run_id)
            .collect()
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

#[async_trait]
impl TelemetrySink for MemorySink {
    async fn append(&self, event: &GraphEvent) -> Result<(), SinkError> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Forwards events to a flume channel for async consumers (live
/// dashboards, log shippers).
pub struct ChannelSink {
    tx: flume::Sender<GraphEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: flume::Sender<GraphEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl TelemetrySink for ChannelSink {
    async fn append(&self, event: &GraphEvent) -> Result<(), SinkError> {
        self.tx
            .send(event.clone())
            .map_err(|_| SinkError::new("channel receiver dropped"))
    }
}

/// Best-effort recorder fanning events out to its sinks.
///
/// Cheap to clone; all clones share the same sinks.
#[derive(Clone, Default)]
pub struct EventRecorder {
    sinks: Vec<Arc<dyn TelemetrySink>>,
    ids: IdGenerator,
}

impl EventRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Appends `event` to every sink.
    ///
    /// Mints the event id if the caller left it empty. Sink failures are
    /// logged and swallowed; this method cannot fail.
    pub async fn record(&self, mut event: GraphEvent) {
        if event.event_id.is_empty() {
            event.event_id = self.ids.event_id();
        }
        for sink in &self.sinks {
            if let Err(err) = sink.append(&event).await {
                warn!(
                    step = %event.step,
                    graph_id = %event.ids.graph_id,
                    run_id = %event.ids.run_id,
                    error = %err,
                    "telemetry sink failed; event dropped"
                );
            }
        }
    }
}
