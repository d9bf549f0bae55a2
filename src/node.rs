//! Node execution framework.
//!
//! This module provides the core abstractions for executable pipeline
//! nodes: the [`Node`] trait, the execution context handed to each run,
//! the partial state update nodes return, and the fatal error type.
//!
//! # Error Handling
//!
//! Nodes fail in two ways:
//! 1. **Fatal errors**: return `Err(NodeError)`; the runner decides
//!    whether the node is best-effort or the run fails.
//! 2. **Diagnostics**: add to `NodePartial::warnings` and return `Ok`.

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::governor::{ConcurrencyGovernor, GovernorError};
use crate::recorder::{EventRecorder, GraphEvent};
use crate::state::StateSnapshot;
use crate::types::{CorrelationIds, NodeOutcome};

/// A single unit of computation within a pipeline.
///
/// Nodes receive the current state snapshot and their execution context,
/// perform their work, and return a partial state update. They hold no
/// mutable state of their own and touch backends only through the
/// handles the context carries.
#[async_trait]
pub trait Node: Send + Sync {
    async fn run(&self, snapshot: StateSnapshot, ctx: NodeContext)
        -> Result<NodePartial, NodeError>;
}

/// Execution context passed to nodes.
///
/// Carries the correlation triple for this specific execution, the
/// node's identity within the run, and explicit handles to the recorder
/// and governor. There are no ambient hooks; everything a node needs to
/// observe or be governed by arrives here.
#[derive(Clone)]
pub struct NodeContext {
    /// Correlation triple; `run_id` is unique to this attempt.
    pub ids: CorrelationIds,
    pub graph_name: String,
    /// Superstep number this execution belongs to.
    pub step: u64,
    pub node_name: String,
    /// Set when this execution is one branch of a map fan-out.
    pub branch_key: Option<String>,
    /// 1-based attempt number.
    pub attempt: u32,
    pub recorder: EventRecorder,
    pub governor: Arc<ConcurrencyGovernor>,
}

impl NodeContext {
    /// A [`GraphEvent`] pre-filled with this execution's identity.
    #[must_use]
    pub fn event(&self, step_label: impl Into<String>) -> GraphEvent {
        let mut event = GraphEvent::new(self.ids.clone(), self.graph_name.clone(), step_label)
            .with_node(self.node_name.clone())
            .with_attempt(self.attempt);
        if let Some(key) = &self.branch_key {
            event = event.with_branch(key.clone());
        }
        event
    }

    /// Records an event; best-effort, never fails.
    pub async fn record(&self, event: GraphEvent) {
        self.recorder.record(event).await;
    }
}

/// Partial state update returned by node execution.
///
/// All fields are optional; nodes update only the channels they care
/// about and the barrier merges the partials. A map branch returns its
/// output in `branch`; the runner inserts it under that branch's own
/// key, so branches cannot write each other's slots.
#[derive(Clone, Debug, Default)]
pub struct NodePartial {
    /// Key-value data merged into the shared extra channel.
    pub extra: Option<FxHashMap<String, Value>>,
    /// This branch's output; ignored outside map fan-outs.
    pub branch: Option<Value>,
    /// Diagnostics appended to the warnings channel.
    pub warnings: Option<Vec<String>>,
    /// How the ledger records this execution; `Empty` marks a success
    /// that produced no usable evidence.
    pub outcome: NodeOutcome,
}

impl NodePartial {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_extra(mut self, extra: FxHashMap<String, Value>) -> Self {
        self.extra = Some(extra);
        self
    }

    /// Convenience for a single extra entry.
    #[must_use]
    pub fn with_extra_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra
            .get_or_insert_with(FxHashMap::default)
            .insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_branch(mut self, value: Value) -> Self {
        self.branch = Some(value);
        self
    }

    #[must_use]
    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = Some(warnings);
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: NodeOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Reads an extra entry from this partial, if present.
    #[must_use]
    pub fn extra_value(&self, key: &str) -> Option<&Value> {
        self.extra.as_ref().and_then(|m| m.get(key))
    }
}

/// Classification of a failed backend interaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendFailure {
    Timeout,
    Unavailable,
    Rejected,
}

impl BackendFailure {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Rejected => "rejected",
        }
    }
}

/// Fatal errors from node execution.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected input data is missing from the state snapshot.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(ragweave::node::missing_input),
        help("Check that an upstream node produced the required data.")
    )]
    MissingInput { what: &'static str },

    /// A backend call failed in a way the governor classified.
    ///
    /// Eligible for the runner's single backoff retry.
    #[error("backend failure ({}): {message}", kind.as_label())]
    #[diagnostic(
        code(ragweave::node::backend),
        help("Transient by classification; the runner may retry once with backoff.")
    )]
    Backend {
        kind: BackendFailure,
        message: String,
    },

    /// Input validation failed.
    #[error("validation failed: {0}")]
    #[diagnostic(
        code(ragweave::node::validation),
        help("Check input data format and required fields.")
    )]
    ValidationFailed(String),

    /// JSON serialization error while building a partial.
    #[error(transparent)]
    #[diagnostic(code(ragweave::node::serde_json))]
    Serde(#[from] serde_json::Error),
}

impl NodeError {
    /// Maps a governor outcome onto the backend failure taxonomy.
    #[must_use]
    pub fn from_governor(err: GovernorError<crate::backends::BackendError>) -> Self {
        match err {
            GovernorError::Timeout { class, waited_ms } => Self::Backend {
                kind: BackendFailure::Timeout,
                message: format!("{class} timed out after {waited_ms}ms"),
            },
            GovernorError::Rejected { class } => Self::Backend {
                kind: BackendFailure::Rejected,
                message: format!("{class} rejected by circuit breaker"),
            },
            GovernorError::Inner(inner) => Self::Backend {
                kind: BackendFailure::Unavailable,
                message: inner.to_string(),
            },
        }
    }

    /// Backend failures are the only class the runner retries with
    /// backoff.
    #[must_use]
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}
