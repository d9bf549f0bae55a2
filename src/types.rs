//! Core identifier types for the ragweave pipeline core.
//!
//! This module defines the fundamental types used throughout the system
//! for naming nodes in a pipeline graph and correlating every recorded
//! step of a run back to its originating request.
//!
//! # Key Types
//!
//! - [`NodeKind`]: Identifies a node in a pipeline graph
//! - [`CorrelationIds`]: The `request_id`/`graph_id`/`run_id` triple
//! - [`RunStatus`] / [`NodeOutcome`]: Terminal states for runs and node
//!   executions
//!
//! # Examples
//!
//! ```rust
//! use ragweave::types::NodeKind;
//!
//! let start = NodeKind::Start;
//! let retrieval = NodeKind::Custom("concept_retrieval".to_string());
//! assert_eq!(retrieval.to_string(), "concept_retrieval");
//! assert!(start.is_start());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a node within a pipeline graph.
///
/// `Start` and `End` are virtual endpoints: they are never registered or
/// executed, they only anchor the graph topology. Every executable node
/// is a `Custom` entry with a caller-chosen, graph-unique name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Virtual entry point; the initial frontier is seeded from its edges.
    Start,
    /// Virtual terminal; reaching it (or draining the frontier) completes
    /// the run.
    End,
    /// Executable node identified by a user-defined name.
    Custom(String),
}

impl NodeKind {
    /// Returns `true` if this is the virtual [`Start`](Self::Start) node.
    #[must_use]
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start)
    }

    /// Returns `true` if this is the virtual [`End`](Self::End) node.
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    /// The node's name as a conditional-edge target.
    #[must_use]
    pub fn as_target(&self) -> String {
        self.as_label().to_string()
    }

    /// Target string routing to the virtual End node.
    #[must_use]
    pub fn end_target() -> String {
        NodeKind::End.as_target()
    }

    /// The node's name as recorded on telemetry events.
    #[must_use]
    pub fn as_label(&self) -> &str {
        match self {
            Self::Start => "Start",
            Self::End => "End",
            Self::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

// Developer experience: lets string literals stand in for NodeKind in
// builder calls and tests.
impl From<&str> for NodeKind {
    fn from(s: &str) -> Self {
        match s {
            "Start" => NodeKind::Start,
            "End" => NodeKind::End,
            other => NodeKind::Custom(other.to_string()),
        }
    }
}

/// The state channels a reducer can be registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Extra,
    Branches,
    Warnings,
}

/// Identifier of one external request, minted by the caller.
pub type RequestId = String;

/// Identifier of one graph invocation.
pub type GraphId = String;

/// Identifier of one node execution, minted per attempt.
pub type RunId = String;

/// The correlation triple joining all telemetry of one logical
/// execution: `request_id` spans an external request, `graph_id` spans
/// one graph invocation, `run_id` is unique per node execution.
///
/// `(graph_id, run_id)` is globally unique and serves as the join key
/// for event queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub request_id: RequestId,
    pub graph_id: GraphId,
    pub run_id: RunId,
}

impl CorrelationIds {
    #[must_use]
    pub fn new(
        request_id: impl Into<RequestId>,
        graph_id: impl Into<GraphId>,
        run_id: impl Into<RunId>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            graph_id: graph_id.into(),
            run_id: run_id.into(),
        }
    }

    /// Derives the ids for a child node execution: request and graph ids
    /// are inherited, the run id is replaced.
    #[must_use]
    pub fn child_run(&self, run_id: impl Into<RunId>) -> Self {
        Self {
            request_id: self.request_id.clone(),
            graph_id: self.graph_id.clone(),
            run_id: run_id.into(),
        }
    }
}

/// Terminal status of a whole graph run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a single node execution.
///
/// `Empty` marks a successful execution that produced no usable evidence
/// (for example a retrieval that returned zero hits). It is not an
/// error; downstream nodes decide how to react to it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    #[default]
    Ok,
    Empty,
    Error,
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Empty => write!(f, "empty"),
            Self::Error => write!(f, "error"),
        }
    }
}
