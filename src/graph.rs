//! Graph construction and compilation.
//!
//! [`GraphBuilder`] is the fluent API for declaring a pipeline: nodes,
//! static and conditional edges, per-node policies (best-effort, map
//! fan-out, retry edges). [`GraphBuilder::compile`] validates the
//! topology and produces an immutable [`Graph`] for the runner.
//!
//! `NodeKind::Start` and `NodeKind::End` are virtual endpoints: they are
//! never registered as nodes, only referenced by edges.

use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use crate::node::{Node, NodePartial};
use crate::state::StateSnapshot;
use crate::types::NodeKind;

/// Predicate for conditional routing.
///
/// Evaluated against the post-barrier snapshot; returns the target node
/// names to schedule next (use [`NodeKind::end_target`] to route to End).
pub type EdgePredicate = Arc<dyn Fn(StateSnapshot) -> Vec<String> + Send + Sync + 'static>;

/// A conditional edge routing to predicate-chosen targets.
#[derive(Clone)]
pub struct ConditionalEdge {
    from: NodeKind,
    predicate: EdgePredicate,
}

impl ConditionalEdge {
    pub fn new(from: impl Into<NodeKind>, predicate: EdgePredicate) -> Self {
        Self {
            from: from.into(),
            predicate,
        }
    }

    #[must_use]
    pub fn from(&self) -> &NodeKind {
        &self.from
    }

    #[must_use]
    pub fn predicate(&self) -> &EdgePredicate {
        &self.predicate
    }
}

/// Decides, from the node's own partial, whether a retry edge fires.
pub type RetryTrigger = Arc<dyn Fn(&NodePartial) -> bool + Send + Sync + 'static>;

/// Produces the extra patch merged into the snapshot the retried attempt
/// sees. Receives the failed attempt's partial and the 1-based number of
/// the attempt about to run.
pub type RetryAdjust =
    Arc<dyn Fn(&NodePartial, u32) -> FxHashMap<String, Value> + Send + Sync + 'static>;

/// Hard cap on retries per retry edge; retry is an escape hatch, not a
/// loop construct.
pub const MAX_RETRY_LIMIT: u32 = 2;

/// A declared retry edge on a node.
///
/// When the trigger matches the node's partial, the runner re-enters the
/// node with the adjust patch applied, at most `max_retries` times.
/// Exhausted retries proceed with the last partial plus a warning.
#[derive(Clone)]
pub struct RetryEdge {
    pub max_retries: u32,
    pub trigger: RetryTrigger,
    pub adjust: RetryAdjust,
}

impl RetryEdge {
    pub fn new(max_retries: u32, trigger: RetryTrigger, adjust: RetryAdjust) -> Self {
        Self {
            max_retries,
            trigger,
            adjust,
        }
    }
}

/// Fan-out declaration for a map node.
///
/// The runner reads the string array at `items_key` from the snapshot
/// and runs one branch per element, keyed by the element itself.
#[derive(Clone, Debug)]
pub struct MapPolicy {
    /// Extra-channel key holding the items array.
    pub items_key: String,
    /// Branch concurrency; the runner's default applies when `None`.
    pub max_concurrency: Option<usize>,
    /// Per-branch timeout; the runner's default applies when `None`.
    pub branch_timeout: Option<Duration>,
}

impl MapPolicy {
    #[must_use]
    pub fn new(items_key: impl Into<String>) -> Self {
        Self {
            items_key: items_key.into(),
            max_concurrency: None,
            branch_timeout: None,
        }
    }

    #[must_use]
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    #[must_use]
    pub fn with_branch_timeout(mut self, timeout: Duration) -> Self {
        self.branch_timeout = Some(timeout);
        self
    }
}

/// Per-node execution policy.
#[derive(Clone, Default)]
pub struct NodePolicy {
    /// On failure, substitute an empty partial plus warning instead of
    /// failing the run.
    pub best_effort: bool,
    /// Fan this node out over an items array.
    pub map: Option<MapPolicy>,
    /// Bounded re-entry driven by the node's own output.
    pub retry: Option<RetryEdge>,
}

impl NodePolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    #[must_use]
    pub fn with_map(mut self, map: MapPolicy) -> Self {
        self.map = Some(map);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryEdge) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Structural problems rejected at compile time.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphValidationError {
    #[error("graph has no nodes")]
    #[diagnostic(code(ragweave::graph::empty))]
    Empty,

    #[error("no edge originates from Start")]
    #[diagnostic(
        code(ragweave::graph::no_entry),
        help("Add at least one edge from NodeKind::Start.")
    )]
    NoEntry,

    #[error("edge references unknown node: {name}")]
    #[diagnostic(
        code(ragweave::graph::unknown_target),
        help("Register the node with add_node before wiring edges to it.")
    )]
    UnknownTarget { name: String },

    #[error("edge targets the virtual Start node")]
    #[diagnostic(code(ragweave::graph::edge_into_start))]
    EdgeIntoStart,

    #[error("static edges form a cycle through node: {name}")]
    #[diagnostic(
        code(ragweave::graph::cycle),
        help("Loops are expressed as retry edges, never as static cycles.")
    )]
    Cycle { name: String },

    #[error("retry edge on {node} allows {requested} retries; the limit is {MAX_RETRY_LIMIT}")]
    #[diagnostic(code(ragweave::graph::retry_limit))]
    RetryLimit { node: String, requested: u32 },
}

/// Fluent builder for pipeline graphs.
///
/// # Examples
///
/// ```
/// use ragweave::graph::GraphBuilder;
/// use ragweave::types::NodeKind;
///
/// # struct MyNode;
/// # #[async_trait::async_trait]
/// # impl ragweave::node::Node for MyNode {
/// #     async fn run(&self, _: ragweave::state::StateSnapshot, _: ragweave::node::NodeContext) -> Result<ragweave::node::NodePartial, ragweave::node::NodeError> {
/// #         Ok(ragweave::node::NodePartial::default())
/// #     }
/// # }
/// let graph = GraphBuilder::new("example")
///     .add_node(NodeKind::Custom("work".into()), MyNode)
///     .add_edge(NodeKind::Start, NodeKind::Custom("work".into()))
///     .add_edge(NodeKind::Custom("work".into()), NodeKind::End)
///     .compile()
///     .unwrap();
/// assert_eq!(graph.name(), "example");
/// ```
pub struct GraphBuilder {
    name: String,
    nodes: FxHashMap<NodeKind, Arc<dyn Node>>,
    policies: FxHashMap<NodeKind, NodePolicy>,
    edges: FxHashMap<NodeKind, Vec<NodeKind>>,
    conditional_edges: Vec<ConditionalEdge>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: FxHashMap::default(),
            policies: FxHashMap::default(),
            edges: FxHashMap::default(),
            conditional_edges: Vec::new(),
        }
    }

    /// Registers a node with the default policy.
    ///
    /// Registration of the virtual Start/End kinds is ignored with a
    /// warning; they exist only for topology.
    #[must_use]
    pub fn add_node(self, id: NodeKind, node: impl Node + 'static) -> Self {
        self.add_node_with_policy(id, node, NodePolicy::default())
    }

    /// Registers a node with an explicit policy.
    #[must_use]
    pub fn add_node_with_policy(
        mut self,
        id: NodeKind,
        node: impl Node + 'static,
        policy: NodePolicy,
    ) -> Self {
        match id {
            NodeKind::Start | NodeKind::End => {
                tracing::warn!(?id, "ignoring registration of virtual node kind");
            }
            _ => {
                self.nodes.insert(id.clone(), Arc::new(node));
                self.policies.insert(id, policy);
            }
        }
        self
    }

    /// Adds an unconditional edge. Multiple edges from one node fan out;
    /// multiple edges into one node fan in.
    #[must_use]
    pub fn add_edge(mut self, from: NodeKind, to: NodeKind) -> Self {
        self.edges.entry(from).or_default().push(to);
        self
    }

    /// Adds a conditional edge evaluated against the post-barrier
    /// snapshot.
    #[must_use]
    pub fn add_conditional_edge(mut self, from: NodeKind, predicate: EdgePredicate) -> Self {
        self.conditional_edges
            .push(ConditionalEdge { from, predicate });
        self
    }

    /// Validates the topology and produces an executable [`Graph`].
    pub fn compile(self) -> Result<Graph, GraphValidationError> {
        if self.nodes.is_empty() {
            return Err(GraphValidationError::Empty);
        }
        if self
            .edges
            .get(&NodeKind::Start)
            .is_none_or(|targets| targets.is_empty())
        {
            return Err(GraphValidationError::NoEntry);
        }

        for (from, targets) in &self.edges {
            if !from.is_start() && !self.nodes.contains_key(from) {
                return Err(GraphValidationError::UnknownTarget {
                    name: from.as_label().to_string(),
                });
            }
            for to in targets {
                if to.is_start() {
                    return Err(GraphValidationError::EdgeIntoStart);
                }
                if !to.is_end() && !self.nodes.contains_key(to) {
                    return Err(GraphValidationError::UnknownTarget {
                        name: to.as_label().to_string(),
                    });
                }
            }
        }
        for edge in &self.conditional_edges {
            if !edge.from.is_start() && !self.nodes.contains_key(&edge.from) {
                return Err(GraphValidationError::UnknownTarget {
                    name: edge.from.as_label().to_string(),
                });
            }
        }

        for (id, policy) in &self.policies {
            if let Some(retry) = &policy.retry
                && retry.max_retries > MAX_RETRY_LIMIT
            {
                return Err(GraphValidationError::RetryLimit {
                    node: id.as_label().to_string(),
                    requested: retry.max_retries,
                });
            }
        }

        self.check_acyclic()?;

        Ok(Graph {
            name: self.name,
            nodes: self.nodes,
            policies: self.policies,
            edges: self.edges,
            conditional_edges: self.conditional_edges,
        })
    }

    /// DFS over static edges; conditional targets are not walked because
    /// predicates route, they do not add topology.
    fn check_acyclic(&self) -> Result<(), GraphValidationError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks: FxHashMap<&NodeKind, Mark> = self
            .edges
            .keys()
            .chain(self.nodes.keys())
            .map(|k| (k, Mark::Unvisited))
            .collect();

        fn visit<'a>(
            node: &'a NodeKind,
            edges: &'a FxHashMap<NodeKind, Vec<NodeKind>>,
            marks: &mut FxHashMap<&'a NodeKind, Mark>,
        ) -> Result<(), GraphValidationError> {
            match marks.get(node).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return Ok(()),
                Mark::InProgress => {
                    return Err(GraphValidationError::Cycle {
                        name: node.as_label().to_string(),
                    });
                }
                Mark::Unvisited => {}
            }
            marks.insert(node, Mark::InProgress);
            if let Some(targets) = edges.get(node) {
                for to in targets {
                    if !to.is_end() {
                        visit(to, edges, marks)?;
                    }
                }
            }
            marks.insert(node, Mark::Done);
            Ok(())
        }

        let roots: Vec<&NodeKind> = marks.keys().copied().collect();
        for root in roots {
            visit(root, &self.edges, &mut marks)?;
        }
        Ok(())
    }
}

/// A compiled, validated pipeline graph.
#[derive(Clone)]
pub struct Graph {
    name: String,
    nodes: FxHashMap<NodeKind, Arc<dyn Node>>,
    policies: FxHashMap<NodeKind, NodePolicy>,
    edges: FxHashMap<NodeKind, Vec<NodeKind>>,
    conditional_edges: Vec<ConditionalEdge>,
}

// Nodes are trait objects, so Debug reports the shape, not the contents.
impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.values().map(Vec::len).sum::<usize>())
            .field("conditional_edges", &self.conditional_edges.len())
            .finish_non_exhaustive()
    }
}

impl Graph {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn node(&self, id: &NodeKind) -> Option<&Arc<dyn Node>> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn policy(&self, id: &NodeKind) -> Option<&NodePolicy> {
        self.policies.get(id)
    }

    #[must_use]
    pub fn edges_from(&self, id: &NodeKind) -> &[NodeKind] {
        self.edges.get(id).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn conditional_edges_from(&self, id: &NodeKind) -> Vec<&ConditionalEdge> {
        self.conditional_edges
            .iter()
            .filter(|edge| edge.from() == id)
            .collect()
    }

    #[must_use]
    pub fn contains(&self, id: &NodeKind) -> bool {
        self.nodes.contains_key(id)
    }
}
