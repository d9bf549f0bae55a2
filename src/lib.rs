//! # Ragweave: Retrieval-then-Generation Pipeline Core
//!
//! Ragweave executes retrieval-augmented generation pipelines as typed
//! node graphs with versioned state, barrier-merged supersteps, and
//! append-only run telemetry.
//!
//! ## Core Concepts
//!
//! - **Nodes**: Async units of work that read a state snapshot and
//!   return a partial update
//! - **State**: Three versioned channels (extras, per-branch outputs,
//!   warnings) merged once per superstep
//! - **Graph**: Declarative topology with static, conditional, and
//!   retry edges plus map fan-out policies
//! - **Runner**: The superstep loop; scheduling, retries, fan-out, and
//!   the barrier merge
//! - **Governor**: Per-class concurrency limits, timeouts, and a
//!   circuit breaker in front of every backend call
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ragweave::config::PipelineConfig;
//! use ragweave::governor::ConcurrencyGovernor;
//! use ragweave::graph::GraphBuilder;
//! use ragweave::node::{Node, NodeContext, NodeError, NodePartial};
//! use ragweave::recorder::EventRecorder;
//! use ragweave::runner::{GraphRunner, RunInput};
//! use ragweave::state::{PipelineState, StateSnapshot};
//! use ragweave::types::NodeKind;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl Node for Echo {
//!     async fn run(
//!         &self,
//!         snapshot: StateSnapshot,
//!         _ctx: NodeContext,
//!     ) -> Result<NodePartial, NodeError> {
//!         let query = snapshot.query().unwrap_or_default().to_string();
//!         Ok(NodePartial::new().with_extra_entry("echo", query.into()))
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::from_env();
//! let graph = GraphBuilder::new("echo")
//!     .add_node(NodeKind::Custom("echo".into()), Echo)
//!     .add_edge(NodeKind::Start, NodeKind::Custom("echo".into()))
//!     .add_edge(NodeKind::Custom("echo".into()), NodeKind::End)
//!     .compile()?;
//!
//! let runner = GraphRunner::new(
//!     EventRecorder::new(),
//!     Arc::new(ConcurrencyGovernor::new(&config.governor)),
//!     config.runner,
//! );
//! let report = runner
//!     .execute(
//!         &graph,
//!         RunInput::new("req-1", "g-1", PipelineState::new_with_query("hello")),
//!     )
//!     .await?;
//! assert_eq!(report.status, ragweave::types::RunStatus::Completed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`types`] - Node identifiers and the correlation-id triple
//! - [`state`] - Versioned state channels and snapshots
//! - [`node`] - Node trait, execution context, partial updates
//! - [`nodes`] - The retrieval / generation / decision node variants
//! - [`graph`] - Graph construction, policies, compile-time validation
//! - [`runner`] - Superstep execution, retries, map fan-out
//! - [`reducers`] - Barrier-side state merge strategies
//! - [`governor`] - Concurrency limits, timeouts, circuit breaking
//! - [`retrieval`] - Rank fusion, reranking, adaptive widening
//! - [`consistency`] - Cross-candidate agreement checking
//! - [`recorder`] - Append-only, correlated event recording
//! - [`backends`] - Traits for search, embedding, and generation
//! - [`config`] - Defaults and environment overlays

pub mod backends;
pub mod config;
pub mod consistency;
pub mod governor;
pub mod graph;
pub mod node;
pub mod nodes;
pub mod recorder;
pub mod reducers;
pub mod retrieval;
pub mod runner;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod utils;
