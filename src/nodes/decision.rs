//! Consistency gate node.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::consistency::{ConsistencyChecker, ConsistencyError};
use crate::node::{BackendFailure, Node, NodeContext, NodeError, NodePartial};
use crate::nodes::keys;
use crate::state::StateSnapshot;

/// Where a decision node finds its candidate answers.
#[derive(Clone, Debug)]
pub enum CandidateSource {
    /// The `answer` field of every branch output.
    Branches,
    /// A string array under this extra-channel key.
    ExtraKey(String),
}

/// Checks generated candidates for agreement and publishes the verdict.
///
/// Downstream conditional edges and retry triggers read the divergence
/// flag; the node itself never decides what happens next.
pub struct DecisionNode {
    checker: Arc<ConsistencyChecker>,
    source: CandidateSource,
}

impl DecisionNode {
    #[must_use]
    pub fn new(checker: Arc<ConsistencyChecker>, source: CandidateSource) -> Self {
        Self { checker, source }
    }

    fn candidates(&self, snapshot: &StateSnapshot) -> Vec<String> {
        match &self.source {
            CandidateSource::Branches => {
                // Key order is irrelevant: the checker is permutation-stable.
                snapshot
                    .branches
                    .values()
                    .filter_map(|value| value.get("answer").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            }
            CandidateSource::ExtraKey(key) => snapshot
                .extra
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Node for DecisionNode {
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        let candidates = self.candidates(&snapshot);

        let started = Instant::now();
        let verdict = self
            .checker
            .check(&candidates)
            .await
            .map_err(|err| match err {
                ConsistencyError::Embedding { message } => NodeError::Backend {
                    kind: BackendFailure::Unavailable,
                    message,
                },
                other @ ConsistencyError::EmbeddingShape { .. } => NodeError::Backend {
                    kind: BackendFailure::Unavailable,
                    message: other.to_string(),
                },
            })?;

        ctx.record(
            ctx.event("judge")
                .with_duration_ms(started.elapsed().as_millis() as u64)
                .with_consistency(verdict.clone())
                .with_metadata("candidates", json!(candidates.len())),
        )
        .await;

        Ok(NodePartial::new()
            .with_extra_entry(keys::CONSISTENCY, serde_json::to_value(&verdict)?)
            .with_extra_entry(keys::DIVERGENT, json!(verdict.divergent)))
    }
}
