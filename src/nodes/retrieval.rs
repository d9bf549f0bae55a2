//! Evidence gathering node.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use crate::node::{Node, NodeContext, NodeError, NodePartial};
use crate::nodes::keys;
use crate::retrieval::{build_context, Filter, RetrievalFusionEngine, RetrievalRequest};
use crate::state::StateSnapshot;
use crate::types::NodeOutcome;

/// Retrieves evidence for the run's query and assembles prompt context.
///
/// Inside a map branch, `branch_filter_field` narrows the search to the
/// branch's slice of the corpus (the branch key as an equality clause).
/// An empty retrieval is not an error: the node reports
/// [`NodeOutcome::Empty`] and sets the insufficient-context flag that
/// widens the next retrieval.
pub struct RetrievalNode {
    engine: Arc<RetrievalFusionEngine>,
    k_base: usize,
    k_final: usize,
    base_filter: Filter,
    /// Payload field matched against the branch key inside fan-outs.
    branch_filter_field: Option<String>,
    max_context_chars: usize,
}

impl RetrievalNode {
    #[must_use]
    pub fn new(
        engine: Arc<RetrievalFusionEngine>,
        k_base: usize,
        k_final: usize,
        max_context_chars: usize,
    ) -> Self {
        Self {
            engine,
            k_base,
            k_final,
            base_filter: Filter::default(),
            branch_filter_field: None,
            max_context_chars,
        }
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.base_filter = filter;
        self
    }

    #[must_use]
    pub fn with_branch_filter_field(mut self, field: impl Into<String>) -> Self {
        self.branch_filter_field = Some(field.into());
        self
    }
}

#[async_trait]
impl Node for RetrievalNode {
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        let query = snapshot
            .query()
            .ok_or(NodeError::MissingInput { what: "query" })?
            .to_string();

        let mut filter = self.base_filter.clone();
        if let (Some(field), Some(key)) = (&self.branch_filter_field, &ctx.branch_key) {
            filter = filter.must_equal(field.clone(), json!(key));
        }

        let widen_hint = snapshot
            .extra
            .get(keys::INSUFFICIENT_CONTEXT)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        let request = RetrievalRequest::new(query.clone(), self.k_base, self.k_final)
            .with_filter(filter)
            .with_widen_hint(widen_hint);

        let started = Instant::now();
        let outcome = self.engine.retrieve(&request).await;
        let context = build_context(&outcome.hits, self.max_context_chars);

        ctx.record(
            ctx.event("retrieve")
                .with_query(query)
                .with_duration_ms(started.elapsed().as_millis() as u64)
                .with_retrieval(outcome.clone())
                .with_metadata("sufficiency", json!(context.sufficiency))
                .with_metadata("refs", json!(context.refs)),
        )
        .await;

        let node_outcome = if outcome.is_empty() {
            NodeOutcome::Empty
        } else {
            NodeOutcome::Ok
        };

        Ok(NodePartial::new()
            .with_extra_entry(keys::CONTEXT, json!(context.text))
            .with_extra_entry(keys::CONTEXT_REFS, json!(context.refs))
            .with_extra_entry(keys::SUFFICIENCY, json!(context.sufficiency))
            .with_extra_entry(
                keys::INSUFFICIENT_CONTEXT,
                json!(!context.sufficiency.is_sufficient()),
            )
            .with_outcome(node_outcome))
    }
}
