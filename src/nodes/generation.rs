//! Answer generation node.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::backends::{ChatMessage, GenerationBackend};
use crate::governor::ResourceClass;
use crate::node::{Node, NodeContext, NodeError, NodePartial};
use crate::nodes::keys;
use crate::state::StateSnapshot;

/// One governed chat-completion call over the assembled context.
///
/// Inside a map branch the answer lands in the branch's own slot (as
/// `{"answer": ..., "perspective": <branch key>}`); outside, it lands
/// under the answer key in the extra channel. Backend failures map to
/// [`NodeError::Backend`], making them eligible for the runner's single
/// backoff retry.
pub struct GenerationNode {
    generation: Arc<dyn GenerationBackend>,
    system_prompt: String,
    timeout: Duration,
}

impl GenerationNode {
    #[must_use]
    pub fn new(
        generation: Arc<dyn GenerationBackend>,
        system_prompt: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            generation,
            system_prompt: system_prompt.into(),
            timeout,
        }
    }

    fn build_prompt(&self, snapshot: &StateSnapshot, ctx: &NodeContext) -> Vec<ChatMessage> {
        let query = snapshot.query().unwrap_or_default();
        let context = snapshot
            .extra
            .get(keys::CONTEXT)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();

        let mut system = self.system_prompt.clone();
        if let Some(key) = &ctx.branch_key {
            system.push_str(&format!("\nAnswer from the perspective named: {key}."));
        }
        if context.is_empty() {
            system.push_str(
                "\nNo supporting context was retrieved. Say so if you cannot answer reliably.",
            );
        }

        let user = if context.is_empty() {
            query.to_string()
        } else {
            format!("Context:\n{context}\n\nQuestion: {query}")
        };

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }
}

#[async_trait]
impl Node for GenerationNode {
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        if snapshot.query().is_none() {
            return Err(NodeError::MissingInput { what: "query" });
        }
        let messages = self.build_prompt(&snapshot, &ctx);

        let started = Instant::now();
        let answer = ctx
            .governor
            .run_under(
                ResourceClass::Generation,
                self.timeout,
                self.generation.complete(&messages),
            )
            .await
            .map_err(NodeError::from_governor)?;

        ctx.record(
            ctx.event("generate")
                .with_prompt(messages.last().map(|m| m.content.clone()).unwrap_or_default())
                .with_response(answer.clone())
                .with_duration_ms(started.elapsed().as_millis() as u64),
        )
        .await;

        let partial = match &ctx.branch_key {
            Some(key) => NodePartial::new().with_branch(json!({
                "answer": answer,
                "perspective": key,
            })),
            None => NodePartial::new().with_extra_entry(keys::ANSWER, json!(answer)),
        };
        Ok(partial)
    }
}
