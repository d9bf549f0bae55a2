//! Minimal nodes for exercising the runner.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use ragweave::node::{BackendFailure, Node, NodeContext, NodeError, NodePartial};
use ragweave::state::StateSnapshot;

/// Writes one extra entry and succeeds.
pub struct WriteExtra {
    pub key: &'static str,
    pub value: serde_json::Value,
}

#[async_trait]
impl Node for WriteExtra {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        _ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        Ok(NodePartial::new().with_extra_entry(self.key, self.value.clone()))
    }
}

/// Records the attempt number it ran with and echoes the retry hint it
/// saw in the snapshot.
pub struct AttemptProbe;

#[async_trait]
impl Node for AttemptProbe {
    async fn run(
        &self,
        snapshot: StateSnapshot,
        ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        let mut partial = NodePartial::new().with_extra_entry("attempt", json!(ctx.attempt));
        if let Some(hint) = snapshot.extra.get("hint") {
            partial = partial.with_extra_entry("seen_hint", hint.clone());
        }
        Ok(partial)
    }
}

/// Always fails with a non-backend error.
pub struct AlwaysFails;

#[async_trait]
impl Node for AlwaysFails {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        _ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        Err(NodeError::ValidationFailed("deliberate failure".into()))
    }
}

/// Fails with a backend-classified error the first `failures` calls,
/// then succeeds.
pub struct FlakyNode {
    failures: AtomicUsize,
}

impl FlakyNode {
    pub fn new(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl Node for FlakyNode {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(NodeError::Backend {
                kind: BackendFailure::Unavailable,
                message: "transient outage".into(),
            });
        }
        Ok(NodePartial::new().with_extra_entry("recovered_on_attempt", json!(ctx.attempt)))
    }
}

/// Counts how many copies of itself run at once; `hold` keeps each run
/// alive long enough for the overlap to register.
pub struct ConcurrencyProbe {
    pub active: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
    pub hold: Duration,
}

#[async_trait]
impl Node for ConcurrencyProbe {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(NodePartial::new().with_branch(json!({
            "done": ctx.branch_key,
        })))
    }
}

/// Branch-aware node: answers for its branch key, or fails on the key
/// named in `poison`.
pub struct BranchAnswer {
    pub poison: Option<&'static str>,
}

#[async_trait]
impl Node for BranchAnswer {
    async fn run(
        &self,
        _snapshot: StateSnapshot,
        ctx: NodeContext,
    ) -> Result<NodePartial, NodeError> {
        let key = ctx.branch_key.clone().unwrap_or_default();
        if Some(key.as_str()) == self.poison {
            return Err(NodeError::ValidationFailed(format!(
                "branch {key} cannot answer"
            )));
        }
        Ok(NodePartial::new().with_branch(json!({
            "answer": format!("answer from {key}"),
            "perspective": key,
        })))
    }
}
