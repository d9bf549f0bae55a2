//! Superstep execution engine.
//!
//! [`GraphRunner::execute`] drives a compiled [`Graph`] to completion:
//! each superstep runs the frontier nodes concurrently, applies one
//! barrier merge through the reducer registry, then computes the next
//! frontier from static and conditional edges. Map nodes fan out one
//! branch per item under a semaphore; retry edges re-enter a node inside
//! its attempt loop, so the barrier only ever sees final partials.
//!
//! Every node execution, including each retry attempt, appends one
//! [`NodeRun`] to the report's ledger; entries are never mutated.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, instrument, warn, Instrument};

use crate::config::RunnerConfig;
use crate::governor::ConcurrencyGovernor;
use crate::graph::{Graph, NodePolicy};
use crate::node::{Node, NodeContext, NodeError, NodePartial};
use crate::recorder::{EventRecorder, GraphEvent};
use crate::reducers::{ReducerRegistry, StateDelta};
use crate::state::{PipelineState, StateSnapshot};
use crate::types::{CorrelationIds, NodeKind, NodeOutcome, RunStatus};
use crate::utils::id_generator::IdGenerator;

/// Input for one graph invocation.
#[derive(Clone, Debug)]
pub struct RunInput {
    pub request_id: String,
    pub graph_id: String,
    pub initial_state: PipelineState,
}

impl RunInput {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        graph_id: impl Into<String>,
        initial_state: PipelineState,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            graph_id: graph_id.into(),
            initial_state,
        }
    }
}

/// One entry in the execution ledger: a single attempt of a single node.
///
/// Retries append new entries; nothing is ever rewritten.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRun {
    pub run_id: String,
    pub node_name: String,
    pub branch_key: Option<String>,
    /// 1-based attempt number within this node's execution.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: NodeOutcome,
}

/// The result of one graph invocation.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub request_id: String,
    pub graph_id: String,
    pub graph_name: String,
    pub status: RunStatus,
    /// Detail of the error that failed the run, when `status` is Failed.
    pub error_detail: Option<String>,
    pub state: PipelineState,
    pub node_runs: Vec<NodeRun>,
    pub steps: u64,
}

impl RunReport {
    /// Ledger entries for one node, in attempt order.
    #[must_use]
    pub fn runs_for(&self, node_name: &str) -> Vec<&NodeRun> {
        self.node_runs
            .iter()
            .filter(|run| run.node_name == node_name)
            .collect()
    }
}

/// Errors that abort execution before or outside node semantics.
///
/// A required node failing mid-run does not surface here; it terminates
/// the run with [`RunStatus::Failed`] and the detail on the report, so
/// the ledger survives.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("validation failed: {reason}")]
    #[diagnostic(
        code(ragweave::runner::validation),
        help("Check request/graph ids and the initial state for map nodes.")
    )]
    Validation { reason: String },

    #[error("node task join error: {0}")]
    #[diagnostic(code(ragweave::runner::join))]
    Join(#[from] JoinError),

    #[error("run exceeded {max_steps} supersteps")]
    #[diagnostic(
        code(ragweave::runner::step_budget),
        help("A conditional edge is probably routing in a loop.")
    )]
    StepBudget { max_steps: u64 },
}

/// Everything one spawned node execution needs, owned.
struct NodeTask {
    node: Arc<dyn Node>,
    kind: NodeKind,
    policy: NodePolicy,
    snapshot: StateSnapshot,
    step: u64,
    graph_name: String,
    base_ids: CorrelationIds,
    recorder: EventRecorder,
    governor: Arc<ConcurrencyGovernor>,
    config: RunnerConfig,
    ids: IdGenerator,
}

/// Outcome of one node execution (all attempts, all branches).
struct NodeExecution {
    kind: NodeKind,
    /// `(branch_key, partial)` pairs; branch key is `None` outside maps.
    partials: Vec<(Option<String>, NodePartial)>,
    runs: Vec<NodeRun>,
    warnings: Vec<String>,
    /// Set when a required (non-best-effort) node failed.
    fatal: Option<NodeError>,
}

/// Drives compiled graphs to completion.
///
/// One runner can execute any number of graphs; per-run state lives on
/// the stack of [`execute`](Self::execute).
pub struct GraphRunner {
    recorder: EventRecorder,
    governor: Arc<ConcurrencyGovernor>,
    reducers: ReducerRegistry,
    config: RunnerConfig,
    ids: IdGenerator,
}

impl GraphRunner {
    #[must_use]
    pub fn new(
        recorder: EventRecorder,
        governor: Arc<ConcurrencyGovernor>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            recorder,
            governor,
            reducers: ReducerRegistry::default(),
            config,
            ids: IdGenerator::new(),
        }
    }

    /// Executes `graph` to completion.
    ///
    /// Fails fast with [`GraphError::Validation`] before any node runs;
    /// afterwards a required node error terminates the run with
    /// [`RunStatus::Failed`] on the report rather than an `Err`, so the
    /// ledger and partial state remain inspectable.
    #[instrument(skip(self, graph, input), fields(graph = graph.name(), graph_id = %input.graph_id))]
    pub async fn execute(&self, graph: &Graph, input: RunInput) -> Result<RunReport, GraphError> {
        self.validate(graph, &input)?;

        let run_ids = CorrelationIds::new(
            input.request_id.clone(),
            input.graph_id.clone(),
            self.ids.run_id(),
        );
        info!(request_id = %input.request_id, "graph run started");
        self.recorder
            .record(GraphEvent::new(run_ids.clone(), graph.name(), "run_started"))
            .await;

        let mut state = input.initial_state;
        let mut frontier: Vec<NodeKind> = graph.edges_from(&NodeKind::Start).to_vec();
        let mut node_runs: Vec<NodeRun> = Vec::new();
        let mut step: u64 = 0;

        while !frontier.is_empty() && !frontier.iter().all(NodeKind::is_end) {
            step += 1;
            if step > self.config.max_steps {
                return Err(GraphError::StepBudget {
                    max_steps: self.config.max_steps,
                });
            }

            debug!(step, frontier = ?frontier, "starting superstep");
            let span = tracing::info_span!("superstep", step, frontier_len = frontier.len());
            let executions = self
                .run_frontier(graph, &frontier, &state, step, &run_ids)
                .instrument(span)
                .await?;

            // One of the frontier's required nodes failed: terminate.
            for execution in &executions {
                node_runs.extend(execution.runs.iter().cloned());
            }
            if let Some(failed) = executions.iter().find(|e| e.fatal.is_some()) {
                let detail = failed
                    .fatal
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                warn!(node = %failed.kind, error = %detail, "required node failed; run failed");
                self.recorder
                    .record(
                        GraphEvent::new(run_ids.clone(), graph.name(), "run_failed")
                            .with_node(failed.kind.as_label())
                            .with_metadata("error", Value::String(detail.clone())),
                    )
                    .await;
                return Ok(RunReport {
                    request_id: input.request_id,
                    graph_id: input.graph_id,
                    graph_name: graph.name().to_string(),
                    status: RunStatus::Failed,
                    error_detail: Some(detail),
                    state,
                    node_runs,
                    steps: step,
                });
            }

            self.apply_barrier(&mut state, &executions);

            let ran: Vec<NodeKind> = executions.iter().map(|e| e.kind.clone()).collect();
            frontier = self.compute_next_frontier(graph, &ran, &state, step);
            debug!(step, next_frontier = ?frontier, "computed next frontier");
        }

        info!(steps = step, "graph run completed");
        self.recorder
            .record(
                GraphEvent::new(run_ids, graph.name(), "run_completed")
                    .with_metadata("steps", Value::from(step)),
            )
            .await;

        Ok(RunReport {
            request_id: input.request_id,
            graph_id: input.graph_id,
            graph_name: graph.name().to_string(),
            status: RunStatus::Completed,
            error_detail: None,
            state,
            node_runs,
            steps: step,
        })
    }

    /// Fail-fast checks before any node runs.
    fn validate(&self, graph: &Graph, input: &RunInput) -> Result<(), GraphError> {
        if input.request_id.trim().is_empty() {
            return Err(GraphError::Validation {
                reason: "request_id is empty".into(),
            });
        }
        if input.graph_id.trim().is_empty() {
            return Err(GraphError::Validation {
                reason: "graph_id is empty".into(),
            });
        }
        // Map nodes entered directly from Start need their items array
        // in the initial state.
        let snapshot = input.initial_state.snapshot();
        for target in graph.edges_from(&NodeKind::Start) {
            if let Some(policy) = graph.policy(target)
                && let Some(map) = &policy.map
            {
                let valid = snapshot
                    .extra
                    .get(&map.items_key)
                    .and_then(Value::as_array)
                    .is_some_and(|items| items.iter().all(Value::is_string));
                if !valid {
                    return Err(GraphError::Validation {
                        reason: format!(
                            "map node {} expects a string array at extra key '{}'",
                            target.as_label(),
                            map.items_key
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs every frontier node concurrently; results come back in
    /// frontier order for deterministic barrier application.
    async fn run_frontier(
        &self,
        graph: &Graph,
        frontier: &[NodeKind],
        state: &PipelineState,
        step: u64,
        run_ids: &CorrelationIds,
    ) -> Result<Vec<NodeExecution>, GraphError> {
        let snapshot = state.snapshot();
        let mut set: JoinSet<(usize, NodeExecution)> = JoinSet::new();
        let mut scheduled = 0usize;

        for (index, kind) in frontier.iter().enumerate() {
            if kind.is_end() {
                continue;
            }
            let Some(node) = graph.node(kind) else {
                // Compile validation makes this unreachable for static
                // edges; conditional predicates are checked at routing.
                warn!(node = %kind, "frontier entry has no registered node; skipping");
                continue;
            };
            let task = NodeTask {
                node: Arc::clone(node),
                kind: kind.clone(),
                policy: graph.policy(kind).cloned().unwrap_or_default(),
                snapshot: snapshot.clone(),
                step,
                graph_name: graph.name().to_string(),
                base_ids: run_ids.clone(),
                recorder: self.recorder.clone(),
                governor: Arc::clone(&self.governor),
                config: self.config.clone(),
                ids: self.ids,
            };
            scheduled += 1;
            set.spawn(async move { (index, execute_node(task).await) });
        }

        let mut indexed: Vec<(usize, NodeExecution)> = Vec::with_capacity(scheduled);
        while let Some(joined) = set.join_next().await {
            indexed.push(joined?);
        }
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, execution)| execution).collect())
    }

    /// Aggregates the frontier's partials into one delta and applies it,
    /// bumping the version of each channel that changed.
    fn apply_barrier(&self, state: &mut PipelineState, executions: &[NodeExecution]) {
        let mut delta = StateDelta::default();
        for execution in executions {
            // Extras merge in deterministic key order within each node.
            for (branch_key, partial) in &execution.partials {
                if let Some(extra) = &partial.extra {
                    let mut keys: Vec<&String> = extra.keys().collect();
                    keys.sort();
                    for key in keys {
                        delta.extra.insert(key.clone(), extra[key].clone());
                    }
                }
                if let (Some(key), Some(value)) = (branch_key, &partial.branch) {
                    delta.branches.insert(key.clone(), value.clone());
                }
                if let Some(warnings) = &partial.warnings {
                    delta.warnings.extend(warnings.iter().cloned());
                }
            }
            delta.warnings.extend(execution.warnings.iter().cloned());
        }

        if delta.is_empty() {
            return;
        }
        if let Err(err) = self.reducers.apply_all(state, &delta) {
            warn!(error = %err, "reducer application failed; delta dropped");
            return;
        }
        if !delta.extra.is_empty() {
            state.extra.bump_version();
        }
        if !delta.branches.is_empty() {
            state.branches.bump_version();
        }
        if !delta.warnings.is_empty() {
            state.warnings.bump_version();
        }
    }

    /// Static edges plus conditional-edge routing on the post-barrier
    /// snapshot, deduplicated in evaluation order.
    fn compute_next_frontier(
        &self,
        graph: &Graph,
        ran: &[NodeKind],
        state: &PipelineState,
        step: u64,
    ) -> Vec<NodeKind> {
        let snapshot = state.snapshot();
        let mut next: Vec<NodeKind> = Vec::new();

        for id in ran {
            let mut targets: Vec<NodeKind> = graph.edges_from(id).to_vec();

            for edge in graph.conditional_edges_from(id) {
                debug!(from = %id, step, "evaluating conditional edge");
                for name in (edge.predicate())(snapshot.clone()) {
                    targets.push(NodeKind::from(name.as_str()));
                }
            }

            for target in targets {
                let valid = target.is_end() || graph.contains(&target);
                if !valid {
                    warn!(step, origin = %id, target = %target, "frontier target not found; skipping");
                    continue;
                }
                if target.is_start() {
                    warn!(step, origin = %id, "conditional edge routed to Start; skipping");
                    continue;
                }
                if !next.contains(&target) {
                    next.push(target);
                }
            }
        }

        next
    }
}

/// Runs one node: either a single attempt loop or a map fan-out.
async fn execute_node(task: NodeTask) -> NodeExecution {
    match task.policy.map.clone() {
        Some(map) => execute_map_node(task, map).await,
        None => {
            let (partial, runs, warnings, fatal) =
                attempt_loop(&task, None, task.snapshot.clone()).await;
            NodeExecution {
                kind: task.kind,
                partials: partial.map(|p| (None, p)).into_iter().collect(),
                runs,
                warnings,
                fatal,
            }
        }
    }
}

/// Fan-out: one branch per string item, gated by a semaphore, each
/// bounded by the branch timeout. A branch failure or timeout is
/// isolated; siblings and the run proceed.
async fn execute_map_node(task: NodeTask, map: crate::graph::MapPolicy) -> NodeExecution {
    let items: Vec<String> = task
        .snapshot
        .extra
        .get(&map.items_key)
        .and_then(Value::as_array)
        .map(|array| {
            array
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut warnings = Vec::new();
    if items.is_empty() {
        warnings.push(format!(
            "{}: no items at extra key '{}'; map produced no branches",
            task.kind.as_label(),
            map.items_key
        ));
        return NodeExecution {
            kind: task.kind,
            partials: Vec::new(),
            runs: Vec::new(),
            warnings,
            fatal: None,
        };
    }

    let max_concurrency = map
        .max_concurrency
        .unwrap_or(task.config.map_max_concurrency)
        .max(1);
    let branch_timeout = map.branch_timeout.unwrap_or(task.config.branch_timeout);
    let semaphore = Arc::new(Semaphore::new(max_concurrency));

    let shared = Arc::new(task);
    let mut set: JoinSet<(
        usize,
        String,
        Option<(Option<NodePartial>, Vec<NodeRun>, Vec<String>, Option<NodeError>)>,
    )> = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let shared = Arc::clone(&shared);
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            // Closed semaphore cannot happen: it lives as long as the set.
            let Ok(_permit) = semaphore.acquire().await else {
                return (index, item, None);
            };
            let outcome = tokio::time::timeout(
                branch_timeout,
                attempt_loop(&shared, Some(item.clone()), shared.snapshot.clone()),
            )
            .await;
            (index, item, outcome.ok())
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(join_err) => {
                warnings.push(format!(
                    "{}: branch task panicked: {join_err}",
                    shared.kind.as_label()
                ));
            }
        }
    }
    results.sort_by_key(|(index, _, _)| *index);

    let mut partials = Vec::new();
    let mut runs = Vec::new();
    for (_, item, outcome) in results {
        match outcome {
            Some((partial, branch_runs, branch_warnings, fatal)) => {
                runs.extend(branch_runs);
                warnings.extend(branch_warnings);
                match fatal {
                    // Branch errors are isolated, best-effort or not.
                    Some(err) => {
                        warnings.push(format!(
                            "{}[{item}]: branch failed ({err}); siblings unaffected",
                            shared.kind.as_label()
                        ));
                    }
                    None => {
                        if let Some(partial) = partial {
                            partials.push((Some(item), partial));
                        }
                    }
                }
            }
            None => {
                let now = Utc::now();
                runs.push(NodeRun {
                    run_id: shared.ids.run_id(),
                    node_name: shared.kind.as_label().to_string(),
                    branch_key: Some(item.clone()),
                    attempt: 1,
                    started_at: now,
                    finished_at: now,
                    outcome: NodeOutcome::Error,
                });
                warnings.push(format!(
                    "{}[{item}]: branch timed out after {}ms",
                    shared.kind.as_label(),
                    branch_timeout.as_millis()
                ));
            }
        }
    }

    let kind = shared.kind.clone();
    NodeExecution {
        kind,
        partials,
        runs,
        warnings,
        fatal: None,
    }
}

/// The bounded attempt loop for one node (or one branch of a map).
///
/// Two independent retry budgets apply: at most one backoff retry for a
/// backend-classified failure, and up to `max_retries` re-entries driven
/// by the node's declared retry edge. Each attempt appends a fresh
/// [`NodeRun`].
async fn attempt_loop(
    task: &NodeTask,
    branch_key: Option<String>,
    snapshot: StateSnapshot,
) -> (Option<NodePartial>, Vec<NodeRun>, Vec<String>, Option<NodeError>) {
    let node_name = task.kind.as_label().to_string();
    let mut runs = Vec::new();
    let mut warnings = Vec::new();
    let mut attempt: u32 = 1;
    let mut backoff_used = false;
    let mut retries_used: u32 = 0;
    // Adjust patches from fired retry edges, overlaid on every
    // subsequent attempt's snapshot.
    let mut overlay: FxHashMap<String, Value> = FxHashMap::default();

    loop {
        let run_id = task.ids.run_id();
        let mut attempt_snapshot = snapshot.clone();
        for (key, value) in &overlay {
            attempt_snapshot.extra.insert(key.clone(), value.clone());
        }

        let ctx = NodeContext {
            ids: task.base_ids.child_run(run_id.clone()),
            graph_name: task.graph_name.clone(),
            step: task.step,
            node_name: node_name.clone(),
            branch_key: branch_key.clone(),
            attempt,
            recorder: task.recorder.clone(),
            governor: Arc::clone(&task.governor),
        };

        let started_at = Utc::now();
        let result = task.node.run(attempt_snapshot, ctx).await;
        let finished_at = Utc::now();

        match result {
            Ok(partial) => {
                runs.push(NodeRun {
                    run_id,
                    node_name: node_name.clone(),
                    branch_key: branch_key.clone(),
                    attempt,
                    started_at,
                    finished_at,
                    outcome: partial.outcome,
                });

                if let Some(retry) = &task.policy.retry
                    && (retry.trigger)(&partial)
                {
                    if retries_used < retry.max_retries {
                        retries_used += 1;
                        let patch = (retry.adjust)(&partial, attempt + 1);
                        overlay.extend(patch);
                        debug!(node = %node_name, attempt, "retry edge fired; re-entering");
                        attempt += 1;
                        continue;
                    }
                    warnings.push(format!(
                        "{node_name}: retry budget exhausted after {attempt} attempts; proceeding with last output"
                    ));
                }

                return (Some(partial), runs, warnings, None);
            }
            Err(err) => {
                runs.push(NodeRun {
                    run_id,
                    node_name: node_name.clone(),
                    branch_key: branch_key.clone(),
                    attempt,
                    started_at,
                    finished_at,
                    outcome: NodeOutcome::Error,
                });

                if err.is_backend() && !backoff_used {
                    backoff_used = true;
                    let delay = backoff_delay(&task.config, 1);
                    warn!(node = %node_name, error = %err, delay_ms = delay.as_millis() as u64, "backend failure; retrying after backoff");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                if task.policy.best_effort {
                    warnings.push(format!(
                        "{node_name}: failed ({err}); substituting empty output"
                    ));
                    return (
                        Some(NodePartial::new().with_outcome(NodeOutcome::Error)),
                        runs,
                        warnings,
                        None,
                    );
                }

                return (None, runs, warnings, Some(err));
            }
        }
    }
}

/// Exponential backoff with jitter, capped.
fn backoff_delay(config: &RunnerConfig, attempt: u32) -> Duration {
    use rand::Rng;

    let exp = config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let capped = exp.min(config.backoff_cap);
    let jitter = config.backoff_jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return capped;
    }
    let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
    capped.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_is_capped() {
        let config = RunnerConfig {
            backoff_jitter: 0.0,
            ..RunnerConfig::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(8));
    }

    #[test]
    fn backoff_jitter_stays_within_bounds() {
        let config = RunnerConfig::default();
        for _ in 0..32 {
            let delay = backoff_delay(&config, 1);
            assert!(delay >= Duration::from_millis(800));
            assert!(delay <= Duration::from_millis(1200));
        }
    }
}
