mod common;
use common::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::json;

use ragweave::graph::{Graph, GraphBuilder, MapPolicy, NodePolicy, RetryEdge};
use ragweave::nodes::GenerationNode;
use ragweave::recorder::{EventRecorder, MemorySink};
use ragweave::runner::{GraphError, RunInput};
use ragweave::state::PipelineState;
use ragweave::types::{NodeKind, NodeOutcome, RunStatus};

fn custom(name: &str) -> NodeKind {
    NodeKind::Custom(name.to_string())
}

fn input(state: PipelineState) -> RunInput {
    RunInput::new("req-1", "g-1", state)
}

fn linear(graph_name: &str) -> Graph {
    GraphBuilder::new(graph_name)
        .add_node(custom("first"), WriteExtra {
            key: "first_out",
            value: json!(1),
        })
        .add_node(custom("second"), WriteExtra {
            key: "second_out",
            value: json!(2),
        })
        .add_edge(NodeKind::Start, custom("first"))
        .add_edge(custom("first"), custom("second"))
        .add_edge(custom("second"), NodeKind::End)
        .compile()
        .unwrap()
}

#[tokio::test]
async fn linear_graph_runs_to_completion() {
    let runner = test_runner(EventRecorder::new());
    let graph = linear("linear");

    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.steps, 2);
    assert_eq!(report.node_runs.len(), 2);
    let snap = report.state.snapshot();
    assert_eq!(snap.extra.get("first_out"), Some(&json!(1)));
    assert_eq!(snap.extra.get("second_out"), Some(&json!(2)));
}

#[tokio::test]
async fn ledger_records_one_entry_per_attempt() {
    let runner = test_runner(EventRecorder::new());
    let graph = linear("ledger");

    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();

    for run in &report.node_runs {
        assert_eq!(run.attempt, 1);
        assert_eq!(run.outcome, NodeOutcome::Ok);
        assert!(run.run_id.starts_with("r-"));
        assert!(run.finished_at >= run.started_at);
    }
    assert_eq!(report.runs_for("first").len(), 1);
    assert_eq!(report.runs_for("second").len(), 1);
}

#[tokio::test]
async fn retry_edge_caps_attempts_and_proceeds_with_warning() {
    let retry = RetryEdge::new(
        2,
        // Never satisfied, so the budget is always exhausted.
        Arc::new(|_| true),
        Arc::new(|_, next_attempt| {
            let mut patch = FxHashMap::default();
            patch.insert("hint".to_string(), json!(next_attempt));
            patch
        }),
    );
    let graph = GraphBuilder::new("retry")
        .add_node_with_policy(custom("probe"), AttemptProbe, NodePolicy::new().with_retry(retry))
        .add_edge(NodeKind::Start, custom("probe"))
        .add_edge(custom("probe"), NodeKind::End)
        .compile()
        .unwrap();

    let runner = test_runner(EventRecorder::new());
    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let runs = report.runs_for("probe");
    assert_eq!(runs.len(), 3);
    assert_eq!(
        runs.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let snap = report.state.snapshot();
    // The barrier sees only the final attempt's partial.
    assert_eq!(snap.extra.get("attempt"), Some(&json!(3)));
    // The adjust patch was visible to the retried attempts.
    assert_eq!(snap.extra.get("seen_hint"), Some(&json!(3)));
    assert!(snap
        .warnings
        .iter()
        .any(|w| w.contains("retry budget exhausted")));
}

#[tokio::test]
async fn backend_failure_gets_one_backoff_retry() {
    let graph = GraphBuilder::new("flaky")
        .add_node(custom("flaky"), FlakyNode::new(1))
        .add_edge(NodeKind::Start, custom("flaky"))
        .add_edge(custom("flaky"), NodeKind::End)
        .compile()
        .unwrap();

    let runner = test_runner(EventRecorder::new());
    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let runs = report.runs_for("flaky");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].outcome, NodeOutcome::Error);
    assert_eq!(runs[1].outcome, NodeOutcome::Ok);
    assert_eq!(
        report.state.snapshot().extra.get("recovered_on_attempt"),
        Some(&json!(2))
    );
}

#[tokio::test]
async fn backend_failure_twice_fails_the_run() {
    let graph = GraphBuilder::new("flaky")
        .add_node(custom("flaky"), FlakyNode::new(2))
        .add_edge(NodeKind::Start, custom("flaky"))
        .add_edge(custom("flaky"), NodeKind::End)
        .compile()
        .unwrap();

    let runner = test_runner(EventRecorder::new());
    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.error_detail.is_some());
    // The ledger survives the failure.
    assert_eq!(report.runs_for("flaky").len(), 2);
}

#[tokio::test]
async fn best_effort_node_substitutes_empty_partial() {
    let graph = GraphBuilder::new("best_effort")
        .add_node_with_policy(custom("boom"), AlwaysFails, NodePolicy::new().best_effort())
        .add_node(custom("after"), WriteExtra {
            key: "after_out",
            value: json!(true),
        })
        .add_edge(NodeKind::Start, custom("boom"))
        .add_edge(custom("boom"), custom("after"))
        .add_edge(custom("after"), NodeKind::End)
        .compile()
        .unwrap();

    let runner = test_runner(EventRecorder::new());
    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let snap = report.state.snapshot();
    assert_eq!(snap.extra.get("after_out"), Some(&json!(true)));
    assert!(snap
        .warnings
        .iter()
        .any(|w| w.contains("substituting empty output")));
    assert_eq!(report.runs_for("boom")[0].outcome, NodeOutcome::Error);
}

#[tokio::test]
async fn required_node_failure_fails_the_run() {
    let graph = GraphBuilder::new("required")
        .add_node(custom("boom"), AlwaysFails)
        .add_edge(NodeKind::Start, custom("boom"))
        .add_edge(custom("boom"), NodeKind::End)
        .compile()
        .unwrap();

    let runner = test_runner(EventRecorder::new());
    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report
        .error_detail
        .as_deref()
        .unwrap()
        .contains("deliberate failure"));
}

#[tokio::test]
async fn map_fan_out_isolates_a_failing_branch() {
    let graph = GraphBuilder::new("fan_out")
        .add_node_with_policy(
            custom("answer"),
            BranchAnswer {
                poison: Some("cynic"),
            },
            NodePolicy::new().with_map(MapPolicy::new("perspectives")),
        )
        .add_edge(NodeKind::Start, custom("answer"))
        .add_edge(custom("answer"), NodeKind::End)
        .compile()
        .unwrap();

    let state = PipelineState::builder()
        .with_query("what is freedom?")
        .with_extra("perspectives", json!(["stoic", "hedonist", "cynic"]))
        .build();

    let runner = test_runner(EventRecorder::new());
    let report = runner.execute(&graph, input(state)).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let snap = report.state.snapshot();
    assert_eq!(
        snap.branches.get("stoic").and_then(|v| v.get("answer")),
        Some(&json!("answer from stoic"))
    );
    assert!(snap.branches.contains_key("hedonist"));
    assert!(!snap.branches.contains_key("cynic"));
    assert!(snap.warnings.iter().any(|w| w.contains("cynic")));

    // Three branch executions, each its own ledger entry.
    let runs = report.runs_for("answer");
    assert_eq!(runs.len(), 3);
    let mut keys: Vec<_> = runs.iter().filter_map(|r| r.branch_key.clone()).collect();
    keys.sort();
    assert_eq!(keys, vec!["cynic", "hedonist", "stoic"]);
}

#[tokio::test]
async fn map_fan_out_respects_the_concurrency_cap() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let graph = GraphBuilder::new("capped")
        .add_node_with_policy(
            custom("work"),
            ConcurrencyProbe {
                active: Arc::clone(&active),
                peak: Arc::clone(&peak),
                hold: Duration::from_millis(25),
            },
            NodePolicy::new().with_map(MapPolicy::new("items").with_max_concurrency(4)),
        )
        .add_edge(NodeKind::Start, custom("work"))
        .add_edge(custom("work"), NodeKind::End)
        .compile()
        .unwrap();

    let items: Vec<String> = (0..10).map(|i| format!("item-{i}")).collect();
    let state = PipelineState::builder()
        .with_query("q")
        .with_extra("items", json!(items))
        .build();

    let runner = test_runner(EventRecorder::new());
    let report = runner.execute(&graph, input(state)).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.state.snapshot().branches.len(), 10);
    let observed = peak.load(Ordering::SeqCst);
    assert!(observed <= 4, "branch concurrency exceeded the cap: {observed}");
    // Ten branches against four slots saturate the pool.
    assert_eq!(observed, 4);
}

#[tokio::test]
async fn stalled_branch_times_out_without_failing_the_run() {
    let graph = GraphBuilder::new("stalled")
        .add_node_with_policy(
            custom("answer"),
            GenerationNode::new(
                Arc::new(StalledGeneration),
                "You answer from retrieved context.",
                Duration::from_secs(30),
            ),
            NodePolicy::new().with_map(
                MapPolicy::new("perspectives").with_branch_timeout(Duration::from_millis(50)),
            ),
        )
        .add_edge(NodeKind::Start, custom("answer"))
        .add_edge(custom("answer"), NodeKind::End)
        .compile()
        .unwrap();

    let state = PipelineState::builder()
        .with_query("what is freedom?")
        .with_extra("perspectives", json!(["stoic"]))
        .build();

    let runner = test_runner(EventRecorder::new());
    let report = runner.execute(&graph, input(state)).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let snap = report.state.snapshot();
    assert!(snap.branches.is_empty());
    assert!(snap.warnings.iter().any(|w| w.contains("timed out")));
    let runs = report.runs_for("answer");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].outcome, NodeOutcome::Error);
}

#[tokio::test]
async fn backoff_and_retry_edge_budgets_stack_to_four_attempts() {
    // A retry edge that always fires on success.
    let retry = RetryEdge::new(
        2,
        Arc::new(|_| true),
        Arc::new(|_, _| FxHashMap::default()),
    );
    let graph = GraphBuilder::new("stacked")
        .add_node_with_policy(
            custom("flaky"),
            FlakyNode::new(1),
            NodePolicy::new().with_retry(retry),
        )
        .add_edge(NodeKind::Start, custom("flaky"))
        .add_edge(custom("flaky"), NodeKind::End)
        .compile()
        .unwrap();

    let runner = test_runner(EventRecorder::new());
    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    // Worst case: one failed attempt, its backoff retry, then both
    // retry-edge re-entries. Four ledger entries, never a fifth.
    let runs = report.runs_for("flaky");
    assert_eq!(runs.len(), 4);
    assert_eq!(
        runs.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(runs[0].outcome, NodeOutcome::Error);
    assert!(runs[1..].iter().all(|r| r.outcome == NodeOutcome::Ok));
    let snap = report.state.snapshot();
    assert_eq!(snap.extra.get("recovered_on_attempt"), Some(&json!(4)));
    assert!(snap
        .warnings
        .iter()
        .any(|w| w.contains("retry budget exhausted after 4 attempts")));
}

#[tokio::test]
async fn conditional_edge_routes_on_post_barrier_state() {
    let graph = GraphBuilder::new("routing")
        .add_node(custom("router"), WriteExtra {
            key: "route",
            value: json!("extend"),
        })
        .add_node(custom("extend"), WriteExtra {
            key: "extended",
            value: json!(true),
        })
        .add_edge(NodeKind::Start, custom("router"))
        .add_edge(custom("extend"), NodeKind::End)
        .add_conditional_edge(
            custom("router"),
            Arc::new(|snapshot| {
                if snapshot.extra.get("route") == Some(&json!("extend")) {
                    vec!["extend".to_string()]
                } else {
                    vec![NodeKind::end_target()]
                }
            }),
        )
        .compile()
        .unwrap();

    let runner = test_runner(EventRecorder::new());
    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        report.state.snapshot().extra.get("extended"),
        Some(&json!(true))
    );
}

#[tokio::test]
async fn parallel_branches_lose_no_updates() {
    let graph = GraphBuilder::new("diamond")
        .add_node(custom("left"), WriteExtra {
            key: "left_out",
            value: json!("l"),
        })
        .add_node(custom("right"), WriteExtra {
            key: "right_out",
            value: json!("r"),
        })
        .add_edge(NodeKind::Start, custom("left"))
        .add_edge(NodeKind::Start, custom("right"))
        .add_edge(custom("left"), NodeKind::End)
        .add_edge(custom("right"), NodeKind::End)
        .compile()
        .unwrap();

    let runner = test_runner(EventRecorder::new());
    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.steps, 1);
    let snap = report.state.snapshot();
    assert_eq!(snap.extra.get("left_out"), Some(&json!("l")));
    assert_eq!(snap.extra.get("right_out"), Some(&json!("r")));
    // One barrier, one version bump for the changed channel.
    assert_eq!(snap.extra_version, 2);
    assert_eq!(snap.warnings_version, 1);
}

#[tokio::test]
async fn empty_request_id_fails_validation() {
    let runner = test_runner(EventRecorder::new());
    let graph = linear("validation");

    let err = runner
        .execute(
            &graph,
            RunInput::new("", "g-1", PipelineState::new_with_query("q")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Validation { .. }));
}

#[tokio::test]
async fn map_node_at_start_requires_items_array() {
    let graph = GraphBuilder::new("fan_out")
        .add_node_with_policy(
            custom("answer"),
            BranchAnswer { poison: None },
            NodePolicy::new().with_map(MapPolicy::new("perspectives")),
        )
        .add_edge(NodeKind::Start, custom("answer"))
        .add_edge(custom("answer"), NodeKind::End)
        .compile()
        .unwrap();

    let runner = test_runner(EventRecorder::new());
    // No "perspectives" key in the initial state.
    let err = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap_err();
    assert!(matches!(err, GraphError::Validation { .. }));
}

#[tokio::test]
async fn run_events_share_the_correlation_ids() {
    let sink = MemorySink::new();
    let recorder = EventRecorder::new().with_sink(Arc::new(sink.clone()));
    let runner = test_runner(recorder);
    let graph = linear("correlated");

    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let events = sink.events_for_graph("g-1");
    assert!(events.iter().any(|e| e.step == "run_started"));
    assert!(events.iter().any(|e| e.step == "run_completed"));
    for event in &events {
        assert_eq!(event.ids.request_id, "req-1");
        assert!(!event.event_id.is_empty());
    }
}

#[tokio::test]
async fn failing_sink_never_fails_the_run() {
    let recorder = EventRecorder::new().with_sink(Arc::new(FailingSink));
    let runner = test_runner(recorder);
    let graph = linear("best_effort_telemetry");

    let report = runner
        .execute(&graph, input(PipelineState::new_with_query("q")))
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Completed);
}
