// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for graph instrumentation.
//!
//! The collector registry is process-wide, so every test in this binary
//! shares one recorder over one scratch database and distinguishes its
//! data by execution id (pinned through [`InvokeConfig`]).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde_json::{Value, json};
use tempfile::TempDir;

use retrace_core::{RunStatus, SyncSqliteStore};
use retrace_sdk::{
    END, GraphError, InvokeConfig, NodeError, RecorderConfig, StateGraph, collector,
    enable_recording,
};

fn recording_db() -> PathBuf {
    static DIR: OnceLock<TempDir> = OnceLock::new();
    DIR.get_or_init(|| TempDir::new().expect("tempdir"))
        .path()
        .join("traces.db")
}

/// Instrument a graph against the shared test recorder.
fn enable(graph: StateGraph) -> StateGraph {
    let config = RecorderConfig::new()
        .with_db_path(recording_db())
        .with_checkpoint_interval(2);
    enable_recording(graph, config).expect("enable recording")
}

fn store() -> &'static SyncSqliteStore {
    collector().expect("collector installed").store()
}

/// The research-agent shape used across tests.
fn build_graph() -> StateGraph {
    StateGraph::new("research_agent")
        .add_node("planner", |state: &Value| {
            let query = state["query"].as_str().unwrap_or_default();
            let intent = if query.contains("summary") {
                "summarize"
            } else {
                "research"
            };
            Ok(json!({"intent": intent, "step_count": 1}))
        })
        .add_node("searcher", |state: &Value| {
            let query = state["query"].as_str().unwrap_or_default();
            Ok(json!({
                "search_results": [format!("result for '{query}'")],
                "step_count": 2,
            }))
        })
        .add_node("summarizer", |state: &Value| {
            let n = state["search_results"]
                .as_array()
                .map(Vec::len)
                .unwrap_or(0);
            Ok(json!({"summary": format!("based on {n} sources"), "step_count": 3}))
        })
        .add_conditional_edge(
            "planner",
            "route on intent",
            |state: &Value| Ok(state["intent"].as_str().unwrap_or("research").to_string()),
            HashMap::from([
                ("research".to_string(), "searcher".to_string()),
                ("summarize".to_string(), "summarizer".to_string()),
            ]),
        )
        .add_edge("searcher", "summarizer")
        .add_edge("summarizer", END)
        .set_entry_point("planner")
}

#[test]
fn test_instrumented_invoke_matches_uninstrumented() {
    let plain = build_graph();
    let expected = plain.invoke(json!({"query": "what is retrace?"})).expect("plain run");

    let instrumented = enable(build_graph());
    let config = InvokeConfig::new().with_execution_id("exec-match");
    let actual = instrumented
        .invoke_with_config(json!({"query": "what is retrace?"}), config)
        .expect("instrumented run");

    assert_eq!(actual, expected);

    // Three nodes ran; three steps were recorded, densely indexed.
    let steps = store().list_steps("exec-match").expect("list steps");
    let names: Vec<&str> = steps.iter().map(|s| s.node_name.as_str()).collect();
    assert_eq!(names, vec!["planner", "searcher", "summarizer"]);
    let indices: Vec<u64> = steps.iter().map(|s| s.step_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(steps[0].is_checkpoint);
    assert!(!steps[1].is_checkpoint);
    assert!(steps[2].is_checkpoint);

    // The runner finalized the execution.
    let execution = store()
        .get_execution("exec-match")
        .expect("get")
        .expect("exists");
    assert_eq!(execution.status, RunStatus::Completed);
    assert_eq!(execution.step_count, 3);
    assert_eq!(execution.final_state, Some(expected));
}

#[test]
fn test_node_error_passes_through_unchanged() {
    let failing = || {
        StateGraph::new("failing")
            .add_node("boom", |_: &Value| {
                Err(NodeError::new("user code exploded"))
            })
            .set_entry_point("boom")
    };

    let plain_err = failing().invoke(json!({"q": "?"})).expect_err("plain");
    let instrumented = enable(failing());
    let config = InvokeConfig::new().with_execution_id("exec-fail");
    let wrapped_err = instrumented
        .invoke_with_config(json!({"q": "?"}), config)
        .expect_err("instrumented");

    // Same error type, node, and message as the uninstrumented run.
    assert_eq!(plain_err.to_string(), wrapped_err.to_string());
    match wrapped_err {
        GraphError::Node { node, source } => {
            assert_eq!(node, "boom");
            assert_eq!(source, NodeError::new("user code exploded"));
        }
        other => panic!("unexpected error: {other}"),
    }

    // The failure was recorded with state_after == state_before.
    let steps = store().list_steps("exec-fail").expect("list steps");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, RunStatus::Failed);
    assert_eq!(steps[0].error.as_deref(), Some("user code exploded"));
    assert_eq!(steps[0].state_before, steps[0].state_after);
    assert!(steps[0].state_diff.is_empty());

    let execution = store()
        .get_execution("exec-fail")
        .expect("get")
        .expect("exists");
    assert_eq!(execution.status, RunStatus::Failed);
}

#[test]
fn test_routing_decisions_are_captured() {
    let instrumented = enable(build_graph());
    let config = InvokeConfig::new().with_execution_id("exec-route");
    instrumented
        .invoke_with_config(json!({"query": "give me a summary of retrace"}), config)
        .expect("run");

    let decisions = store()
        .get_routing_decisions("exec-route")
        .expect("list routing");
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].source_node, "planner");
    assert_eq!(decisions[0].target_node, "summarize");
    assert_eq!(decisions[0].condition_description, "route on intent");
    assert_eq!(decisions[0].evaluated_value, json!("summarize"));
    assert_eq!(decisions[0].condition_inputs["intent"], json!("summarize"));

    // The summarize branch skipped the searcher.
    let steps = store().list_steps("exec-route").expect("list steps");
    let names: Vec<&str> = steps.iter().map(|s| s.node_name.as_str()).collect();
    assert_eq!(names, vec!["planner", "summarizer"]);
}

#[test]
fn test_disabled_config_returns_graph_untouched() {
    let graph = StateGraph::new("untouched")
        .add_node("n", |_: &Value| Ok(json!({"ran": true})))
        .set_entry_point("n");
    let graph = enable_recording(graph, RecorderConfig::new().with_enabled(false))
        .expect("disabled enable");

    let config = InvokeConfig::new().with_execution_id("exec-disabled");
    let result = graph
        .invoke_with_config(json!({}), config)
        .expect("run");
    assert_eq!(result, json!({"ran": true}));

    // Nothing was recorded for this run, even if another test already
    // installed the shared collector.
    if let Some(collector) = collector() {
        assert!(
            collector
                .store()
                .get_execution("exec-disabled")
                .expect("get")
                .is_none()
        );
    }
}

#[tokio::test]
async fn test_async_nodes_are_recorded() {
    let graph = StateGraph::new("async_pipeline")
        .add_async_node("fetch", |state: Value| async move {
            let q = state["q"].as_str().unwrap_or_default().to_string();
            Ok(json!({"fetched": format!("data for {q}")}))
        })
        .add_node("finish", |_: &Value| Ok(json!({"done": true})))
        .add_edge("fetch", "finish")
        .add_edge("finish", END)
        .set_entry_point("fetch");

    let instrumented = enable(graph);
    let config = InvokeConfig::new().with_execution_id("exec-async");
    let result = instrumented
        .ainvoke_with_config(json!({"q": "42"}), config)
        .await
        .expect("run");
    assert_eq!(result["done"], json!(true));
    assert_eq!(result["fetched"], json!("data for 42"));

    let steps = store().list_steps("exec-async").expect("list steps");
    let names: Vec<&str> = steps.iter().map(|s| s.node_name.as_str()).collect();
    assert_eq!(names, vec!["fetch", "finish"]);
    // The async node's diff captured its partial update.
    assert!(
        steps[0]
            .state_diff
            .added
            .iter()
            .any(|e| e.path == "fetched")
    );
}

#[test]
fn test_reserved_state_key_selects_execution_id() {
    let graph = enable(
        StateGraph::new("keyed")
            .add_node("n", |_: &Value| Ok(json!({"ran": true})))
            .set_entry_point("n"),
    );

    // No config channel; the id rides inside the state itself.
    graph
        .invoke(json!({"__retrace_execution_id": "exec-from-state"}))
        .expect("run");

    let steps = store().list_steps("exec-from-state").expect("list steps");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].node_name, "n");
}

#[test]
fn test_replay_after_instrumented_run() {
    let instrumented = enable(build_graph());
    let config = InvokeConfig::new().with_execution_id("exec-replay");
    let final_state = instrumented
        .invoke_with_config(json!({"query": "what is retrace?"}), config)
        .expect("run");

    // Reconstructed state at the last step equals the run's final state.
    let reconstructed = store()
        .get_state_at_step("exec-replay", 2)
        .expect("reconstruct")
        .expect("present");
    assert_eq!(reconstructed, final_state);

    // Intermediate state still lacks the summary.
    let mid = store()
        .get_state_at_step("exec-replay", 1)
        .expect("reconstruct")
        .expect("present");
    assert!(mid.get("summary").is_none());
    assert_eq!(mid["step_count"], json!(2));
}
