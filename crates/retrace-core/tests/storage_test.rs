// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the synchronous storage backend.

use chrono::{Duration, Utc};
use serde_json::{Map, json};
use tempfile::TempDir;

use retrace_core::{
    Execution, ExecutionStep, RoutingDecision, RunStatus, StateDiff, StoreError,
    SyncSqliteStore, compute_diff,
};

fn open_store(dir: &TempDir) -> SyncSqliteStore {
    SyncSqliteStore::open(dir.path().join("traces.db")).expect("open store")
}

fn make_step(execution_id: &str, index: u64, diff: StateDiff) -> ExecutionStep {
    ExecutionStep {
        step_id: ExecutionStep::new_id(),
        execution_id: execution_id.to_string(),
        node_name: format!("node_{index}"),
        step_index: index,
        timestamp_start: Utc::now(),
        timestamp_end: Some(Utc::now()),
        status: RunStatus::Completed,
        state_before: None,
        state_after: None,
        state_diff: diff,
        is_checkpoint: false,
        error: None,
        metadata: Map::new(),
    }
}

#[test]
fn test_execution_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);

    let execution = Execution::new("e1", "test_graph", json!({"query": "hi"}));
    store.save_execution(&execution).expect("save");

    let loaded = store
        .get_execution("e1")
        .expect("get")
        .expect("must exist");
    assert_eq!(loaded.execution_id, "e1");
    assert_eq!(loaded.graph_name, "test_graph");
    assert_eq!(loaded.initial_state, json!({"query": "hi"}));
    assert_eq!(loaded.status, RunStatus::Running);
    assert!(loaded.ended_at.is_none());

    assert!(store.get_execution("nope").expect("get").is_none());
}

#[test]
fn test_duplicate_execution_id_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);

    let execution = Execution::new("dup", "g", json!({}));
    store.save_execution(&execution).expect("first save");
    let err = store
        .save_execution(&execution)
        .expect_err("second save must fail");
    assert!(matches!(err, StoreError::AlreadyExists { id, .. } if id == "dup"));
}

#[test]
fn test_update_execution_writes_finalization_fields() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);

    let mut execution = Execution::new("e1", "g", json!({"x": 0}));
    store.save_execution(&execution).expect("save");

    execution.ended_at = Some(Utc::now());
    execution.status = RunStatus::Completed;
    execution.final_state = Some(json!({"x": 3}));
    execution.step_count = 3;
    store.update_execution(&execution).expect("update");

    let loaded = store.get_execution("e1").expect("get").expect("exists");
    assert_eq!(loaded.status, RunStatus::Completed);
    assert_eq!(loaded.final_state, Some(json!({"x": 3})));
    assert_eq!(loaded.step_count, 3);
    assert!(loaded.ended_at.is_some());
    // Creation fields are untouched.
    assert_eq!(loaded.initial_state, json!({"x": 0}));
}

#[test]
fn test_list_executions_newest_first() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);

    for (i, id) in ["old", "mid", "new"].iter().enumerate() {
        let mut execution = Execution::new(*id, "g", json!({}));
        execution.started_at = Utc::now() - Duration::minutes(10 - i as i64);
        store.save_execution(&execution).expect("save");
    }

    let listed = store.list_executions(10, 0).expect("list");
    let ids: Vec<&str> = listed.iter().map(|e| e.execution_id.as_str()).collect();
    assert_eq!(ids, vec!["new", "mid", "old"]);

    let page = store.list_executions(1, 1).expect("list");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].execution_id, "mid");
}

#[test]
fn test_steps_round_trip_in_index_order() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    store
        .save_execution(&Execution::new("e1", "g", json!({})))
        .expect("save execution");

    // Insert out of order; listing must come back ordered.
    for index in [2_u64, 0, 1] {
        store
            .save_step(&make_step("e1", index, StateDiff::default()))
            .expect("save step");
    }

    let steps = store.list_steps("e1").expect("list");
    let indices: Vec<u64> = steps.iter().map(|s| s.step_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    let by_id = store
        .get_step(&steps[1].step_id)
        .expect("get")
        .expect("exists");
    assert_eq!(by_id.node_name, "node_1");
}

#[test]
fn test_routing_decision_resolves_execution_from_step() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    store
        .save_execution(&Execution::new("e1", "g", json!({})))
        .expect("save execution");
    let step = make_step("e1", 0, StateDiff::default());
    store.save_step(&step).expect("save step");

    let decision = RoutingDecision {
        step_id: step.step_id.clone(),
        execution_id: String::new(),
        source_node: "planner".to_string(),
        target_node: "searcher".to_string(),
        condition_description: "route on intent".to_string(),
        condition_inputs: json!({"intent": "research"}),
        evaluated_value: json!("searcher"),
    };
    store.save_routing_decision(&decision).expect("save routing");

    let decisions = store.get_routing_decisions("e1").expect("list");
    assert_eq!(decisions.len(), 1);
    // The execution was resolved from the referenced step.
    assert_eq!(decisions[0].execution_id, "e1");
    assert_eq!(decisions[0].source_node, "planner");
    assert_eq!(decisions[0].target_node, "searcher");
    assert_eq!(decisions[0].evaluated_value, json!("searcher"));
}

#[test]
fn test_state_reconstruction_from_checkpoint_and_diffs() {
    let dir = TempDir::new().expect("tempdir");
    let store = open_store(&dir);
    store
        .save_execution(&Execution::new("e1", "g", json!({"x": 0})))
        .expect("save execution");

    let states = [
        json!({"x": 0}),
        json!({"x": 1}),
        json!({"x": 2, "y": "new"}),
        json!({"x": 3, "y": "new"}),
    ];

    for i in 0..3 {
        let mut step = make_step(
            "e1",
            i as u64,
            compute_diff(&states[i], &states[i + 1], &Default::default()),
        );
        if i == 0 {
            step.is_checkpoint = true;
            step.state_before = Some(states[0].clone());
            step.state_after = Some(states[1].clone());
        }
        store.save_step(&step).expect("save step");
    }

    for (index, expected) in states.iter().enumerate().skip(1) {
        let state = store
            .get_state_at_step("e1", index as u64 - 1)
            .expect("reconstruct")
            .expect("present");
        assert_eq!(&state, expected, "state after step {}", index - 1);
    }

    // Indices beyond the recorded range are not found.
    assert!(store.get_state_at_step("e1", 3).expect("query").is_none());
    assert!(store.get_state_at_step("ghost", 0).expect("query").is_none());
}
