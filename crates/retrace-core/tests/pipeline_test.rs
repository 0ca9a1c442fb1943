// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests: collector -> storage -> replay pipeline.
//!
//! The collector records synchronously through the rusqlite backend; the
//! replay engine reads the same database back through the async sqlx
//! backend, exactly as an external trace server would.

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tempfile::TempDir;

use retrace_core::{
    Collector, CollectorError, QueryService, RecorderConfig, ReplayEngine, RunStatus,
    SqliteStore, StateStore, SyncSqliteStore,
};

/// Build a collector plus an async reader over one scratch database.
fn setup(dir: &TempDir, checkpoint_interval: u64) -> Collector {
    let db_path = dir.path().join("traces.db");
    let config = RecorderConfig::new()
        .with_db_path(&db_path)
        .with_checkpoint_interval(checkpoint_interval);
    let store = SyncSqliteStore::open(&db_path).expect("open store");
    Collector::new(config, store).expect("collector")
}

async fn reader(dir: &TempDir) -> Arc<SqliteStore> {
    Arc::new(
        SqliteStore::from_path(dir.path().join("traces.db"))
            .await
            .expect("open reader"),
    )
}

#[tokio::test]
async fn test_record_and_replay() {
    let dir = TempDir::new().expect("tempdir");
    let collector = setup(&dir, 2);

    let initial = json!({"query": "test", "count": 0});
    collector
        .start_execution("e1", "test_graph", &initial, None)
        .expect("start");

    // Four steps; checkpoints land at indices 0 and 2.
    let states = [
        initial.clone(),
        json!({"query": "test", "count": 1, "intent": "a"}),
        json!({"query": "test", "count": 2, "intent": "a", "result": "x"}),
        json!({"query": "test", "count": 3, "intent": "b", "result": "x"}),
        json!({"query": "test", "count": 4, "intent": "b", "result": "y", "done": true}),
    ];
    for i in 0..4 {
        let step = collector
            .record_step(
                "e1",
                &format!("node_{i}"),
                &states[i],
                &states[i + 1],
                None,
                None,
            )
            .expect("record");
        assert_eq!(step.step_index, i as u64);
        assert_eq!(step.is_checkpoint, i % 2 == 0);
    }

    collector
        .end_execution("e1", &states[4], RunStatus::Completed)
        .expect("end");

    let store = reader(&dir).await;
    let execution = store
        .get_execution("e1")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(execution.step_count, 4);
    assert_eq!(execution.status, RunStatus::Completed);
    assert_eq!(execution.final_state, Some(states[4].clone()));

    let replay = ReplayEngine::new(store.clone());
    let timeline = replay.get_full_timeline("e1").await.expect("timeline");
    assert_eq!(timeline.len(), 4);
    assert_eq!(timeline[0].node_name, "node_0");
    assert_eq!(timeline[3].node_name, "node_3");
    for (i, entry) in timeline.iter().enumerate() {
        assert_eq!(entry.state["count"], json!(i as u64 + 1));
    }

    // State reconstruction works for non-checkpoint indices too.
    let state_at_3 = replay
        .get_state_at_step("e1", 3)
        .await
        .expect("reconstruct")
        .expect("present");
    assert_eq!(state_at_3["count"], json!(4));
    assert_eq!(state_at_3["done"], json!(true));

    // Checkpoint snapshots agree with the folded reconstruction.
    for entry in &timeline {
        let reconstructed = replay
            .get_state_at_step("e1", entry.step_index)
            .await
            .expect("reconstruct")
            .expect("present");
        assert_eq!(reconstructed, entry.state);
    }

    // Past the recorded range: not found.
    assert!(
        replay
            .get_state_at_step("e1", 4)
            .await
            .expect("query")
            .is_none()
    );
}

#[tokio::test]
async fn test_checkpoint_policy_over_long_run() {
    let dir = TempDir::new().expect("tempdir");
    let collector = setup(&dir, 10);

    collector
        .start_execution("e1", "long", &json!({"n": 0}), None)
        .expect("start");

    let mut previous = json!({"n": 0});
    for i in 0..25 {
        let next = json!({"n": i + 1});
        collector
            .record_step("e1", "inc", &previous, &next, None, None)
            .expect("record");
        previous = next;
    }

    let store = reader(&dir).await;
    let steps = store.list_steps("e1").await.expect("list");
    assert_eq!(steps.len(), 25);
    let checkpoints: Vec<u64> = steps
        .iter()
        .filter(|s| s.is_checkpoint)
        .map(|s| s.step_index)
        .collect();
    assert_eq!(checkpoints, vec![0, 10, 20]);

    // Non-checkpoint steps carry no snapshots, only diffs.
    assert!(steps[5].state_after.is_none());
    assert!(!steps[5].state_diff.is_empty());

    let replay = ReplayEngine::new(store);
    let state = replay
        .get_state_at_step("e1", 24)
        .await
        .expect("reconstruct")
        .expect("present");
    assert_eq!(state, json!({"n": 25}));
}

#[tokio::test]
async fn test_two_step_scenario_with_interval_two() {
    let dir = TempDir::new().expect("tempdir");
    let collector = setup(&dir, 2);

    collector
        .start_execution("e1", "g", &json!({"x": 0}), None)
        .expect("start");
    collector
        .record_step(
            "e1",
            "a",
            &json!({"x": 0}),
            &json!({"x": 1, "y": "new"}),
            None,
            None,
        )
        .expect("record a");
    collector
        .record_step(
            "e1",
            "b",
            &json!({"x": 1, "y": "new"}),
            &json!({"x": 2, "y": "new", "z": true}),
            None,
            None,
        )
        .expect("record b");

    let store = reader(&dir).await;
    let steps = store.list_steps("e1").await.expect("list");
    assert!(steps[0].is_checkpoint);
    assert!(!steps[1].is_checkpoint);

    let state = store
        .get_state_at_step("e1", 1)
        .await
        .expect("reconstruct")
        .expect("present");
    assert_eq!(state, json!({"x": 2, "y": "new", "z": true}));
}

#[tokio::test]
async fn test_list_append_diff_shape() {
    let dir = TempDir::new().expect("tempdir");
    let collector = setup(&dir, 10);

    collector
        .start_execution("e1", "g", &json!({"messages": []}), None)
        .expect("start");
    let step = collector
        .record_step(
            "e1",
            "append_user",
            &json!({"messages": []}),
            &json!({"messages": [{"role": "user", "content": "hi"}]}),
            None,
            None,
        )
        .expect("record");

    let added: Vec<&str> = step.state_diff.added.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(added, vec!["messages[0]"]);
    let changed: Vec<&str> = step
        .state_diff
        .changed
        .iter()
        .map(|e| e.path.as_str())
        .collect();
    assert_eq!(changed, vec!["messages.length"]);
    assert_eq!(step.state_diff.changed[0].old_value, json!(0));
    assert_eq!(step.state_diff.changed[0].new_value, json!(1));
}

#[tokio::test]
async fn test_ignore_keys_exclude_volatile_fields() {
    let dir = TempDir::new().expect("tempdir");
    let db_path = dir.path().join("traces.db");
    let config = RecorderConfig::new()
        .with_db_path(&db_path)
        .with_ignore_keys(["timestamp"]);
    let store = SyncSqliteStore::open(&db_path).expect("open");
    let collector = Collector::new(config, store).expect("collector");

    collector
        .start_execution("e1", "g", &json!({}), None)
        .expect("start");
    let step = collector
        .record_step(
            "e1",
            "n",
            &json!({"data": 1, "timestamp": "t0"}),
            &json!({"data": 2, "timestamp": "t1"}),
            None,
            None,
        )
        .expect("record");

    assert_eq!(step.state_diff.changed.len(), 1);
    assert_eq!(step.state_diff.changed[0].path, "data");
    assert!(step.state_diff.added.is_empty());
    assert!(step.state_diff.removed.is_empty());
}

#[tokio::test]
async fn test_failed_step_keeps_execution_running() {
    let dir = TempDir::new().expect("tempdir");
    let collector = setup(&dir, 10);

    collector
        .start_execution("e1", "g", &json!({"q": "?"}), None)
        .expect("start");
    let step = collector
        .record_step(
            "e1",
            "exploder",
            &json!({"q": "?"}),
            &json!({"q": "?"}),
            Some("boom".to_string()),
            None,
        )
        .expect("record");

    assert_eq!(step.status, RunStatus::Failed);
    assert_eq!(step.error.as_deref(), Some("boom"));
    assert!(step.state_diff.is_empty());

    let store = reader(&dir).await;
    let execution = store
        .get_execution("e1")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(execution.status, RunStatus::Running);

    collector
        .end_execution("e1", &json!({"q": "?"}), RunStatus::Failed)
        .expect("end");
    let execution = store
        .get_execution("e1")
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(execution.status, RunStatus::Failed);
    assert_eq!(execution.step_count, 1);
}

#[test]
fn test_duplicate_start_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let collector = setup(&dir, 10);

    collector
        .start_execution("e1", "g", &json!({}), None)
        .expect("first start");
    let err = collector
        .start_execution("e1", "g", &json!({}), None)
        .expect_err("second start must fail");
    assert!(matches!(err, CollectorError::DuplicateExecution { execution_id } if execution_id == "e1"));
}

#[test]
fn test_end_execution_for_unknown_id_is_silent() {
    let dir = TempDir::new().expect("tempdir");
    let collector = setup(&dir, 10);
    collector
        .end_execution("never-started", &json!({}), RunStatus::Completed)
        .expect("must not error");
}

#[test]
fn test_concurrent_executions_have_disjoint_step_indices() {
    let dir = TempDir::new().expect("tempdir");
    let collector = Arc::new(setup(&dir, 10));

    let mut handles = Vec::new();
    for worker in 0..2 {
        let collector = Arc::clone(&collector);
        handles.push(std::thread::spawn(move || {
            let execution_id = format!("worker-{worker}");
            collector
                .start_execution(execution_id.as_str(), "g", &json!({"i": 0}), None)
                .expect("start");
            for i in 0..5 {
                let step = collector
                    .record_step(
                        &execution_id,
                        "tick",
                        &json!({"i": i}),
                        &json!({"i": i + 1}),
                        None,
                        None,
                    )
                    .expect("record");
                assert_eq!(step.step_index, i as u64);
            }
            execution_id
        }));
    }

    for handle in handles {
        let execution_id = handle.join().expect("worker");
        let indices: Vec<u64> = collector
            .store()
            .list_steps(&execution_id)
            .expect("list")
            .iter()
            .map(|s| s.step_index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }
}

#[test]
fn test_oversized_snapshot_sets_metadata_flag() {
    let dir = TempDir::new().expect("tempdir");
    let db_path = dir.path().join("traces.db");
    let config = RecorderConfig::new()
        .with_db_path(&db_path)
        .with_max_state_size_bytes(64);
    let store = SyncSqliteStore::open(&db_path).expect("open");
    let collector = Collector::new(config, store).expect("collector");

    collector
        .start_execution("e1", "g", &json!({}), None)
        .expect("start");
    let step = collector
        .record_step(
            "e1",
            "bloat",
            &json!({}),
            &json!({"blob": "x".repeat(256)}),
            None,
            None,
        )
        .expect("record");
    assert_eq!(step.metadata.get("state_size_exceeded"), Some(&json!(true)));

    let small = collector
        .record_step("e1", "tiny", &json!({}), &json!({"ok": 1}), None, None)
        .expect("record");
    assert!(small.metadata.get("state_size_exceeded").is_none());
}

#[test]
fn test_subscribers_observe_recording_events() {
    let dir = TempDir::new().expect("tempdir");
    let collector = setup(&dir, 10);

    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&events);
    let subscription = collector.subscribe(Box::new(move |event, _payload: &Value| {
        sink.lock().unwrap().push(event.to_string());
    }));

    collector
        .start_execution("e1", "g", &json!({}), None)
        .expect("start");
    collector
        .record_step("e1", "n", &json!({}), &json!({"a": 1}), None, None)
        .expect("record");
    collector
        .record_routing("", "e1", "n", "other", "desc", &json!({}), &json!("other"))
        .expect("routing");
    collector
        .end_execution("e1", &json!({"a": 1}), RunStatus::Completed)
        .expect("end");

    let seen = events.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            "execution_started",
            "step_recorded",
            "routing_decision",
            "execution_ended",
        ]
    );

    // A detached subscriber observes nothing further.
    collector.unsubscribe(subscription);
    collector
        .record_step("e1", "silent", &json!({}), &json!({"b": 2}), None, None)
        .expect("record");
    assert_eq!(events.lock().unwrap().len(), seen.len());
}

#[tokio::test]
async fn test_query_service_surface() {
    let dir = TempDir::new().expect("tempdir");
    let collector = setup(&dir, 2);

    collector
        .start_execution("e1", "g", &json!({"x": 1}), None)
        .expect("start");
    collector
        .record_step("e1", "a", &json!({"x": 1}), &json!({"x": 2, "y": "new"}), None, None)
        .expect("record");
    collector
        .record_step(
            "e1",
            "b",
            &json!({"x": 2, "y": "new"}),
            &json!({"x": 3, "y": "updated", "z": true}),
            None,
            None,
        )
        .expect("record");

    let query = QueryService::open(dir.path().join("traces.db"))
        .await
        .expect("open query service");

    // Limit is clamped into [1, 200]; a zero limit still returns results.
    let listed = query.list_executions(0, 0).await.expect("list");
    assert_eq!(listed.len(), 1);

    let steps = query.list_steps("e1").await.expect("steps");
    assert_eq!(steps.len(), 2);

    let comparison = query
        .compare("e1", 0, 1)
        .await
        .expect("compare")
        .expect("both present");
    let changed: Vec<&str> = comparison
        .diff
        .changed
        .iter()
        .map(|e| e.path.as_str())
        .collect();
    assert!(changed.contains(&"x"));
    assert!(changed.contains(&"y"));
    assert_eq!(comparison.state_a, json!({"x": 2, "y": "new"}));

    // Unknown executions: empty timeline, absent state.
    assert!(query.get_execution("ghost").await.expect("get").is_none());
    assert!(query.get_timeline("ghost").await.expect("timeline").is_empty());
    assert!(
        query
            .get_state_at_step("e1", 99)
            .await
            .expect("state")
            .is_none()
    );
}
