// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain models for execution traces and state snapshots.
//!
//! Plain data containers shared by every component: the collector writes
//! them, storage persists them, the replay engine and query surface read
//! them back. Step rows are append-only; only the execution tail fields
//! (`ended_at`, `status`, `final_state`, `step_count`, `metadata`) are
//! written a second time, at finalization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Length of a freshly generated execution id (hex chars).
const EXECUTION_ID_LEN: usize = 16;
/// Length of a freshly generated step id (hex chars).
const STEP_ID_LEN: usize = 12;

/// Generate a short opaque hex id.
fn short_id(len: usize) -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(len);
    id
}

/// Status of an execution or a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Still executing (or never finalized).
    #[default]
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl RunStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse a status from a string. Unknown values map to `Running`.
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

/// A `changed` diff entry: the value at `path` was replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedEntry {
    /// Dotted/bracketed location in the tree.
    pub path: String,
    /// Value before the transition.
    pub old_value: Value,
    /// Value after the transition.
    pub new_value: Value,
}

/// An `added` diff entry: `path` did not exist before.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddedEntry {
    /// Dotted/bracketed location in the tree.
    pub path: String,
    /// The value that appeared.
    pub value: Value,
}

/// A `removed` diff entry: `path` no longer exists after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedEntry {
    /// Dotted/bracketed location in the tree.
    pub path: String,
    /// The value that disappeared.
    pub value: Value,
}

/// Structural diff between two state snapshots.
///
/// Paths use dot notation with bracket indexing for lists, e.g.
/// `messages[2].content` or `config.model`. List length changes produce a
/// synthetic `<path>.length` entry in `changed` alongside the per-element
/// add/remove entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    /// Values replaced in place.
    pub changed: Vec<ChangedEntry>,
    /// Paths present only in the after tree.
    pub added: Vec<AddedEntry>,
    /// Paths present only in the before tree.
    pub removed: Vec<RemovedEntry>,
}

impl StateDiff {
    /// Returns true if the diff records no changes at all.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    /// Total number of entries across all three lists.
    pub fn len(&self) -> usize {
        self.changed.len() + self.added.len() + self.removed.len()
    }
}

/// A single graph run from start to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Opaque unique id for the run.
    pub execution_id: String,
    /// Name of the graph that was executed.
    pub graph_name: String,
    /// When the run started (UTC).
    pub started_at: DateTime<Utc>,
    /// When the run ended, if finalized.
    pub ended_at: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Serialized state the run started from.
    pub initial_state: Value,
    /// Serialized state at finalization, if any.
    pub final_state: Option<Value>,
    /// Number of steps recorded; set at finalization.
    pub step_count: u64,
    /// Free-form caller metadata.
    pub metadata: Map<String, Value>,
}

impl Execution {
    /// Create a new running execution with the given id.
    pub fn new(
        execution_id: impl Into<String>,
        graph_name: impl Into<String>,
        initial_state: Value,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            graph_name: graph_name.into(),
            started_at: Utc::now(),
            ended_at: None,
            status: RunStatus::Running,
            initial_state,
            final_state: None,
            step_count: 0,
            metadata: Map::new(),
        }
    }

    /// Generate a fresh execution id (16 hex chars).
    pub fn new_id() -> String {
        short_id(EXECUTION_ID_LEN)
    }
}

/// One node execution within a graph run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Opaque unique id for the step.
    pub step_id: String,
    /// The execution this step belongs to.
    pub execution_id: String,
    /// Name of the node that ran.
    pub node_name: String,
    /// Dense, monotone position within the execution, starting at 0.
    pub step_index: u64,
    /// When the node invocation was observed to start.
    pub timestamp_start: DateTime<Utc>,
    /// When the node invocation was observed to end.
    pub timestamp_end: Option<DateTime<Utc>>,
    /// Outcome of the invocation.
    pub status: RunStatus,
    /// Full serialized pre-state; populated only on checkpoint steps.
    pub state_before: Option<Value>,
    /// Full serialized post-state; populated only on checkpoint steps.
    pub state_after: Option<Value>,
    /// Structural diff from the previous state to this step's post-state.
    pub state_diff: StateDiff,
    /// True when this step carries a full snapshot.
    pub is_checkpoint: bool,
    /// Error description when the node failed.
    pub error: Option<String>,
    /// Free-form metadata (size-limit flags, caller annotations).
    pub metadata: Map<String, Value>,
}

impl ExecutionStep {
    /// Generate a fresh step id (12 hex chars).
    pub fn new_id() -> String {
        short_id(STEP_ID_LEN)
    }
}

/// Captured conditional edge evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// The step the decision is associated with; empty when unknown.
    pub step_id: String,
    /// The execution the decision belongs to. When a known `step_id` is
    /// given, storage resolves this from the step instead.
    pub execution_id: String,
    /// Node (or edge id) the decision routed away from.
    pub source_node: String,
    /// Branch label the predicate returned.
    pub target_node: String,
    /// Human-readable description of the predicate.
    pub condition_description: String,
    /// Serialized state the predicate saw.
    pub condition_inputs: Value,
    /// Serialized value the predicate returned.
    pub evaluated_value: Value,
}
