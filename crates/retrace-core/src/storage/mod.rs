//! Persistence for execution traces.
//!
//! Two backends share one schema and one database file:
//!
//! - [`SyncSqliteStore`] (rusqlite): the recording path. Fully synchronous,
//!   writes serialized behind a mutex. Node wrappers may run inside a host
//!   scheduler, so this path never suspends.
//! - [`SqliteStore`] (sqlx): the query path, used by an external server
//!   from its own async runtime. Read-only, own connection pool, never
//!   shares connection state with the writer.
//!
//! WAL journaling lets the reader pool operate while the collector writes.
//! The `steps` relation is append-only: no row is ever updated or deleted.

pub mod sqlite;
pub mod sqlite_sync;

pub use self::sqlite::SqliteStore;
pub use self::sqlite_sync::SyncSqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::diff::apply_diff;
use crate::error::StoreError;
use crate::model::{Execution, ExecutionStep, RoutingDecision, RunStatus, StateDiff};

/// Database schema shared by both backends. Either end may bootstrap it;
/// every statement is idempotent.
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS executions (
    execution_id   TEXT PRIMARY KEY,
    graph_name     TEXT NOT NULL,
    started_at     TEXT NOT NULL,
    ended_at       TEXT,
    status         TEXT NOT NULL DEFAULT 'running',
    initial_state  TEXT NOT NULL DEFAULT '{}',
    final_state    TEXT,
    step_count     INTEGER NOT NULL DEFAULT 0,
    metadata       TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS steps (
    step_id         TEXT PRIMARY KEY,
    execution_id    TEXT NOT NULL,
    node_name       TEXT NOT NULL,
    step_index      INTEGER NOT NULL,
    timestamp_start TEXT NOT NULL,
    timestamp_end   TEXT,
    status          TEXT NOT NULL DEFAULT 'running',
    state_before    TEXT,
    state_after     TEXT,
    state_diff      TEXT NOT NULL DEFAULT '{"changed":[],"added":[],"removed":[]}',
    is_checkpoint   INTEGER NOT NULL DEFAULT 0,
    error           TEXT,
    metadata        TEXT NOT NULL DEFAULT '{}',
    FOREIGN KEY (execution_id) REFERENCES executions(execution_id)
);

CREATE INDEX IF NOT EXISTS idx_steps_execution ON steps(execution_id, step_index);

CREATE TABLE IF NOT EXISTS routing_decisions (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    step_id               TEXT NOT NULL,
    execution_id          TEXT NOT NULL,
    source_node           TEXT NOT NULL,
    target_node           TEXT NOT NULL,
    condition_description TEXT NOT NULL DEFAULT '',
    condition_inputs      TEXT NOT NULL DEFAULT '{}',
    evaluated_value       TEXT,
    FOREIGN KEY (step_id) REFERENCES steps(step_id),
    FOREIGN KEY (execution_id) REFERENCES executions(execution_id)
);

CREATE INDEX IF NOT EXISTS idx_routing_execution ON routing_decisions(execution_id);
"#;

/// Read-only trace access for the query path.
///
/// Implemented by the async backend; the replay engine and the query
/// surface operate over this trait so an external server never touches the
/// recording connection.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch one execution by id.
    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, StoreError>;

    /// List executions, newest first.
    async fn list_executions(&self, limit: u32, offset: u32)
    -> Result<Vec<Execution>, StoreError>;

    /// Fetch one step by id.
    async fn get_step(&self, step_id: &str) -> Result<Option<ExecutionStep>, StoreError>;

    /// List all steps of an execution by ascending step index.
    async fn list_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>, StoreError>;

    /// List routing decisions of an execution in recording order.
    async fn get_routing_decisions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<RoutingDecision>, StoreError>;

    /// Reconstruct the state after the given step, or `None` when the
    /// execution or the step index does not exist.
    async fn get_state_at_step(
        &self,
        execution_id: &str,
        step_index: u64,
    ) -> Result<Option<Value>, StoreError>;
}

/// Render a timestamp for storage (RFC 3339, fixed microsecond precision so
/// lexicographic and chronological order agree).
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| format!("bad timestamp '{raw}': {err}"))
}

/// Fold steps forward over a base state: checkpoints replace the state
/// wholesale, everything else applies its diff.
pub(crate) fn roll_forward<I>(base: Value, steps: I) -> Value
where
    I: IntoIterator<Item = ExecutionStep>,
{
    steps.into_iter().fold(base, |state, step| {
        if step.is_checkpoint
            && let Some(snapshot) = step.state_after
        {
            snapshot
        } else {
            apply_diff(&state, &step.state_diff)
        }
    })
}

// ============================================================================
// Raw rows
// ============================================================================
//
// Both backends decode through these intermediate structs so the
// string-to-model conversion (timestamps, JSON columns) lives in one place.

/// Raw `executions` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ExecutionRow {
    pub execution_id: String,
    pub graph_name: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: String,
    pub initial_state: String,
    pub final_state: Option<String>,
    pub step_count: i64,
    pub metadata: String,
}

impl ExecutionRow {
    /// Decode into the domain model.
    pub(crate) fn into_execution(self) -> Result<Execution, StoreError> {
        let corrupt = |details: String| StoreError::Corrupt {
            entity: "execution",
            id: self.execution_id.clone(),
            details,
        };

        Ok(Execution {
            started_at: parse_timestamp(&self.started_at).map_err(&corrupt)?,
            ended_at: self
                .ended_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(&corrupt)?,
            status: RunStatus::parse(&self.status),
            initial_state: serde_json::from_str(&self.initial_state)
                .map_err(|e| corrupt(e.to_string()))?,
            final_state: self
                .final_state
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| corrupt(e.to_string()))?,
            step_count: self.step_count.max(0) as u64,
            metadata: decode_metadata(&self.metadata).map_err(&corrupt)?,
            execution_id: self.execution_id,
            graph_name: self.graph_name,
        })
    }
}

/// Raw `steps` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct StepRow {
    pub step_id: String,
    pub execution_id: String,
    pub node_name: String,
    pub step_index: i64,
    pub timestamp_start: String,
    pub timestamp_end: Option<String>,
    pub status: String,
    pub state_before: Option<String>,
    pub state_after: Option<String>,
    pub state_diff: String,
    pub is_checkpoint: i64,
    pub error: Option<String>,
    pub metadata: String,
}

impl StepRow {
    /// Decode into the domain model.
    pub(crate) fn into_step(self) -> Result<ExecutionStep, StoreError> {
        let corrupt = |details: String| StoreError::Corrupt {
            entity: "step",
            id: self.step_id.clone(),
            details,
        };

        Ok(ExecutionStep {
            step_index: self.step_index.max(0) as u64,
            timestamp_start: parse_timestamp(&self.timestamp_start).map_err(&corrupt)?,
            timestamp_end: self
                .timestamp_end
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(&corrupt)?,
            status: RunStatus::parse(&self.status),
            state_before: self
                .state_before
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| corrupt(e.to_string()))?,
            state_after: self
                .state_after
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| corrupt(e.to_string()))?,
            state_diff: serde_json::from_str::<StateDiff>(&self.state_diff)
                .map_err(|e| corrupt(e.to_string()))?,
            is_checkpoint: self.is_checkpoint != 0,
            metadata: decode_metadata(&self.metadata).map_err(&corrupt)?,
            step_id: self.step_id,
            execution_id: self.execution_id,
            node_name: self.node_name,
            error: self.error,
        })
    }
}

/// Raw `routing_decisions` row.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RoutingRow {
    pub step_id: String,
    pub execution_id: String,
    pub source_node: String,
    pub target_node: String,
    pub condition_description: String,
    pub condition_inputs: String,
    pub evaluated_value: Option<String>,
}

impl RoutingRow {
    /// Decode into the domain model.
    pub(crate) fn into_decision(self) -> Result<RoutingDecision, StoreError> {
        let corrupt = |details: String| StoreError::Corrupt {
            entity: "routing decision",
            id: self.step_id.clone(),
            details,
        };

        Ok(RoutingDecision {
            condition_inputs: serde_json::from_str(&self.condition_inputs)
                .map_err(|e| corrupt(e.to_string()))?,
            evaluated_value: self
                .evaluated_value
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| corrupt(e.to_string()))?
                .unwrap_or(Value::Null),
            step_id: self.step_id,
            execution_id: self.execution_id,
            source_node: self.source_node,
            target_node: self.target_node,
            condition_description: self.condition_description,
        })
    }
}

/// Decode a metadata column; tolerates non-object JSON by wrapping nothing.
fn decode_metadata(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw).map_err(|e| e.to_string())? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}
