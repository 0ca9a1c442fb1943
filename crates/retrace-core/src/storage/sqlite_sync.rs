//! Synchronous SQLite backend for the recording path.
//!
//! Node wrappers may fire from inside a host framework's own scheduler;
//! introducing awaits there causes re-entrancy hazards. This backend is
//! plain rusqlite behind a mutex: the only blocking operation on the
//! recording path is this write lock. The async [`super::SqliteStore`]
//! remains available for the query path, which runs in its own runtime and
//! never shares this connection.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use serde_json::Value;

use crate::error::StoreError;
use crate::model::{Execution, ExecutionStep, RoutingDecision};

use super::{ExecutionRow, RoutingRow, SCHEMA, StepRow, format_timestamp, roll_forward};

/// Busy timeout for the writer connection.
const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Thread-safe synchronous SQLite storage.
///
/// WAL mode allows external readers to operate concurrently while steps are
/// appended here. Step rows are never updated or deleted; executions are
/// updated once, at finalization, and only in their tail fields.
pub struct SyncSqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SyncSqliteStore {
    /// Open (creating if necessary) the database at `path` and ensure the
    /// schema exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the file cannot be opened
    /// or the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let unavailable = |details: String| StoreError::Unavailable {
            path: path.display().to_string(),
            details,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| unavailable(e.to_string()))?;
        }

        let conn = Connection::open(path).map_err(|e| unavailable(e.to_string()))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| unavailable(e.to_string()))?;
        // journal_mode returns a result row; query it instead of execute.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(|e| unavailable(e.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| unavailable(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| unavailable(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Executions ---

    /// Insert a new execution.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] when the id is taken.
    pub fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO executions
                (execution_id, graph_name, started_at, ended_at, status,
                 initial_state, final_state, step_count, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                execution.execution_id,
                execution.graph_name,
                format_timestamp(&execution.started_at),
                execution.ended_at.as_ref().map(format_timestamp),
                execution.status.as_str(),
                serde_json::to_string(&execution.initial_state)?,
                execution
                    .final_state
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                execution.step_count as i64,
                serde_json::to_string(&execution.metadata)?,
            ],
        )
        .map_err(|err| match &err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::AlreadyExists {
                    entity: "execution",
                    id: execution.execution_id.clone(),
                }
            }
            _ => StoreError::Database {
                operation: "save_execution".to_string(),
                details: err.to_string(),
            },
        })?;
        Ok(())
    }

    /// Write the finalization fields of an execution. Never touches
    /// `graph_name`, `started_at`, or `initial_state`.
    pub fn update_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            r#"
            UPDATE executions SET
                ended_at = ?1, status = ?2, final_state = ?3,
                step_count = ?4, metadata = ?5
            WHERE execution_id = ?6
            "#,
            params![
                execution.ended_at.as_ref().map(format_timestamp),
                execution.status.as_str(),
                execution
                    .final_state
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                execution.step_count as i64,
                serde_json::to_string(&execution.metadata)?,
                execution.execution_id,
            ],
        )?;
        Ok(())
    }

    /// Fetch one execution by id.
    pub fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, StoreError> {
        query_execution(&self.conn(), execution_id)
    }

    /// List executions, newest first.
    pub fn list_executions(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Execution>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM executions ORDER BY started_at DESC LIMIT ?1 OFFSET ?2",
        )?;
        let rows = stmt.query_map(params![limit, offset], execution_row)?;
        rows.map(|row| row.map_err(StoreError::from)?.into_execution())
            .collect()
    }

    // --- Steps ---

    /// Append one step. Step rows are immutable once written.
    pub fn save_step(&self, step: &ExecutionStep) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO steps
                (step_id, execution_id, node_name, step_index, timestamp_start,
                 timestamp_end, status, state_before, state_after, state_diff,
                 is_checkpoint, error, metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                step.step_id,
                step.execution_id,
                step.node_name,
                step.step_index as i64,
                format_timestamp(&step.timestamp_start),
                step.timestamp_end.as_ref().map(format_timestamp),
                step.status.as_str(),
                step.state_before
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                step.state_after
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&step.state_diff)?,
                step.is_checkpoint as i64,
                step.error,
                serde_json::to_string(&step.metadata)?,
            ],
        )
        .map_err(|err| StoreError::Database {
            operation: "save_step".to_string(),
            details: err.to_string(),
        })?;
        Ok(())
    }

    /// Fetch one step by id.
    pub fn get_step(&self, step_id: &str) -> Result<Option<ExecutionStep>, StoreError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT * FROM steps WHERE step_id = ?1",
                params![step_id],
                step_row,
            )
            .optional()?;
        row.map(StepRow::into_step).transpose()
    }

    /// List all steps of an execution by ascending step index.
    pub fn list_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>, StoreError> {
        query_steps_in_range(&self.conn(), execution_id, 0, i64::MAX)
    }

    // --- Routing ---

    /// Persist a routing decision. A known `step_id` resolves the owning
    /// execution from the step row; otherwise the decision's own
    /// `execution_id` is trusted.
    pub fn save_routing_decision(&self, decision: &RoutingDecision) -> Result<(), StoreError> {
        let conn = self.conn();
        let execution_id: String = if decision.step_id.is_empty() {
            decision.execution_id.clone()
        } else {
            conn.query_row(
                "SELECT execution_id FROM steps WHERE step_id = ?1",
                params![decision.step_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or_else(|| decision.execution_id.clone())
        };

        conn.execute(
            r#"
            INSERT INTO routing_decisions
                (step_id, execution_id, source_node, target_node,
                 condition_description, condition_inputs, evaluated_value)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                decision.step_id,
                execution_id,
                decision.source_node,
                decision.target_node,
                decision.condition_description,
                serde_json::to_string(&decision.condition_inputs)?,
                serde_json::to_string(&decision.evaluated_value)?,
            ],
        )?;
        Ok(())
    }

    /// List routing decisions of an execution in recording order.
    pub fn get_routing_decisions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<RoutingDecision>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT step_id, execution_id, source_node, target_node,
                   condition_description, condition_inputs, evaluated_value
            FROM routing_decisions WHERE execution_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![execution_id], routing_row)?;
        rows.map(|row| row.map_err(StoreError::from)?.into_decision())
            .collect()
    }

    // --- Replay support ---

    /// Reconstruct the state after `step_index` from the nearest prior
    /// checkpoint plus forward diffs. Returns `None` when the execution is
    /// unknown or the index was never recorded.
    pub fn get_state_at_step(
        &self,
        execution_id: &str,
        step_index: u64,
    ) -> Result<Option<Value>, StoreError> {
        let conn = self.conn();
        let target = step_index as i64;

        let max_index: Option<i64> = conn.query_row(
            "SELECT MAX(step_index) FROM steps WHERE execution_id = ?1",
            params![execution_id],
            |row| row.get(0),
        )?;
        let Some(max_index) = max_index else {
            return Ok(None);
        };
        if target > max_index {
            return Ok(None);
        }

        let checkpoint = conn
            .query_row(
                r#"
                SELECT * FROM steps
                WHERE execution_id = ?1 AND step_index <= ?2 AND is_checkpoint = 1
                ORDER BY step_index DESC LIMIT 1
                "#,
                params![execution_id, target],
                step_row,
            )
            .optional()?
            .map(StepRow::into_step)
            .transpose()?;

        let (base, cursor) = match checkpoint {
            Some(step) => {
                let cursor = step.step_index as i64 + 1;
                (step.state_after.unwrap_or_default(), cursor)
            }
            None => match query_execution(&conn, execution_id)? {
                Some(execution) => (execution.initial_state, 0),
                None => return Ok(None),
            },
        };

        let steps = if cursor <= target {
            query_steps_in_range(&conn, execution_id, cursor, target)?
        } else {
            Vec::new()
        };

        Ok(Some(roll_forward(base, steps)))
    }
}

// --- Row closures and shared queries ---

fn execution_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok(ExecutionRow {
        execution_id: row.get("execution_id")?,
        graph_name: row.get("graph_name")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
        status: row.get("status")?,
        initial_state: row.get("initial_state")?,
        final_state: row.get("final_state")?,
        step_count: row.get("step_count")?,
        metadata: row.get("metadata")?,
    })
}

fn step_row(row: &Row<'_>) -> rusqlite::Result<StepRow> {
    Ok(StepRow {
        step_id: row.get("step_id")?,
        execution_id: row.get("execution_id")?,
        node_name: row.get("node_name")?,
        step_index: row.get("step_index")?,
        timestamp_start: row.get("timestamp_start")?,
        timestamp_end: row.get("timestamp_end")?,
        status: row.get("status")?,
        state_before: row.get("state_before")?,
        state_after: row.get("state_after")?,
        state_diff: row.get("state_diff")?,
        is_checkpoint: row.get("is_checkpoint")?,
        error: row.get("error")?,
        metadata: row.get("metadata")?,
    })
}

fn routing_row(row: &Row<'_>) -> rusqlite::Result<RoutingRow> {
    Ok(RoutingRow {
        step_id: row.get("step_id")?,
        execution_id: row.get("execution_id")?,
        source_node: row.get("source_node")?,
        target_node: row.get("target_node")?,
        condition_description: row.get("condition_description")?,
        condition_inputs: row.get("condition_inputs")?,
        evaluated_value: row.get("evaluated_value")?,
    })
}

fn query_execution(
    conn: &Connection,
    execution_id: &str,
) -> Result<Option<Execution>, StoreError> {
    let row = conn
        .query_row(
            "SELECT * FROM executions WHERE execution_id = ?1",
            params![execution_id],
            execution_row,
        )
        .optional()?;
    row.map(ExecutionRow::into_execution).transpose()
}

fn query_steps_in_range(
    conn: &Connection,
    execution_id: &str,
    start: i64,
    end: i64,
) -> Result<Vec<ExecutionStep>, StoreError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT * FROM steps
        WHERE execution_id = ?1 AND step_index >= ?2 AND step_index <= ?3
        ORDER BY step_index ASC
        "#,
    )?;
    let rows = stmt.query_map(params![execution_id, start, end], step_row)?;
    rows.map(|row| row.map_err(StoreError::from)?.into_step())
        .collect()
}
