//! Async SQLite backend for the query path.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};

use crate::error::StoreError;
use crate::model::{Execution, ExecutionStep, RoutingDecision};

use super::{ExecutionRow, RoutingRow, SCHEMA, StateStore, StepRow, roll_forward};

/// Async SQLite store backed by its own connection pool.
///
/// This is the read side consumed by an external server. It shares the
/// database file with [`super::SyncSqliteStore`] but never its connection:
/// WAL journaling keeps concurrent reads safe while the collector writes.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if necessary) the database at `path` and ensure the
    /// schema exists.
    ///
    /// Usually the recording side has already created both file and schema;
    /// bootstrapping here as well lets the query path start first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] when the pool cannot connect or
    /// the schema cannot be created.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
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

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| unavailable(format!("schema: {e}")))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get_execution(&self, execution_id: &str) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ExecutionRow::into_execution).transpose()
    }

    async fn list_executions(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT * FROM executions ORDER BY started_at DESC LIMIT ? OFFSET ?",
        )
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(ExecutionRow::into_execution)
            .collect()
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<ExecutionStep>, StoreError> {
        let row = sqlx::query_as::<_, StepRow>("SELECT * FROM steps WHERE step_id = ?")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(StepRow::into_step).transpose()
    }

    async fn list_steps(&self, execution_id: &str) -> Result<Vec<ExecutionStep>, StoreError> {
        let rows = sqlx::query_as::<_, StepRow>(
            "SELECT * FROM steps WHERE execution_id = ? ORDER BY step_index ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StepRow::into_step).collect()
    }

    async fn get_routing_decisions(
        &self,
        execution_id: &str,
    ) -> Result<Vec<RoutingDecision>, StoreError> {
        let rows = sqlx::query_as::<_, RoutingRow>(
            r#"
            SELECT step_id, execution_id, source_node, target_node,
                   condition_description, condition_inputs, evaluated_value
            FROM routing_decisions WHERE execution_id = ? ORDER BY id ASC
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RoutingRow::into_decision).collect()
    }

    async fn get_state_at_step(
        &self,
        execution_id: &str,
        step_index: u64,
    ) -> Result<Option<Value>, StoreError> {
        let target = step_index as i64;

        let max_index: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(step_index) FROM steps WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_one(&self.pool)
        .await?;
        let Some(max_index) = max_index else {
            return Ok(None);
        };
        if target > max_index {
            return Ok(None);
        }

        let checkpoint = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT * FROM steps
            WHERE execution_id = ? AND step_index <= ? AND is_checkpoint = 1
            ORDER BY step_index DESC LIMIT 1
            "#,
        )
        .bind(execution_id)
        .bind(target)
        .fetch_optional(&self.pool)
        .await?
        .map(StepRow::into_step)
        .transpose()?;

        let (base, cursor) = match checkpoint {
            Some(step) => {
                let cursor = step.step_index as i64 + 1;
                (step.state_after.unwrap_or_default(), cursor)
            }
            None => match self.get_execution(execution_id).await? {
                Some(execution) => (execution.initial_state, 0),
                None => return Ok(None),
            },
        };

        let steps = if cursor <= target {
            let rows = sqlx::query_as::<_, StepRow>(
                r#"
                SELECT * FROM steps
                WHERE execution_id = ? AND step_index >= ? AND step_index <= ?
                ORDER BY step_index ASC
                "#,
            )
            .bind(execution_id)
            .bind(cursor)
            .bind(target)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter()
                .map(StepRow::into_step)
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };

        Ok(Some(roll_forward(base, steps)))
    }
}
