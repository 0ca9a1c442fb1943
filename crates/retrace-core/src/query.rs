// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-only query surface consumed by an external server.
//!
//! This facade bundles the async store and the replay engine behind the
//! verbs a trace server exposes. Exact wire encoding is the server's
//! concern; this layer returns domain models.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::error::StoreError;
use crate::model::{Execution, ExecutionStep, RoutingDecision};
use crate::replay::{ReplayEngine, StepComparison, TimelineEntry};
use crate::storage::{SqliteStore, StateStore};

/// Largest accepted page size for execution listings.
const MAX_LIST_LIMIT: u32 = 200;

/// Read-only access to recorded traces.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn StateStore>,
    replay: ReplayEngine,
}

impl QueryService {
    /// Create a query service over a trace store.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        let replay = ReplayEngine::new(Arc::clone(&store));
        Self { store, replay }
    }

    /// Open the database at `path` read-side and build a query service.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let store = SqliteStore::from_path(path).await?;
        Ok(Self::new(Arc::new(store)))
    }

    /// List executions, newest first. The limit is clamped to `[1, 200]`.
    pub async fn list_executions(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Execution>, StoreError> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        self.store.list_executions(limit, offset).await
    }

    /// Fetch one execution by id.
    pub async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<Execution>, StoreError> {
        self.store.get_execution(execution_id).await
    }

    /// List all steps of an execution by ascending step index.
    pub async fn list_steps(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ExecutionStep>, StoreError> {
        self.store.list_steps(execution_id).await
    }

    /// Reconstruct the state after a specific step.
    pub async fn get_state_at_step(
        &self,
        execution_id: &str,
        step_index: u64,
    ) -> Result<Option<Value>, StoreError> {
        self.replay.get_state_at_step(execution_id, step_index).await
    }

    /// Reconstruct the complete per-step timeline.
    pub async fn get_timeline(
        &self,
        execution_id: &str,
    ) -> Result<Vec<TimelineEntry>, StoreError> {
        self.replay.get_full_timeline(execution_id).await
    }

    /// List routing decisions of an execution.
    pub async fn list_routing(
        &self,
        execution_id: &str,
    ) -> Result<Vec<RoutingDecision>, StoreError> {
        self.store.get_routing_decisions(execution_id).await
    }

    /// Compare the states at two steps.
    pub async fn compare(
        &self,
        execution_id: &str,
        step_a: u64,
        step_b: u64,
    ) -> Result<Option<StepComparison>, StoreError> {
        self.replay.compare_steps(execution_id, step_a, step_b).await
    }
}
