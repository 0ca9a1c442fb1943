// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replay engine - deterministic state reconstruction without re-execution.
//!
//! Reconstructs the full state at any point of an execution timeline from
//! checkpoint snapshots plus incremental diffs. With the default checkpoint
//! interval of 10, at most 9 diffs are applied for any single lookup.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::diff::{apply_diff, compute_diff};
use crate::error::StoreError;
use crate::model::{RunStatus, StateDiff};
use crate::storage::StateStore;

/// One entry of a reconstructed timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    /// Position within the execution.
    pub step_index: u64,
    /// Node that produced this transition.
    pub node_name: String,
    /// Full reconstructed state after the step.
    pub state: Value,
    /// The diff the step recorded.
    pub diff: StateDiff,
    /// Observed start of the node invocation.
    pub timestamp_start: DateTime<Utc>,
    /// Observed end of the node invocation.
    pub timestamp_end: Option<DateTime<Utc>>,
    /// Outcome of the step.
    pub status: RunStatus,
    /// Error description for failed steps.
    pub error: Option<String>,
}

/// Result of comparing the states at two steps.
#[derive(Debug, Clone, Serialize)]
pub struct StepComparison {
    /// First compared index.
    pub step_a: u64,
    /// Second compared index.
    pub step_b: u64,
    /// Reconstructed state after `step_a`.
    pub state_a: Value,
    /// Reconstructed state after `step_b`.
    pub state_b: Value,
    /// Structural diff from `state_a` to `state_b`.
    pub diff: StateDiff,
}

/// Reconstructs state at any point of an execution timeline.
#[derive(Clone)]
pub struct ReplayEngine {
    store: Arc<dyn StateStore>,
}

impl ReplayEngine {
    /// Create a replay engine over a trace store.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Reconstruct the state after a specific step.
    ///
    /// Delegates to the store, which walks back to the nearest checkpoint
    /// and applies forward diffs. Returns `None` for unknown executions or
    /// step indices that were never recorded.
    pub async fn get_state_at_step(
        &self,
        execution_id: &str,
        step_index: u64,
    ) -> Result<Option<Value>, StoreError> {
        self.store.get_state_at_step(execution_id, step_index).await
    }

    /// Reconstruct the complete state timeline of an execution.
    ///
    /// Folds every step from the initial state; checkpoint snapshots
    /// replace the running state wholesale. Used by a visualizer's replay
    /// slider for instant scrubbing.
    pub async fn get_full_timeline(
        &self,
        execution_id: &str,
    ) -> Result<Vec<TimelineEntry>, StoreError> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            return Ok(Vec::new());
        };

        let steps = self.store.list_steps(execution_id).await?;
        let mut timeline = Vec::with_capacity(steps.len());
        let mut current = execution.initial_state;

        for step in steps {
            current = if step.is_checkpoint && step.state_after.is_some() {
                step.state_after.clone().unwrap_or_default()
            } else {
                apply_diff(&current, &step.state_diff)
            };

            timeline.push(TimelineEntry {
                step_index: step.step_index,
                node_name: step.node_name,
                state: current.clone(),
                diff: step.state_diff,
                timestamp_start: step.timestamp_start,
                timestamp_end: step.timestamp_end,
                status: step.status,
                error: step.error,
            });
        }

        Ok(timeline)
    }

    /// Reconstruct states for a step range (both bounds inclusive).
    ///
    /// A visualizer pre-fetches a window of states around the scrubber
    /// position with this.
    pub async fn get_state_range(
        &self,
        execution_id: &str,
        start_step: u64,
        end_step: u64,
    ) -> Result<Vec<TimelineEntry>, StoreError> {
        let timeline = self.get_full_timeline(execution_id).await?;
        Ok(timeline
            .into_iter()
            .filter(|entry| entry.step_index >= start_step && entry.step_index <= end_step)
            .collect())
    }

    /// Compare the states at two arbitrary steps.
    ///
    /// Returns `None` when either step cannot be reconstructed.
    pub async fn compare_steps(
        &self,
        execution_id: &str,
        step_a: u64,
        step_b: u64,
    ) -> Result<Option<StepComparison>, StoreError> {
        let state_a = self.get_state_at_step(execution_id, step_a).await?;
        let state_b = self.get_state_at_step(execution_id, step_b).await?;

        let (Some(state_a), Some(state_b)) = (state_a, state_b) else {
            return Ok(None);
        };

        let diff = compute_diff(&state_a, &state_b, &HashSet::new());
        Ok(Some(StepComparison {
            step_a,
            step_b,
            state_a,
            state_b,
            diff,
        }))
    }
}
