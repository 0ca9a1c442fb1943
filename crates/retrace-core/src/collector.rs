// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Central collector that receives execution events from instrumentation.
//!
//! The collector is the bridge between node wrappers and storage. It owns
//! the per-execution step counters, computes diffs, applies the checkpoint
//! policy, and fans recorded events out to subscribers (e.g. a live
//! broadcast hook registered by an external server).
//!
//! Every method is synchronous and non-suspending. Wrappers may call in
//! from inside a host framework's scheduler; the only blocking operations
//! here are the counter mutex and the storage write mutex. Step index
//! allocation and the step write happen under the same lock, so step rows
//! of one execution are always persisted in index order.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{ConfigError, RecorderConfig};
use crate::diff::compute_diff;
use crate::error::CollectorError;
use crate::model::{Execution, ExecutionStep, RoutingDecision, RunStatus};
use crate::serialize::serialize_state;
use crate::storage::SyncSqliteStore;

/// Subscriber callback: `(event_type, payload)`.
///
/// Invoked synchronously inside the recording path after each persist;
/// callbacks must not block.
pub type EventCallback = Box<dyn Fn(&str, &Value) + Send + Sync>;

/// Handle returned by [`Collector::subscribe`]; pass it to
/// [`Collector::unsubscribe`] to detach the callback again. Closures have
/// no identity to compare, so removal is by token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberId(u64);

/// Registered subscribers plus the id counter for the next one.
struct Subscribers {
    next_id: u64,
    entries: Vec<(SubscriberId, EventCallback)>,
}

/// Metadata flag set on a step when a serialized snapshot exceeds the
/// configured advisory limit.
const SIZE_EXCEEDED_FLAG: &str = "state_size_exceeded";

/// Receives execution events and persists them.
///
/// Designed to be installed once per process (see the SDK registry);
/// instrumentation reads the shared reference on every node invocation.
pub struct Collector {
    config: RecorderConfig,
    store: SyncSqliteStore,
    counters: Mutex<HashMap<String, u64>>,
    subscribers: Mutex<Subscribers>,
}

impl Collector {
    /// Create a collector over an opened store.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration is invalid (e.g. a
    /// zero checkpoint interval).
    pub fn new(config: RecorderConfig, store: SyncSqliteStore) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            counters: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Subscribers {
                next_id: 0,
                entries: Vec::new(),
            }),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// The underlying synchronous store.
    pub fn store(&self) -> &SyncSqliteStore {
        &self.store
    }

    /// Register a callback for live event streaming.
    pub fn subscribe(&self, callback: EventCallback) -> SubscriberId {
        let mut subscribers = self.lock_subscribers();
        let id = SubscriberId(subscribers.next_id);
        subscribers.next_id += 1;
        subscribers.entries.push((id, callback));
        id
    }

    /// Remove a previously registered callback. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.lock_subscribers()
            .entries
            .retain(|(entry_id, _)| *entry_id != id);
    }

    fn lock_counters(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Notify all subscribers of an event.
    fn emit<T: Serialize>(&self, event_type: &str, payload: &T) {
        let subscribers = self.lock_subscribers();
        if subscribers.entries.is_empty() {
            return;
        }
        let payload = serialize_state(payload);
        for (_, callback) in subscribers.entries.iter() {
            callback(event_type, &payload);
        }
    }

    // --- Execution lifecycle ---

    /// Record the start of a new graph execution.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::DuplicateExecution`] when the id was
    /// already started, and storage errors otherwise.
    pub fn start_execution<S>(
        &self,
        execution_id: impl Into<String>,
        graph_name: impl Into<String>,
        initial_state: &S,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Execution, CollectorError>
    where
        S: Serialize + ?Sized,
    {
        let execution_id = execution_id.into();
        let mut execution = Execution::new(
            execution_id.clone(),
            graph_name,
            serialize_state(initial_state),
        );
        if let Some(metadata) = metadata {
            execution.metadata = metadata;
        }

        {
            let mut counters = self.lock_counters();
            self.store.save_execution(&execution).map_err(|err| {
                match err {
                    crate::error::StoreError::AlreadyExists { id, .. } => {
                        CollectorError::DuplicateExecution { execution_id: id }
                    }
                    other => CollectorError::Store(other),
                }
            })?;
            counters.insert(execution_id.clone(), 0);
        }

        self.emit("execution_started", &execution);
        debug!(execution_id = %execution_id, graph = %execution.graph_name, "execution started");
        Ok(execution)
    }

    /// Record the end of a graph execution. Idempotent; an unknown id logs
    /// a warning and returns without error.
    pub fn end_execution<S>(
        &self,
        execution_id: &str,
        final_state: &S,
        status: RunStatus,
    ) -> Result<(), CollectorError>
    where
        S: Serialize + ?Sized,
    {
        let Some(mut execution) = self.store.get_execution(execution_id)? else {
            warn!(execution_id = %execution_id, "end_execution called for unknown execution");
            return Ok(());
        };

        execution.ended_at = Some(Utc::now());
        execution.status = status;
        execution.final_state = Some(serialize_state(final_state));
        execution.step_count = self
            .lock_counters()
            .get(execution_id)
            .copied()
            .unwrap_or(0);
        self.store.update_execution(&execution)?;

        self.emit("execution_ended", &execution);
        debug!(execution_id = %execution_id, status = status.as_str(), "execution ended");
        Ok(())
    }

    // --- Step lifecycle ---

    /// Record a single node execution with its state transition.
    ///
    /// This is the central operation called by node wrappers. It serializes
    /// both states, computes the diff (honoring configured ignore keys),
    /// allocates the next dense step index, applies the checkpoint policy,
    /// and persists the step.
    pub fn record_step<B, A>(
        &self,
        execution_id: &str,
        node_name: &str,
        state_before: &B,
        state_after: &A,
        error: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<ExecutionStep, CollectorError>
    where
        B: Serialize + ?Sized,
        A: Serialize + ?Sized,
    {
        let before = serialize_state(state_before);
        let after = serialize_state(state_after);
        let diff = compute_diff(&before, &after, &self.config.ignore_keys);

        let mut metadata = metadata.unwrap_or_default();
        if self.snapshot_exceeds_limit(&before) || self.snapshot_exceeds_limit(&after) {
            metadata.insert(SIZE_EXCEEDED_FLAG.to_string(), Value::Bool(true));
        }

        let step = {
            // Index allocation and the write stay under one lock so rows
            // land in index order per execution.
            let mut counters = self.lock_counters();
            let counter = counters.entry(execution_id.to_string()).or_insert(0);
            let step_index = *counter;
            *counter += 1;

            let is_checkpoint = step_index % self.config.checkpoint_interval == 0;
            let now = Utc::now();
            let step = ExecutionStep {
                step_id: ExecutionStep::new_id(),
                execution_id: execution_id.to_string(),
                node_name: node_name.to_string(),
                step_index,
                timestamp_start: now,
                timestamp_end: Some(now),
                status: if error.is_some() {
                    RunStatus::Failed
                } else {
                    RunStatus::Completed
                },
                state_before: is_checkpoint.then(|| before.clone()),
                state_after: is_checkpoint.then(|| after.clone()),
                state_diff: diff,
                is_checkpoint,
                error,
                metadata,
            };
            self.store.save_step(&step)?;
            step
        };

        self.emit("step_recorded", &step);
        debug!(
            execution_id = %execution_id,
            node = %node_name,
            step_index = step.step_index,
            checkpoint = step.is_checkpoint,
            diff_entries = step.state_diff.len(),
            "step recorded"
        );
        Ok(step)
    }

    /// Record a conditional routing decision. Never affects step numbering.
    #[allow(clippy::too_many_arguments)]
    pub fn record_routing<S, E>(
        &self,
        step_id: impl Into<String>,
        execution_id: impl Into<String>,
        source_node: impl Into<String>,
        target_node: impl Into<String>,
        condition_description: impl Into<String>,
        condition_inputs: &S,
        evaluated_value: &E,
    ) -> Result<(), CollectorError>
    where
        S: Serialize + ?Sized,
        E: Serialize + ?Sized,
    {
        let decision = RoutingDecision {
            step_id: step_id.into(),
            execution_id: execution_id.into(),
            source_node: source_node.into(),
            target_node: target_node.into(),
            condition_description: condition_description.into(),
            condition_inputs: serialize_state(condition_inputs),
            evaluated_value: serialize_state(evaluated_value),
        };
        self.store.save_routing_decision(&decision)?;
        self.emit("routing_decision", &decision);
        Ok(())
    }

    /// True when the serialized snapshot is larger than the advisory limit.
    fn snapshot_exceeds_limit(&self, tree: &Value) -> bool {
        match serde_json::to_string(tree) {
            Ok(encoded) => encoded.len() > self.config.max_state_size_bytes,
            Err(_) => false,
        }
    }
}
