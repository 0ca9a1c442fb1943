// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! A minimal state-graph framework for agent pipelines.
//!
//! A [`StateGraph`] is a set of named nodes over a shared JSON state. Each
//! node receives the current state and returns a *partial* update; the
//! runner merges updates with shallow key override and follows fixed or
//! conditional edges until [`END`] (or a node with no outgoing edge).
//!
//! Nodes are sync or async; the runner preserves the distinction. The sync
//! [`StateGraph::invoke`] refuses graphs containing async nodes, while the
//! async [`StateGraph::ainvoke`] runs sync nodes inline.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use retrace_core::RunStatus;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::registry::active_collector;
use crate::tracker;

/// Reserved node name terminating an execution.
pub const END: &str = "__end__";

/// Config key carrying a caller-chosen execution id (see [`InvokeConfig`]).
pub const EXECUTION_ID_KEY: &str = "retrace_execution_id";

/// Reserved state key the instrumentation reads an execution id from.
pub const STATE_EXECUTION_ID_KEY: &str = "__retrace_execution_id";

/// Default bound on node invocations per run.
const DEFAULT_STEP_LIMIT: usize = 100;

/// An error raised by a user node or routing predicate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct NodeError(String);

impl NodeError {
    /// Create a node error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A node callable, either synchronous or asynchronous.
#[derive(Clone)]
pub enum NodeFn {
    /// Plain function from state to partial update.
    Sync(Arc<dyn Fn(&Value) -> Result<Value, NodeError> + Send + Sync>),
    /// Future-returning function from state to partial update.
    Async(Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, NodeError>> + Send + Sync>),
}

impl fmt::Debug for NodeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("NodeFn::Sync"),
            Self::Async(_) => f.write_str("NodeFn::Async"),
        }
    }
}

/// A routing predicate on a conditional edge.
pub type Router = Arc<dyn Fn(&Value) -> Result<String, NodeError> + Send + Sync>;

/// A conditional edge: a predicate plus a branch-label-to-node mapping.
#[derive(Clone)]
pub struct ConditionalEdge {
    /// The routing predicate.
    pub(crate) router: Router,
    /// Human-readable description of the predicate, for trace inspection.
    pub(crate) description: String,
    /// Maps predicate results to node names. When empty, the predicate
    /// result is used as the target node name directly.
    pub(crate) branches: HashMap<String, String>,
}

/// Errors raised by graph construction and execution.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The graph has no entry point.
    #[error("graph '{graph}' has no entry point")]
    MissingEntryPoint {
        /// The graph name.
        graph: String,
    },

    /// An edge routed to a node that does not exist.
    #[error("unknown node '{node}'")]
    UnknownNode {
        /// The missing node name.
        node: String,
    },

    /// A routing predicate returned a label with no branch mapping.
    #[error("router on '{node}' returned unmapped branch '{label}'")]
    UnknownBranch {
        /// The node the conditional edge leaves from.
        node: String,
        /// The unmapped label.
        label: String,
    },

    /// `invoke` was called on a graph containing an async node.
    #[error("node '{node}' is async; use ainvoke")]
    AsyncNodeInSyncInvoke {
        /// The async node's name.
        node: String,
    },

    /// The run exceeded the step limit (likely a routing cycle).
    #[error("execution exceeded step limit of {limit}")]
    StepLimitExceeded {
        /// The configured limit.
        limit: usize,
    },

    /// A user node failed. The original error is preserved unchanged.
    #[error("node '{node}' failed: {source}")]
    Node {
        /// The failing node's name.
        node: String,
        /// The error the node raised.
        source: NodeError,
    },
}

/// Per-invocation configuration, the framework's side channel to nodes.
#[derive(Debug, Clone, Default)]
pub struct InvokeConfig {
    /// Free-form configuration values. The key
    /// [`EXECUTION_ID_KEY`] selects the execution id for recording.
    pub configurable: HashMap<String, String>,
}

impl InvokeConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the execution id used for recording this invocation.
    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.configurable
            .insert(EXECUTION_ID_KEY.to_string(), execution_id.into());
        self
    }
}

/// A graph of named computation nodes over a shared state value.
pub struct StateGraph {
    pub(crate) name: String,
    pub(crate) nodes: HashMap<String, NodeFn>,
    pub(crate) edges: HashMap<String, String>,
    pub(crate) conditional: HashMap<String, ConditionalEdge>,
    pub(crate) entry: Option<String>,
    pub(crate) step_limit: usize,
    pub(crate) instrumented: bool,
}

impl StateGraph {
    /// Create an empty graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
            conditional: HashMap::new(),
            entry: None,
            step_limit: DEFAULT_STEP_LIMIT,
            instrumented: false,
        }
    }

    /// The graph's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a synchronous node. Replaces any node with the same name.
    pub fn add_node<F>(mut self, name: impl Into<String>, node: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        self.nodes.insert(name.into(), NodeFn::Sync(Arc::new(node)));
        self
    }

    /// Add an asynchronous node. Replaces any node with the same name.
    pub fn add_async_node<F, Fut>(mut self, name: impl Into<String>, node: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        self.nodes.insert(
            name.into(),
            NodeFn::Async(Arc::new(move |state| Box::pin(node(state)))),
        );
        self
    }

    /// Add a fixed edge. Use [`END`] as the target to terminate.
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.insert(from.into(), to.into());
        self
    }

    /// Add a conditional edge leaving `source`.
    ///
    /// After `source` runs, `router` is evaluated on the merged state; its
    /// result is looked up in `branches` to pick the next node. With an
    /// empty branch map the result is used as the node name directly.
    pub fn add_conditional_edge<F>(
        mut self,
        source: impl Into<String>,
        description: impl Into<String>,
        router: F,
        branches: HashMap<String, String>,
    ) -> Self
    where
        F: Fn(&Value) -> Result<String, NodeError> + Send + Sync + 'static,
    {
        self.conditional.insert(
            source.into(),
            ConditionalEdge {
                router: Arc::new(router),
                description: description.into(),
                branches,
            },
        );
        self
    }

    /// Set the node execution starts from.
    pub fn set_entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// Bound the number of node invocations per run.
    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    /// Run the graph synchronously.
    ///
    /// # Errors
    ///
    /// Fails on graphs containing async nodes; see
    /// [`GraphError::AsyncNodeInSyncInvoke`].
    pub fn invoke(&self, initial: Value) -> Result<Value, GraphError> {
        self.invoke_with_config(initial, InvokeConfig::default())
    }

    /// Run the graph synchronously with per-invocation configuration.
    pub fn invoke_with_config(
        &self,
        initial: Value,
        config: InvokeConfig,
    ) -> Result<Value, GraphError> {
        let run = LifecycleGuard::begin(self, &initial, &config);
        let result = self.run_sync(initial);
        run.finish(&result);
        result
    }

    fn run_sync(&self, initial: Value) -> Result<Value, GraphError> {
        let mut state = initial;
        let mut current = self.entry_node()?;
        let mut steps = 0;

        while current != END {
            let node = self.node(&current)?;
            let update = match node {
                NodeFn::Sync(f) => f(&state).map_err(|source| GraphError::Node {
                    node: current.clone(),
                    source,
                })?,
                NodeFn::Async(_) => {
                    return Err(GraphError::AsyncNodeInSyncInvoke { node: current });
                }
            };
            state = merge_update(&state, &update);

            steps += 1;
            if steps > self.step_limit {
                return Err(GraphError::StepLimitExceeded {
                    limit: self.step_limit,
                });
            }

            current = match self.next_node(&current, &state)? {
                Some(next) => next,
                None => break,
            };
        }

        Ok(state)
    }

    /// Run the graph, awaiting async nodes and running sync nodes inline.
    pub async fn ainvoke(&self, initial: Value) -> Result<Value, GraphError> {
        self.ainvoke_with_config(initial, InvokeConfig::default())
            .await
    }

    /// Run the graph asynchronously with per-invocation configuration.
    pub async fn ainvoke_with_config(
        &self,
        initial: Value,
        config: InvokeConfig,
    ) -> Result<Value, GraphError> {
        let run = LifecycleGuard::begin(self, &initial, &config);
        let result = self.run_async(initial).await;
        run.finish(&result);
        result
    }

    async fn run_async(&self, initial: Value) -> Result<Value, GraphError> {
        let mut state = initial;
        let mut current = self.entry_node()?;
        let mut steps = 0;

        while current != END {
            let node = self.node(&current)?;
            let result = match node {
                NodeFn::Sync(f) => f(&state),
                NodeFn::Async(f) => f(state.clone()).await,
            };
            let update = result.map_err(|source| GraphError::Node {
                node: current.clone(),
                source,
            })?;
            state = merge_update(&state, &update);

            steps += 1;
            if steps > self.step_limit {
                return Err(GraphError::StepLimitExceeded {
                    limit: self.step_limit,
                });
            }

            current = match self.next_node(&current, &state)? {
                Some(next) => next,
                None => break,
            };
        }

        Ok(state)
    }

    fn entry_node(&self) -> Result<String, GraphError> {
        self.entry.clone().ok_or_else(|| GraphError::MissingEntryPoint {
            graph: self.name.clone(),
        })
    }

    fn node(&self, name: &str) -> Result<NodeFn, GraphError> {
        self.nodes
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownNode {
                node: name.to_string(),
            })
    }

    /// Resolve the node following `current`, or `None` when the run ends.
    fn next_node(&self, current: &str, state: &Value) -> Result<Option<String>, GraphError> {
        if let Some(edge) = self.conditional.get(current) {
            let label = (edge.router)(state).map_err(|source| GraphError::Node {
                node: current.to_string(),
                source,
            })?;
            if label == END {
                return Ok(None);
            }
            let target = if edge.branches.is_empty() {
                label
            } else {
                edge.branches
                    .get(&label)
                    .cloned()
                    .ok_or(GraphError::UnknownBranch {
                        node: current.to_string(),
                        label,
                    })?
            };
            if target == END {
                return Ok(None);
            }
            return Ok(Some(target));
        }

        match self.edges.get(current) {
            Some(target) if target == END => Ok(None),
            Some(target) => Ok(Some(target.clone())),
            // No outgoing edge: the run ends here.
            None => Ok(None),
        }
    }
}

/// Merge a node's partial update into the current state.
///
/// Mapping keys in the update replace keys in the state (shallow override).
/// A null update means "no change"; a non-mapping update replaces the state
/// wholesale.
pub(crate) fn merge_update(state: &Value, update: &Value) -> Value {
    match (state, update) {
        (state, Value::Null) => state.clone(),
        (Value::Object(state), Value::Object(update)) => {
            let mut merged = state.clone();
            for (key, value) in update {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, update) => update.clone(),
    }
}

/// Brackets a run with `start_execution` / `end_execution` when the graph
/// is instrumented and a collector is installed. Recording failures are
/// logged and never surface to the caller.
struct LifecycleGuard {
    execution_id: Option<String>,
}

impl LifecycleGuard {
    fn begin(graph: &StateGraph, initial: &Value, config: &InvokeConfig) -> Self {
        if !graph.instrumented {
            return Self { execution_id: None };
        }
        let Some(collector) = active_collector() else {
            return Self { execution_id: None };
        };

        // Execution id resolution: the caller's config channel wins, then a
        // reserved state key, then a fresh context-local id.
        let execution_id = config
            .configurable
            .get(EXECUTION_ID_KEY)
            .cloned()
            .or_else(|| {
                initial
                    .get(STATE_EXECUTION_ID_KEY)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(tracker::get_or_create);
        tracker::set_current(execution_id.clone());

        match collector.start_execution(execution_id.clone(), graph.name.as_str(), initial, None) {
            Ok(_) => {}
            Err(err) => {
                warn!(execution_id = %execution_id, error = %err, "failed to start execution record");
            }
        }
        Self {
            execution_id: Some(execution_id),
        }
    }

    fn finish(self, result: &Result<Value, GraphError>) {
        let Some(execution_id) = self.execution_id else {
            return;
        };
        if let Some(collector) = active_collector() {
            let outcome = match result {
                Ok(state) => collector.end_execution(&execution_id, state, RunStatus::Completed),
                Err(_) => {
                    collector.end_execution(&execution_id, &Value::Null, RunStatus::Failed)
                }
            };
            if let Err(err) = outcome {
                warn!(execution_id = %execution_id, error = %err, "failed to finalize execution record");
            }
        }
        tracker::clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_update_shallow_override() {
        let state = json!({"a": 1, "b": {"x": 1}});
        let update = json!({"b": {"y": 2}, "c": 3});
        assert_eq!(
            merge_update(&state, &update),
            json!({"a": 1, "b": {"y": 2}, "c": 3})
        );
    }

    #[test]
    fn test_merge_update_null_is_no_change() {
        let state = json!({"a": 1});
        assert_eq!(merge_update(&state, &Value::Null), state);
    }

    #[test]
    fn test_merge_update_non_mapping_replaces() {
        let state = json!({"a": 1});
        assert_eq!(merge_update(&state, &json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn test_invoke_linear_graph() {
        let graph = StateGraph::new("counting")
            .add_node("inc", |state: &Value| {
                let count = state["count"].as_i64().unwrap_or(0);
                Ok(json!({"count": count + 1}))
            })
            .add_node("label", |_state: &Value| Ok(json!({"label": "done"})))
            .add_edge("inc", "label")
            .add_edge("label", END)
            .set_entry_point("inc");

        let result = graph.invoke(json!({"count": 0})).expect("run");
        assert_eq!(result, json!({"count": 1, "label": "done"}));
    }

    #[test]
    fn test_conditional_routing() {
        let graph = StateGraph::new("branching")
            .add_node("classify", |state: &Value| {
                let n = state["n"].as_i64().unwrap_or(0);
                Ok(json!({"kind": if n % 2 == 0 { "even" } else { "odd" }}))
            })
            .add_node("even_handler", |_: &Value| Ok(json!({"result": "even path"})))
            .add_node("odd_handler", |_: &Value| Ok(json!({"result": "odd path"})))
            .add_conditional_edge(
                "classify",
                "route on kind",
                |state: &Value| {
                    Ok(state["kind"].as_str().unwrap_or("even").to_string())
                },
                HashMap::from([
                    ("even".to_string(), "even_handler".to_string()),
                    ("odd".to_string(), "odd_handler".to_string()),
                ]),
            )
            .set_entry_point("classify");

        let result = graph.invoke(json!({"n": 3})).expect("run");
        assert_eq!(result["result"], json!("odd path"));
    }

    #[test]
    fn test_node_error_surfaces() {
        let graph = StateGraph::new("failing")
            .add_node("boom", |_: &Value| Err(NodeError::new("exploded")))
            .set_entry_point("boom");

        let err = graph.invoke(json!({})).expect_err("must fail");
        match err {
            GraphError::Node { node, source } => {
                assert_eq!(node, "boom");
                assert_eq!(source, NodeError::new("exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_step_limit_guards_cycles() {
        let graph = StateGraph::new("loop")
            .add_node("spin", |_: &Value| Ok(json!({})))
            .add_edge("spin", "spin")
            .set_entry_point("spin")
            .with_step_limit(5);

        let err = graph.invoke(json!({})).expect_err("must hit limit");
        assert!(matches!(err, GraphError::StepLimitExceeded { limit: 5 }));
    }

    #[test]
    fn test_sync_invoke_rejects_async_nodes() {
        let graph = StateGraph::new("mixed")
            .add_async_node("fetch", |_state| async { Ok(json!({"fetched": true})) })
            .set_entry_point("fetch");

        let err = graph.invoke(json!({})).expect_err("must reject");
        assert!(matches!(err, GraphError::AsyncNodeInSyncInvoke { .. }));
    }

    #[tokio::test]
    async fn test_ainvoke_runs_mixed_nodes() {
        let graph = StateGraph::new("mixed")
            .add_async_node("fetch", |_state| async { Ok(json!({"fetched": true})) })
            .add_node("mark", |_: &Value| Ok(json!({"marked": true})))
            .add_edge("fetch", "mark")
            .add_edge("mark", END)
            .set_entry_point("fetch");

        let result = graph.ainvoke(json!({"q": 1})).await.expect("run");
        assert_eq!(result, json!({"q": 1, "fetched": true, "marked": true}));
    }
}
