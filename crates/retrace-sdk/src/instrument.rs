// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Zero-modification state capture for a [`StateGraph`].
//!
//! [`instrument`] replaces each node's callable with a wrapper that
//! captures the state before the node runs, lets the node run unchanged,
//! merges its partial update for the after snapshot, and hands both to the
//! collector. Routing predicates on conditional edges are wrapped the same
//! way.
//!
//! The wrappers must not alter observable behavior: return values and node
//! errors pass through bit-for-bit, the sync/async nature of every callable
//! is preserved, and failures inside the recording machinery are logged and
//! swallowed. With no collector installed (or recording disabled) wrappers
//! invoke the original directly and observe nothing.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::graph::{
    ConditionalEdge, NodeFn, Router, STATE_EXECUTION_ID_KEY, StateGraph, merge_update,
};
use crate::registry::active_collector;
use crate::tracker;

/// Wrap every node and routing predicate of the graph with state capture.
///
/// Returns the same graph with wrappers installed. Instrumenting twice is a
/// no-op.
pub fn instrument(mut graph: StateGraph) -> StateGraph {
    if graph.instrumented {
        return graph;
    }

    let mut node_count = 0;
    for (name, node) in graph.nodes.iter_mut() {
        *node = wrap_node(name.clone(), node.clone());
        node_count += 1;
    }

    for (source, edge) in graph.conditional.iter_mut() {
        edge.router = wrap_router(source.clone(), edge.description.clone(), edge.router.clone());
    }

    graph.instrumented = true;
    info!(graph = %graph.name, nodes = node_count, "instrumented state graph");
    graph
}

/// Resolve the execution id a step should be recorded under.
///
/// Order: the id the runner published from the caller's config channel,
/// then the reserved state key, then a fresh context-local id.
fn resolve_execution_id(state: &Value) -> String {
    if let Some(id) = tracker::current() {
        return id;
    }
    if let Some(id) = state.get(STATE_EXECUTION_ID_KEY).and_then(Value::as_str) {
        return id.to_string();
    }
    tracker::get_or_create()
}

/// Wrap one node callable, preserving its sync/async variant.
fn wrap_node(node_name: String, original: NodeFn) -> NodeFn {
    match original {
        NodeFn::Sync(f) => NodeFn::Sync(Arc::new(move |state: &Value| {
            let Some(collector) = active_collector() else {
                return f(state);
            };

            let state_before = state.clone();
            let execution_id = resolve_execution_id(state);

            match f(state) {
                Ok(update) => {
                    let state_after = merge_update(&state_before, &update);
                    record_step(
                        collector,
                        &execution_id,
                        &node_name,
                        &state_before,
                        &state_after,
                        None,
                    );
                    Ok(update)
                }
                Err(err) => {
                    record_step(
                        collector,
                        &execution_id,
                        &node_name,
                        &state_before,
                        &state_before,
                        Some(err.to_string()),
                    );
                    Err(err)
                }
            }
        })),
        NodeFn::Async(f) => NodeFn::Async(Arc::new(move |state: Value| {
            let f = Arc::clone(&f);
            let node_name = node_name.clone();
            Box::pin(async move {
                let Some(collector) = active_collector() else {
                    return f(state).await;
                };

                let state_before = state.clone();
                let execution_id = resolve_execution_id(&state);

                match f(state).await {
                    Ok(update) => {
                        let state_after = merge_update(&state_before, &update);
                        record_step(
                            collector,
                            &execution_id,
                            &node_name,
                            &state_before,
                            &state_after,
                            None,
                        );
                        Ok(update)
                    }
                    Err(err) => {
                        record_step(
                            collector,
                            &execution_id,
                            &node_name,
                            &state_before,
                            &state_before,
                            Some(err.to_string()),
                        );
                        Err(err)
                    }
                }
            })
        })),
    }
}

/// Record a step, swallowing recorder failures so they never reach the
/// host program.
fn record_step(
    collector: &retrace_core::Collector,
    execution_id: &str,
    node_name: &str,
    state_before: &Value,
    state_after: &Value,
    error: Option<String>,
) {
    if let Err(err) = collector.record_step(
        execution_id,
        node_name,
        state_before,
        state_after,
        error,
        None,
    ) {
        warn!(node = %node_name, error = %err, "failed to record step");
    }
}

/// Wrap a routing predicate to capture its decision.
///
/// Predicate errors are not swallowed; recording failures are.
fn wrap_router(source_node: String, description: String, original: Router) -> Router {
    Arc::new(move |state: &Value| {
        let result = original(state)?;

        if let Some(collector) = active_collector()
            && let Err(err) = collector.record_routing(
                "",
                resolve_execution_id(state),
                source_node.as_str(),
                result.as_str(),
                description.as_str(),
                state,
                &result,
            )
        {
            debug!(source = %source_node, error = %err, "failed to record routing decision");
        }

        Ok(result)
    })
}
