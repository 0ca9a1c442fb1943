// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retrace SDK - one-line state recording for graph agents.
//!
//! Build a [`StateGraph`], then call [`enable_recording`] on it before
//! invoking. Every node invocation is captured (state before, state after,
//! structural diff) and persisted through [`retrace-core`], with zero
//! changes to node code:
//!
//! ```no_run
//! use retrace_sdk::{END, RecorderConfig, StateGraph, enable_recording};
//! use serde_json::{Value, json};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let graph = StateGraph::new("research_agent")
//!         .add_node("planner", |state: &Value| {
//!             let query = state["query"].as_str().unwrap_or_default();
//!             Ok(json!({"intent": if query.contains("summary") { "summarize" } else { "research" }}))
//!         })
//!         .add_node("searcher", |_state: &Value| {
//!             Ok(json!({"search_results": ["r1", "r2", "r3"]}))
//!         })
//!         .add_edge("planner", "searcher")
//!         .add_edge("searcher", END)
//!         .set_entry_point("planner");
//!
//!     // One line to enable recording - no node changes needed.
//!     let graph = enable_recording(graph, RecorderConfig::default())?;
//!
//!     let result = graph.invoke(json!({"query": "what is retrace?"}))?;
//!     println!("{result}");
//!     Ok(())
//! }
//! ```
//!
//! Recorded traces are read back through `retrace_core::QueryService` (the
//! surface an external trace server consumes).
//!
//! # Behavior guarantees
//!
//! Instrumentation never changes what the host program observes: return
//! values and node errors pass through unchanged, sync nodes stay sync,
//! async nodes stay async, and any failure inside the recording machinery
//! is logged at warn level and dropped.
//!
//! # Modules
//!
//! - [`graph`]: the state-graph framework (nodes, edges, runner)
//! - [`instrument`]: node and router wrappers
//! - [`registry`]: process-wide collector installation
//! - [`tracker`]: thread-local execution-id propagation

#![deny(missing_docs)]

pub mod graph;
pub mod instrument;
pub mod registry;
pub mod tracker;

pub use graph::{
    END, EXECUTION_ID_KEY, GraphError, InvokeConfig, NodeError, NodeFn, Router,
    STATE_EXECUTION_ID_KEY, StateGraph,
};
pub use instrument::instrument;
pub use registry::{InitError, collector, init_recording};
pub use retrace_core::{Collector, RecorderConfig};

/// Instrument a graph for state recording.
///
/// This is the primary public API. The first call installs the process-wide
/// collector (opening the trace database at `config.db_path`); later calls
/// reuse it. A config with `enabled = false` returns the graph untouched
/// and nothing is initialized.
///
/// # Errors
///
/// Returns [`InitError`] when the configuration is invalid or the trace
/// database cannot be opened.
pub fn enable_recording(
    graph: StateGraph,
    config: RecorderConfig,
) -> Result<StateGraph, InitError> {
    if !config.enabled {
        return Ok(graph);
    }
    init_recording(config)?;
    Ok(instrument(graph))
}
