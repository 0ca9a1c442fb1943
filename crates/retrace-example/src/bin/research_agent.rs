// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Research Agent Example - state recording with one line of integration.
//!
//! This example shows:
//! - Building a small agent graph (planner -> searcher -> summarizer)
//! - Enabling recording with `enable_recording` (zero node changes)
//! - Reading the trace back through the query surface
//!
//! Run with: cargo run -p retrace-example --bin research_agent

use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::info;

use retrace_core::QueryService;
use retrace_sdk::{END, InvokeConfig, RecorderConfig, StateGraph, enable_recording};

/// Build the research agent graph. Node functions are plain closures over
/// the shared state; none of them know recording exists.
fn build_graph() -> StateGraph {
    StateGraph::new("research_agent")
        .add_node("planner", |state: &Value| {
            let query = state["query"].as_str().unwrap_or_default().to_lowercase();
            let intent = if query.contains("compare") {
                "compare"
            } else if query.contains("summarize") || query.contains("summary") {
                "summarize"
            } else {
                "research"
            };
            Ok(json!({
                "intent": intent,
                "messages": [{"role": "assistant", "content": format!("Intent classified as: {intent}")}],
            }))
        })
        .add_node("searcher", |state: &Value| {
            let query = state["query"].as_str().unwrap_or_default();
            let results = json!([
                {"title": format!("Result 1 for '{query}'"), "snippet": "This is the first result..."},
                {"title": format!("Result 2 for '{query}'"), "snippet": "Another relevant finding..."},
                {"title": format!("Result 3 for '{query}'"), "snippet": "Additional context here..."},
            ]);
            Ok(json!({
                "search_results": results,
                "messages": [{"role": "tool", "content": "Found 3 results"}],
            }))
        })
        .add_node("summarizer", |state: &Value| {
            let n = state["search_results"].as_array().map(Vec::len).unwrap_or(0);
            let query = state["query"].as_str().unwrap_or_default();
            let summary =
                format!("Based on {n} sources, the answer to '{query}' is: [simulated summary].");
            Ok(json!({
                "summary": summary.clone(),
                "messages": [{"role": "assistant", "content": summary}],
            }))
        })
        .add_conditional_edge(
            "planner",
            "route on intent",
            |state: &Value| {
                let intent = state["intent"].as_str().unwrap_or("research");
                Ok(if intent == "summarize" {
                    "summarizer".to_string()
                } else {
                    "searcher".to_string()
                })
            },
            HashMap::new(),
        )
        .add_edge("searcher", "summarizer")
        .add_edge("summarizer", END)
        .set_entry_point("planner")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("=== Research Agent Example: state recording ===");

    let config = RecorderConfig::default().with_checkpoint_interval(2);
    let db_path = config.db_path.clone();

    // ONE LINE to enable recording - no node changes needed.
    let graph = enable_recording(build_graph(), config)?;

    let execution_id = retrace_core::Execution::new_id();
    let result = graph.invoke_with_config(
        json!({"query": "What is retrace?", "messages": []}),
        InvokeConfig::new().with_execution_id(execution_id.clone()),
    )?;
    info!(execution_id = %execution_id, "graph finished");
    info!("final summary: {}", result["summary"]);

    // Read the trace back the way an external server would.
    let query = QueryService::open(&db_path).await?;
    let steps = query.list_steps(&execution_id).await?;
    for step in &steps {
        info!(
            index = step.step_index,
            node = %step.node_name,
            checkpoint = step.is_checkpoint,
            diff_entries = step.state_diff.len(),
            "recorded step"
        );
    }

    // Time travel: reconstruct the state as it was after the first step.
    if let Some(state) = query.get_state_at_step(&execution_id, 0).await? {
        info!("state after planner: {state}");
    }

    Ok(())
}
