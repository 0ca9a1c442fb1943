// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retrace Core - State-Transition Recording Engine
//!
//! This crate records every state transition of a graph-structured agent
//! execution and reconstructs the exact state at any step afterwards,
//! without re-executing user code.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Instrumented user graph                    │
//! │                      (retrace-sdk)                           │
//! └──────────────────────────────────────────────────────────────┘
//!              │ per node: state before / state after
//!              ▼
//! ┌───────────────────────┐   serialize + diff   ┌──────────────┐
//! │       Collector       │─────────────────────►│ SyncSqlite-  │
//! │  counters, checkpoint │    (synchronous)     │ Store (write)│
//! │  policy, subscribers  │                      └──────┬───────┘
//! └───────────────────────┘                             │ WAL
//!                                                       ▼
//! ┌───────────────────────┐                      ┌──────────────┐
//! │ QueryService / Replay │◄─────────────────────│ SqliteStore  │
//! │  (external server)    │     async reads      │   (read)     │
//! └───────────────────────┘                      └──────────────┘
//! ```
//!
//! # Recording model
//!
//! Each node invocation becomes an [`ExecutionStep`](model::ExecutionStep)
//! carrying a structural [`StateDiff`](model::StateDiff). Every
//! `checkpoint_interval`-th step additionally stores full before/after
//! snapshots; step index 0 is always a checkpoint. Reconstruction loads the
//! nearest prior checkpoint and applies at most `interval - 1` diffs.
//!
//! # Concurrency
//!
//! Two disjoint regimes coexist:
//!
//! | Path | Backend | Suspension points |
//! |------|---------|-------------------|
//! | Recording (collector + writes) | rusqlite + mutex | none |
//! | Query (replay + reads) | sqlx pool | every storage read |
//!
//! The recording path may be entered from a host framework's scheduler and
//! therefore never suspends; the query path runs in the external server's
//! own async runtime and never shares the writer connection.
//!
//! # Modules
//!
//! - [`model`]: record types for executions, steps, diffs, routing decisions
//! - [`serialize`]: total conversion of arbitrary values into canonical trees
//! - [`diff`]: structural diff computation and application
//! - [`config`]: recorder configuration
//! - [`collector`]: synchronous event hub feeding storage
//! - [`storage`]: sync write backend and async read backend over one schema
//! - [`replay`]: checkpoint + diff state reconstruction
//! - [`query`]: read-only facade for an external server
//! - [`error`]: error types

#![deny(missing_docs)]

pub mod collector;
pub mod config;
pub mod diff;
pub mod error;
pub mod model;
pub mod query;
pub mod replay;
pub mod serialize;
pub mod storage;

pub use collector::{Collector, EventCallback, SubscriberId};
pub use config::{ConfigError, DEFAULT_IGNORE_KEYS, RecorderConfig};
pub use diff::{apply_diff, compute_diff};
pub use error::{CollectorError, StoreError};
pub use model::{
    AddedEntry, ChangedEntry, Execution, ExecutionStep, RemovedEntry, RoutingDecision,
    RunStatus, StateDiff,
};
pub use query::QueryService;
pub use replay::{ReplayEngine, StepComparison, TimelineEntry};
pub use serialize::serialize_state;
pub use storage::{SqliteStore, StateStore, SyncSqliteStore};
