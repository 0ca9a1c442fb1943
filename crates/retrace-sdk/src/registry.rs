// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Global collector registry.
//!
//! Node wrappers have no way to receive a collector through the graph's
//! calling convention, so the process holds one shared reference: set once
//! when recording is enabled, read on every node invocation. When absent,
//! instrumentation is a no-op.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use retrace_core::{Collector, ConfigError, RecorderConfig, StoreError, SyncSqliteStore};
use thiserror::Error;
use tracing::info;

/// Global storage for the collector instance.
static COLLECTOR: OnceCell<Arc<Collector>> = OnceCell::new();

/// Errors from recorder initialization.
#[derive(Debug, Error)]
pub enum InitError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The trace database could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Initialize the process-wide collector, or return the existing one.
///
/// The first call opens the trace database at `config.db_path` and
/// publishes the collector; later calls ignore their `config` argument and
/// return the already-installed instance.
///
/// # Errors
///
/// Returns [`InitError`] when validation or the database open fails on the
/// first call.
pub fn init_recording(config: RecorderConfig) -> Result<Arc<Collector>, InitError> {
    let collector = COLLECTOR.get_or_try_init(|| -> Result<Arc<Collector>, InitError> {
        config.validate()?;
        let store = SyncSqliteStore::open(&config.db_path)?;
        let db_path = config.db_path.clone();
        let collector = Collector::new(config, store)?;
        info!(db_path = %db_path.display(), "recording collector initialized");
        Ok(Arc::new(collector))
    })?;
    Ok(Arc::clone(collector))
}

/// The installed collector, if recording was initialized.
pub fn collector() -> Option<&'static Arc<Collector>> {
    COLLECTOR.get()
}

/// The installed collector, filtered by the master switch.
pub(crate) fn active_collector() -> Option<&'static Arc<Collector>> {
    collector().filter(|c| c.config().enabled)
}
