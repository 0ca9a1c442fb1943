// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recorder configuration.

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

/// Keys that change every run and clutter diffs; excluded by default.
pub const DEFAULT_IGNORE_KEYS: [&str; 5] = [
    "timestamp",
    "token_usage",
    "run_id",
    "request_id",
    "trace_id",
];

/// Default location of the trace database.
const DEFAULT_DB_PATH: &str = ".retrace/retrace.db";

/// Default checkpoint interval (full snapshot every N steps).
const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

/// Default advisory size limit per serialized snapshot (10 MiB).
const DEFAULT_MAX_STATE_SIZE_BYTES: usize = 10 * 1024 * 1024;

/// Configuration for a recording session.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Master switch. When false, all instrumentation is a no-op.
    pub enabled: bool,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Full state snapshot every N steps; the rest store only diffs.
    pub checkpoint_interval: u64,
    /// Top-level state keys excluded from diff computation.
    pub ignore_keys: HashSet<String>,
    /// Advisory soft limit per serialized state snapshot. Exceeding it sets
    /// a metadata flag on the step; it never fails the recording.
    pub max_state_size_bytes: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            ignore_keys: DEFAULT_IGNORE_KEYS
                .iter()
                .map(|k| (*k).to_string())
                .collect(),
            max_state_size_bytes: DEFAULT_MAX_STATE_SIZE_BYTES,
        }
    }
}

impl RecorderConfig {
    /// Create a configuration with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `RETRACE_ENABLED`: master switch (default: true; "0"/"false" disable)
    /// - `RETRACE_DB_PATH`: database file path (default: `.retrace/retrace.db`)
    /// - `RETRACE_CHECKPOINT_INTERVAL`: snapshot interval (default: 10)
    /// - `RETRACE_IGNORE_KEYS`: comma-separated key list (default: volatile keys)
    /// - `RETRACE_MAX_STATE_SIZE_BYTES`: advisory snapshot limit (default: 10 MiB)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(enabled) = env::var("RETRACE_ENABLED") {
            config.enabled = !matches!(enabled.as_str(), "0" | "false" | "no");
        }

        if let Ok(path) = env::var("RETRACE_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Ok(interval) = env::var("RETRACE_CHECKPOINT_INTERVAL") {
            config.checkpoint_interval = interval.parse().map_err(|_| {
                ConfigError::Invalid("RETRACE_CHECKPOINT_INTERVAL", "must be a positive integer")
            })?;
        }

        if let Ok(keys) = env::var("RETRACE_IGNORE_KEYS") {
            config.ignore_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Ok(max) = env::var("RETRACE_MAX_STATE_SIZE_BYTES") {
            config.max_state_size_bytes = max.parse().map_err(|_| {
                ConfigError::Invalid("RETRACE_MAX_STATE_SIZE_BYTES", "must be a byte count")
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the master switch.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the database file path.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    /// Set the checkpoint interval.
    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Replace the set of ignored top-level keys.
    pub fn with_ignore_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the advisory snapshot size limit.
    pub fn with_max_state_size_bytes(mut self, max: usize) -> Self {
        self.max_state_size_bytes = max;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the checkpoint interval is zero or the
    /// database path is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint_interval",
                "must be at least 1",
            ));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("db_path", "must not be empty"));
        }
        Ok(())
    }
}

/// Configuration errors, raised at collector construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A configuration field has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
