// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the recording core.
//!
//! User-facing policy: errors raised by user nodes always surface to the
//! host program; errors inside the recording machinery never do. The SDK
//! wrappers log [`CollectorError`]s at warn level and continue, so enabling
//! recording cannot change the success or failure of the host program.

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened or its schema could not be created.
    /// Raised at initialization only.
    #[error("storage unavailable at '{path}': {details}")]
    Unavailable {
        /// Database file path.
        path: String,
        /// Underlying failure.
        details: String,
    },

    /// A row with this primary key already exists.
    #[error("{entity} '{id}' already exists")]
    AlreadyExists {
        /// Kind of record (execution, step).
        entity: &'static str,
        /// Conflicting primary key.
        id: String,
    },

    /// A database operation failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A persisted row could not be decoded back into a model.
    #[error("corrupt {entity} row '{id}': {details}")]
    Corrupt {
        /// Kind of record (execution, step, routing decision).
        entity: &'static str,
        /// Primary key of the bad row.
        id: String,
        /// Decode failure details.
        details: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

/// Errors surfaced by collector operations.
///
/// These reach the caller only on the explicit lifecycle API
/// (`start_execution`); inside instrumentation they are logged and dropped.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// An execution with this id was already started.
    #[error("execution '{execution_id}' already exists")]
    DuplicateExecution {
        /// The conflicting execution id.
        execution_id: String,
    },

    /// The persistence layer failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
