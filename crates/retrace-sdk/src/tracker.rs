// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Thread-local execution-id tracking.
//!
//! Node wrappers resolve the execution id on every invocation. When neither
//! the caller's config channel nor the reserved state key supplies one, the
//! id lives here for the duration of the run. The graph runner publishes the
//! resolved id before the first node fires and clears it afterwards.
//!
//! Thread-local scope matches the recording path's execution model: the
//! runner drives nodes sequentially on the calling thread (sync nodes run
//! inline even under `ainvoke`). A node that hops threads internally falls
//! back to a fresh id; see DESIGN notes on context propagation.

use std::cell::RefCell;

use retrace_core::Execution;

thread_local! {
    static CURRENT_EXECUTION: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Publish the execution id for the current thread.
pub fn set_current(execution_id: String) {
    CURRENT_EXECUTION.with(|cell| *cell.borrow_mut() = Some(execution_id));
}

/// The currently published execution id, if any.
pub fn current() -> Option<String> {
    CURRENT_EXECUTION.with(|cell| cell.borrow().clone())
}

/// The current execution id, generating and publishing a fresh one when
/// none is set.
pub fn get_or_create() -> String {
    CURRENT_EXECUTION.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_ref() {
            Some(id) => id.clone(),
            None => {
                let id = Execution::new_id();
                *slot = Some(id.clone());
                id
            }
        }
    })
}

/// Drop the published execution id.
pub fn clear() {
    CURRENT_EXECUTION.with(|cell| *cell.borrow_mut() = None);
}
