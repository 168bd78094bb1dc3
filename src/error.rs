//! Error types for the campaign orchestrator
//!
//! This module defines the crate-level error returned by the registry, the state
//! store and the executor. Failures of individual activities are not errors in this
//! sense; they are classified outcomes (see [`crate::activity::ActivityError`]) that
//! the executor records and feeds to the retry policy.

use thiserror::Error;

use crate::workflow::run::{RunId, RunStatus};

/// A specialized Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid workflow definition (unknown target, cycle, duplicate step, ...)
    #[error("Definition error: {0}")]
    Definition(String),

    /// Invalid input supplied by a caller
    #[error("Validation error: {0}")]
    Validation(String),

    /// No workflow definition registered under this name
    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    /// No run with this id exists in the store
    #[error("Workflow run not found: {0}")]
    RunNotFound(RunId),

    /// Another executor holds an unexpired lease on the run
    #[error("Run {run_id} is leased by {owner}")]
    LeaseHeld {
        /// Run the lease was requested for
        run_id: RunId,
        /// Current lease owner
        owner: String,
    },

    /// The presented lease is no longer the run's active lease
    #[error("Lease on run {0} is no longer valid")]
    LeaseLost(RunId),

    /// The run reached a terminal status and can no longer be mutated
    #[error("Run {run_id} is {status} and cannot be modified")]
    RunTerminal {
        /// Run that was addressed
        run_id: RunId,
        /// Terminal status of the run
        status: RunStatus,
    },

    /// A status change that the run state machine does not allow
    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: RunStatus,
        /// Requested status
        to: RunStatus,
    },

    /// An attempt that is out of order or targets a step the run already left
    #[error("Stale attempt: {0}")]
    StaleAttempt(String),

    /// A run did not reach a terminal status in time
    #[error("Timed out waiting for run {0}")]
    WaitTimeout(RunId),

    /// The executor no longer accepts work
    #[error("Executor is shutting down")]
    ShuttingDown,

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// IO error while reading or writing persisted state
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error reports a lease conflict rather than a real failure
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, Error::LeaseHeld { .. } | Error::LeaseLost(_))
    }
}
