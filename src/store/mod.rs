//! Durable workflow state.
//!
//! The store keeps one record per run: the run snapshot plus its current lease. Every
//! mutating operation takes the caller's [`Lease`] and is applied atomically; the
//! rules deciding whether a mutation is allowed live in [`record`] and are shared by
//! all backends.

/// In-memory backend
pub mod memory;
/// JSON file backend
pub mod file;
/// Run record and mutation rules
pub mod record;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::error::Result;
use crate::workflow::run::{ActivityAttempt, RunId, RunStatus, WorkflowRun};

pub use file::FileStateStore;
pub use memory::InMemoryStateStore;
pub use record::RunRecord;

/// Time-bounded grant of exclusive write access to a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Leased run
    pub run_id: RunId,

    /// Executor holding the lease
    pub owner: String,

    /// Token identifying this grant; a re-acquired lease gets a new token
    pub token: Uuid,

    /// Expiry time
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A requested status change
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    /// Target status
    pub status: RunStatus,

    /// Due time, only kept for WAITING_RETRY
    pub retry_at: Option<DateTime<Utc>>,

    /// Error to record as the run's last error
    pub error: Option<ActivityError>,
}

impl StatusChange {
    /// Change to `status` without further detail
    pub fn to(status: RunStatus) -> Self {
        Self {
            status,
            retry_at: None,
            error: None,
        }
    }

    /// Move to WAITING_RETRY, due at `retry_at`
    pub fn waiting_retry(retry_at: DateTime<Utc>, error: ActivityError) -> Self {
        Self {
            status: RunStatus::WaitingRetry,
            retry_at: Some(retry_at),
            error: Some(error),
        }
    }

    /// Move to FAILED with `error`
    pub fn failed(error: ActivityError) -> Self {
        Self {
            status: RunStatus::Failed,
            retry_at: None,
            error: Some(error),
        }
    }
}

/// Storage for workflow runs.
///
/// Implementations must make each mutation atomic and durable before returning, and
/// must enforce the rules in [`RunRecord`].
#[async_trait]
pub trait StateStore: Send + Sync + Debug + 'static {
    /// Persist a new run
    async fn create_run(&self, run: WorkflowRun) -> Result<()>;

    /// Snapshot of a run
    async fn load_run(&self, run_id: &RunId) -> Result<WorkflowRun>;

    /// Snapshots of all runs, oldest first
    async fn list_runs(&self) -> Result<Vec<WorkflowRun>>;

    /// Acquire the run's lease for `owner`, reclaiming it if expired
    async fn acquire_lease(&self, run_id: &RunId, owner: &str, ttl: Duration) -> Result<Lease>;

    /// Extend a held lease
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease>;

    /// Give up a lease; releasing a lease that is no longer current is a no-op
    async fn release_lease(&self, lease: &Lease) -> Result<()>;

    /// Append a failed or timed out attempt to the audit trail
    async fn append_attempt(&self, lease: &Lease, attempt: ActivityAttempt) -> Result<WorkflowRun>;

    /// Append the successful attempt of the current step, store its output and move
    /// to `next_step`, all in one write
    async fn complete_step(
        &self,
        lease: &Lease,
        attempt: ActivityAttempt,
        output: Value,
        next_step: usize,
    ) -> Result<WorkflowRun>;

    /// Append the successful attempt of one fan-out element and store its output in
    /// one write
    async fn record_item_output(
        &self,
        lease: &Lease,
        attempt: ActivityAttempt,
        output: Value,
    ) -> Result<WorkflowRun>;

    /// Store the joined output of a fan-out step and move to `next_step`
    async fn advance_step(
        &self,
        lease: &Lease,
        step_id: &str,
        output: Value,
        next_step: usize,
    ) -> Result<WorkflowRun>;

    /// Change the run status
    async fn set_status(&self, lease: &Lease, change: StatusChange) -> Result<WorkflowRun>;

    /// Flag the run for cancellation; needs no lease
    async fn request_cancel(&self, run_id: &RunId) -> Result<WorkflowRun>;
}
