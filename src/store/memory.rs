use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Lease, RunRecord, StateStore, StatusChange};
use crate::error::{Error, Result};
use crate::workflow::run::{ActivityAttempt, RunId, WorkflowRun};

/// Process-local store, for tests and dry runs. State is lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: RwLock<HashMap<RunId, RunRecord>>,
}

impl InMemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lease of a run, if any
    pub async fn lease(&self, run_id: &RunId) -> Option<Lease> {
        self.records
            .read()
            .await
            .get(run_id)
            .and_then(|r| r.lease.clone())
    }

    async fn mutate<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunRecord) -> Result<T>,
    ) -> Result<T> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(run_id)
            .ok_or_else(|| Error::RunNotFound(run_id.clone()))?;
        f(record)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_run(&self, run: WorkflowRun) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&run.id) {
            return Err(Error::Validation(format!("run {} already exists", run.id)));
        }
        debug!(run_id = %run.id, workflow = %run.definition, "Run created");
        records.insert(run.id.clone(), RunRecord::new(run));
        Ok(())
    }

    async fn load_run(&self, run_id: &RunId) -> Result<WorkflowRun> {
        self.records
            .read()
            .await
            .get(run_id)
            .map(|r| r.run.clone())
            .ok_or_else(|| Error::RunNotFound(run_id.clone()))
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self
            .records
            .read()
            .await
            .values()
            .map(|r| r.run.clone())
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn acquire_lease(&self, run_id: &RunId, owner: &str, ttl: Duration) -> Result<Lease> {
        self.mutate(run_id, |r| r.acquire_lease(owner, ttl, Utc::now()))
            .await
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        self.mutate(&lease.run_id, |r| r.renew_lease(lease, ttl, Utc::now()))
            .await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        self.mutate(&lease.run_id, |r| {
            r.release_lease(lease);
            Ok(())
        })
        .await
    }

    async fn append_attempt(&self, lease: &Lease, attempt: ActivityAttempt) -> Result<WorkflowRun> {
        self.mutate(&lease.run_id, |r| {
            r.append_attempt(lease, attempt, Utc::now())?;
            Ok(r.run.clone())
        })
        .await
    }

    async fn complete_step(
        &self,
        lease: &Lease,
        attempt: ActivityAttempt,
        output: Value,
        next_step: usize,
    ) -> Result<WorkflowRun> {
        self.mutate(&lease.run_id, |r| {
            r.complete_step(lease, attempt, output, next_step, Utc::now())?;
            Ok(r.run.clone())
        })
        .await
    }

    async fn record_item_output(
        &self,
        lease: &Lease,
        attempt: ActivityAttempt,
        output: Value,
    ) -> Result<WorkflowRun> {
        self.mutate(&lease.run_id, |r| {
            r.record_item_output(lease, attempt, output, Utc::now())?;
            Ok(r.run.clone())
        })
        .await
    }

    async fn advance_step(
        &self,
        lease: &Lease,
        step_id: &str,
        output: Value,
        next_step: usize,
    ) -> Result<WorkflowRun> {
        self.mutate(&lease.run_id, |r| {
            r.advance_step(lease, step_id, output, next_step, Utc::now())?;
            Ok(r.run.clone())
        })
        .await
    }

    async fn set_status(&self, lease: &Lease, change: StatusChange) -> Result<WorkflowRun> {
        self.mutate(&lease.run_id, |r| {
            r.set_status(lease, change, Utc::now())?;
            Ok(r.run.clone())
        })
        .await
    }

    async fn request_cancel(&self, run_id: &RunId) -> Result<WorkflowRun> {
        self.mutate(run_id, |r| {
            r.request_cancel(Utc::now())?;
            Ok(r.run.clone())
        })
        .await
    }
}
