use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Lease, RunRecord, StateStore, StatusChange};
use crate::error::{Error, Result};
use crate::workflow::run::{ActivityAttempt, RunId, WorkflowRun};

const RECORD_EXTENSION: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";

/// Store keeping one JSON document per run in a directory.
///
/// Writes go to a temporary file that is fsynced and renamed over the previous
/// document, so a crash leaves either the old or the new version on disk.
/// Mutations are serialized within the process; the directory is not meant to be
/// shared by concurrently running processes.
#[derive(Debug)]
pub struct FileStateStore {
    /// Directory holding the run documents
    dir: PathBuf,

    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl FileStateStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        debug!(path = %dir.display(), "File state store opened");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, run_id: &RunId) -> Result<PathBuf> {
        let id = run_id.as_str();
        if id.is_empty()
            || id.starts_with('.')
            || id.contains(|c: char| c == '/' || c == '\\' || c.is_control())
        {
            return Err(Error::Validation(format!("run id '{}' cannot be used as a file name", id)));
        }
        Ok(self.dir.join(format!("{}.{}", id, RECORD_EXTENSION)))
    }

    async fn read_record(&self, run_id: &RunId) -> Result<RunRecord> {
        let path = self.path_for(run_id)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::RunNotFound(run_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write_record(&self, record: &RunRecord) -> Result<()> {
        let path = self.path_for(&record.run.id)?;
        let tmp = path.with_extension(format!("{}{}", RECORD_EXTENSION, TEMP_SUFFIX));
        let bytes = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &path).await?;

        // Persist the rename itself; not every platform lets a directory be opened.
        if let Ok(dir) = fs::File::open(&self.dir).await {
            if let Err(e) = dir.sync_all().await {
                debug!(error = %e, "Directory sync skipped");
            }
        }
        Ok(())
    }

    async fn mutate<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut RunRecord) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read_record(run_id).await?;
        let value = f(&mut record)?;
        self.write_record(&record).await?;
        Ok(value)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn create_run(&self, run: WorkflowRun) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&run.id)?;
        if fs::try_exists(&path).await? {
            return Err(Error::Validation(format!("run {} already exists", run.id)));
        }
        debug!(run_id = %run.id, workflow = %run.definition, "Run created");
        self.write_record(&RunRecord::new(run)).await
    }

    async fn load_run(&self, run_id: &RunId) -> Result<WorkflowRun> {
        Ok(self.read_record(run_id).await?.run)
    }

    async fn list_runs(&self) -> Result<Vec<WorkflowRun>> {
        let mut runs = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<RunRecord>(&bytes) {
                Ok(record) => runs.push(record.run),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run document"),
            }
        }
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
