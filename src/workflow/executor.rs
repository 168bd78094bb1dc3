//! Workflow executor: drives runs through their definitions.
//!
//! Every run is driven by its own tokio task. The task holds the run's lease while
//! it executes steps, releases it while waiting for a retry and re-acquires it when
//! the retry is due. A successful attempt is persisted in the same write as its
//! output and the move to the next step, so a run whose executor disappeared can be
//! picked up by another one through [`WorkflowExecutor::recover`] once the lease
//! expired, without calling a finished activity again.

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::definition::{Step, Transition, WorkflowDefinition};
use super::mapping::MappingContext;
use super::registry::DefinitionRegistry;
use super::retry::RetryPolicy;
use super::run::{ActivityAttempt, AttemptOutcome, RunId, RunStatus, WorkflowRun};
use crate::activity::{ActivityError, ActivityInvoker, ActivityResult, ProviderFamily};
use crate::error::{Error, Result};
use crate::store::{Lease, StateStore, StatusChange};
use crate::telemetry::{add_metric, span_duration};

fn default_lease_duration_ms() -> u64 {
    60_000
}

fn default_llm_timeout_ms() -> u64 {
    30_000
}

fn default_email_timeout_ms() -> u64 {
    10_000
}

fn default_calendar_timeout_ms() -> u64 {
    10_000
}

fn default_fan_out_concurrency() -> usize {
    4
}

/// How often `wait_for_run` re-reads the store when no local notification arrives
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for the workflow executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Lease duration in milliseconds; must exceed every activity timeout
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Timeout for LLM-backed activities in milliseconds
    #[serde(default = "default_llm_timeout_ms")]
    pub llm_timeout_ms: u64,

    /// Timeout for email delivery in milliseconds
    #[serde(default = "default_email_timeout_ms")]
    pub email_timeout_ms: u64,

    /// Timeout for calendar calls in milliseconds
    #[serde(default = "default_calendar_timeout_ms")]
    pub calendar_timeout_ms: u64,

    /// Policy for steps that do not name one
    #[serde(default)]
    pub default_retry: RetryPolicy,

    /// Named policies steps can refer to
    #[serde(default)]
    pub retry_policies: HashMap<String, RetryPolicy>,

    /// Maximum number of fan-out elements invoked at the same time
    #[serde(default = "default_fan_out_concurrency")]
    pub max_fan_out_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: default_lease_duration_ms(),
            llm_timeout_ms: default_llm_timeout_ms(),
            email_timeout_ms: default_email_timeout_ms(),
            calendar_timeout_ms: default_calendar_timeout_ms(),
            default_retry: RetryPolicy::default(),
            retry_policies: HashMap::new(),
            max_fan_out_concurrency: default_fan_out_concurrency(),
        }
    }
}

impl ExecutorConfig {
    /// Check timeouts, lease duration and retry policies
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("llm_timeout_ms", self.llm_timeout_ms),
            ("email_timeout_ms", self.email_timeout_ms),
            ("calendar_timeout_ms", self.calendar_timeout_ms),
            ("lease_duration_ms", self.lease_duration_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        let longest = self
            .llm_timeout_ms
            .max(self.email_timeout_ms)
            .max(self.calendar_timeout_ms);
        if self.lease_duration_ms <= longest {
            return Err(Error::Config(format!(
                "lease_duration_ms ({}) must be longer than the largest provider timeout ({})",
                self.lease_duration_ms, longest
            )));
        }

        if self.max_fan_out_concurrency == 0 {
            return Err(Error::Config("max_fan_out_concurrency must be at least 1".to_string()));
        }

        self.default_retry
            .validate()
            .map_err(|e| Error::Config(format!("default_retry: {}", e)))?;
        for (name, policy) in &self.retry_policies {
            policy
                .validate()
                .map_err(|e| Error::Config(format!("retry policy '{}': {}", name, e)))?;
        }
        Ok(())
    }

    /// Lease duration
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Default timeout for activities served by `provider`
    pub fn timeout_for(&self, provider: ProviderFamily) -> Duration {
        let millis = match provider {
            ProviderFamily::Llm => self.llm_timeout_ms,
            ProviderFamily::Email => self.email_timeout_ms,
            ProviderFamily::Calendar => self.calendar_timeout_ms,
        };
        Duration::from_millis(millis)
    }

    /// Retry policy for a step
    pub fn policy_for(&self, step: &Step) -> &RetryPolicy {
        match &step.retry_policy {
            Some(name) => self.retry_policies.get(name).unwrap_or_else(|| {
                warn!(policy = %name, step = %step.id, "Unknown retry policy, using default");
                &self.default_retry
            }),
            None => &self.default_retry,
        }
    }
}

/// Where a driver stands after working on a run while holding its lease
#[derive(Debug)]
enum Flow {
    /// The run reached a terminal status
    Finished(RunStatus),
    /// A retry is due after the delay
    RetryIn(Duration),
    /// The executor is shutting down
    Stopped,
}

/// Result of executing one step
#[derive(Debug)]
enum StepOutcome {
    /// The step succeeded and the run advanced
    Advanced(WorkflowRun),
    /// The run left the step loop
    Flow(Flow),
}

/// Local bookkeeping for a run driven by this executor
#[derive(Debug)]
struct RunHandle {
    cancel: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Renews a lease in the background until dropped
#[derive(Debug)]
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(store: Arc<dyn StateStore>, lease: Lease, ttl: Duration) -> Self {
        let interval = (ttl / 3).max(Duration::from_millis(1));
        Self(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = store.renew_lease(&lease, ttl).await {
                    debug!(run_id = %lease.run_id, error = %e, "Lease renewal stopped");
                    break;
                }
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug)]
struct ExecutorInner {
    id: String,
    config: ExecutorConfig,
    registry: DefinitionRegistry,
    store: Arc<dyn StateStore>,
    invoker: ActivityInvoker,
    runs: Mutex<HashMap<RunId, RunHandle>>,
    finished: Notify,
    stop_tx: watch::Sender<bool>,
}

/// Executes workflow runs against a state store.
///
/// Cloning is cheap; clones share the same registry, store and run tasks.
#[derive(Debug, Clone)]
pub struct WorkflowExecutor {
    inner: Arc<ExecutorInner>,
}

impl WorkflowExecutor {
    /// Create an executor. The configuration is validated first.
    pub fn new(
        config: ExecutorConfig,
        store: Arc<dyn StateStore>,
        invoker: ActivityInvoker,
    ) -> Result<Self> {
        config.validate()?;
        let (stop_tx, _) = watch::channel(false);
        let id = format!("executor-{}", Uuid::new_v4());
        info!(executor = %id, "Workflow executor created");

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                id,
                config,
                registry: DefinitionRegistry::new(),
                store,
                invoker,
                runs: Mutex::new(HashMap::new()),
                finished: Notify::new(),
                stop_tx,
            }),
        })
    }

    /// Identifier used as lease owner
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Executor configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Registered definitions
    pub fn registry(&self) -> &DefinitionRegistry {
        &self.inner.registry
    }

    /// The underlying state store
    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.inner.store)
    }

    /// Register a definition after checking it against the executor configuration
    pub fn register_definition(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>> {
        let config = &self.inner.config;
        for step in &definition.steps {
            if let Some(name) = &step.retry_policy {
                if !config.retry_policies.contains_key(name) {
                    return Err(Error::Definition(format!(
                        "{}: step '{}' uses unknown retry policy '{}'",
                        definition.name, step.id, name
                    )));
                }
            }
            if let Some(timeout) = step.timeout_override() {
                if timeout.is_zero() || timeout >= config.lease_duration() {
                    return Err(Error::Definition(format!(
                        "{}: step '{}' timeout must be between 0 and the lease duration",
                        definition.name, step.id
                    )));
                }
            }
        }
        self.inner.registry.register(definition)
    }

    /// Create a run of `definition_name` and start driving it
    #[instrument(skip(self, input), fields(workflow = %definition_name))]
    pub async fn start_workflow(&self, definition_name: &str, input: Value) -> Result<RunId> {
        if *self.inner.stop_tx.borrow() {
            return Err(Error::ShuttingDown);
        }
        let definition = self.inner.registry.get(definition_name)?;

        let run = WorkflowRun::new(&definition.name, input);
        let run_id = run.id.clone();
        self.inner.store.create_run(run).await?;

        info!(run_id = %run_id, "Workflow run started");
        add_metric(
            "workflow_runs_started",
            1.0,
            &[("workflow", definition.name.clone())],
        );

        self.spawn_driver(run_id.clone(), None);
        Ok(run_id)
    }

    /// Snapshot of a run; never mutates it
    pub async fn get_run_status(&self, run_id: &RunId) -> Result<WorkflowRun> {
        self.inner.store.load_run(run_id).await
    }

    /// Request cancellation. The run stops at its next step boundary, or right away
    /// when it is pending or waiting for a retry.
    #[instrument(skip(self, run_id), fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: &RunId) -> Result<WorkflowRun> {
        let run = self.inner.store.request_cancel(run_id).await?;
        info!("Cancellation requested");

        let local = {
            let runs = self.inner.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.get(run_id)
                .filter(|h| !h.task.is_finished())
                .map(|h| Arc::clone(&h.cancel))
        };
        match local {
            Some(cancel) => cancel.notify_one(),
            // Nobody here drives the run; adopt it if its lease is free
            None if !*self.inner.stop_tx.borrow() => self.spawn_driver(run_id.clone(), None),
            None => {}
        }
        Ok(run)
    }

    /// Wait until the run reaches a terminal status
    pub async fn wait_for_run(&self, run_id: &RunId, timeout: Duration) -> Result<WorkflowRun> {
        let wait = async {
            loop {
                let notified = self.inner.finished.notified();
                let run = self.inner.store.load_run(run_id).await?;
                if run.is_terminal() {
                    return Ok(run);
                }
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(STATUS_POLL_INTERVAL) => {}
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::WaitTimeout(run_id.clone())),
        }
    }

    /// Resume every non-terminal run whose lease is free or expired.
    ///
    /// Returns the ids of the runs this executor took over.
    #[instrument(skip(self), fields(executor = %self.inner.id))]
    pub async fn recover(&self) -> Result<Vec<RunId>> {
        if *self.inner.stop_tx.borrow() {
            return Err(Error::ShuttingDown);
        }
        let ttl = self.inner.config.lease_duration();
        let mut resumed = Vec::new();

        for run in self.inner.store.list_runs().await? {
            if run.is_terminal() || self.is_driving(&run.id) {
                continue;
            }
            match self.inner.store.acquire_lease(&run.id, &self.inner.id, ttl).await {
                Ok(lease) => {
                    info!(run_id = %run.id, status = %run.status, "Recovering run");
                    self.spawn_driver(run.id.clone(), Some(lease));
                    resumed.push(run.id);
                }
                Err(e) if e.is_lease_conflict() => {
                    debug!(run_id = %run.id, error = %e, "Run is leased elsewhere");
                }
                Err(Error::RunTerminal { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        add_metric("workflow_runs_recovered", resumed.len() as f64, &[]);
        Ok(resumed)
    }

    /// Stop driving runs. Drivers finish their current step and release their leases;
    /// drivers still busy after `grace` are aborted, leaving their leases to expire.
    #[instrument(skip(self), fields(executor = %self.inner.id))]
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.stop_tx.send_replace(true);
        let handles: Vec<RunHandle> = {
            let mut runs = self.inner.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.drain().map(|(_, handle)| handle).collect()
        };
        let aborts: Vec<_> = handles.iter().map(|h| h.task.abort_handle()).collect();

        let joined = futures::future::join_all(handles.into_iter().map(|h| h.task));
        if tokio::time::timeout(grace, joined).await.is_err() {
            warn!(count = aborts.len(), "Aborting run drivers after grace period");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Workflow executor stopped");
    }

    fn is_driving(&self, run_id: &RunId) -> bool {
        self.inner
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .map_or(false, |h| !h.task.is_finished())
    }

    fn spawn_driver(&self, run_id: RunId, lease: Option<Lease>) {
        let mut runs = self.inner.runs.lock().unwrap_or_else(|e| e.into_inner());
        if runs.get(&run_id).map_or(false, |h| !h.task.is_finished()) {
            return;
        }

        let cancel = Arc::new(Notify::new());
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(drive(inner, run_id.clone(), lease, Arc::clone(&cancel)));
        runs.insert(run_id, RunHandle { cancel, task });
    }
}

/// Driver task of one run
#[instrument(skip(inner, run_id, lease, cancel), fields(executor = %inner.id, run_id = %run_id))]
async fn drive(inner: Arc<ExecutorInner>, run_id: RunId, lease: Option<Lease>, cancel: Arc<Notify>) {
    let ttl = inner.config.lease_duration();
    let mut stop = inner.stop_tx.subscribe();
    let mut lease = lease;

    loop {
        if *stop.borrow() {
            if let Some(lease) = lease.take() {
                release(&inner, &lease).await;
            }
            break;
        }

        let current = match lease.take() {
            Some(lease) => lease,
            None => match inner.store.acquire_lease(&run_id, &inner.id, ttl).await {
                Ok(lease) => lease,
                Err(e) if e.is_lease_conflict() => {
                    debug!(error = %e, "Run is driven elsewhere");
                    break;
                }
                Err(Error::RunTerminal { .. }) => break,
                Err(e) => {
                    error!(error = %e, "Failed to acquire lease");
                    break;
                }
            },
        };

        let heartbeat = Heartbeat::start(Arc::clone(&inner.store), current.clone(), ttl);
        let flow = inner.run_steps(&run_id, &current, &stop).await;
        drop(heartbeat);

        match flow {
            Ok(Flow::Finished(status)) => {
                debug!(status = %status, "Run finished");
                break;
            }
            Ok(Flow::Stopped) => {
                release(&inner, &current).await;
                break;
            }
            Ok(Flow::RetryIn(delay)) => {
                release(&inner, &current).await;
                debug!(delay_ms = delay.as_millis() as u64, "Waiting for retry");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.notified() => debug!("Retry wait interrupted by cancellation"),
                    _ = stop.changed() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "Run driver stopped");
                release(&inner, &current).await;
                break;
            }
        }
    }

    inner.finished.notify_waiters();
    let mut runs = inner.runs.lock().unwrap_or_else(|e| e.into_inner());
    if runs.get(&run_id).map_or(false, |h| Arc::ptr_eq(&h.cancel, &cancel)) {
        runs.remove(&run_id);
    }
}

async fn release(inner: &ExecutorInner, lease: &Lease) {
    if let Err(e) = inner.store.release_lease(lease).await {
        warn!(run_id = %lease.run_id, error = %e, "Failed to release lease");
    }
}

impl ExecutorInner {
    /// Execute steps while holding `lease`
    async fn run_steps(
        &self,
        run_id: &RunId,
        lease: &Lease,
        stop: &watch::Receiver<bool>,
    ) -> Result<Flow> {
        let mut run = self.store.load_run(run_id).await?;
        if run.is_terminal() {
            return Ok(Flow::Finished(run.status));
        }

        let definition = match self.registry.get(&run.definition) {
            Ok(definition) => definition,
            Err(e) => {
                let error = ActivityError::definition(e.to_string());
                return self.finish(lease, &run, StatusChange::failed(error)).await;
            }
        };

        if run.cancel_requested {
            return self.finish(lease, &run, StatusChange::to(RunStatus::Cancelled)).await;
        }

        if run.status == RunStatus::WaitingRetry {
            if let Some(retry_at) = run.retry_at {
                if let Ok(remaining) = (retry_at - Utc::now()).to_std() {
                    if !remaining.is_zero() {
                        return Ok(Flow::RetryIn(remaining));
                    }
                }
            }
        }

        if run.status != RunStatus::Running {
            run = self
                .store
                .set_status(lease, StatusChange::to(RunStatus::Running))
                .await?;
        }

        loop {
            if *stop.borrow() {
                return Ok(Flow::Stopped);
            }
            if run.cancel_requested {
                info!(step = run.current_step, "Cancelling run at step boundary");
                return self.finish(lease, &run, StatusChange::to(RunStatus::Cancelled)).await;
            }
            let Some(step) = definition.steps.get(run.current_step) else {
                return self.finish(lease, &run, StatusChange::to(RunStatus::Succeeded)).await;
            };

            let outcome = if step.fan_out.is_some() {
                self.execute_fan_out(lease, &definition, step, run).await?
            } else {
                self.execute_step(lease, &definition, step, run).await?
            };
            match outcome {
                StepOutcome::Advanced(next) => run = next,
                StepOutcome::Flow(flow) => return Ok(flow),
            }
        }
    }

    #[instrument(skip_all, fields(run_id = %run.id, step = %step.id, activity = %step.activity))]
    async fn execute_step(
        &self,
        lease: &Lease,
        definition: &WorkflowDefinition,
        step: &Step,
        run: WorkflowRun,
    ) -> Result<StepOutcome> {
        let attempt = run.last_attempt_number(&step.id, None) + 1;
        let input = step
            .input
            .build(&MappingContext::new(&run.input, &run.outputs));

        let started = Instant::now();
        let result = match input {
            Ok(input) => self.invoke(step, input).await,
            Err(msg) => ActivityResult::Failure(ActivityError::validation(format!(
                "cannot build input for step '{}': {}",
                step.id, msg
            ))),
        };
        let elapsed = started.elapsed();
        let outcome = result.outcome();

        match result {
            ActivityResult::Success(output) => {
                match next_step(definition, step, &run, &output) {
                    Ok(next) => {
                        let record = attempt_record(&run.id, step, None, attempt, outcome, None, elapsed);
                        let run = self.store.complete_step(lease, record, output, next).await?;
                        Ok(StepOutcome::Advanced(run))
                    }
                    Err(error) => {
                        let record = attempt_record(
                            &run.id,
                            step,
                            None,
                            attempt,
                            AttemptOutcome::Failure,
                            Some(error.clone()),
                            elapsed,
                        );
                        let run = self.store.append_attempt(lease, record).await?;
                        let flow = self.finish(lease, &run, StatusChange::failed(error)).await?;
                        Ok(StepOutcome::Flow(flow))
                    }
                }
            }
            ActivityResult::Failure(error) | ActivityResult::Timeout(error) => {
                let record =
                    attempt_record(&run.id, step, None, attempt, outcome, Some(error.clone()), elapsed);
                let run = self.store.append_attempt(lease, record).await?;
                let delay = self.config.policy_for(step).delay_after(attempt, &error);
                self.retry_or_fail(lease, &run, step, delay, error).await
            }
        }
    }

    #[instrument(skip_all, fields(run_id = %run.id, step = %step.id, activity = %step.activity))]
    async fn execute_fan_out(
        &self,
        lease: &Lease,
        definition: &WorkflowDefinition,
        step: &Step,
        run: WorkflowRun,
    ) -> Result<StepOutcome> {
        let over = step.fan_out.as_ref().map(|f| f.over.as_str()).unwrap_or_default();
        let ctx = MappingContext::new(&run.input, &run.outputs);
        let items = match ctx.resolve(over) {
            Some(Value::Array(items)) => items,
            other => {
                let found = if other.is_some() { "is not an array" } else { "is missing" };
                let error = ActivityError::validation(format!(
                    "fan-out path '{}' of step '{}' {}",
                    over, step.id, found
                ));
                let attempt = run.last_attempt_number(&step.id, None) + 1;
                let record = attempt_record(
                    &run.id,
                    step,
                    None,
                    attempt,
                    AttemptOutcome::Failure,
                    Some(error.clone()),
                    Duration::ZERO,
                );
                let run = self.store.append_attempt(lease, record).await?;
                return self.retry_or_fail(lease, &run, step, None, error).await;
            }
        };

        let jobs: Vec<(usize, u32, std::result::Result<Value, String>)> = (0..items.len())
            .filter(|i| !run.partial_outputs.contains_key(i))
            .map(|i| {
                let attempt = run.last_attempt_number(&step.id, Some(i)) + 1;
                let input = step.input.build(&ctx.with_item(i, &items[i]));
                (i, attempt, input)
            })
            .collect();
        debug!(total = items.len(), pending = jobs.len(), "Fanning out");

        let semaphore = Semaphore::new(self.config.max_fan_out_concurrency);
        let mut in_flight: FuturesUnordered<_> = jobs
            .into_iter()
            .map(|(item, attempt, input)| {
                let semaphore = &semaphore;
                async move {
                    let _permit = semaphore.acquire().await.ok();
                    let started = Instant::now();
                    let result = match input {
                        Ok(input) => self.invoke(step, input).await,
                        Err(msg) => ActivityResult::Failure(ActivityError::validation(format!(
                            "cannot build input for element {} of step '{}': {}",
                            item, step.id, msg
                        ))),
                    };
                    (item, attempt, result, started.elapsed())
                }
            })
            .collect();

        let mut latest = run;
        let mut failures: Vec<(u32, ActivityError)> = Vec::new();
        while let Some((item, attempt, result, elapsed)) = in_flight.next().await {
            let outcome = result.outcome();
            match result {
                ActivityResult::Success(output) => {
                    let record =
                        attempt_record(&latest.id, step, Some(item), attempt, outcome, None, elapsed);
                    latest = self.store.record_item_output(lease, record, output).await?;
                }
                ActivityResult::Failure(error) | ActivityResult::Timeout(error) => {
                    let record = attempt_record(
                        &latest.id,
                        step,
                        Some(item),
                        attempt,
                        outcome,
                        Some(error.clone()),
                        elapsed,
                    );
                    latest = self.store.append_attempt(lease, record).await?;
                    failures.push((attempt, error));
                }
            }
        }
        drop(in_flight);

        if failures.is_empty() {
            let output = Value::Array(
                (0..items.len())
                    .map(|i| latest.partial_outputs.get(&i).cloned().unwrap_or(Value::Null))
                    .collect(),
            );
            return match next_step(definition, step, &latest, &output) {
                Ok(next) => {
                    let run = self.store.advance_step(lease, &step.id, output, next).await?;
                    Ok(StepOutcome::Advanced(run))
                }
                Err(error) => {
                    let flow = self.finish(lease, &latest, StatusChange::failed(error)).await?;
                    Ok(StepOutcome::Flow(flow))
                }
            };
        }

        // The slowest element sets the pace; one exhausted element fails the step
        let policy = self.config.policy_for(step);
        let mut delay = Some(Duration::ZERO);
        let mut reported = None;
        for (attempt, error) in failures {
            match (delay, policy.delay_after(attempt, &error)) {
                (Some(current), Some(next)) => {
                    delay = Some(current.max(next));
                    reported.get_or_insert(error);
                }
                (Some(_), None) => {
                    delay = None;
                    reported = Some(error);
                }
                (None, _) => {}
            }
        }
        let error = reported.unwrap_or_else(|| ActivityError::validation("fan-out failed"));
        self.retry_or_fail(lease, &latest, step, delay, error).await
    }

    async fn invoke(&self, step: &Step, input: Value) -> ActivityResult {
        let timeout = step
            .timeout_override()
            .unwrap_or_else(|| self.config.timeout_for(step.activity.provider()));
        self.invoker.invoke(step.activity, input, timeout).await
    }

    async fn retry_or_fail(
        &self,
        lease: &Lease,
        run: &WorkflowRun,
        step: &Step,
        delay: Option<Duration>,
        error: ActivityError,
    ) -> Result<StepOutcome> {
        let flow = match delay {
            Some(delay) => {
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                warn!(
                    step = %step.id,
                    kind = %error.kind,
                    delay_ms = delay.as_millis() as u64,
                    "Step failed, retry scheduled: {}",
                    error.message
                );
                self.store
                    .set_status(lease, StatusChange::waiting_retry(retry_at, error))
                    .await?;
                add_metric("workflow_retries_scheduled", 1.0, &[("step", step.id.clone())]);
                Flow::RetryIn(delay)
            }
            None => {
                warn!(step = %step.id, kind = %error.kind, "Step failed permanently: {}", error.message);
                self.finish(lease, run, StatusChange::failed(error)).await?
            }
        };
        Ok(StepOutcome::Flow(flow))
    }

    /// Move the run to a terminal status
    async fn finish(&self, lease: &Lease, run: &WorkflowRun, change: StatusChange) -> Result<Flow> {
        let _timer = span_duration("workflow_finish");
        let status = change.status;
        let run_after = self.store.set_status(lease, change).await?;

        let elapsed_ms = (run_after.updated_at - run.created_at).num_milliseconds().max(0);
        info!(status = %status, elapsed_ms, "Workflow run finished");
        add_metric(
            "workflow_run_duration_ms",
            elapsed_ms as f64,
            &[("workflow", run.definition.clone()), ("status", status.to_string())],
        );
        Ok(Flow::Finished(status))
    }
}

fn resolve_target(definition: &WorkflowDefinition, target: &str) -> std::result::Result<usize, ActivityError> {
    definition.index_of(target).ok_or_else(|| {
        ActivityError::definition(format!(
            "{}: transition to unknown step '{}'",
            definition.name, target
        ))
    })
}

/// Audit entry for one attempt; also counts it on the metrics target
fn attempt_record(
    run_id: &RunId,
    step: &Step,
    item: Option<usize>,
    attempt: u32,
    outcome: AttemptOutcome,
    error: Option<ActivityError>,
    elapsed: Duration,
) -> ActivityAttempt {
    add_metric(
        "workflow_step_attempts",
        1.0,
        &[
            ("step", step.id.clone()),
            ("activity", step.activity.to_string()),
            ("outcome", format!("{:?}", outcome)),
        ],
    );
    ActivityAttempt {
        run_id: run_id.clone(),
        step_id: step.id.clone(),
        item,
        attempt,
        outcome,
        error,
        duration_ms: elapsed.as_millis() as u64,
        recorded_at: Utc::now(),
    }
}

/// Index of the step that follows `step` once it produced `output`
fn next_step(
    definition: &WorkflowDefinition,
    step: &Step,
    run: &WorkflowRun,
    output: &Value,
) -> std::result::Result<usize, ActivityError> {
    let mut outputs = run.outputs.clone();
    outputs.insert(step.id.clone(), output.clone());
    let ctx = MappingContext::new(&run.input, &outputs);

    match &step.next {
        Transition::Next => Ok(run.current_step + 1),
        Transition::End => Ok(definition.steps.len()),
        Transition::Goto { step: target } => resolve_target(definition, target),
        Transition::Branch {
            when,
            then,
            otherwise,
        } => {
            let taken = when.evaluate(&ctx);
            debug!(step = %step.id, taken, "Branch evaluated");
            match (taken, otherwise) {
                (true, _) => resolve_target(definition, then),
                (false, Some(otherwise)) => resolve_target(definition, otherwise),
                (false, None) => Ok(definition.steps.len()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;

    #[test]
    fn test_default_config_is_valid() {
        let config = ExecutorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timeout_for(ProviderFamily::Email), Duration::from_secs(10));
        assert_eq!(config.timeout_for(ProviderFamily::Llm), Duration::from_secs(30));
    }

    #[test]
    fn test_lease_must_exceed_timeouts() {
        let config = ExecutorConfig {
            lease_duration_ms: 30_000,
            ..ExecutorConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("lease_duration_ms")));

        let config = ExecutorConfig {
            email_timeout_ms: 0,
            ..ExecutorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_named_policy_rejected() {
        let mut config = ExecutorConfig::default();
        config.retry_policies.insert(
            "broken".to_string(),
            RetryPolicy {
                jitter: 0.9,
                ..RetryPolicy::default()
            },
        );
        assert!(matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("broken")));
    }

    #[test]
    fn test_policy_lookup() {
        let mut config = ExecutorConfig::default();
        config
            .retry_policies
            .insert("email".to_string(), RetryPolicy::no_retry());

        let named = Step::new("send", ActivityKind::SendEmail).retry_policy("email");
        assert_eq!(config.policy_for(&named).max_attempts, 1);

        let plain = Step::new("send", ActivityKind::SendEmail);
        assert_eq!(config.policy_for(&plain), &config.default_retry);
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
lease_duration_ms: 5000
llm_timeout_ms: 2000
retry_policies:
  email:
    max_attempts: 5
    initial_interval_ms: 10
"#;
        let config: ExecutorConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_policies["email"].max_attempts, 5);
        assert_eq!(config.retry_policies["email"].max_interval_ms, 60_000);
        assert_eq!(config.max_fan_out_concurrency, 4);
    }
}
