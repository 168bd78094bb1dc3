use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use super::{Lease, StatusChange};
use crate::error::{Error, Result};
use crate::workflow::run::{ActivityAttempt, AttemptOutcome, RunStatus, WorkflowRun};

/// Persisted form of a run: the snapshot and its current lease.
///
/// Every mutation checks its preconditions before touching the record, so a
/// rejected call leaves the record unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run snapshot
    pub run: WorkflowRun,

    /// Current lease, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
}

fn ttl_to_chrono(ttl: Duration) -> Result<chrono::Duration> {
    if ttl.is_zero() {
        return Err(Error::Validation("lease duration must be greater than zero".to_string()));
    }
    chrono::Duration::from_std(ttl)
        .map_err(|_| Error::Validation(format!("lease duration {:?} is out of range", ttl)))
}

impl RunRecord {
    /// Record for a freshly created run
    pub fn new(run: WorkflowRun) -> Self {
        Self { run, lease: None }
    }

    fn ensure_not_terminal(&self) -> Result<()> {
        if self.run.status.is_terminal() {
            return Err(Error::RunTerminal {
                run_id: self.run.id.clone(),
                status: self.run.status,
            });
        }
        Ok(())
    }

    fn ensure_lease(&self, lease: &Lease, now: DateTime<Utc>) -> Result<()> {
        match &self.lease {
            Some(current)
                if current.token == lease.token
                    && current.run_id == lease.run_id
                    && !current.is_expired_at(now) =>
            {
                Ok(())
            }
            _ => Err(Error::LeaseLost(self.run.id.clone())),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.run.status != RunStatus::Running {
            return Err(Error::StaleAttempt(format!(
                "run {} is {}, not RUNNING",
                self.run.id, self.run.status
            )));
        }
        Ok(())
    }

    fn ensure_step_open(&self, step_id: &str) -> Result<()> {
        if self.run.outputs.contains_key(step_id) {
            return Err(Error::StaleAttempt(format!(
                "step '{}' of run {} already completed",
                step_id, self.run.id
            )));
        }
        Ok(())
    }

    fn ensure_writable(&self, lease: &Lease, now: DateTime<Utc>) -> Result<()> {
        self.ensure_not_terminal()?;
        self.ensure_lease(lease, now)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.run.updated_at = now;
    }

    /// Grant the lease to `owner`.
    ///
    /// An unexpired lease of another owner is refused; an expired one is reclaimed.
    pub fn acquire_lease(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        self.ensure_not_terminal()?;
        let ttl = ttl_to_chrono(ttl)?;
        if let Some(current) = &self.lease {
            if current.owner != owner && !current.is_expired_at(now) {
                return Err(Error::LeaseHeld {
                    run_id: self.run.id.clone(),
                    owner: current.owner.clone(),
                });
            }
        }

        let lease = Lease {
            run_id: self.run.id.clone(),
            owner: owner.to_string(),
            token: Uuid::new_v4(),
            expires_at: now + ttl,
        };
        self.lease = Some(lease.clone());
        Ok(lease)
    }

    /// Extend the current lease
    pub fn renew_lease(&mut self, lease: &Lease, ttl: Duration, now: DateTime<Utc>) -> Result<Lease> {
        self.ensure_writable(lease, now)?;
        let ttl = ttl_to_chrono(ttl)?;
        let renewed = Lease {
            expires_at: now + ttl,
            ..lease.clone()
        };
        self.lease = Some(renewed.clone());
        Ok(renewed)
    }

    /// Drop the lease if `lease` is still the current one
    pub fn release_lease(&mut self, lease: &Lease) -> bool {
        match &self.lease {
            Some(current) if current.token == lease.token => {
                self.lease = None;
                true
            }
            _ => false,
        }
    }

    fn check_attempt(&self, lease: &Lease, attempt: &ActivityAttempt, now: DateTime<Utc>) -> Result<()> {
        self.ensure_writable(lease, now)?;
        self.ensure_running()?;
        self.ensure_step_open(&attempt.step_id)?;

        if attempt.run_id != self.run.id {
            return Err(Error::StaleAttempt(format!(
                "attempt for run {} recorded on run {}",
                attempt.run_id, self.run.id
            )));
        }
        if let Some(item) = attempt.item {
            if self.run.partial_outputs.contains_key(&item) {
                return Err(Error::StaleAttempt(format!(
                    "element {} of step '{}' already succeeded",
                    item, attempt.step_id
                )));
            }
        }
        let expected = self.run.last_attempt_number(&attempt.step_id, attempt.item) + 1;
        if attempt.attempt != expected {
            return Err(Error::StaleAttempt(format!(
                "step '{}' expects attempt {}, got {}",
                attempt.step_id, expected, attempt.attempt
            )));
        }
        Ok(())
    }

    /// Append a failed or timed out attempt. It must target an open step of a
    /// RUNNING run and carry the next attempt number for its step and element.
    ///
    /// Successful attempts go through [`complete_step`](Self::complete_step) or
    /// [`record_item_output`](Self::record_item_output) so the attempt and its
    /// output land in the same write.
    pub fn append_attempt(
        &mut self,
        lease: &Lease,
        attempt: ActivityAttempt,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if attempt.outcome == AttemptOutcome::Success {
            return Err(Error::Validation(format!(
                "successful attempt {} of step '{}' must be recorded with its output",
                attempt.attempt, attempt.step_id
            )));
        }
        self.check_attempt(lease, &attempt, now)?;

        self.run.attempts.push(attempt);
        self.touch(now);
        Ok(())
    }

    /// Record the successful attempt of a single-activity step together with its
    /// output, and point the run at `next_step`
    pub fn complete_step(
        &mut self,
        lease: &Lease,
        attempt: ActivityAttempt,
        output: Value,
        next_step: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if attempt.outcome != AttemptOutcome::Success || attempt.item.is_some() {
            return Err(Error::Validation(format!(
                "attempt {} of step '{}' does not complete the step",
                attempt.attempt, attempt.step_id
            )));
        }
        self.check_attempt(lease, &attempt, now)?;

        let step_id = attempt.step_id.clone();
        self.run.attempts.push(attempt);
        self.run.outputs.insert(step_id, output);
        self.run.partial_outputs.clear();
        self.run.current_step = next_step;
        self.run.retry_at = None;
        self.touch(now);
        Ok(())
    }

    /// Record the successful attempt of a fan-out element together with its output
    pub fn record_item_output(
        &mut self,
        lease: &Lease,
        attempt: ActivityAttempt,
        output: Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(item) = attempt.item.filter(|_| attempt.outcome == AttemptOutcome::Success) else {
            return Err(Error::Validation(format!(
                "attempt {} of step '{}' is not a succeeded fan-out element",
                attempt.attempt, attempt.step_id
            )));
        };
        self.check_attempt(lease, &attempt, now)?;

        self.run.attempts.push(attempt);
        self.run.partial_outputs.insert(item, output);
        self.touch(now);
        Ok(())
    }

    /// Store the joined output of a fan-out step whose elements have all succeeded
    /// and point the run at `next_step`
    pub fn advance_step(
        &mut self,
        lease: &Lease,
        step_id: &str,
        output: Value,
        next_step: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_writable(lease, now)?;
        self.ensure_running()?;
        self.ensure_step_open(step_id)?;

        self.run.outputs.insert(step_id.to_string(), output);
        self.run.partial_outputs.clear();
        self.run.current_step = next_step;
        self.run.retry_at = None;
        self.touch(now);
        Ok(())
    }

    /// Apply a status change permitted by the run state machine
    pub fn set_status(&mut self, lease: &Lease, change: StatusChange, now: DateTime<Utc>) -> Result<()> {
        self.ensure_writable(lease, now)?;
        let from = self.run.status;
        if !from.can_transition_to(change.status) {
            return Err(Error::InvalidTransition {
                from,
                to: change.status,
            });
        }

        self.run.status = change.status;
        self.run.retry_at = if change.status == RunStatus::WaitingRetry {
            change.retry_at
        } else {
            None
        };
        if let Some(error) = change.error {
            self.run.last_error = Some(error);
        }
        if change.status.is_terminal() {
            self.lease = None;
        }
        self.touch(now);
        Ok(())
    }

    /// Flag the run for cancellation
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_not_terminal()?;
        if !self.run.cancel_requested {
            self.run.cancel_requested = true;
            self.touch(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityError;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(30);

    fn record() -> RunRecord {
        RunRecord::new(WorkflowRun::new("demo", json!({})))
    }

    fn attempt(record: &RunRecord, step: &str, item: Option<usize>, n: u32) -> ActivityAttempt {
        ActivityAttempt {
            run_id: record.run.id.clone(),
            step_id: step.to_string(),
            item,
            attempt: n,
            outcome: AttemptOutcome::Failure,
            error: None,
            duration_ms: 3,
            recorded_at: Utc::now(),
        }
    }

    fn running() -> (RunRecord, Lease) {
        let mut record = record();
        let now = Utc::now();
        let lease = record.acquire_lease("exec-a", TTL, now).unwrap();
        record.set_status(&lease, StatusChange::to(RunStatus::Running), now).unwrap();
        (record, lease)
    }

    #[test]
    fn test_lease_exclusive_until_expiry() {
        let mut record = record();
        let now = Utc::now();
        let lease = record.acquire_lease("exec-a", TTL, now).unwrap();

        match record.acquire_lease("exec-b", TTL, now) {
            Err(Error::LeaseHeld { owner, .. }) => assert_eq!(owner, "exec-a"),
            other => panic!("expected LeaseHeld, got {:?}", other),
        }

        let later = lease.expires_at + chrono::Duration::milliseconds(1);
        let reclaimed = record.acquire_lease("exec-b", TTL, later).unwrap();
        assert_eq!(reclaimed.owner, "exec-b");
        assert_ne!(reclaimed.token, lease.token);

        let err = record
            .set_status(&lease, StatusChange::to(RunStatus::Running), later)
            .unwrap_err();
        assert!(matches!(err, Error::LeaseLost(_)));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut record = record();
        assert!(matches!(
            record.acquire_lease("exec-a", Duration::ZERO, Utc::now()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_release_only_current_lease() {
        let mut record = record();
        let now = Utc::now();
        let lease = record.acquire_lease("exec-a", TTL, now).unwrap();
        let mut stale = lease.clone();
        stale.token = Uuid::new_v4();

        assert!(!record.release_lease(&stale));
        assert!(record.lease.is_some());
        assert!(record.release_lease(&lease));
        assert!(record.lease.is_none());
    }

    #[test]
    fn test_attempt_ordering() {
        let (mut record, lease) = running();
        let now = Utc::now();

        let first = attempt(&record, "a", None, 1);
        record.append_attempt(&lease, first, now).unwrap();

        let skipped = attempt(&record, "a", None, 3);
        assert!(matches!(
            record.append_attempt(&lease, skipped, now),
            Err(Error::StaleAttempt(_))
        ));

        let second = attempt(&record, "a", None, 2);
        record.append_attempt(&lease, second, now).unwrap();

        let element = attempt(&record, "a", Some(0), 1);
        record.append_attempt(&lease, element, now).unwrap();
        assert_eq!(record.run.attempts.len(), 3);
    }

    fn succeeded(record: &RunRecord, step: &str, item: Option<usize>, n: u32) -> ActivityAttempt {
        ActivityAttempt {
            outcome: AttemptOutcome::Success,
            ..attempt(record, step, item, n)
        }
    }

    #[test]
    fn test_success_needs_its_output() {
        let (mut record, lease) = running();
        let now = Utc::now();
        let done = succeeded(&record, "a", None, 1);
        assert!(matches!(
            record.append_attempt(&lease, done, now),
            Err(Error::Validation(_))
        ));
        assert!(record.run.attempts.is_empty());

        let failed = attempt(&record, "a", None, 1);
        assert!(matches!(
            record.complete_step(&lease, failed, json!({}), 1, now),
            Err(Error::Validation(_))
        ));
        let element = succeeded(&record, "a", Some(0), 1);
        assert!(matches!(
            record.complete_step(&lease, element, json!({}), 1, now),
            Err(Error::Validation(_))
        ));
        assert!(record.run.outputs.is_empty());
    }

    #[test]
    fn test_complete_step_writes_attempt_and_output_together() {
        let (mut record, lease) = running();
        let now = Utc::now();
        record.append_attempt(&lease, attempt(&record, "a", None, 1), now).unwrap();

        let skipped = succeeded(&record, "a", None, 3);
        assert!(record.complete_step(&lease, skipped, json!({}), 1, now).is_err());
        assert!(record.run.outputs.is_empty());
        assert_eq!(record.run.attempts.len(), 1);

        let done = succeeded(&record, "a", None, 2);
        record.complete_step(&lease, done, json!({"ok": true}), 1, now).unwrap();
        assert_eq!(record.run.attempts.len(), 2);
        assert_eq!(record.run.outputs["a"], json!({"ok": true}));
        assert_eq!(record.run.current_step, 1);
    }

    #[test]
    fn test_attempt_after_completion_is_stale() {
        let (mut record, lease) = running();
        let now = Utc::now();
        let done = succeeded(&record, "a", None, 1);
        record.complete_step(&lease, done, json!({"ok": true}), 1, now).unwrap();

        let late = attempt(&record, "a", None, 2);
        assert!(matches!(
            record.append_attempt(&lease, late, now),
            Err(Error::StaleAttempt(_))
        ));
        let again = succeeded(&record, "a", None, 2);
        assert!(matches!(
            record.complete_step(&lease, again, json!({}), 1, now),
            Err(Error::StaleAttempt(_))
        ));
        assert!(matches!(
            record.advance_step(&lease, "a", json!({}), 1, now),
            Err(Error::StaleAttempt(_))
        ));
    }

    #[test]
    fn test_partial_outputs_cleared_on_advance() {
        let (mut record, lease) = running();
        let now = Utc::now();
        let element = succeeded(&record, "fan", Some(1), 1);
        record.record_item_output(&lease, element, json!("b"), now).unwrap();
        assert_eq!(record.run.attempts.len(), 1);

        let again = succeeded(&record, "fan", Some(1), 2);
        assert!(matches!(
            record.record_item_output(&lease, again, json!("b"), now),
            Err(Error::StaleAttempt(_))
        ));
        let retry = attempt(&record, "fan", Some(1), 2);
        assert!(record.append_attempt(&lease, retry, now).is_err());
        let not_element = succeeded(&record, "fan", None, 1);
        assert!(matches!(
            record.record_item_output(&lease, not_element, json!("a"), now),
            Err(Error::Validation(_))
        ));

        record.advance_step(&lease, "fan", json!(["a", "b"]), 1, now).unwrap();
        assert!(record.run.partial_outputs.is_empty());
        assert_eq!(record.run.current_step, 1);
    }

    #[test]
    fn test_terminal_run_is_immutable() {
        let (mut record, lease) = running();
        let now = Utc::now();
        record
            .set_status(&lease, StatusChange::failed(ActivityError::validation("bad")), now)
            .unwrap();
        assert!(record.lease.is_none());

        assert!(matches!(
            record.acquire_lease("exec-a", TTL, now),
            Err(Error::RunTerminal { status: RunStatus::Failed, .. })
        ));
        assert!(matches!(record.request_cancel(now), Err(Error::RunTerminal { .. })));
        assert!(matches!(
            record.set_status(&lease, StatusChange::to(RunStatus::Running), now),
            Err(Error::RunTerminal { .. })
        ));
    }

    #[test]
    fn test_invalid_transition() {
        let mut record = record();
        let now = Utc::now();
        let lease = record.acquire_lease("exec-a", TTL, now).unwrap();
        assert!(matches!(
            record.set_status(&lease, StatusChange::to(RunStatus::Succeeded), now),
            Err(Error::InvalidTransition {
                from: RunStatus::Pending,
                to: RunStatus::Succeeded
            })
        ));
        assert_eq!(record.run.status, RunStatus::Pending);
    }

    #[test]
    fn test_retry_at_only_kept_while_waiting() {
        let (mut record, lease) = running();
        let now = Utc::now();
        let due = now + chrono::Duration::seconds(2);
        record
            .set_status(
                &lease,
                StatusChange::waiting_retry(due, ActivityError::validation("x")),
                now,
            )
            .unwrap();
        assert_eq!(record.run.retry_at, Some(due));

        record.set_status(&lease, StatusChange::to(RunStatus::Running), now).unwrap();
        assert_eq!(record.run.retry_at, None);
        assert!(record.run.last_error.is_some());
    }
}
