use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use uuid::Uuid;

use crate::activity::ActivityError;

/// Identifier of a workflow run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created, not yet picked up by an executor
    Pending,
    /// An executor is driving the run
    Running,
    /// A step failed and a retry is scheduled
    WaitingRetry,
    /// All steps completed
    Succeeded,
    /// A step failed permanently or exhausted its retries
    Failed,
    /// Cancelled at a step boundary
    Cancelled,
}

impl RunStatus {
    /// Whether the status is final
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the run state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) | (Pending, Failed) => true,
            (Running, WaitingRetry)
            | (Running, Succeeded)
            | (Running, Failed)
            | (Running, Cancelled) => true,
            (WaitingRetry, Running) | (WaitingRetry, Cancelled) | (WaitingRetry, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::WaitingRetry => "WAITING_RETRY",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Outcome of a single activity attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutcome {
    /// The activity returned an output
    Success,
    /// The activity or its provider reported an error
    Failure,
    /// The activity did not finish within its timeout
    Timeout,
}

/// One entry of a run's append-only audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityAttempt {
    /// Run the attempt belongs to
    pub run_id: RunId,

    /// Step that was attempted
    pub step_id: String,

    /// Element index for fan-out steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<usize>,

    /// Attempt number, starting at 1 for each step (and fan-out element)
    pub attempt: u32,

    /// Classified outcome
    pub outcome: AttemptOutcome,

    /// Error detail for failed or timed out attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ActivityError>,

    /// Wall-clock duration of the call
    pub duration_ms: u64,

    /// Time the attempt finished
    pub recorded_at: DateTime<Utc>,
}

/// Durable state of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique ID of the run
    pub id: RunId,

    /// Name of the workflow definition being executed
    pub definition: String,

    /// Initial input passed to `start_workflow`
    pub input: serde_json::Value,

    /// Index of the next step to execute; equal to the step count once no steps remain
    pub current_step: usize,

    /// Current status
    pub status: RunStatus,

    /// Outputs of completed steps, keyed by step id
    #[serde(default)]
    pub outputs: HashMap<String, serde_json::Value>,

    /// Outputs of fan-out elements of the current step that already succeeded
    #[serde(default)]
    pub partial_outputs: BTreeMap<usize, serde_json::Value>,

    /// Audit trail of every attempt, in the order they were recorded
    #[serde(default)]
    pub attempts: Vec<ActivityAttempt>,

    /// Set by an external cancellation request; honoured at the next step boundary
    #[serde(default)]
    pub cancel_requested: bool,

    /// When a run in WAITING_RETRY becomes due
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,

    /// The error that made the run fail, or the most recent retryable one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ActivityError>,

    /// Time the run was created
    pub created_at: DateTime<Utc>,

    /// Time of the last mutation
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Create a new pending run for `definition`
    pub fn new(definition: &str, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            definition: definition.to_string(),
            input,
            current_step: 0,
            status: RunStatus::Pending,
            outputs: HashMap::new(),
            partial_outputs: BTreeMap::new(),
            attempts: Vec::new(),
            cancel_requested: false,
            retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attempts recorded for a step, in order
    pub fn attempts_for(&self, step_id: &str) -> Vec<&ActivityAttempt> {
        self.attempts
            .iter()
            .filter(|a| a.step_id == step_id)
            .collect()
    }

    /// Number of the last attempt recorded for a step (and fan-out element), 0 if none
    pub fn last_attempt_number(&self, step_id: &str, item: Option<usize>) -> u32 {
        self.attempts
            .iter()
            .filter(|a| a.step_id == step_id && a.item == item)
            .map(|a| a.attempt)
            .max()
            .unwrap_or(0)
    }

    /// Output of a completed step
    pub fn output(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.outputs.get(step_id)
    }

    /// Whether the run is in a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(WaitingRetry));
        assert!(WaitingRetry.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Running.can_transition_to(Pending));

        for terminal in [Succeeded, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, WaitingRetry, Succeeded, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&RunStatus::WaitingRetry).unwrap();
        assert_eq!(json, "\"WAITING_RETRY\"");
        assert_eq!(RunStatus::WaitingRetry.to_string(), "WAITING_RETRY");
    }

    #[test]
    fn test_last_attempt_number() {
        let mut run = WorkflowRun::new("demo", serde_json::json!({}));
        assert_eq!(run.last_attempt_number("a", None), 0);
        for n in 1..=2 {
            run.attempts.push(ActivityAttempt {
                run_id: run.id.clone(),
                step_id: "a".to_string(),
                item: None,
                attempt: n,
                outcome: AttemptOutcome::Failure,
                error: None,
                duration_ms: 1,
                recorded_at: Utc::now(),
            });
        }
        assert_eq!(run.last_attempt_number("a", None), 2);
        assert_eq!(run.last_attempt_number("a", Some(0)), 0);
        assert_eq!(run.attempts_for("a").len(), 2);
    }
}
