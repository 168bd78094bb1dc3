use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::mapping::{BranchPredicate, InputMapping};
use crate::activity::ActivityKind;

/// A named, ordered step graph.
///
/// Definitions are plain data: they can be built in code or deserialized from the
/// `workflows` section of the settings file. The registry validates them and keeps
/// them immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Name the workflow is started by
    pub name: String,

    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Steps in declaration order; execution starts at the first one
    pub steps: Vec<Step>,
}

impl WorkflowDefinition {
    /// Create an empty definition
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
        }
    }

    /// Set the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a step
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Index of the step with the given id
    pub fn index_of(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

/// One activity invocation inside a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Identifier, unique within the definition
    pub id: String,

    /// Activity to run
    pub activity: ActivityKind,

    /// How the activity input is derived from the run's input and prior outputs
    #[serde(default)]
    pub input: InputMapping,

    /// Name of a configured retry policy; the executor default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<String>,

    /// Timeout override in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Run the activity once per element of an array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_out: Option<FanOut>,

    /// Where execution continues once the step succeeded
    #[serde(default)]
    pub next: Transition,
}

impl Step {
    /// Create a step that runs `activity` on the run's initial input
    pub fn new(id: impl Into<String>, activity: ActivityKind) -> Self {
        Self {
            id: id.into(),
            activity,
            input: InputMapping::default(),
            retry_policy: None,
            timeout_ms: None,
            fan_out: None,
            next: Transition::default(),
        }
    }

    /// Set the input mapping
    pub fn input(mut self, input: InputMapping) -> Self {
        self.input = input;
        self
    }

    /// Reference a named retry policy
    pub fn retry_policy(mut self, name: impl Into<String>) -> Self {
        self.retry_policy = Some(name.into());
        self
    }

    /// Override the activity timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Fan out over the array found at `path`
    pub fn fan_out(mut self, path: impl Into<String>) -> Self {
        self.fan_out = Some(FanOut { over: path.into() });
        self
    }

    /// Set the transition taken after the step succeeds
    pub fn then(mut self, next: Transition) -> Self {
        self.next = next;
        self
    }

    /// Timeout override, if any
    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Fan-out settings of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOut {
    /// Path to an array in the mapping context, e.g. `input.platforms`
    pub over: String,
}

/// Control flow after a step succeeded
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transition {
    /// Continue with the next step in declaration order (or finish after the last one)
    #[default]
    Next,
    /// Continue with a named step
    Goto {
        /// Target step id
        step: String,
    },
    /// Evaluate a predicate against the accumulated outputs
    Branch {
        /// Condition to evaluate
        when: BranchPredicate,
        /// Step taken when the condition holds
        then: String,
        /// Step taken otherwise; finishing the run when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<String>,
    },
    /// Finish the run
    End,
}

impl Transition {
    /// Step ids this transition may jump to
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Transition::Next | Transition::End => Vec::new(),
            Transition::Goto { step } => vec![step.as_str()],
            Transition::Branch {
                then, otherwise, ..
            } => {
                let mut targets = vec![then.as_str()];
                if let Some(otherwise) = otherwise {
                    targets.push(otherwise.as_str());
                }
                targets
            }
        }
    }
}
