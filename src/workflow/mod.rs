//! Workflow orchestration: definitions, runs and the executor driving them.
//!
//! - [`definition`]: step graphs (sequence, goto, conditional branch, fan-out)
//! - [`mapping`]: how step inputs and branch conditions read the run state
//! - [`registry`]: validated, immutable definitions keyed by name
//! - [`retry`]: exponential backoff with jitter
//! - [`run`]: run snapshots, statuses and the attempt audit trail
//! - [`executor`]: one tokio task per run, lease-guarded
//! - [`catalog`]: built-in campaign workflows

/// Built-in campaign workflows
pub mod catalog;
/// Workflow definitions
pub mod definition;
/// Run driver
pub mod executor;
/// Input mappings and branch predicates
pub mod mapping;
/// Definition registry
pub mod registry;
/// Retry policy
pub mod retry;
/// Run state
pub mod run;

// Re-export key components
pub use definition::{FanOut, Step, Transition, WorkflowDefinition};
pub use executor::{ExecutorConfig, WorkflowExecutor};
pub use mapping::{BranchPredicate, InputMapping, MappingContext};
pub use registry::DefinitionRegistry;
pub use retry::RetryPolicy;
pub use run::{ActivityAttempt, AttemptOutcome, RunId, RunStatus, WorkflowRun};
