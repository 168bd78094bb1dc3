#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(rustdoc::missing_crate_level_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]
#![deny(rustdoc::invalid_codeblock_attributes)]
#![deny(rustdoc::invalid_html_tags)]
#![deny(rustdoc::bare_urls)]
#![deny(clippy::missing_panics_doc)]

//! Campaign orchestrator: durable, retryable multi-step workflows for sales automation.
//!
//! A workflow is a graph of activities: LLM copy generation, follow-ups, lead
//! qualification and reply classification, plus email delivery and calendar booking. The executor drives each run in its own task,
//! persists every attempt and step result before moving on, retries transient
//! failures with exponential backoff and hands runs over between executors through
//! time-bounded leases.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use campaign_orchestrator::activity::dry_run::{DryRunCalendar, DryRunEmail, DryRunLlm};
//! use campaign_orchestrator::activity::ActivityInvoker;
//! use campaign_orchestrator::store::InMemoryStateStore;
//! use campaign_orchestrator::workflow::{catalog, ExecutorConfig, WorkflowExecutor};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let invoker = ActivityInvoker::new(
//!         Arc::new(DryRunLlm::default()),
//!         Arc::new(DryRunEmail::default()),
//!         Arc::new(DryRunCalendar::default()),
//!     );
//!     let executor = WorkflowExecutor::new(
//!         ExecutorConfig::default(),
//!         Arc::new(InMemoryStateStore::new()),
//!         invoker,
//!     )?;
//!     executor.register_definition(catalog::social_campaign())?;
//!
//!     let run_id = executor
//!         .start_workflow(
//!             catalog::SOCIAL_CAMPAIGN,
//!             json!({"topic": "AI for SDR teams", "platforms": ["twitter", "linkedin"]}),
//!         )
//!         .await?;
//!     let run = executor.wait_for_run(&run_id, Duration::from_secs(30)).await?;
//!     println!("{} finished with {}", run.id, run.status);
//!
//!     executor.shutdown(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

/// Activity catalogue, provider traits and the activity invoker
pub mod activity;

/// Configuration management
pub mod config;

/// Error types for the orchestrator
pub mod error;

/// LLM integration seam
pub mod llm;

/// Durable run state and leases
pub mod store;

/// Logging and metrics
pub mod telemetry;

/// Workflow definitions, registry, retry policy and executor
pub mod workflow;

// Re-export error types
pub use error::{Error, Result};

/// Re-export telemetry types and functions for easier access
pub use telemetry::{add_metric, add_metrics, init_telemetry, span_duration, TelemetryConfig};

/// Re-export LLM types for easier access
pub use llm::{Completion, CompletionRequest, LlmClient, LlmConfig, Message as LlmMessage, MessageRole};

/// Re-export the main workflow types
pub use workflow::{
    ExecutorConfig, RetryPolicy, RunId, RunStatus, WorkflowDefinition, WorkflowExecutor,
    WorkflowRun,
};

pub use activity::{ActivityInvoker, ActivityKind, ActivityResult, FailureKind};
pub use store::{FileStateStore, InMemoryStateStore, StateStore};
