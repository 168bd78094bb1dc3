//! Activity invocation: the leaf of the orchestrator.
//!
//! An activity is one external call (LLM completion, email delivery, calendar
//! booking). This module provides:
//!
//! - the closed catalogue of activities and their input/output schemas
//! - the provider traits the calls go through
//! - the invoker, which validates input, enforces the timeout and classifies the outcome
//! - dry-run providers for rehearsals and tests

/// Deterministic in-process providers
pub mod dry_run;
/// Failure classification and provider errors
pub mod error;
/// Single-call activity invoker
pub mod invoker;
/// Email and calendar provider traits
pub mod providers;
/// Activity catalogue and schemas
pub mod types;

// Re-export key components
pub use error::{ActivityError, FailureKind, ProviderError};
pub use invoker::{ActivityInvoker, ActivityResult};
pub use providers::{CalendarClient, EmailSender};
pub use types::{
    ActivityKind, ActivityRequest, CalendarEventInput, CreatedEvent, EmailCopy, EmailCopyInput,
    FollowUpInput, LeadQualification, ProviderFamily, QualifyLeadInput, ResponseCategory,
    ResponseClassification, ResponseInput, SendEmailInput, SentEmail, SocialPlatform, SocialPost,
    SocialPostInput, QUALIFICATION_THRESHOLD,
};
