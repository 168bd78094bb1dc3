//! Call/response seams for the email and calendar providers.
//!
//! Request shaping, authentication and API keys live in the implementations;
//! the orchestrator only sees these traits.

use async_trait::async_trait;

use super::error::ProviderError;
use super::types::{CalendarEventInput, CreatedEvent, SendEmailInput, SentEmail};

/// Email delivery provider
#[async_trait]
pub trait EmailSender: Send + Sync + std::fmt::Debug + 'static {
    /// Hand one message to the provider
    async fn send(&self, email: &SendEmailInput) -> Result<SentEmail, ProviderError>;
}

/// Calendar / scheduling provider
#[async_trait]
pub trait CalendarClient: Send + Sync + std::fmt::Debug + 'static {
    /// Create a calendar event and invite the attendee
    async fn create_event(&self, event: &CalendarEventInput) -> Result<CreatedEvent, ProviderError>;
}
