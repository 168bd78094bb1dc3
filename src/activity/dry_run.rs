//! Deterministic in-process providers.
//!
//! Useful for rehearsing a campaign definition end to end without touching any
//! real provider: nothing leaves the process, every call is logged and recorded.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::error::ProviderError;
use super::providers::{CalendarClient, EmailSender};
use super::types::{CalendarEventInput, CreatedEvent, SendEmailInput, SentEmail};
use crate::llm::{Completion, CompletionRequest, LlmClient, MessageRole};

/// LLM stand-in that answers in the format each activity expects
#[derive(Debug)]
pub struct DryRunLlm {
    /// Score returned for lead qualification
    score: u8,

    /// Artificial latency before answering
    latency: Option<Duration>,

    /// Number of completions served
    calls: AtomicUsize,
}

impl Default for DryRunLlm {
    fn default() -> Self {
        Self {
            score: 75,
            latency: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl DryRunLlm {
    /// Return `score` from lead qualification
    pub fn with_score(mut self, score: u8) -> Self {
        self.score = score.min(100);
        self
    }

    /// Wait `latency` before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of completions served so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for DryRunLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let system = request
            .messages
            .iter()
            .find(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let user = request
            .messages
            .iter()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let brief: String = user.lines().next().unwrap_or_default().chars().take(120).collect();

        let content = if system.contains("qualify sales leads") {
            format!("{{\"score\": {}, \"rationale\": \"dry run\"}}", self.score)
        } else if system.contains("Classify") {
            classify_reply(user).to_string()
        } else if system.contains("sales emails") {
            format!("Subject: Dry run: {}\n\n{}\n\n(dry run body)", brief, user)
        } else {
            format!("Dry run post: {}", brief)
        };

        info!(model = %request.model, "Dry-run completion served");
        Ok(Completion {
            content,
            model: Some(request.model),
            total_tokens: None,
        })
    }
}

/// Keyword reading of a prospect's reply
fn classify_reply(reply: &str) -> &'static str {
    let reply = reply.to_lowercase();
    if ["not interested", "unsubscribe", "remove me", "no thanks"]
        .iter()
        .any(|k| reply.contains(k))
    {
        "negative"
    } else if ["interested", "yes", "let's", "sounds good", "book"]
        .iter()
        .any(|k| reply.contains(k))
    {
        "positive"
    } else {
        "neutral"
    }
}

/// Email sender that records messages instead of delivering them
#[derive(Debug, Default)]
pub struct DryRunEmail {
    /// Messages accepted so far
    sent: Mutex<Vec<SendEmailInput>>,
}

impl DryRunEmail {
    /// Messages accepted so far
    pub fn sent(&self) -> Vec<SendEmailInput> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl EmailSender for DryRunEmail {
    async fn send(&self, email: &SendEmailInput) -> Result<SentEmail, ProviderError> {
        info!(to = %email.to, subject = %email.subject, send_at = ?email.send_at, "Dry-run email accepted");
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(email.clone());
        Ok(SentEmail {
            message_id: format!("dry-run-{}", Uuid::new_v4()),
            accepted_at: Utc::now(),
            scheduled_for: email.send_at,
        })
    }
}

/// Calendar client that books nothing
#[derive(Debug, Default)]
pub struct DryRunCalendar {
    /// Events created so far
    events: Mutex<Vec<CalendarEventInput>>,
}

impl DryRunCalendar {
    /// Events created so far
    pub fn events(&self) -> Vec<CalendarEventInput> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CalendarClient for DryRunCalendar {
    async fn create_event(&self, event: &CalendarEventInput) -> Result<CreatedEvent, ProviderError> {
        info!(attendee = %event.attendee_email, start = %event.start, "Dry-run event created");
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(CreatedEvent {
            event_id: format!("dry-run-{}", Uuid::new_v4()),
            start: event.start,
            end: event.start + ChronoDuration::minutes(i64::from(event.duration_minutes)),
        })
    }
}
