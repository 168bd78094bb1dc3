use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use super::error::{ActivityError, FailureKind, ProviderError};
use super::providers::{CalendarClient, EmailSender};
use super::types::{
    ActivityKind, ActivityRequest, EmailCopy, EmailCopyInput, FollowUpInput, LeadQualification,
    QualifyLeadInput, ResponseCategory, ResponseClassification, ResponseInput, SocialPost,
    SocialPostInput, QUALIFICATION_THRESHOLD,
};
use crate::llm::{CompletionRequest, LlmClient, LlmConfig};
use crate::telemetry::add_metric;
use crate::workflow::run::AttemptOutcome;

/// Result of a single activity invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ActivityResult {
    /// The activity produced an output
    Success(serde_json::Value),
    /// The activity failed
    Failure(ActivityError),
    /// The activity did not finish in time
    Timeout(ActivityError),
}

impl ActivityResult {
    /// Check if the result is a success
    pub fn is_success(&self) -> bool {
        matches!(self, ActivityResult::Success(_))
    }

    /// Outcome to record in the audit trail
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            ActivityResult::Success(_) => AttemptOutcome::Success,
            ActivityResult::Failure(_) => AttemptOutcome::Failure,
            ActivityResult::Timeout(_) => AttemptOutcome::Timeout,
        }
    }

    /// Get the output if available
    pub fn output(&self) -> Option<&serde_json::Value> {
        match self {
            ActivityResult::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Get the error if the activity did not succeed
    pub fn error(&self) -> Option<&ActivityError> {
        match self {
            ActivityResult::Success(_) => None,
            ActivityResult::Failure(err) | ActivityResult::Timeout(err) => Some(err),
        }
    }
}

/// Executes single activity calls against the configured providers.
///
/// One call to [`ActivityInvoker::invoke`] performs at most one provider call and
/// never retries; retries are decided by the executor's retry policy.
#[derive(Debug, Clone)]
pub struct ActivityInvoker {
    /// LLM used by copy generation and lead qualification
    llm: Arc<dyn LlmClient>,

    /// Email delivery provider
    email: Arc<dyn EmailSender>,

    /// Calendar provider
    calendar: Arc<dyn CalendarClient>,

    /// Model settings applied to every completion request
    model: LlmConfig,
}

impl ActivityInvoker {
    /// Create an invoker over the given providers
    pub fn new(
        llm: Arc<dyn LlmClient>,
        email: Arc<dyn EmailSender>,
        calendar: Arc<dyn CalendarClient>,
    ) -> Self {
        Self {
            llm,
            email,
            calendar,
            model: LlmConfig::default(),
        }
    }

    /// Use specific model settings for LLM-backed activities
    pub fn with_model(mut self, model: LlmConfig) -> Self {
        self.model = model;
        self
    }

    /// Invoke `kind` once with `input`, giving up after `timeout`
    #[instrument(skip(self, input), fields(activity = %kind, timeout_ms = timeout.as_millis() as u64))]
    pub async fn invoke(
        &self,
        kind: ActivityKind,
        input: serde_json::Value,
        timeout: Duration,
    ) -> ActivityResult {
        if timeout.is_zero() {
            return ActivityResult::Failure(ActivityError::validation(format!(
                "timeout for {} must be greater than zero",
                kind
            )));
        }

        let request = match ActivityRequest::parse(kind, input) {
            Ok(request) => request,
            Err(err) => {
                warn!("Rejected {} input before dispatch: {}", kind, err.message);
                return ActivityResult::Failure(err);
            }
        };

        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, self.dispatch(request)).await {
            Ok(Ok(output)) => ActivityResult::Success(output),
            Ok(Err(err)) => ActivityResult::Failure(err),
            Err(_) => ActivityResult::Timeout(ActivityError::new(
                FailureKind::Timeout,
                format!("{} timed out after {:?}", kind, timeout),
            )),
        };

        let duration = start.elapsed();
        debug!("Activity {} finished with {:?} in {:?}", kind, result.outcome(), duration);
        add_metric(
            "activity_duration_ms",
            duration.as_millis() as f64,
            &[
                ("activity", kind.to_string()),
                ("outcome", format!("{:?}", result.outcome())),
            ],
        );

        result
    }

    async fn dispatch(&self, request: ActivityRequest) -> Result<serde_json::Value, ActivityError> {
        match request {
            ActivityRequest::GenerateEmailCopy(input) => {
                let completion = self.llm.complete(email_copy_prompt(&self.model, &input)).await?;
                encode(parse_email_copy(&completion.content)?)
            }
            ActivityRequest::GenerateFollowUp(input) => {
                let completion = self.llm.complete(follow_up_prompt(&self.model, &input)).await?;
                encode(parse_email_copy(&completion.content)?)
            }
            ActivityRequest::ClassifyResponse(input) => {
                let completion = self.llm.complete(classify_prompt(&self.model, &input)).await?;
                encode(parse_classification(&completion.content)?)
            }
            ActivityRequest::GenerateSocialPost(input) => {
                let completion = self.llm.complete(social_post_prompt(&self.model, &input)).await?;
                encode(parse_social_post(&input, &completion.content)?)
            }
            ActivityRequest::QualifyLead(input) => {
                let completion = self.llm.complete(qualify_lead_prompt(&self.model, &input)).await?;
                encode(parse_qualification(&completion.content)?)
            }
            ActivityRequest::SendEmail(input) => {
                let input = input.schedule(Utc::now())?;
                if let Some(send_at) = input.send_at {
                    debug!(to = %input.to, %send_at, "Scheduling email");
                }
                encode(self.email.send(&input).await?)
            }
            ActivityRequest::CreateCalendarEvent(input) => {
                encode(self.calendar.create_event(&input).await?)
            }
        }
    }
}

fn encode<T: Serialize>(value: T) -> Result<serde_json::Value, ActivityError> {
    serde_json::to_value(value)
        .map_err(|e| ActivityError::validation(format!("unencodable activity output: {}", e)))
}

fn email_copy_prompt(model: &LlmConfig, input: &EmailCopyInput) -> CompletionRequest {
    let mut user = format!(
        "Write a {} outreach email to {} at {}.",
        input.tone, input.recipient_name, input.company
    );
    if let Some(context) = &input.context {
        user.push_str(&format!("\nContext: {}", context));
    }
    model.request(
        "You write concise, personalised B2B sales emails. Reply with a first line \
         'Subject: <subject>', a blank line, then the email body.",
        user,
    )
}

fn follow_up_prompt(model: &LlmConfig, input: &FollowUpInput) -> CompletionRequest {
    let user = format!(
        "Write a short {} follow-up to {} at {}, who has not answered this email:\n{}",
        input.tone, input.recipient_name, input.company, input.previous_message
    );
    model.request(
        "You write brief, friendly follow-up sales emails that ask whether the prospect \
         would like to learn more. Reply with a first line 'Subject: <subject>', a blank \
         line, then the email body.",
        user,
    )
}

fn classify_prompt(model: &LlmConfig, input: &ResponseInput) -> CompletionRequest {
    model.request(
        "Classify the sales prospect's response as 'positive' (showing clear interest), \
         'neutral' (needs more nurturing) or 'negative' (not interested). Reply with the \
         category only.",
        input.response_text.clone(),
    )
}

fn social_post_prompt(model: &LlmConfig, input: &SocialPostInput) -> CompletionRequest {
    let mut user = format!(
        "Create an engaging {} post about {} with a {} tone.",
        input.platform, input.topic, input.tone
    );
    if let Some(audience) = &input.audience {
        user.push_str(&format!(" The audience is {}.", audience));
    }
    if !input.hashtags.is_empty() {
        user.push_str(&format!(" Include these hashtags: {}.", input.hashtags.join(" ")));
    }
    user.push_str(&format!(
        " Keep it under {} characters and end with a call-to-action.",
        input.platform.max_chars()
    ));
    model.request(
        "You manage a company's social media. Reply with the post text only.",
        user,
    )
}

fn qualify_lead_prompt(model: &LlmConfig, input: &QualifyLeadInput) -> CompletionRequest {
    let user = format!(
        "Lead: {}, {} at {}. Campaign industry: {}. Company size: {}. Target titles: {}.",
        input.name,
        input.title,
        input.company,
        input.industry,
        input.company_size.as_deref().unwrap_or("any"),
        if input.target_titles.is_empty() {
            "any".to_string()
        } else {
            input.target_titles.join(", ")
        }
    );
    model.request(
        "You qualify sales leads. Reply with JSON only: \
         {\"score\": <integer 0-100>, \"rationale\": \"<one sentence>\"}",
        user,
    )
}

fn parse_email_copy(text: &str) -> Result<EmailCopy, ProviderError> {
    let mut lines = text.lines();
    let subject = lines
        .by_ref()
        .find_map(|line| {
            let trimmed = line.trim();
            let lower = trimmed.to_ascii_lowercase();
            lower
                .starts_with("subject:")
                .then(|| trimmed["subject:".len()..].trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProviderError::InvalidResponse("completion has no subject line".into()))?;

    let body = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    if body.is_empty() {
        return Err(ProviderError::InvalidResponse("completion has no email body".into()));
    }

    Ok(EmailCopy { subject, body })
}

fn parse_social_post(input: &SocialPostInput, text: &str) -> Result<SocialPost, ProviderError> {
    let text = text.trim().trim_matches('"').trim().to_string();
    if text.is_empty() {
        return Err(ProviderError::InvalidResponse("empty post".into()));
    }
    let len = text.chars().count();
    if len > input.platform.max_chars() {
        return Err(ProviderError::InvalidResponse(format!(
            "{} post is {} characters, limit is {}",
            input.platform,
            len,
            input.platform.max_chars()
        )));
    }
    Ok(SocialPost {
        platform: input.platform,
        text,
    })
}

/// The category named first in the completion
fn parse_classification(text: &str) -> Result<ResponseClassification, ProviderError> {
    let lower = text.to_ascii_lowercase();
    ResponseCategory::ALL
        .into_iter()
        .filter_map(|category| lower.find(category.as_str()).map(|at| (at, category)))
        .min_by_key(|(at, _)| *at)
        .map(|(_, category)| ResponseClassification { category })
        .ok_or_else(|| {
            ProviderError::InvalidResponse(format!("no response category in '{}'", text.trim()))
        })
}

#[derive(Deserialize)]
struct RawQualification {
    score: f64,
    #[serde(default)]
    rationale: String,
}

fn parse_qualification(text: &str) -> Result<LeadQualification, ProviderError> {
    let json = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => return Err(ProviderError::InvalidResponse("no JSON object in completion".into())),
    };
    let raw: RawQualification = serde_json::from_str(json)
        .map_err(|e| ProviderError::InvalidResponse(format!("bad qualification JSON: {}", e)))?;
    if !(0.0..=100.0).contains(&raw.score) {
        return Err(ProviderError::InvalidResponse(format!(
            "score {} outside 0-100",
            raw.score
        )));
    }
    let score = raw.score.round() as u8;
    Ok(LeadQualification {
        score,
        qualified: score >= QUALIFICATION_THRESHOLD,
        rationale: raw.rationale,
    })
}
