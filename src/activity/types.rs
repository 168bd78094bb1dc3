use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

use super::error::ActivityError;

/// Score at or above which a lead counts as qualified
pub const QUALIFICATION_THRESHOLD: u8 = 60;

/// The closed set of activities a workflow step can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Draft a personalised outreach email with the LLM
    GenerateEmailCopy,
    /// Draft a follow-up to an earlier outreach email with the LLM
    GenerateFollowUp,
    /// Sort a prospect's reply into positive, neutral or negative with the LLM
    ClassifyResponse,
    /// Draft a social media post with the LLM
    GenerateSocialPost,
    /// Score a lead against the campaign's targeting with the LLM
    QualifyLead,
    /// Deliver an email through the email provider
    SendEmail,
    /// Book a meeting through the calendar provider
    CreateCalendarEvent,
}

/// External collaborator an activity talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// Language model completions
    Llm,
    /// Email delivery
    Email,
    /// Calendar scheduling
    Calendar,
}

impl ActivityKind {
    /// All activity kinds
    pub const ALL: [ActivityKind; 7] = [
        ActivityKind::GenerateEmailCopy,
        ActivityKind::GenerateFollowUp,
        ActivityKind::ClassifyResponse,
        ActivityKind::GenerateSocialPost,
        ActivityKind::QualifyLead,
        ActivityKind::SendEmail,
        ActivityKind::CreateCalendarEvent,
    ];

    /// Provider the activity is dispatched to
    pub fn provider(self) -> ProviderFamily {
        match self {
            ActivityKind::GenerateEmailCopy
            | ActivityKind::GenerateFollowUp
            | ActivityKind::ClassifyResponse
            | ActivityKind::GenerateSocialPost
            | ActivityKind::QualifyLead => ProviderFamily::Llm,
            ActivityKind::SendEmail => ProviderFamily::Email,
            ActivityKind::CreateCalendarEvent => ProviderFamily::Calendar,
        }
    }

    /// Stable name, as used in definitions
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::GenerateEmailCopy => "generate_email_copy",
            ActivityKind::GenerateFollowUp => "generate_follow_up",
            ActivityKind::ClassifyResponse => "classify_response",
            ActivityKind::GenerateSocialPost => "generate_social_post",
            ActivityKind::QualifyLead => "qualify_lead",
            ActivityKind::SendEmail => "send_email",
            ActivityKind::CreateCalendarEvent => "create_calendar_event",
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_tone() -> String {
    "professional".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Input of `generate_email_copy`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EmailCopyInput {
    /// Name used in the greeting
    #[validate(length(min = 1, max = 200))]
    pub recipient_name: String,

    /// Recipient's company
    #[validate(length(min = 1, max = 200))]
    pub company: String,

    /// Extra context for the model (pain points, previous touches)
    #[serde(default)]
    #[validate(length(max = 4000))]
    pub context: Option<String>,

    /// Desired tone of voice
    #[serde(default = "default_tone")]
    #[validate(length(min = 1, max = 50))]
    pub tone: String,
}

/// Output of `generate_email_copy`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailCopy {
    /// Subject line
    pub subject: String,
    /// Email body
    pub body: String,
}

/// Input of `generate_follow_up`; the output is an [`EmailCopy`]
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FollowUpInput {
    /// Name used in the greeting
    #[validate(length(min = 1, max = 200))]
    pub recipient_name: String,

    /// Recipient's company
    #[validate(length(min = 1, max = 200))]
    pub company: String,

    /// The message being followed up on
    #[validate(length(min = 1, max = 4000))]
    pub previous_message: String,

    /// Desired tone of voice
    #[serde(default = "default_tone")]
    #[validate(length(min = 1, max = 50))]
    pub tone: String,
}

/// Input of `classify_response`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ResponseInput {
    /// The prospect's reply
    #[validate(length(min = 1, max = 10000))]
    pub response_text: String,
}

/// How interested a prospect sounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseCategory {
    /// Shows clear interest
    Positive,
    /// Needs more nurturing
    Neutral,
    /// Not interested
    Negative,
}

impl ResponseCategory {
    /// All categories
    pub const ALL: [ResponseCategory; 3] = [
        ResponseCategory::Positive,
        ResponseCategory::Neutral,
        ResponseCategory::Negative,
    ];

    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseCategory::Positive => "positive",
            ResponseCategory::Neutral => "neutral",
            ResponseCategory::Negative => "negative",
        }
    }
}

/// Output of `classify_response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseClassification {
    /// Category of the reply
    pub category: ResponseCategory,
}

/// Social network a post targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocialPlatform {
    /// Twitter / X
    Twitter,
    /// LinkedIn
    Linkedin,
    /// Instagram
    Instagram,
}

impl SocialPlatform {
    /// Maximum post length accepted by the platform
    pub fn max_chars(self) -> usize {
        match self {
            SocialPlatform::Twitter => 280,
            SocialPlatform::Linkedin => 3000,
            SocialPlatform::Instagram => 2200,
        }
    }
}

impl fmt::Display for SocialPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocialPlatform::Twitter => "twitter",
            SocialPlatform::Linkedin => "linkedin",
            SocialPlatform::Instagram => "instagram",
        };
        f.write_str(name)
    }
}

/// Input of `generate_social_post`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SocialPostInput {
    /// Target platform
    pub platform: SocialPlatform,

    /// What the post is about
    #[validate(length(min = 1, max = 500))]
    pub topic: String,

    /// Intended audience
    #[serde(default)]
    pub audience: Option<String>,

    /// Desired tone of voice
    #[serde(default = "default_tone")]
    pub tone: String,

    /// Hashtags the post must include
    #[serde(default)]
    pub hashtags: Vec<String>,
}

/// Output of `generate_social_post`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocialPost {
    /// Platform the text was written for
    pub platform: SocialPlatform,
    /// Post text
    pub text: String,
}

/// Input of `qualify_lead`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QualifyLeadInput {
    /// Lead's full name
    #[validate(length(min = 1))]
    pub name: String,

    /// Lead's company
    #[validate(length(min = 1))]
    pub company: String,

    /// Lead's job title
    #[validate(length(min = 1))]
    pub title: String,

    /// Industry the campaign targets
    #[validate(length(min = 1))]
    pub industry: String,

    /// Company size range, e.g. "11-50"
    #[serde(default)]
    pub company_size: Option<String>,

    /// Job titles the campaign is after
    #[serde(default)]
    pub target_titles: Vec<String>,
}

/// Output of `qualify_lead`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadQualification {
    /// Fit score between 0 and 100
    pub score: u8,
    /// Whether the score reaches [`QUALIFICATION_THRESHOLD`]
    pub qualified: bool,
    /// Model's short justification
    pub rationale: String,
}

/// Input of `send_email`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SendEmailInput {
    /// Recipient address
    #[validate(email)]
    pub to: String,

    /// Subject line
    #[validate(length(min = 1, max = 998))]
    pub subject: String,

    /// HTML or text body
    #[validate(length(min = 1))]
    pub body: String,

    /// Enable open and click tracking
    #[serde(default = "default_true")]
    pub track: bool,

    /// Deliver later instead of immediately
    #[serde(default)]
    pub send_at: Option<DateTime<Utc>>,

    /// Deliver this many days after the attempt; exclusive with `send_at`
    #[serde(default)]
    #[validate(range(min = 1, max = 30))]
    pub delay_days: Option<u32>,
}

impl SendEmailInput {
    /// Turn `delay_days` into an absolute `send_at` counted from `now`
    pub fn schedule(mut self, now: DateTime<Utc>) -> Result<Self, ActivityError> {
        match (self.send_at, self.delay_days.take()) {
            (Some(_), Some(_)) => Err(ActivityError::validation(
                "invalid send_email input: send_at and delay_days are exclusive",
            )),
            (None, Some(days)) => {
                self.send_at = Some(now + chrono::Duration::days(i64::from(days)));
                Ok(self)
            }
            _ => Ok(self),
        }
    }
}

/// Output of `send_email`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentEmail {
    /// Provider's message id
    pub message_id: String,
    /// Time the provider accepted the message
    pub accepted_at: DateTime<Utc>,
    /// Delivery time for scheduled messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Input of `create_calendar_event`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CalendarEventInput {
    /// Meeting title
    #[validate(length(min = 1, max = 300))]
    pub title: String,

    /// Invitee address
    #[validate(email)]
    pub attendee_email: String,

    /// Organizer address
    #[validate(email)]
    pub organizer_email: String,

    /// Meeting start
    pub start: DateTime<Utc>,

    /// Meeting length in minutes
    #[validate(range(min = 1, max = 480))]
    pub duration_minutes: u32,

    /// Timezone shown to attendees
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

/// Output of `create_calendar_event`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedEvent {
    /// Provider's event id
    pub event_id: String,
    /// Meeting start
    pub start: DateTime<Utc>,
    /// Meeting end
    pub end: DateTime<Utc>,
}

/// A validated activity call, ready for dispatch
#[derive(Debug, Clone)]
pub enum ActivityRequest {
    /// `generate_email_copy`
    GenerateEmailCopy(EmailCopyInput),
    /// `generate_follow_up`
    GenerateFollowUp(FollowUpInput),
    /// `classify_response`
    ClassifyResponse(ResponseInput),
    /// `generate_social_post`
    GenerateSocialPost(SocialPostInput),
    /// `qualify_lead`
    QualifyLead(QualifyLeadInput),
    /// `send_email`
    SendEmail(SendEmailInput),
    /// `create_calendar_event`
    CreateCalendarEvent(CalendarEventInput),
}

impl ActivityRequest {
    /// Check `input` against the declared schema of `kind`
    pub fn parse(kind: ActivityKind, input: serde_json::Value) -> Result<Self, ActivityError> {
        Ok(match kind {
            ActivityKind::GenerateEmailCopy => Self::GenerateEmailCopy(decode(kind, input)?),
            ActivityKind::GenerateFollowUp => Self::GenerateFollowUp(decode(kind, input)?),
            ActivityKind::ClassifyResponse => Self::ClassifyResponse(decode(kind, input)?),
            ActivityKind::GenerateSocialPost => Self::GenerateSocialPost(decode(kind, input)?),
            ActivityKind::QualifyLead => Self::QualifyLead(decode(kind, input)?),
            ActivityKind::SendEmail => Self::SendEmail(decode(kind, input)?),
            ActivityKind::CreateCalendarEvent => Self::CreateCalendarEvent(decode(kind, input)?),
        })
    }
}

fn decode<T>(kind: ActivityKind, input: serde_json::Value) -> Result<T, ActivityError>
where
    T: DeserializeOwned + Validate,
{
    let value: T = serde_json::from_value(input)
        .map_err(|e| ActivityError::validation(format!("invalid {} input: {}", kind, e)))?;
    value
        .validate()
        .map_err(|e| ActivityError::validation(format!("invalid {} input: {}", kind, e)))?;
    Ok(value)
}
