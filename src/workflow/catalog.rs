//! Built-in campaign workflows.
//!
//! `outreach_campaign` expects:
//!
//! ```json
//! {
//!   "lead": {"name": "...", "company": "...", "title": "...", "email": "..."},
//!   "campaign": {"industry": "...", "target_titles": ["..."], "pitch": "..."},
//!   "sender": {"email": "..."},
//!   "meeting": {"title": "...", "start": "2026-11-02T15:00:00Z", "duration_minutes": 30},
//!   "reply": "..."
//! }
//! ```
//!
//! Leads that do not qualify end the run after the first step. When the lead already
//! answered (`reply`), the answer is classified and a positive one books the
//! `meeting`, if given. Without a reply a follow-up email is written and scheduled
//! [`FOLLOW_UP_DELAY_DAYS`] days out.
//!
//! `social_campaign` expects `{"topic": "...", "platforms": ["twitter", "linkedin"]}`
//! and produces one post per platform.

use serde_json::json;

use super::definition::{Step, Transition, WorkflowDefinition};
use super::mapping::{BranchPredicate, InputMapping};
use crate::activity::ActivityKind;

/// Name of the lead outreach workflow
pub const OUTREACH_CAMPAIGN: &str = "outreach_campaign";

/// Days between the first email and the scheduled follow-up
pub const FOLLOW_UP_DELAY_DAYS: u32 = 3;

/// Name of the social posting workflow
pub const SOCIAL_CAMPAIGN: &str = "social_campaign";

/// All built-in definitions
pub fn builtin_definitions() -> Vec<WorkflowDefinition> {
    vec![outreach_campaign(), social_campaign()]
}

/// Qualify a lead, write and send a personalised email, then either act on the
/// lead's reply or schedule a follow-up
pub fn outreach_campaign() -> WorkflowDefinition {
    WorkflowDefinition::new(OUTREACH_CAMPAIGN)
        .with_description(
            "Qualify a lead, send personalised outreach, then book a meeting or follow up",
        )
        .step(
            Step::new("qualify", ActivityKind::QualifyLead)
                .input(InputMapping::Template {
                    template: json!({
                        "name": "{{input.lead.name}}",
                        "company": "{{input.lead.company}}",
                        "title": "{{input.lead.title}}",
                        "industry": "{{input.campaign.industry}}",
                        "target_titles": "{{input.campaign.target_titles}}"
                    }),
                })
                .then(Transition::Branch {
                    when: BranchPredicate::Truthy {
                        path: "steps.qualify.qualified".to_string(),
                    },
                    then: "copy".to_string(),
                    otherwise: None,
                }),
        )
        .step(
            Step::new("copy", ActivityKind::GenerateEmailCopy).input(InputMapping::Template {
                template: json!({
                    "recipient_name": "{{input.lead.name}}",
                    "company": "{{input.lead.company}}",
                    "context": "{{input.lead.title}} in {{input.campaign.industry}}. {{input.campaign.pitch}}"
                }),
            }),
        )
        .step(
            Step::new("send", ActivityKind::SendEmail)
                .input(InputMapping::Template {
                    template: json!({
                        "to": "{{input.lead.email}}",
                        "subject": "{{steps.copy.subject}}",
                        "body": "{{steps.copy.body}}"
                    }),
                })
                .then(Transition::Branch {
                    when: BranchPredicate::Exists {
                        path: "input.reply".to_string(),
                    },
                    then: "classify".to_string(),
                    otherwise: Some("follow_up".to_string()),
                }),
        )
        .step(
            Step::new("classify", ActivityKind::ClassifyResponse)
                .input(InputMapping::Template {
                    template: json!({"response_text": "{{input.reply}}"}),
                })
                .then(Transition::Branch {
                    when: BranchPredicate::All {
                        predicates: vec![
                            BranchPredicate::Equals {
                                path: "steps.classify.category".to_string(),
                                value: json!("positive"),
                            },
                            BranchPredicate::Exists {
                                path: "input.meeting".to_string(),
                            },
                        ],
                    },
                    then: "book".to_string(),
                    otherwise: None,
                }),
        )
        .step(
            Step::new("book", ActivityKind::CreateCalendarEvent)
                .input(InputMapping::Template {
                    template: json!({
                        "title": "{{input.meeting.title}}",
                        "attendee_email": "{{input.lead.email}}",
                        "organizer_email": "{{input.sender.email}}",
                        "start": "{{input.meeting.start}}",
                        "duration_minutes": "{{input.meeting.duration_minutes}}"
                    }),
                })
                .then(Transition::End),
        )
        .step(
            Step::new("follow_up", ActivityKind::GenerateFollowUp).input(InputMapping::Template {
                template: json!({
                    "recipient_name": "{{input.lead.name}}",
                    "company": "{{input.lead.company}}",
                    "previous_message": "{{steps.copy.body}}"
                }),
            }),
        )
        .step(
            Step::new("send_follow_up", ActivityKind::SendEmail).input(InputMapping::Template {
                template: json!({
                    "to": "{{input.lead.email}}",
                    "subject": "{{steps.follow_up.subject}}",
                    "body": "{{steps.follow_up.body}}",
                    "delay_days": FOLLOW_UP_DELAY_DAYS
                }),
            }),
        )
}

/// Generate one post per requested platform
pub fn social_campaign() -> WorkflowDefinition {
    WorkflowDefinition::new(SOCIAL_CAMPAIGN)
        .with_description("Generate a post for every requested social platform")
        .step(
            Step::new("posts", ActivityKind::GenerateSocialPost)
                .fan_out("input.platforms")
                .input(InputMapping::Template {
                    template: json!({
                        "platform": "{{item}}",
                        "topic": "{{input.topic}}"
                    }),
                }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::registry::DefinitionRegistry;

    #[test]
    fn test_builtins_register() {
        let registry = DefinitionRegistry::new();
        for definition in builtin_definitions() {
            registry.register(definition).unwrap();
        }
        assert_eq!(
            registry.names(),
            vec![OUTREACH_CAMPAIGN.to_string(), SOCIAL_CAMPAIGN.to_string()]
        );
    }

    #[test]
    fn test_outreach_shape() {
        let definition = outreach_campaign();
        let ids: Vec<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["qualify", "copy", "send", "classify", "book", "follow_up", "send_follow_up"]
        );
        assert_eq!(definition.steps[0].next.targets(), vec!["copy"]);
        assert_eq!(definition.steps[2].next.targets(), vec!["classify", "follow_up"]);
        assert!(matches!(definition.steps[4].next, Transition::End));
        assert!(social_campaign().steps[0].fan_out.is_some());
    }
}
