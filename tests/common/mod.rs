#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

use campaign_orchestrator::activity::dry_run::{DryRunCalendar, DryRunEmail, DryRunLlm};
use campaign_orchestrator::activity::{
    ActivityInvoker, ActivityKind, EmailSender, ProviderError, SendEmailInput, SentEmail,
};
use campaign_orchestrator::llm::{Completion, CompletionRequest, LlmClient};
use campaign_orchestrator::store::{InMemoryStateStore, StateStore};
use campaign_orchestrator::workflow::{
    ExecutorConfig, InputMapping, RetryPolicy, Step, WorkflowDefinition, WorkflowExecutor,
};

/// LLM that fails with scripted errors first, can be held behind a gate, then
/// answers like the dry-run model
#[derive(Debug)]
pub struct ScriptedLlm {
    inner: DryRunLlm,
    failures: Mutex<VecDeque<ProviderError>>,
    gate: Option<Semaphore>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(inner: DryRunLlm) -> Self {
        Self {
            inner,
            failures: Mutex::new(VecDeque::new()),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(errors: Vec<ProviderError>) -> Self {
        let llm = Self::new(DryRunLlm::default());
        *llm.failures.lock().unwrap() = errors.into();
        llm
    }

    /// Every call waits for a permit from `open`
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(DryRunLlm::default())
        }
    }

    pub fn open(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(error) => Err(error),
            None => self.inner.complete(request).await,
        }
    }
}

/// Email sender that fails with scripted errors before delivering
#[derive(Debug, Default)]
pub struct ScriptedEmail {
    inner: DryRunEmail,
    failures: Mutex<VecDeque<ProviderError>>,
    always_fail: Option<ProviderError>,
    calls: AtomicUsize,
}

impl ScriptedEmail {
    pub fn failing(errors: Vec<ProviderError>) -> Self {
        Self {
            failures: Mutex::new(errors.into()),
            ..Self::default()
        }
    }

    pub fn always(error: ProviderError) -> Self {
        Self {
            always_fail: Some(error),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SendEmailInput> {
        self.inner.sent()
    }
}

#[async_trait]
impl EmailSender for ScriptedEmail {
    async fn send(&self, email: &SendEmailInput) -> Result<SentEmail, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.always_fail {
            return Err(error.clone());
        }
        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(error) => Err(error),
            None => self.inner.send(email).await,
        }
    }
}

pub struct Harness {
    pub executor: WorkflowExecutor,
    pub llm: Arc<ScriptedLlm>,
    pub email: Arc<ScriptedEmail>,
    pub calendar: Arc<DryRunCalendar>,
}

/// Small timeouts and millisecond backoff so scenarios finish quickly
pub fn fast_config() -> ExecutorConfig {
    let mut config = ExecutorConfig {
        lease_duration_ms: 2_000,
        llm_timeout_ms: 500,
        email_timeout_ms: 500,
        calendar_timeout_ms: 500,
        default_retry: RetryPolicy {
            max_attempts: 3,
            initial_interval_ms: 10,
            max_interval_ms: 50,
            jitter: 0.0,
        },
        ..ExecutorConfig::default()
    };
    config.retry_policies.insert(
        "slow".to_string(),
        RetryPolicy {
            max_attempts: 5,
            initial_interval_ms: 10_000,
            max_interval_ms: 60_000,
            jitter: 0.0,
        },
    );
    config
}

pub fn harness(llm: ScriptedLlm, email: ScriptedEmail) -> Harness {
    harness_with(fast_config(), Arc::new(InMemoryStateStore::new()), llm, email)
}

pub fn harness_with(
    config: ExecutorConfig,
    store: Arc<dyn StateStore>,
    llm: ScriptedLlm,
    email: ScriptedEmail,
) -> Harness {
    let llm = Arc::new(llm);
    let email = Arc::new(email);
    let calendar = Arc::new(DryRunCalendar::default());
    let invoker = ActivityInvoker::new(llm.clone(), email.clone(), calendar.clone());
    let executor = WorkflowExecutor::new(config, store, invoker).unwrap();
    Harness {
        executor,
        llm,
        email,
        calendar,
    }
}

/// Email copy generation followed by delivery
pub fn two_step() -> WorkflowDefinition {
    WorkflowDefinition::new("two_step")
        .step(
            Step::new("copy", ActivityKind::GenerateEmailCopy).input(InputMapping::Template {
                template: json!({
                    "recipient_name": "{{input.name}}",
                    "company": "{{input.company}}"
                }),
            }),
        )
        .step(
            Step::new("send", ActivityKind::SendEmail).input(InputMapping::Template {
                template: json!({
                    "to": "{{input.email}}",
                    "subject": "{{steps.copy.subject}}",
                    "body": "{{steps.copy.body}}"
                }),
            }),
        )
}

pub fn lead() -> serde_json::Value {
    json!({"name": "Ana Silva", "company": "Acme", "email": "ana@acme.example"})
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
