use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of an activity failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad input or definition; never retried
    Validation,
    /// Rate limiting, network trouble, provider hiccups; retryable
    TransientProvider,
    /// Auth failure, exhausted quota, rejected request; not retried
    PermanentProvider,
    /// The call did not finish in time; retryable while attempts remain
    Timeout,
    /// Invalid branch target or similar; fails the run immediately
    Definition,
}

impl FailureKind {
    /// Whether the retry policy may schedule another attempt for this kind
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::TransientProvider | FailureKind::Timeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Validation => "validation",
            FailureKind::TransientProvider => "transient_provider",
            FailureKind::PermanentProvider => "permanent_provider",
            FailureKind::Timeout => "timeout",
            FailureKind::Definition => "definition",
        };
        f.write_str(name)
    }
}

/// Error detail recorded for a failed attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityError {
    /// Failure classification
    pub kind: FailureKind,

    /// Human readable message
    pub message: String,

    /// Whether another attempt may succeed
    pub retryable: bool,

    /// Minimum wait before the next attempt requested by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ActivityError {
    /// Create an error whose retryability follows from its kind
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_retryable(),
            retry_after_ms: None,
        }
    }

    /// Minimum wait before the next attempt, if the provider asked for one
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }

    /// Shorthand for a validation failure
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    /// Shorthand for a definition failure
    pub fn definition(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Definition, message)
    }
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Errors reported by provider integrations (LLM, email, calendar)
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The provider throttled the request
    #[error("Rate limited")]
    RateLimited {
        /// Delay suggested by the provider, if any
        retry_after: Option<Duration>,
    },

    /// Connection reset, DNS failure and similar
    #[error("Network error: {0}")]
    Network(String),

    /// The provider answered with a server-side error
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// The provider answered but the payload could not be used
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    /// Credentials were missing or refused
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The account ran out of quota
    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    /// The provider refused the request as malformed
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Failure kind used for the attempt record
    pub fn kind(&self) -> FailureKind {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Network(_)
            | ProviderError::Unavailable(_)
            | ProviderError::InvalidResponse(_) => FailureKind::TransientProvider,
            ProviderError::Auth(_)
            | ProviderError::QuotaExhausted(_)
            | ProviderError::Rejected(_) => FailureKind::PermanentProvider,
        }
    }

    /// Whether retrying the call may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<ProviderError> for ActivityError {
    fn from(err: ProviderError) -> Self {
        let retry_after_ms = match &err {
            ProviderError::RateLimited { retry_after } => {
                retry_after.map(|d| d.as_millis().min(u64::MAX as u128) as u64)
            }
            _ => None,
        };
        ActivityError {
            retry_after_ms,
            ..ActivityError::new(err.kind(), err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(ProviderError::Unavailable("503".into()).is_retryable());
        assert!(!ProviderError::Auth("bad key".into()).is_retryable());
        assert!(!ProviderError::QuotaExhausted("daily".into()).is_retryable());
        assert!(!ProviderError::Rejected("bad address".into()).is_retryable());

        let err: ActivityError = ProviderError::Auth("bad key".into()).into();
        assert_eq!(err.kind, FailureKind::PermanentProvider);
        assert!(!err.retryable);
        assert!(err.message.contains("bad key"));
    }

    #[test]
    fn test_rate_limit_keeps_retry_after() {
        let err: ActivityError = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        }
        .into();
        assert_eq!(err.kind, FailureKind::TransientProvider);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));

        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["retry_after_ms"], 2000);
        let err: ActivityError = ProviderError::Network("reset".into()).into();
        assert!(serde_json::to_value(&err).unwrap().get("retry_after_ms").is_none());
    }

    #[test]
    fn test_failure_kind_retryable() {
        assert!(FailureKind::Timeout.is_retryable());
        assert!(!FailureKind::Validation.is_retryable());
        assert!(!FailureKind::Definition.is_retryable());
    }
}
