use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::activity::{ActivityError, FailureKind};

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval_ms() -> u64 {
    1_000
}

fn default_max_interval_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

/// Exponential backoff policy for failed activities.
///
/// The policy holds no state: every decision is a function of the attempt number,
/// the failure kind and the random source handed in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Upper bound for any delay, in milliseconds
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Relative jitter applied to each delay, between 0.0 and 0.2
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Largest jitter the policy accepts
    pub const MAX_JITTER: f64 = 0.2;

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Check that the policy is usable
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.initial_interval_ms == 0 {
            return Err("initial_interval_ms must be greater than zero".to_string());
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err("max_interval_ms must not be below initial_interval_ms".to_string());
        }
        if !(0.0..=Self::MAX_JITTER).contains(&self.jitter) {
            return Err(format!("jitter must be between 0.0 and {}", Self::MAX_JITTER));
        }
        Ok(())
    }

    /// Delay before the retry that follows failed attempt `attempt`, without jitter
    /// or clamping: `initial_interval * 2^(attempt - 1)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(62) as i32;
        let millis = self.initial_interval_ms as f64 * 2f64.powi(exponent);
        Duration::from_millis(millis.min(u64::MAX as f64) as u64)
    }

    /// Delay before retrying after attempt `attempt` failed with `kind`, or `None`
    /// when no further attempt is allowed.
    pub fn next_delay(&self, attempt: u32, kind: FailureKind) -> Option<Duration> {
        self.next_delay_with(&mut rand::thread_rng(), attempt, kind)
    }

    /// Delay before retrying after attempt `attempt` failed with `error`.
    ///
    /// Like [`RetryPolicy::next_delay`], but a wait requested by the provider is
    /// honoured as a lower bound, even above `max_interval_ms`.
    pub fn delay_after(&self, attempt: u32, error: &ActivityError) -> Option<Duration> {
        let delay = self.next_delay(attempt, error.kind)?;
        Some(error.retry_after().map_or(delay, |floor| delay.max(floor)))
    }

    /// [`RetryPolicy::next_delay`] drawing jitter from `rng`
    pub fn next_delay_with<R: Rng>(
        &self,
        rng: &mut R,
        attempt: u32,
        kind: FailureKind,
    ) -> Option<Duration> {
        if !kind.is_retryable() || attempt == 0 || attempt >= self.max_attempts {
            return None;
        }

        let jitter = self.jitter.clamp(0.0, Self::MAX_JITTER);
        let factor = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let jittered = self.base_delay(attempt).as_millis() as f64 * factor;
        let clamped = jittered.min(self.max_interval_ms as f64).max(0.0);

        Some(Duration::from_millis(clamped.round() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_interval_ms: 1_000,
            max_interval_ms: 60_000,
            jitter: 0.2,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval_ms, 1_000);
        assert_eq!(policy.max_interval_ms, 60_000);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_base_delay_doubles() {
        let policy = policy(10);
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(5), Duration::from_secs(16));
    }

    #[test]
    fn test_attempt_five_within_jitter_band() {
        let policy = policy(10);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let delay = policy
                .next_delay_with(&mut rng, 5, FailureKind::TransientProvider)
                .unwrap();
            assert!(delay >= Duration::from_millis(12_800), "{:?}", delay);
            assert!(delay <= Duration::from_millis(19_200), "{:?}", delay);
        }
    }

    #[test]
    fn test_delay_clamped_to_max() {
        let policy = policy(50);
        let delay = policy.next_delay(20, FailureKind::Timeout).unwrap();
        assert_eq!(delay, Duration::from_secs(60));
    }

    #[test]
    fn test_non_retryable_kinds_stop() {
        let policy = policy(5);
        assert!(policy.next_delay(1, FailureKind::PermanentProvider).is_none());
        assert!(policy.next_delay(1, FailureKind::Validation).is_none());
        assert!(policy.next_delay(1, FailureKind::Definition).is_none());
        assert!(policy.next_delay(1, FailureKind::Timeout).is_some());
    }

    #[test]
    fn test_budget_exhaustion() {
        let policy = policy(3);
        assert!(policy.next_delay(1, FailureKind::TransientProvider).is_some());
        assert!(policy.next_delay(2, FailureKind::TransientProvider).is_some());
        assert!(policy.next_delay(3, FailureKind::TransientProvider).is_none());
        assert!(RetryPolicy::no_retry()
            .next_delay(1, FailureKind::TransientProvider)
            .is_none());
    }

    #[test]
    fn test_provider_retry_after_is_a_floor() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..policy(3)
        };
        let mut error = ActivityError::new(FailureKind::TransientProvider, "Rate limited");
        assert_eq!(policy.delay_after(1, &error), Some(Duration::from_secs(1)));

        error.retry_after_ms = Some(90_000);
        assert_eq!(policy.delay_after(1, &error), Some(Duration::from_secs(90)));
        error.retry_after_ms = Some(10);
        assert_eq!(policy.delay_after(2, &error), Some(Duration::from_secs(2)));

        // A requested wait does not extend the attempt budget
        error.retry_after_ms = Some(5_000);
        assert!(policy.delay_after(3, &error).is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut policy = RetryPolicy::default();
        policy.jitter = 0.5;
        assert!(policy.validate().is_err());

        let mut policy = RetryPolicy::default();
        policy.max_attempts = 0;
        assert!(policy.validate().is_err());

        let mut policy = RetryPolicy::default();
        policy.max_interval_ms = 10;
        assert!(policy.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_no_delay_past_budget(max_attempts in 1u32..20, extra in 0u32..1000) {
            let policy = policy(max_attempts);
            let attempt = max_attempts + extra;
            prop_assert!(policy.next_delay(attempt, FailureKind::TransientProvider).is_none());
        }

        #[test]
        fn prop_delay_never_exceeds_max(attempt in 1u32..40, seed in any::<u64>()) {
            let policy = policy(100);
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = policy.next_delay_with(&mut rng, attempt, FailureKind::Timeout).unwrap();
            prop_assert!(delay <= Duration::from_millis(policy.max_interval_ms));
        }

        #[test]
        fn prop_delay_within_jitter_of_base(attempt in 1u32..6, seed in any::<u64>()) {
            let policy = policy(100);
            let mut rng = StdRng::seed_from_u64(seed);
            let delay = policy
                .next_delay_with(&mut rng, attempt, FailureKind::TransientProvider)
                .unwrap()
                .as_millis() as f64;
            let base = policy.base_delay(attempt).as_millis() as f64;
            prop_assert!(delay >= base * 0.8 - 1.0);
            prop_assert!(delay <= base * 1.2 + 1.0);
        }
    }
}
