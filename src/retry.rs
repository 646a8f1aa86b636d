//! Retry policies with linear or exponential backoff
//!
//! A unit that reports a transient failure is attempted again after a
//! backoff delay measured from the end of the failed attempt. The delay
//! grows linearly (`base * n`) or exponentially (`base * 2^(n-1)`) with the
//! number `n` of attempts made so far, is never shorter than the configured
//! floor and never longer than the configured ceiling.
//!
//! # Example
//!
//! ```
//! use chainflow::retry::{BackoffPolicy, RetryState};
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::linear(Duration::from_secs(10)).with_max_attempts(3);
//! let mut state = RetryState::new();
//!
//! state.record_attempt();
//! assert!(!state.is_exhausted(&policy));
//! let delay = state.next_delay(&policy, Duration::from_secs(10), Duration::from_secs(3600));
//! assert_eq!(delay, Duration::from_secs(10));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Lowest backoff base accepted by default
pub const MIN_BACKOFF: Duration = Duration::from_millis(10_000);
/// Highest delay between two attempts by default (5 hours)
pub const MAX_BACKOFF: Duration = Duration::from_millis(18_000_000);
/// Base delay used when a request sets no policy
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(30_000);

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Linear,
    #[default]
    Exponential,
}

/// Retry/backoff policy for one work unit
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffPolicy {
    #[serde(default)]
    pub kind: BackoffKind,
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Total attempts allowed, including the first. `None` retries until cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    pub fn new(kind: BackoffKind, base_delay: Duration) -> Self {
        Self {
            kind,
            base_delay,
            max_attempts: None,
        }
    }

    pub fn linear(base_delay: Duration) -> Self {
        Self::new(BackoffKind::Linear, base_delay)
    }

    pub fn exponential(base_delay: Duration) -> Self {
        Self::new(BackoffKind::Exponential, base_delay)
    }

    /// Cap the total number of attempts (including the first)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before the attempt following the `attempt`-th one.
    ///
    /// `attempt` is 1 for the first attempt. The base is clamped up to
    /// `floor`, and the result lies within `floor..=ceiling`.
    pub fn delay_for(&self, attempt: u32, floor: Duration, ceiling: Duration) -> Duration {
        let n = attempt.max(1);
        let base = self.base_delay.max(floor);
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);

        let raw_ms = match self.kind {
            BackoffKind::Linear => base_ms.saturating_mul(u64::from(n)),
            BackoffKind::Exponential => {
                let factor = 2u64.checked_pow(n - 1).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor)
            }
        };

        let delay = Duration::from_millis(raw_ms).min(ceiling).max(floor);

        debug!(
            "Calculated {:?} backoff delay: {}ms (attempt {})",
            self.kind,
            delay.as_millis(),
            attempt
        );

        delay
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_BACKOFF)
    }
}

/// Attempt bookkeeping for a single unit
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts started so far
    pub attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self { attempts: 0 }
    }

    /// Record that another attempt has started
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Whether the policy forbids another attempt
    pub fn is_exhausted(&self, policy: &BackoffPolicy) -> bool {
        match policy.max_attempts {
            Some(max) => {
                let exhausted = self.attempts >= max;
                if exhausted {
                    warn!(
                        "Retry budget exhausted after {} of {} attempts",
                        self.attempts, max
                    );
                }
                exhausted
            }
            None => false,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&self, policy: &BackoffPolicy, floor: Duration, ceiling: Duration) -> Duration {
        policy.delay_for(self.attempts, floor, ceiling)
    }

    /// Wall-clock time of the next attempt if scheduled now
    pub fn next_attempt_at(&self, delay: Duration) -> chrono::DateTime<chrono::Utc> {
        let now = chrono::Utc::now();
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now)
    }
}

/// Serialize a `Duration` as whole milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOOR: Duration = MIN_BACKOFF;
    const CEILING: Duration = MAX_BACKOFF;

    #[test]
    fn test_policy_constructors() {
        let policy = BackoffPolicy::linear(Duration::from_secs(10)).with_max_attempts(5);
        assert_eq!(policy.kind, BackoffKind::Linear);
        assert_eq!(policy.base_delay, Duration::from_secs(10));
        assert_eq!(policy.max_attempts, Some(5));

        let policy = BackoffPolicy::default();
        assert_eq!(policy.kind, BackoffKind::Exponential);
        assert_eq!(policy.base_delay, DEFAULT_BACKOFF);
        assert_eq!(policy.max_attempts, None);
    }

    #[test]
    fn test_linear_delay_grows_by_base() {
        let policy = BackoffPolicy::linear(Duration::from_secs(10));

        assert_eq!(policy.delay_for(1, FLOOR, CEILING), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2, FLOOR, CEILING), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3, FLOOR, CEILING), Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_delay_doubles() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(10));

        assert_eq!(policy.delay_for(1, FLOOR, CEILING), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2, FLOOR, CEILING), Duration::from_secs(20));
        assert_eq!(policy.delay_for(3, FLOOR, CEILING), Duration::from_secs(40));
        assert_eq!(policy.delay_for(4, FLOOR, CEILING), Duration::from_secs(80));
    }

    #[test]
    fn test_base_clamped_up_to_floor() {
        let policy = BackoffPolicy::linear(Duration::from_millis(500));

        // 500ms is below the 10s floor, so the base becomes 10s
        assert_eq!(policy.delay_for(1, FLOOR, CEILING), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2, FLOOR, CEILING), Duration::from_secs(20));
    }

    #[test]
    fn test_delay_capped_at_ceiling() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(10));
        assert_eq!(policy.delay_for(40, FLOOR, CEILING), CEILING);
        assert_eq!(policy.delay_for(u32::MAX, FLOOR, CEILING), CEILING);

        let policy = BackoffPolicy::linear(Duration::from_secs(3600));
        assert_eq!(policy.delay_for(u32::MAX, FLOOR, CEILING), CEILING);
    }

    #[test]
    fn test_delays_monotonic_and_above_floor() {
        let exponential = BackoffPolicy::exponential(Duration::from_millis(1));
        let linear = BackoffPolicy::linear(Duration::from_millis(1));

        let mut previous = Duration::ZERO;
        for attempt in 1..64 {
            let delay = exponential.delay_for(attempt, FLOOR, CEILING);
            assert!(delay >= previous);
            assert!(delay >= FLOOR);
            previous = delay;
        }

        // Linear steps are a constant increment of the (clamped) base
        for attempt in 1..20 {
            let step = linear.delay_for(attempt + 1, FLOOR, CEILING)
                - linear.delay_for(attempt, FLOOR, CEILING);
            assert_eq!(step, FLOOR);
        }
    }

    #[test]
    fn test_retry_state_budget() {
        let policy = BackoffPolicy::linear(Duration::from_secs(10)).with_max_attempts(2);
        let mut state = RetryState::new();
        assert_eq!(state.attempts, 0);

        state.record_attempt();
        assert!(!state.is_exhausted(&policy));

        state.record_attempt();
        assert!(state.is_exhausted(&policy));
    }

    #[test]
    fn test_unbounded_policy_never_exhausts() {
        let policy = BackoffPolicy::linear(Duration::from_secs(10));
        let mut state = RetryState::new();
        for _ in 0..1000 {
            state.record_attempt();
        }
        assert!(!state.is_exhausted(&policy));
    }

    #[test]
    fn test_next_attempt_at_in_future() {
        let state = RetryState::new();
        let now = chrono::Utc::now();
        let next = state.next_attempt_at(Duration::from_secs(1));

        let diff = next.signed_duration_since(now);
        assert!(diff.num_milliseconds() >= 900);
        assert!(diff.num_seconds() <= 2);
    }

    #[test]
    fn test_policy_yaml() {
        let yaml = r#"
kind: linear
base_delay_ms: 10000
max_attempts: 3
"#;
        let policy: BackoffPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            policy,
            BackoffPolicy::linear(Duration::from_secs(10)).with_max_attempts(3)
        );
    }
}
