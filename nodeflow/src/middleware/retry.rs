//! Retry policy with configurable backoff and jitter strategies.
//!
//! A worker never sleeps on a failed delivery. It acknowledges it and
//! republishes a copy that becomes visible after the computed delay,
//! stamped with the attempts made so far; the redelivered copy resumes the
//! [`RetryState`] from that stamp, so the ceiling holds across redeliveries
//! and restarts.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// How transient failures are retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts (at least 1).
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }
}

/// Retry bookkeeping for one delivery.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempt: u32,
    /// When the first attempt failed.
    first_failed_at: Option<DateTime<Utc>>,
    /// Previous delay, for decorrelated jitter.
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resumes the state of a message rescheduled after `attempts` failed
    /// attempts.
    #[must_use]
    pub fn resumed(attempts: u32, first_failed_at: DateTime<Utc>) -> Self {
        Self {
            attempt: attempts,
            first_failed_at: Some(first_failed_at),
            previous_delay_ms: None,
        }
    }

    /// Marks the start of an attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    /// Records a failed attempt.
    pub fn record_failure(&mut self) {
        if self.first_failed_at.is_none() {
            self.first_failed_at = Some(Utc::now());
        }
    }

    /// Returns when the first attempt failed, or now if none has.
    #[must_use]
    pub fn first_failed_at(&self) -> DateTime<Utc> {
        self.first_failed_at.unwrap_or_else(Utc::now)
    }

    /// Returns true if no attempt remains.
    #[must_use]
    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempt >= policy.max_attempts
    }

    /// Calculates the delay before the next attempt.
    #[must_use]
    pub fn calculate_delay(&mut self, policy: &RetryPolicy) -> Duration {
        let base = policy.base_delay_ms;
        let max = policy.max_delay_ms;
        let retry = self.attempt.saturating_sub(1);

        let delay = match policy.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match policy.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base.min(max)
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delay_ms = Some(next);
                next
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// The failure is transient but the ceiling was reached.
    GiveUp,
    /// The failure is permanent.
    NotRetryable,
}

/// Decides what to do after a failed attempt.
#[must_use]
pub fn should_retry(state: &mut RetryState, policy: &RetryPolicy, transient: bool) -> RetryDecision {
    state.record_failure();
    if !transient {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(policy) {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry(state.calculate_delay(policy))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(backoff)
            .with_jitter(JitterStrategy::None)
    }

    fn delay_after(attempt: u32, policy: &RetryPolicy) -> Duration {
        let mut state = RetryState::new();
        state.attempt = attempt;
        state.calculate_delay(policy)
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay_ms, 200);
        assert_eq!(policy.backoff, BackoffStrategy::Exponential);
        assert_eq!(policy.jitter, JitterStrategy::Full);
    }

    #[test]
    fn test_policy_from_partial_toml() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 3\nbackoff = \"linear\"").unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, BackoffStrategy::Linear);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn test_max_attempts_at_least_one() {
        assert_eq!(RetryPolicy::new().with_max_attempts(0).max_attempts, 1);
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }

    #[test]
    fn test_exponential_delays() {
        let policy = no_jitter(BackoffStrategy::Exponential);
        assert_eq!(delay_after(1, &policy), Duration::from_millis(100));
        assert_eq!(delay_after(2, &policy), Duration::from_millis(200));
        assert_eq!(delay_after(3, &policy), Duration::from_millis(400));
    }

    #[test]
    fn test_linear_delays() {
        let policy = no_jitter(BackoffStrategy::Linear);
        assert_eq!(delay_after(1, &policy), Duration::from_millis(100));
        assert_eq!(delay_after(3, &policy), Duration::from_millis(300));
    }

    #[test]
    fn test_constant_delays() {
        let policy = no_jitter(BackoffStrategy::Constant);
        assert_eq!(delay_after(1, &policy), Duration::from_millis(100));
        assert_eq!(delay_after(6, &policy), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000)
            .with_jitter(JitterStrategy::None);
        assert_eq!(delay_after(11, &policy), Duration::from_millis(5000));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Full);
        for _ in 0..20 {
            assert!(delay_after(1, &policy) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_equal_jitter_keeps_half() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Equal);
        for _ in 0..20 {
            let delay = delay_after(1, &policy);
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_should_retry_until_ceiling() {
        let policy = RetryPolicy::new().with_max_attempts(3).with_jitter(JitterStrategy::None);
        let mut state = RetryState::new();

        state.begin_attempt();
        assert!(matches!(should_retry(&mut state, &policy, true), RetryDecision::Retry(_)));
        state.begin_attempt();
        assert!(matches!(should_retry(&mut state, &policy, true), RetryDecision::Retry(_)));
        state.begin_attempt();
        assert_eq!(should_retry(&mut state, &policy, true), RetryDecision::GiveUp);
        assert_eq!(state.attempt, 3);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let policy = RetryPolicy::new();
        let mut state = RetryState::new();
        state.begin_attempt();

        assert_eq!(should_retry(&mut state, &policy, false), RetryDecision::NotRetryable);
        assert!(state.first_failed_at() <= Utc::now());
    }

    #[test]
    fn test_first_failure_time_is_kept() {
        let policy = RetryPolicy::new().with_base_delay_ms(0);
        let mut state = RetryState::new();

        state.begin_attempt();
        let _ = should_retry(&mut state, &policy, true);
        let first = state.first_failed_at();
        state.begin_attempt();
        let _ = should_retry(&mut state, &policy, true);
        assert_eq!(state.first_failed_at(), first);
    }

    #[test]
    fn test_resumed_state_keeps_ceiling_and_first_failure() {
        let policy = RetryPolicy::new().with_max_attempts(3).with_jitter(JitterStrategy::None);
        let first = Utc::now() - chrono::Duration::seconds(30);
        let mut state = RetryState::resumed(2, first);

        assert_eq!(state.begin_attempt(), 3);
        assert_eq!(should_retry(&mut state, &policy, true), RetryDecision::GiveUp);
        assert_eq!(state.first_failed_at(), first);
    }
}
