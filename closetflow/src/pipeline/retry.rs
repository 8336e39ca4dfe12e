//! Backoff policies and retry decisions for failed job attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// delay = base
    Fixed,
    /// delay = base * 2^(attempts_made - 1)
    #[default]
    Exponential,
}

/// Jitter strategy to spread retries of many jobs failing together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Delay function applied between a failed attempt and its retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Growth function.
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    /// Base delay in milliseconds.
    pub delay_ms: u64,
    /// Ceiling for any computed delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

const fn default_max_delay_ms() -> u64 {
    10 * 60 * 1000
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(10_000)
    }
}

impl BackoffPolicy {
    /// Exponential backoff from a base delay.
    #[must_use]
    pub const fn exponential(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms,
            max_delay_ms: default_max_delay_ms(),
            jitter: JitterStrategy::None,
        }
    }

    /// Constant backoff.
    #[must_use]
    pub const fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms,
            max_delay_ms: default_max_delay_ms(),
            jitter: JitterStrategy::None,
        }
    }

    /// Sets the delay ceiling.
    #[must_use]
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the delay before the retry that follows `attempts_made`
    /// failed attempts.
    #[must_use]
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let base = self.delay_ms;
        let max = self.max_delay_ms;

        let delay = match self.kind {
            BackoffKind::Fixed => base.min(max),
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1);
                base.saturating_mul(2u64.saturating_pow(exponent)).min(max)
            }
        };

        let jittered = match self.jitter {
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
        };

        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// Attempts are exhausted, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Decides what happens after an attempt failed.
///
/// `attempts_made` already counts the attempt that just failed.
#[must_use]
pub fn should_retry(
    attempts_made: u32,
    max_attempts: u32,
    retryable: bool,
    backoff: &BackoffPolicy,
) -> RetryDecision {
    if !retryable {
        return RetryDecision::NotRetryable;
    }
    if attempts_made >= max_attempts {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry(backoff.delay_for(attempts_made))
}
