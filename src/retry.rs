//! Retry policy engine for activity scheduling.
//!
//! A `RetryPolicy` describes how many attempts an activity gets and how long
//! to back off between them. The retry loop itself is driven by
//! `OrchestrationContext::schedule_activity_with_retry`, which turns each
//! backoff delay into a durable timer so the sequence of attempts replays
//! deterministically.

use std::time::Duration;

/// Backoff computation between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately, no delay.
    None,
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt-1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => {
                base.checked_mul(attempt).unwrap_or(*max).min(*max)
            }
            BackoffStrategy::Exponential {
                base,
                multiplier,
                max,
            } => {
                let factor = multiplier.powi(attempt as i32 - 1);
                if !factor.is_finite() || factor >= (u32::MAX as f64) {
                    return *max;
                }
                base.mul_f64(factor).min(*max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

/// Retry policy for `schedule_activity_with_retry`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first (must be >= 1).
    pub max_attempts: u32,
    /// Backoff between attempts.
    pub backoff: BackoffStrategy,
    /// Optional per-attempt timeout; a timed-out attempt counts as a failure.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            backoff: BackoffStrategy::default(),
            timeout: None,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
