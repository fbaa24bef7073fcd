//! Exponential backoff with jitter
//!
//! Used in two places: reconnecting to the broker, where attempts are
//! unbounded and only the delay is capped, and writing to the sinks, where a
//! failed write is retried a small number of times before the reading is
//! handed to the dead-letter log.
//!
//! ```text
//! delay(attempt) = min(initial_backoff * multiplier^attempt, max_backoff) * (1 ± jitter)
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_with::serde_as;
use tokio::time::sleep;
use tracing::warn;

/// Retry policy configuration for exponential backoff.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub initial_backoff: Duration,
    /// Upper bound for a single delay, before jitter
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Relative jitter in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait before retry number `attempt` (zero based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (2.0 * fastrand::f64() - 1.0);

        Duration::from_secs_f64((capped * factor).max(0.0))
    }

    /// Check that the policy produces sensible delays
    pub fn validate(&self) -> Result<(), String> {
        if self.multiplier < 1.0 {
            return Err("Backoff multiplier must be at least 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("Backoff jitter must be between 0.0 and 1.0".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return Err("Initial backoff must not exceed maximum backoff".to_string());
        }
        Ok(())
    }
}

/// Stateful backoff for an unbounded sequence of attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next attempt; grows until `max_backoff`
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Start over after a successful attempt
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of consecutive failed attempts
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Run `operation` until it succeeds or the policy's retries are used up
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    label,
                    attempt + 1,
                    policy.max_retries + 1,
                    delay,
                    e
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
