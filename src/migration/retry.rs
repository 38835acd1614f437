//! Retry policy with configurable backoff
//!
//! The engine retries one page of work (processing plus commit) as a unit.
//! Only errors reporting `is_retryable()` are tried again.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ErrorCode, Result, SchemaFlowError};

/// Retry configuration with backoff strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    #[serde(default = "default_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    #[serde(default)]
    pub jitter: bool,

    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff: BackoffStrategy::default(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: false,
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with no waiting
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// Fixed delay between a bounded number of attempts
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            backoff: BackoffStrategy::Fixed,
            initial_delay: delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), before jitter
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_delay = match &self.backoff {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Linear { increment } => {
                self.initial_delay + *increment * (attempt - 1)
            }
            BackoffStrategy::Exponential { base } => {
                let multiplier = base.powi(attempt as i32 - 1);
                Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier)
            }
        };

        base_delay.min(self.max_delay)
    }

    /// Apply jitter to delay
    pub fn apply_jitter(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }

        let mut rng = rand::rng();
        let jitter_range = delay.as_secs_f64() * self.jitter_factor.clamp(0.0, 1.0);
        if jitter_range <= 0.0 {
            return delay;
        }
        let jitter = rng.random_range(-jitter_range / 2.0..=jitter_range / 2.0);
        Duration::from_secs_f64((delay.as_secs_f64() + jitter).max(0.0))
    }
}

/// Backoff strategies for retry delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Linear increase in delay
    Linear {
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    /// Exponential increase in delay
    Exponential {
        #[serde(default = "default_exponential_base")]
        base: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: default_exponential_base(),
        }
    }
}

/// Runs a unit of work under a [`RetryPolicy`] and counts retries
pub struct RetryExecutor {
    policy: RetryPolicy,
    retries: AtomicU64,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retries: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether `attempt` is the last one the policy allows
    pub fn is_final(&self, attempt: u32) -> bool {
        attempt >= self.policy.attempts.max(1)
    }

    /// Retries performed so far
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Execute `operation`, passing it the 1-based attempt number.
    ///
    /// A retryable error on the final attempt is reported as exhausted.
    pub async fn execute<F, Fut, T>(&self, context: &str, operation: F) -> Result<T>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) if self.is_final(attempt) => {
                    debug!("Giving up on {} after {} attempt(s)", context, attempt);
                    let code = err.code();
                    return Err(SchemaFlowError::migration_with_code(
                        ErrorCode::MIGRATION_RETRIES_EXHAUSTED,
                        format!(
                            "{} failed after {} attempt(s) [E{:04}]",
                            context, attempt, code
                        ),
                        None,
                    )
                    .with_source(err));
                }
                Err(err) => {
                    let delay = self
                        .policy
                        .apply_jitter(self.policy.calculate_delay(attempt));
                    info!(
                        "Retrying {} (attempt {}/{}) after {:?}: {}",
                        context, attempt, self.policy.attempts, delay, err
                    );
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter_factor() -> f64 {
    0.3
}

fn default_exponential_base() -> f64 {
    2.0
}
