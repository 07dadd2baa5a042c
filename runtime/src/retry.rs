//! Retry with exponential backoff for idempotent external queries.
//!
//! Only operations that are safe to repeat go through here (provider lookups
//! during reconciliation). Payment captures are never retried automatically.
//!
//! # Example
//!
//! ```rust
//! use fulfillment_runtime::retry::{RetryPolicy, retry_when};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(2)
//!     .initial_delay(Duration::from_millis(5))
//!     .build();
//!
//! let value = retry_when(&policy, "lookup", || async { Ok::<_, String>(7) }, |_| true).await?;
//! assert_eq!(value, 7);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 10 seconds
/// - `multiplier`: 2 (delay doubles each retry)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap for the exponential delay
    pub max_delay: Duration,
    /// Growth factor between retries
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(10),
                multiplier: 2,
            },
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.multiplier
            .checked_pow(attempt)
            .and_then(|factor| self.initial_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: u32) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Run `operation`, retrying errors accepted by `is_retryable`.
///
/// Non-retryable errors are returned immediately; once `max_retries` is
/// exhausted the last error is returned.
///
/// # Errors
///
/// Returns the operation's error when it is not retryable or retries run out.
pub async fn retry_when<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            },
            Err(err) if !is_retryable(&err) || attempt >= policy.max_retries => {
                tracing::warn!(operation = operation_name, attempt, error = %err, "Giving up");
                return Err(err);
            },
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::debug!(
                    operation = operation_name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            },
        }
    }
}
