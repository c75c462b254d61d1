//! Unified retry and backoff logic for Telemetron
//!
//! This crate provides the single bounded retry loop used by the collector's
//! storage layer and by the agent's delivery path. Errors are split into
//! transient and permanent classes through [`RetryableError`]; only transient
//! errors are retried, and an exhausted budget always surfaces the last error.

use backoff::backoff::Backoff;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Errors returned by [`retry`]
#[derive(Error, Debug)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// The operation failed with an error that must not be retried
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        #[source]
        source: E,
    },
    /// Every attempt failed with a transient error
    #[error("Operation '{operation}' failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: &'static str,
        attempts: usize,
        #[source]
        source: E,
    },
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// The last error produced by the operation
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Permanent { source, .. } | RetryError::Exhausted { source, .. } => source,
        }
    }

    /// Consume the retry error and return the last underlying error
    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Permanent { source, .. } | RetryError::Exhausted { source, .. } => source,
        }
    }

    /// Returns true if the retry budget was used up
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    /// Number of attempts made before giving up
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Permanent { .. } => 1,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T, E> = std::result::Result<T, RetryError<E>>;

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Bounded retry policy with linearly growing pauses
///
/// A policy allows `max_retries` retries after the initial attempt. The pause
/// before retry `n` (starting at zero) is `initial_pause + n * pause_increment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_pause: Duration,
    pub pause_increment: Duration,
}

impl RetryPolicy {
    /// Create a policy from its three parameters
    pub fn new(max_retries: usize, initial_pause: Duration, pause_increment: Duration) -> Self {
        Self {
            max_retries,
            initial_pause,
            pause_increment,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Total number of attempts, including the initial one
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Build a fresh backoff schedule for one retried operation
    pub fn backoff(&self) -> LinearBackoff {
        LinearBackoff {
            policy: *self,
            retries: 0,
        }
    }
}

impl Default for RetryPolicy {
    /// 3 retries, pausing 1s, 3s and 5s
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(2))
    }
}

/// Backoff schedule produced by a [`RetryPolicy`]
///
/// Yields exactly `max_retries` pauses and then `None`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries as usize >= self.policy.max_retries {
            return None;
        }
        let pause = self.policy.initial_pause + self.policy.pause_increment * self.retries;
        self.retries += 1;
        Some(pause)
    }
}

/// Execute an operation under the given retry policy
///
/// The closure receives the 1-based attempt number. Permanent errors are
/// returned immediately as [`RetryError::Permanent`]; transient errors are
/// retried until the policy's budget is spent, after which the last error is
/// returned as [`RetryError::Exhausted`].
pub async fn retry<T, E, F, Fut>(
    operation: &'static str,
    policy: &RetryPolicy,
    mut f: F,
) -> RetryResult<T, E>
where
    E: RetryableError + std::error::Error + 'static,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        debug!(operation, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_permanent() => {
                warn!(operation, attempt, error = %err, "Operation failed permanently");
                return Err(RetryError::Permanent {
                    operation,
                    source: err,
                });
            }
            Err(err) => match backoff.next_backoff() {
                Some(pause) => {
                    warn!(
                        operation,
                        attempt,
                        pause_ms = pause.as_millis() as u64,
                        error = %err,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                None => {
                    error!(operation, attempts = attempt, error = %err, "Retry budget exhausted");
                    return Err(RetryError::Exhausted {
                        operation,
                        attempts: attempt,
                        source: err,
                    });
                }
            },
        }
    }
}
