//! Bounded exponential-backoff retry around backend primitives

use crate::backend::{BackendError, ErrorClass};
use crate::error::{Result, StreamError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default number of attempts per primitive call
pub const DEFAULT_MAX_RETRY_TIMES: u32 = 10;

/// Retry behaviour for one kind of backend call
///
/// The delay before retry `n` (1-based) is `base_delay * 2^n`, capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts including the first one. Invariant: >= 1
    pub max_attempts: u32,
    /// Base of the exponential backoff
    pub base_delay: Duration,
    /// Upper bound of a single backoff sleep
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_TIMES,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Same attempt budget, no sleeping between attempts
    pub fn without_delay(self) -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..self
        }
    }

    /// Backoff before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op`, retrying transient [`BackendError`]s
    pub fn call<T, F>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> std::result::Result<T, BackendError>,
    {
        self.call_with(operation, BackendError::class, op)
    }

    /// Run `op`, retrying the failures `classify` marks as transient
    pub fn call_with<T, F, C>(&self, operation: &str, classify: C, mut op: F) -> Result<T>
    where
        F: FnMut() -> std::result::Result<T, BackendError>,
        C: Fn(&BackendError) -> ErrorClass,
    {
        let max_attempts = self.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let err = match op() {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} recovered after {} retries", operation, attempt - 1);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if classify(&err) == ErrorClass::Fatal {
                debug!("{} failed with fatal error: {}", operation, err);
                return Err(StreamError::Backend(err));
            }

            if attempt == max_attempts {
                error!(
                    "{} failed after {} attempts, giving up: {}",
                    operation, attempt, err
                );
                return Err(StreamError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.delay_for(attempt);
            if attempt == 1 {
                debug!("{} failed: {}, retrying in {:?}", operation, err, delay);
            } else if attempt + 1 == max_attempts {
                warn!(
                    "{} failed: {}, last retry in {:?} after {} tries",
                    operation, err, delay, attempt
                );
            } else {
                info!(
                    "{} failed: {}, retry in {:?} after {} tries",
                    operation, err, delay, attempt
                );
            }
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }

        unreachable!("retry loop always returns on the last attempt")
    }
}
