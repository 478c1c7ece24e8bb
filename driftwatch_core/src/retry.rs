use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Bounded exponential backoff for whole-unit retries.
///
/// Only transient failures are retried; input and conversion errors
/// fail the unit on the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::InvalidInput("max_attempts must be >= 1".to_string()));
        }
        if initial_backoff.is_zero() {
            return Err(Error::InvalidInput(
                "initial_backoff must be > 0".to_string(),
            ));
        }
        if max_backoff < initial_backoff {
            return Err(Error::InvalidInput(
                "max_backoff must be >= initial_backoff".to_string(),
            ));
        }
        Ok(Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        })
    }

    /// A single attempt, no backoff. Useful when the hosting scheduler
    /// owns retries itself.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    /// Delay before retrying after the given failed attempt (1-based):
    /// initial * 2^(attempt-1), capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self
            .initial_backoff
            .saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        delay.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}
