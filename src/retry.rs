//! Bounded retry with exponential backoff for transient backend errors.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendError;

/// How often and how patiently to repeat a failing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least one is always made
    pub max_attempts: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    pub multiplier: f64,

    /// Pause between pages of a paginated listing
    pub page_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            page_delay_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// A single attempt with no pauses.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
            page_delay_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1 is the first retry).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exp);
        Duration::from_millis((ms as u64).min(self.max_backoff_ms))
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    /// Run `f` until it succeeds, fails permanently, or attempts run out.
    pub fn run<T>(
        &self,
        operation: &str,
        mut f: impl FnMut() -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max => {
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
