use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::StoreError;

// ============================================================================
// Caller-side Retry
// ============================================================================
//
// The repository and the event store never retry on their own. Callers that
// want to ride out a lost append race or a dropped connection wrap the whole
// read-decide-write cycle in `retry_on_transient`; the closure receives the
// attempt number so it can reload state before writing again.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied to the delay after every failure
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config for hot aggregates where append races are expected.
    pub fn contended() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_millis((delay.as_millis() as f64 * self.multiplier) as u64).min(self.max_delay)
    }
}

/// Errors that may succeed when the same operation is attempted again.
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of
/// attempts. The last error is returned as-is.
pub async fn retry_on_transient<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) if !error.is_transient() => {
                tracing::debug!(error = %error, "Permanent failure, not retrying");
                return Err(error);
            }
            Err(error) if attempt >= config.max_attempts => {
                tracing::error!(
                    attempt = attempt,
                    error = %error,
                    "Operation failed after all retries"
                );
                return Err(error);
            }
            Err(error) => {
                tracing::warn!(
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying after delay"
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
