//! Per-file retry with exponential backoff.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::UploadConfig;
use crate::remote::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

/// How a retried operation ended
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Failed { error: RemoteError, attempts: u32 },
    /// Cancelled while waiting to retry
    Cancelled { attempts: u32 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.max_attempts, config.backoff_base(), config.backoff_max())
    }

    /// Wait before the attempt following failed attempt number `failed`
    /// (1-based): `base * 2^(failed-1)` capped at `max`, but never shorter
    /// than a remote-supplied `retry_after`.
    pub fn delay_for(&self, failed: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 2u32.saturating_pow(failed.saturating_sub(1));
        let backoff = self.base.saturating_mul(factor).min(self.max);
        match retry_after {
            Some(hint) => backoff.max(hint),
            None => backoff,
        }
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts,
    /// or `cancel` fires during a backoff wait.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => {
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            let retry_after = match &error {
                RemoteError::Transient { retry_after, .. } if attempt < self.max_attempts => {
                    *retry_after
                }
                _ => {
                    return RetryOutcome::Failed {
                        error,
                        attempts: attempt,
                    }
                }
            };

            let delay = self.delay_for(attempt, retry_after);
            warn!(
                "{}: attempt {}/{} failed ({}), retrying in {:?}",
                label, attempt, self.max_attempts, error, delay
            );

            tokio::select! {
                _ = cancel.cancelled() => return RetryOutcome::Cancelled { attempts: attempt },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
