//! Exponential-backoff retry around a single row's embedding request.

use std::future::Future;
use std::time::Duration;

use lattice_core::error::EmbedError;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self { max_retries, base_delay }
    }

    /// `base_delay * 2^attempt_index`, saturating.
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    /// Gave up: attempts ran out, or the failure was not worth retrying.
    Exhausted { attempts: u32, last_error: EmbedError },
    /// Structural failure that no retry can fix.
    Fatal { attempts: u32, error: EmbedError },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Retry,
    GiveUp,
    Fatal,
}

fn classify(err: &EmbedError) -> Disposition {
    match err {
        EmbedError::DimensionMismatch { .. } => Disposition::Fatal,
        EmbedError::EmptyResponse => Disposition::Retry,
        EmbedError::Api { .. } if err.is_rate_limited() || err.is_transient() => Disposition::Retry,
        EmbedError::Api { .. } => Disposition::GiveUp,
    }
}

/// Runs `operation` until it succeeds, a non-retryable failure occurs, or
/// `policy.max_retries` retries have been spent.
pub async fn with_retries<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EmbedError>>,
{
    let mut attempt_index = 0u32;
    loop {
        let attempts = attempt_index + 1;
        let err = match operation().await {
            Ok(value) => return RetryOutcome::Success { value, attempts },
            Err(err) => err,
        };
        match classify(&err) {
            Disposition::Fatal => {
                warn!(attempts, error = %err, "non-retryable embedding failure");
                return RetryOutcome::Fatal { attempts, error: err };
            }
            Disposition::GiveUp => {
                warn!(attempts, error = %err, "embedding failed; not retrying");
                return RetryOutcome::Exhausted { attempts, last_error: err };
            }
            Disposition::Retry if attempt_index >= policy.max_retries => {
                warn!(attempts, error = %err, "embedding retries exhausted");
                return RetryOutcome::Exhausted { attempts, last_error: err };
            }
            Disposition::Retry => {
                let delay = policy.delay_for(attempt_index);
                debug!(
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying embedding request"
                );
                tokio::time::sleep(delay).await;
                attempt_index += 1;
            }
        }
    }
}
