use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::error::LedgerError;

/// Bounded exponential backoff for ledger writes that hit a write conflict.
///
/// Attempt `n` (zero based) that fails with a conflict waits
/// `base_delay * 2^n`, capped at `max_delay`, before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("still conflicting after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: LedgerError },

    #[error(transparent)]
    Fatal(LedgerError),
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Run `op` until it succeeds, fails with a non-conflict error, or the
    /// attempt budget is spent. Each attempt must be a complete transaction.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_conflict() => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    let wait = self.delay_for(attempt - 1);
                    tracing::warn!(
                        "{}: write conflict ({}), waiting {:?} before retry {}/{}",
                        label,
                        e,
                        wait,
                        attempt,
                        self.max_attempts - 1
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(RetryError::Fatal(e)),
            }
        }
    }
}
