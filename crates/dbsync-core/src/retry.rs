use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{SyncError, SyncResult};

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    Exponential { multiplier: f64, max_delay: Duration },
}

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed delay between at most `max_attempts` attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(
        max_attempts: u32,
        initial: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: initial,
            backoff: Backoff::Exponential {
                multiplier,
                max_delay,
            },
        }
    }

    /// Releasing a lock at the end of a workflow: 3 attempts, 1s apart.
    pub fn unlock() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }

    /// Delay to wait before attempt `attempt` (1-indexed). The first
    /// attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential {
                multiplier,
                max_delay,
            } => {
                let factor = multiplier.powi(attempt.saturating_sub(2) as i32);
                let secs = (self.delay.as_secs_f64() * factor).min(max_delay.as_secs_f64());
                Duration::from_secs_f64(secs)
            }
        }
    }

    /// Run `operation` until it succeeds, fails terminally or attempts run out.
    ///
    /// Errors for which `SyncError::is_retryable` is false end the loop
    /// immediately. The last error is returned on exhaustion.
    pub async fn run<T, F, Fut>(&self, label: &str, operation: F) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.run_if(label, operation, SyncError::is_retryable).await
    }

    /// Like `run`, with a caller-supplied classification of retryable errors.
    pub async fn run_if<T, F, Fut, P>(
        &self,
        label: &str,
        mut operation: F,
        retryable: P,
    ) -> SyncResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
        P: Fn(&SyncError) -> bool,
    {
        let mut attempt = 1;
        loop {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        label, attempt, self.max_attempts, e
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unlock()
    }
}
