//! Bounded retry loop around stream attempts.

use std::time::Duration;

use tracing::{debug, warn};

use crate::abort::AbortSignal;
use crate::config::ChatConfig;
use crate::errors::ChatError;
use crate::outcome::Outcome;

/// Exponential backoff without jitter: the wait after attempt `n` is
/// `backoff_unit * 2^n`, capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub backoff_unit: Duration,
    pub max_backoff: Duration,
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(300)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, backoff_unit: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff_unit,
            max_backoff: default_max_backoff(),
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::exponential(config.max_retries, config.backoff_unit)
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Whether another attempt follows attempt `attempt` (0-based).
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_unit
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// One attempt of a turn. Implemented by the stream session; tests provide
/// scripted runners.
#[async_trait::async_trait]
pub trait AttemptRunner: Send {
    async fn run_attempt(&mut self, attempt: u32, max_attempts: u32) -> Outcome;
}

/// How the retry loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStatus {
    Succeeded { attempts: u32 },
    /// Every attempt asked for a retry. Treated as completed: the failure has
    /// already been written to the conversation log by the attempts.
    Exhausted { attempts: u32 },
}

impl RetryStatus {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts } | Self::Exhausted { attempts } => *attempts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryDriver {
    policy: RetryPolicy,
}

impl RetryDriver {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs attempts sequentially until one succeeds or fails fatally.
    ///
    /// An abort during backoff cuts the wait short; the next attempt observes
    /// the abort and reports it.
    pub async fn run<R>(&self, runner: &mut R, mut abort: AbortSignal) -> Result<RetryStatus, ChatError>
    where
        R: AttemptRunner + ?Sized,
    {
        let max = self.policy.max_attempts;
        for attempt in 0..max {
            match runner.run_attempt(attempt, max).await {
                Outcome::Success => {
                    debug!(attempt, "attempt succeeded");
                    return Ok(RetryStatus::Succeeded {
                        attempts: attempt + 1,
                    });
                }
                Outcome::Fatal(err) => return Err(err),
                Outcome::Retryable {
                    reason,
                    attempts_remaining,
                } => {
                    if !self.policy.can_retry(attempt) {
                        break;
                    }
                    let delay = self.policy.backoff_duration(attempt);
                    warn!(attempt, attempts_remaining, ?delay, %reason, "retrying after backoff");
                    tokio::select! {
                        _ = abort.aborted() => debug!(attempt, "backoff interrupted by abort"),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        Ok(RetryStatus::Exhausted { attempts: max })
    }
}
