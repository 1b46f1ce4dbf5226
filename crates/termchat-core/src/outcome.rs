//! Maps the result of one dispatch (status code or connection failure) to a
//! retry decision.

use crate::errors::ChatError;

/// Status codes treated as a rejected credential. `145` is the auth rejection
/// code some OpenRouter-compatible gateways return instead of `401`.
pub const AUTH_REJECTION_CODES: [u16; 2] = [401, 145];

/// Status codes retried with backoff while budget remains.
pub const SERVER_ERROR_CODES: [u16; 4] = [500, 502, 503, 504];

const RATE_LIMITED: u16 = 429;

/// What the transport produced for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptResult<'a> {
    /// Headers arrived with this status. `body` is only read for non-200s.
    Status { code: u16, body: &'a str },
    /// No status: dial, TLS or timeout failure.
    TransportFailure { message: &'a str },
}

/// Decision for one attempt, consumed immediately by the retry driver.
#[derive(Debug)]
pub enum Outcome {
    Success,
    Retryable {
        reason: String,
        attempts_remaining: u32,
    },
    Fatal(ChatError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// System-role message written to the conversation log for this outcome.
    pub fn log_message(&self) -> Option<String> {
        match self {
            Self::Success => None,
            Self::Retryable { reason, .. } => Some(reason.clone()),
            Self::Fatal(err) => Some(err.log_message()),
        }
    }
}

/// Classifies one attempt. `attempt` is 0-based; `max_attempts` is the whole
/// budget, so the last attempt is `max_attempts - 1`.
pub fn classify(result: AttemptResult<'_>, attempt: u32, max_attempts: u32) -> Outcome {
    let max_attempts = max_attempts.max(1);
    let attempts_remaining = max_attempts.saturating_sub(attempt.saturating_add(1));
    let can_retry = attempts_remaining > 0;

    match result {
        AttemptResult::Status { code: 200, .. } => Outcome::Success,
        AttemptResult::Status { code, .. } if AUTH_REJECTION_CODES.contains(&code) => {
            Outcome::Fatal(ChatError::Authentication { status: code })
        }
        AttemptResult::Status {
            code: RATE_LIMITED, ..
        } => {
            if can_retry {
                Outcome::Retryable {
                    reason: "Rate limit exceeded, retrying...".to_string(),
                    attempts_remaining,
                }
            } else {
                Outcome::Fatal(ChatError::RateLimited {
                    attempts: max_attempts,
                })
            }
        }
        AttemptResult::Status { code, .. } if SERVER_ERROR_CODES.contains(&code) => {
            if can_retry {
                Outcome::Retryable {
                    reason: format!("Server error ({code}), retrying..."),
                    attempts_remaining,
                }
            } else {
                Outcome::Fatal(ChatError::Server {
                    status: code,
                    attempts: max_attempts,
                })
            }
        }
        AttemptResult::Status { code, body } => Outcome::Fatal(ChatError::Unexpected {
            status: code,
            body: body.trim().to_string(),
        }),
        AttemptResult::TransportFailure { message } => {
            if can_retry {
                Outcome::Retryable {
                    reason: format!("Connection failed ({message}), retrying..."),
                    attempts_remaining,
                }
            } else {
                Outcome::Fatal(ChatError::Transport(format!(
                    "{message} (after {max_attempts} retries)"
                )))
            }
        }
    }
}
