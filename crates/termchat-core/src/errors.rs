use crate::config::ConfigError;

/// Errors raised by a [`Transport`](crate::transport::Transport) while
/// dispatching a request or reading its body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request could not be dispatched (dial, TLS, timeout before headers).
    #[error("request failed: {0}")]
    Request(String),
    /// The response body failed while it was being read.
    #[error("stream read failed: {0}")]
    Read(String),
}

impl TransportError {
    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Request(message) | Self::Read(message) => message,
        }
    }
}

/// Errors returned by a [`ConversationStore`](crate::store::ConversationStore).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    UnknownConversation(String),
    #[error("store i/o failed: {0}")]
    Io(String),
    #[error("stored record is invalid: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Turn-level failure returned to callers of the chat client.
///
/// Protocol problems inside a stream (malformed frames, unterminated
/// payloads) never reach this type: they are logged and the bad frame is
/// skipped.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Credential was rejected. Never retried.
    #[error("invalid credential (HTTP {status})")]
    Authentication { status: u16 },
    /// 429 responses exhausted the attempt budget.
    #[error("rate limit exceeded after {attempts} retries")]
    RateLimited { attempts: u32 },
    /// 5xx responses exhausted the attempt budget.
    #[error("server error after {attempts} retries (HTTP {status})")]
    Server { status: u16, attempts: u32 },
    /// Any status the classifier does not recognize. Never retried.
    #[error("unexpected response: {status} {body}")]
    Unexpected { status: u16, body: String },
    /// Connection or read failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The caller aborted the turn.
    #[error("turn cancelled")]
    Cancelled,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The request body could not be built.
    #[error("invalid request: {0}")]
    Request(String),
}

impl ChatError {
    /// Short text written to the conversation log when this error ends a turn.
    pub fn log_message(&self) -> String {
        match self {
            Self::Authentication { status } => format!("Error ({status}): Invalid API key"),
            Self::RateLimited { .. } => "Error: Rate limit exceeded".to_string(),
            Self::Server { .. } => "Error: Server error after multiple retries".to_string(),
            Self::Unexpected { status, .. } => {
                format!("Error: Unexpected response (HTTP {status})")
            }
            other => format!("Error: {other}"),
        }
    }
}
