//! Streaming chat-completion client for the terminal.
//!
//! A turn is one `POST` to an OpenAI-compatible endpoint whose reply is a
//! server-sent event stream. The stream is reassembled into frames, decoded
//! into deltas, and rendered as it arrives; `<cmd>...</cmd>` directives in the
//! reply are handed to a [`CommandExecutor`]. Rate limits and server errors
//! are retried with exponential backoff, and every turn and failure is
//! written to a [`ConversationStore`].
//!
//! ```no_run
//! use termchat_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ChatError> {
//! let mut client = ChatClient::builder(ChatConfig::from_env()?).build()?;
//! let (_handle, signal) = abort_pair();
//! let report = client
//!     .send_message(TurnInput::new("list the largest files here"), signal)
//!     .await?;
//! eprintln!("conversation {}", report.conversation);
//! # Ok(())
//! # }
//! ```

/// Cancellation handle shared by dispatch, backoff and body reads.
pub mod abort;
/// Conversation facade.
pub mod client;
/// JSON configuration and environment resolution.
pub mod config;
/// Frame payload to delta decoding.
pub mod delta;
/// `<cmd>` directive extraction.
pub mod directive;
/// Visible output sinks.
pub mod display;
/// Public error types.
pub mod errors;
/// Directive receivers.
pub mod executor;
/// Line-level stream framing.
pub mod frame;
/// Global tracing subscriber setup.
pub mod observability;
/// Per-attempt status classification.
pub mod outcome;
/// Common imports for typical usage.
pub mod prelude;
/// Request body and envelope.
pub mod request;
/// Retry policy and driver.
pub mod retry;
/// Per-turn stream state machine.
pub mod session;
/// Conversation persistence.
pub mod store;
/// HTTP transport and line decoding.
pub mod transport;

pub use abort::{AbortHandle, AbortSignal, abort_pair};
pub use client::{ChatClient, ChatClientBuilder, TurnInput, TurnReport};
pub use config::{ChatConfig, ConfigError, expand_env};
pub use delta::{Delta, ToolInvocation, decode_frame};
pub use directive::{Directive, extract_directive};
pub use display::{DisplaySink, RecordingDisplay, TerminalDisplay};
pub use errors::{ChatError, StoreError, TransportError};
pub use executor::{ChannelExecutor, CommandExecutor, PrintExecutor};
pub use frame::{FrameAssembler, FrameEvent, ProtocolViolation, StreamEnd};
pub use observability::init_observability;
pub use outcome::{AttemptResult, Outcome, classify};
pub use request::{ChatMessage, ChatRequest, RequestEnvelope, Role};
pub use retry::{AttemptRunner, RetryDriver, RetryPolicy, RetryStatus};
pub use session::{SessionState, StreamSession, TurnContext, TurnProgress};
pub use store::{ConversationId, ConversationStore, JsonlStore, MemoryStore, StoredMessage};
pub use transport::{ByteStream, LineDecoder, ReqwestTransport, Transport, TransportResponse};
