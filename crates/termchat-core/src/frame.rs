//! Rebuilds JSON payloads from the line-oriented event stream.
//!
//! The upstream service sends `data: {...}` lines, but a payload may be split
//! over several physical lines by the transport. A frame is considered
//! complete when a line ends with `}`. This is not a real JSON balance check:
//! a `}` ending a physical line in the middle of a payload closes the frame
//! early, and the decoder then reports it as malformed.

use tracing::{debug, warn};

/// Keep-alive comment emitted by OpenRouter while the model is thinking.
pub const KEEP_ALIVE: &str = ": OPENROUTER PROCESSING";
/// Prefix of the in-band control line carrying a machine-readable status.
pub const CONTROL_PREFIX: &str = "CODE: ";
/// Prefix of a payload line.
pub const DATA_PREFIX: &str = "data:";
/// Terminal marker.
pub const DONE_MARKER: &str = "[DONE]";

/// Why the stream ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StreamEnd {
    /// `[DONE]` was received.
    DoneMarker,
    /// A `CODE: ` line arrived after the 200 status. `code` is `None` when the
    /// line carried no parseable number.
    ControlSignal { code: Option<u16> },
    /// The body ended without an end marker.
    Eof,
}

/// A frame that was thrown away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A new `data:` line arrived while the previous frame was still open.
    UnclosedFrame { discarded: String },
    /// The stream ended while a frame was open.
    UnterminatedAtEnd { discarded: String },
}

impl ProtocolViolation {
    pub fn discarded(&self) -> &str {
        match self {
            Self::UnclosedFrame { discarded } | Self::UnterminatedAtEnd { discarded } => discarded,
        }
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnclosedFrame { discarded } => {
                write!(f, "frame never closed, discarded: {discarded}")
            }
            Self::UnterminatedAtEnd { discarded } => {
                write!(f, "unterminated frame at end of stream, discarded: {discarded}")
            }
        }
    }
}

/// Result of feeding one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Violation(ProtocolViolation),
    /// A complete payload for the delta decoder.
    Frame(String),
    /// The stream is finished; later lines must not be fed.
    End(StreamEnd),
}

#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: String,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current partial payload.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Feeds one physical line and returns what it produced, in order.
    pub fn push_line(&mut self, raw: &str) -> Vec<FrameEvent> {
        let line = raw.trim();
        let mut events = Vec::new();

        if line.is_empty() || line == KEEP_ALIVE {
            return events;
        }

        if let Some(rest) = line.strip_prefix(CONTROL_PREFIX) {
            let code = rest.split_whitespace().next().and_then(|c| c.parse().ok());
            debug!(?code, "in-band control line ends stream");
            events.push(FrameEvent::End(StreamEnd::ControlSignal { code }));
            return events;
        }

        let payload = line.strip_prefix(DATA_PREFIX).map(str::trim_start);

        if line == DONE_MARKER || payload == Some(DONE_MARKER) {
            if let Some(violation) = self.take_open_frame(true) {
                events.push(FrameEvent::Violation(violation));
            }
            events.push(FrameEvent::End(StreamEnd::DoneMarker));
            return events;
        }

        match payload {
            Some(payload) => {
                if let Some(violation) = self.take_open_frame(false) {
                    events.push(FrameEvent::Violation(violation));
                }
                self.buffer.push_str(payload);
            }
            None if !self.buffer.is_empty() => self.buffer.push_str(line),
            None => {
                debug!(line, "ignoring line outside of a frame");
                return events;
            }
        }

        if line.ends_with('}') && !self.buffer.is_empty() {
            events.push(FrameEvent::Frame(std::mem::take(&mut self.buffer)));
        }
        events
    }

    /// Called when the body ends without an end marker.
    pub fn finish(&mut self) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        if let Some(violation) = self.take_open_frame(true) {
            events.push(FrameEvent::Violation(violation));
        }
        events.push(FrameEvent::End(StreamEnd::Eof));
        events
    }

    fn take_open_frame(&mut self, at_end: bool) -> Option<ProtocolViolation> {
        if self.buffer.is_empty() {
            return None;
        }
        let discarded = std::mem::take(&mut self.buffer);
        let violation = if at_end {
            ProtocolViolation::UnterminatedAtEnd { discarded }
        } else {
            ProtocolViolation::UnclosedFrame { discarded }
        };
        warn!(%violation, "discarding partial frame");
        Some(violation)
    }
}
