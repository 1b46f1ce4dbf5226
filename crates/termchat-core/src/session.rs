//! One turn against the chat endpoint: dispatch, classify, stream, persist.
//!
//! A [`StreamSession`] is driven by the retry driver through
//! [`AttemptRunner`]. Each attempt owns its response body; the body is
//! dropped when the attempt returns, whatever the exit path.

use futures::StreamExt as _;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::abort::AbortSignal;
use crate::delta::{Delta, ToolInvocation, decode_frame};
use crate::directive::extract_directive;
use crate::display::DisplaySink;
use crate::errors::ChatError;
use crate::executor::CommandExecutor;
use crate::frame::{FrameAssembler, FrameEvent, StreamEnd};
use crate::outcome::{AttemptResult, Outcome, classify};
use crate::request::{RequestEnvelope, Role};
use crate::retry::AttemptRunner;
use crate::store::{ConversationId, ConversationStore};
use crate::transport::{ByteStream, LineDecoder, Transport};

const INVALID_JSON_MESSAGE: &str = "Error: Invalid JSON response";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Aborted,
}

/// Collaborators for one turn, borrowed from the client.
pub struct TurnContext<'a> {
    pub conversation: &'a ConversationId,
    pub store: &'a dyn ConversationStore,
    pub display: &'a mut dyn DisplaySink,
    pub executor: &'a dyn CommandExecutor,
}

/// What a turn produced so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnProgress {
    /// Raw content of the turn, directive markers included.
    pub text: String,
    pub tool_invocations: Vec<ToolInvocation>,
    /// Commands handed to the executor, in order.
    pub directives: Vec<String>,
    pub end: Option<StreamEnd>,
    /// Attempts started, including the one that finished the turn.
    pub attempts: u32,
    /// Assistant messages written to the store.
    pub persisted_turns: u32,
}

pub struct StreamSession<'a> {
    transport: &'a dyn Transport,
    envelope: &'a RequestEnvelope,
    ctx: TurnContext<'a>,
    abort: AbortSignal,
    state: SessionState,
    progress: TurnProgress,
    /// Content arrived since the last persisted assistant message.
    unpersisted: bool,
    /// The end-of-turn marker was rendered after the latest content.
    end_rendered: bool,
}

impl<'a> StreamSession<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        envelope: &'a RequestEnvelope,
        ctx: TurnContext<'a>,
        abort: AbortSignal,
    ) -> Self {
        Self {
            transport,
            envelope,
            ctx,
            abort,
            state: SessionState::Idle,
            progress: TurnProgress::default(),
            unpersisted: false,
            end_rendered: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn progress(&self) -> &TurnProgress {
        &self.progress
    }

    pub fn into_progress(self) -> TurnProgress {
        self.progress
    }

    fn transition(&mut self, next: SessionState) {
        debug!(conversation = %self.ctx.conversation, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    fn record(&self, role: Role, content: &str) {
        if let Err(err) = self.ctx.store.save(self.ctx.conversation, role, content) {
            warn!(conversation = %self.ctx.conversation, %role, error = %err, "failed to save message");
        }
    }

    /// Logs a non-success outcome once and moves to the matching state.
    fn settle(&mut self, outcome: Outcome) -> Outcome {
        self.ctx.display.set_busy(false);
        if let Some(message) = outcome.log_message() {
            self.record(Role::System, &message);
        }
        match &outcome {
            Outcome::Success => self.transition(SessionState::Completed),
            Outcome::Retryable { reason, .. } => {
                warn!(conversation = %self.ctx.conversation, %reason, "attempt failed");
                self.transition(SessionState::Idle);
            }
            Outcome::Fatal(err) => {
                error!(conversation = %self.ctx.conversation, error = %err, "turn failed");
                self.progress.text.clear();
                self.unpersisted = false;
                self.transition(SessionState::Aborted);
            }
        }
        outcome
    }

    fn cancelled(&mut self) -> Outcome {
        self.settle(Outcome::Fatal(ChatError::Cancelled))
    }

    async fn consume(&mut self, mut body: ByteStream) -> Result<StreamEnd, ChatError> {
        let mut lines = LineDecoder::default();
        let mut frames = FrameAssembler::new();
        loop {
            let next = tokio::select! {
                _ = self.abort.aborted() => return Err(ChatError::Cancelled),
                next = body.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    for line in lines.push_chunk(&chunk) {
                        if let Some(end) = self.apply_events(frames.push_line(&line)) {
                            return Ok(end);
                        }
                    }
                }
                Some(Err(err)) => {
                    return Err(ChatError::Transport(format!(
                        "stream read failed: {}",
                        err.message()
                    )));
                }
                None => {
                    if let Some(tail) = lines.finish()
                        && let Some(end) = self.apply_events(frames.push_line(&tail))
                    {
                        return Ok(end);
                    }
                    return Ok(self.apply_events(frames.finish()).unwrap_or(StreamEnd::Eof));
                }
            }
        }
    }

    fn apply_events(&mut self, events: Vec<FrameEvent>) -> Option<StreamEnd> {
        for event in events {
            match event {
                FrameEvent::Violation(violation) => {
                    warn!(conversation = %self.ctx.conversation, %violation, "protocol violation");
                    self.record(Role::System, &format!("Error: {violation}"));
                }
                FrameEvent::Frame(frame) => self.apply_frame(&frame),
                FrameEvent::End(end) => return Some(end),
            }
        }
        None
    }

    fn apply_frame(&mut self, frame: &str) {
        debug!(conversation = %self.ctx.conversation, frame, "frame");
        match decode_frame(frame) {
            Ok(Some(delta)) => {
                self.ctx.display.set_busy(false);
                self.apply_delta(delta);
            }
            Ok(None) => debug!("frame without choices"),
            Err(err) => {
                error!(conversation = %self.ctx.conversation, frame, error = %err, "invalid JSON frame");
                self.record(Role::System, INVALID_JSON_MESSAGE);
            }
        }
    }

    fn apply_delta(&mut self, delta: Delta) {
        match delta {
            Delta::ContentChunk(text) => {
                let directive = extract_directive(&text);
                if !directive.visible.is_empty() {
                    self.ctx.display.render(&directive.visible);
                }
                if let Some(command) = directive.command.filter(|c| !c.is_empty()) {
                    debug!(command = %command, "directive extracted");
                    self.ctx.executor.submit(&command);
                    self.progress.directives.push(command);
                }
                self.progress.text.push_str(&text);
                self.unpersisted = true;
                self.end_rendered = false;
            }
            Delta::ToolInvocations { invocations, raw } => {
                for call in &invocations {
                    debug!(id = %call.id, function = %call.function_name, "tool invocation");
                }
                self.record(Role::Tool, &raw.to_string());
                self.progress.tool_invocations.extend(invocations);
            }
            Delta::EndOfTurn => self.close_turn(),
        }
    }

    /// Renders the end-of-turn marker and persists the accumulated text.
    /// A no-op when nothing arrived since the last close.
    fn close_turn(&mut self) {
        if !self.unpersisted {
            debug!("end of turn without new content");
            return;
        }
        self.ctx.display.render("");
        self.end_rendered = true;
        self.record(Role::Assistant, &self.progress.text);
        self.unpersisted = false;
        self.progress.persisted_turns += 1;
    }

    /// Closes any open turn, then makes sure the display saw exactly one
    /// end-of-turn marker, even for turns without content.
    fn finish_stream(&mut self) {
        self.close_turn();
        if !self.end_rendered {
            self.ctx.display.render("");
            self.end_rendered = true;
        }
    }
}

#[async_trait::async_trait]
impl AttemptRunner for StreamSession<'_> {
    async fn run_attempt(&mut self, attempt: u32, max_attempts: u32) -> Outcome {
        self.progress.attempts = attempt + 1;
        if self.abort.is_aborted() {
            return self.cancelled();
        }

        self.transition(SessionState::Sending);
        self.ctx.display.set_busy(true);
        let sent = tokio::select! {
            _ = self.abort.aborted() => None,
            sent = self.transport.send(self.envelope) => Some(sent),
        };
        let response = match sent {
            None => return self.cancelled(),
            Some(Err(err)) => {
                let message = err.message().to_string();
                let outcome = classify(
                    AttemptResult::TransportFailure { message: &message },
                    attempt,
                    max_attempts,
                );
                return self.settle(outcome);
            }
            Some(Ok(response)) => response,
        };

        let status = response.status;
        debug!(conversation = %self.ctx.conversation, status, attempt, "response headers");
        if status != 200 {
            let body = tokio::select! {
                _ = self.abort.aborted() => return self.cancelled(),
                text = response.text() => text.unwrap_or_else(|err| format!("<unreadable body: {err}>")),
            };
            let outcome = classify(
                AttemptResult::Status {
                    code: status,
                    body: &body,
                },
                attempt,
                max_attempts,
            );
            return self.settle(outcome);
        }

        self.transition(SessionState::Streaming);
        match self.consume(response.body).await {
            Ok(end) => {
                self.finish_stream();
                self.progress.end = Some(end);
                self.settle(Outcome::Success)
            }
            Err(err) => self.settle(Outcome::Fatal(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::abort_pair;
    use crate::display::RecordingDisplay;
    use crate::errors::TransportError;
    use crate::executor::ChannelExecutor;
    use crate::request::{ChatMessage, ChatRequest};
    use crate::store::MemoryStore;
    use crate::transport::TransportResponse;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    struct CountedBody {
        chunks: VecDeque<Result<Bytes, TransportError>>,
        hang: bool,
        drops: Arc<AtomicUsize>,
    }

    impl futures::Stream for CountedBody {
        type Item = Result<Bytes, TransportError>;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            match self.chunks.pop_front() {
                Some(chunk) => Poll::Ready(Some(chunk)),
                None if self.hang => Poll::Pending,
                None => Poll::Ready(None),
            }
        }
    }

    impl Drop for CountedBody {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    enum Reply {
        Status(u16, Vec<&'static str>),
        Hanging(u16, Vec<&'static str>),
        ReadError(Vec<&'static str>),
        Refused,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicUsize,
        drops: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            }
        }

        fn body(&self, chunks: &[&'static str], hang: bool, fail: bool) -> ByteStream {
            let mut chunks: VecDeque<_> = chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect();
            if fail {
                chunks.push_back(Err(TransportError::Read("connection reset".into())));
            }
            Box::pin(CountedBody {
                chunks,
                hang,
                drops: self.drops.clone(),
            })
        }
    }

    #[async_trait::async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _request: &RequestEnvelope) -> Result<TransportResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .lock()
                .expect("lock")
                .pop_front()
                .expect("unexpected extra request");
            let (status, body) = match reply {
                Reply::Status(status, chunks) => (status, self.body(&chunks, false, false)),
                Reply::Hanging(status, chunks) => (status, self.body(&chunks, true, false)),
                Reply::ReadError(chunks) => (200, self.body(&chunks, false, true)),
                Reply::Refused => return Err(TransportError::Request("connection refused".into())),
            };
            Ok(TransportResponse { status, body })
        }
    }

    struct Fixture {
        store: MemoryStore,
        conversation: ConversationId,
        display: RecordingDisplay,
        executor: ChannelExecutor,
        commands: tokio::sync::mpsc::UnboundedReceiver<String>,
        envelope: RequestEnvelope,
    }

    impl Fixture {
        fn new() -> Self {
            let store = MemoryStore::new();
            let conversation = store
                .create_conversation("test-model", "be brief")
                .expect("create");
            let (executor, commands) = ChannelExecutor::new();
            let request = ChatRequest::streaming("test-model", vec![ChatMessage::new(Role::User, "hi")]);
            let envelope =
                RequestEnvelope::new("http://localhost/chat", "key", &request).expect("envelope");
            Self {
                store,
                conversation,
                display: RecordingDisplay::new(),
                executor,
                commands,
                envelope,
            }
        }

        async fn run(
            &mut self,
            transport: &ScriptedTransport,
            attempt: u32,
            max: u32,
            abort: AbortSignal,
        ) -> (Outcome, SessionState, TurnProgress) {
            let mut display = self.display.clone();
            let ctx = TurnContext {
                conversation: &self.conversation,
                store: &self.store,
                display: &mut display,
                executor: &self.executor,
            };
            let mut session = StreamSession::new(transport, &self.envelope, ctx, abort);
            let outcome = session.run_attempt(attempt, max).await;
            let state = session.state();
            (outcome, state, session.into_progress())
        }

        fn saved(&self, role: Role) -> Vec<String> {
            self.store.messages_with_role(&self.conversation, role)
        }
    }

    const HI: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n";
    const EMPTY: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n";
    const DONE: &str = "data: [DONE]\n";

    #[tokio::test]
    async fn three_line_stream_persists_assistant_text_once() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(200, vec![HI, EMPTY, DONE])]);

        let (outcome, state, progress) = fx.run(&transport, 0, 3, AbortSignal::never()).await;

        assert!(outcome.is_success());
        assert_eq!(state, SessionState::Completed);
        assert_eq!(fx.display.rendered(), vec!["Hi".to_string(), String::new()]);
        assert_eq!(fx.saved(Role::Assistant), vec!["Hi".to_string()]);
        assert_eq!(progress.end, Some(StreamEnd::DoneMarker));
        assert_eq!(progress.persisted_turns, 1);
        assert_eq!(transport.drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn leading_empty_delta_does_not_close_turn() {
        let mut fx = Fixture::new();
        let transport =
            ScriptedTransport::new(vec![Reply::Status(200, vec![EMPTY, HI, EMPTY, DONE])]);
        let (_, _, progress) = fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert_eq!(fx.display.rendered(), vec!["Hi".to_string(), String::new()]);
        assert_eq!(progress.persisted_turns, 1);
    }

    #[tokio::test]
    async fn tool_only_turn_still_signals_end_once() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(
            200,
            vec![
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"id\":\"call_9\",\"function\":{\"name\":\"shell\",\"arguments\":\"{}\"}}]}}]}\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"\"},\"finish_reason\":\"tool_calls\"}]}\n",
                DONE,
            ],
        )]);
        let (outcome, _, progress) = fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert!(outcome.is_success());
        assert_eq!(fx.display.rendered(), vec![String::new()]);
        assert_eq!(progress.tool_invocations.len(), 1);
        assert_eq!(progress.persisted_turns, 0);
        assert!(fx.saved(Role::Assistant).is_empty());
    }

    #[tokio::test]
    async fn empty_stream_signals_end_once() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(200, vec![DONE])]);
        fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert_eq!(fx.display.rendered(), vec![String::new()]);
    }

    #[tokio::test]
    async fn discarded_partial_frame_is_logged_once() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(
            200,
            vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"a\"\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"b\"\n",
                "}}]}\n",
                DONE,
            ],
        )]);
        let (outcome, _, progress) = fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert!(outcome.is_success());
        assert_eq!(progress.text, "b");
        let discarded: Vec<String> = fx
            .saved(Role::System)
            .into_iter()
            .filter(|m| m.starts_with("Error: frame never closed"))
            .collect();
        assert_eq!(discarded.len(), 1);
        assert!(discarded[0].contains("\"a\""));
    }

    #[tokio::test]
    async fn whitespace_directive_is_still_submitted() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(
            200,
            vec!["data: {\"choices\":[{\"delta\":{\"content\":\"x<cmd> </cmd>y\"}}]}\n", DONE],
        )]);
        let (_, _, progress) = fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert_eq!(progress.directives, vec![" ".to_string()]);
        assert_eq!(fx.commands.try_recv().ok().as_deref(), Some(" "));
    }

    #[tokio::test]
    async fn eof_without_end_of_turn_still_persists() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(200, vec![HI])]);
        let (outcome, _, progress) = fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert!(outcome.is_success());
        assert_eq!(progress.end, Some(StreamEnd::Eof));
        assert_eq!(fx.saved(Role::Assistant), vec!["Hi".to_string()]);
    }

    #[tokio::test]
    async fn chunk_split_mid_line_and_frame_split_over_lines() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(
            200,
            vec![
                ": OPENROUTER PROCESSING\n\ndata: {\"choices\":[{\"del",
                "ta\":{\"content\":\"Hel\"\n",
                "}}]}\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\ndata: [DONE]",
            ],
        )]);
        let (_, _, progress) = fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert_eq!(progress.text, "Hello");
        assert_eq!(progress.end, Some(StreamEnd::DoneMarker));
    }

    #[tokio::test]
    async fn directive_is_hidden_and_submitted() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(
            200,
            vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"run <cmd>ls -la</cmd> now\"}}]}\n",
                DONE,
            ],
        )]);
        let (_, _, progress) = fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert_eq!(fx.display.rendered()[0], "run  now");
        assert_eq!(fx.commands.try_recv().ok().as_deref(), Some("ls -la"));
        assert_eq!(progress.directives, vec!["ls -la".to_string()]);
        assert_eq!(fx.saved(Role::Assistant), vec!["run <cmd>ls -la</cmd> now".to_string()]);
    }

    #[tokio::test]
    async fn tool_calls_are_logged_raw() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(
            200,
            vec![
                "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"id\":\"call_1\",\"function\":{\"name\":\"shell\",\"arguments\":\"{\\\"command\\\":\\\"pwd\\\"}\"}}]}}]}\n",
                DONE,
            ],
        )]);
        let (_, _, progress) = fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert_eq!(progress.tool_invocations.len(), 1);
        assert_eq!(progress.tool_invocations[0].command, "pwd");
        let tool = fx.saved(Role::Tool);
        assert_eq!(tool.len(), 1);
        assert!(tool[0].contains("call_1"));
        assert!(fx.saved(Role::Assistant).is_empty());
    }

    #[tokio::test]
    async fn invalid_json_frame_is_logged_and_skipped() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(
            200,
            vec!["data: {not json}\n", HI, DONE],
        )]);
        let (outcome, _, progress) = fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert!(outcome.is_success());
        assert_eq!(progress.text, "Hi");
        assert!(fx.saved(Role::System).contains(&INVALID_JSON_MESSAGE.to_string()));
    }

    #[tokio::test]
    async fn control_line_ends_stream() {
        let mut fx = Fixture::new();
        let transport =
            ScriptedTransport::new(vec![Reply::Status(200, vec![HI, "CODE: 200\n", HI])]);
        let (_, _, progress) = fx.run(&transport, 0, 1, AbortSignal::never()).await;
        assert_eq!(progress.end, Some(StreamEnd::ControlSignal { code: Some(200) }));
        assert_eq!(progress.text, "Hi");
    }

    #[tokio::test]
    async fn server_error_is_retryable_and_logged_once() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(503, vec!["busy"])]);
        let (outcome, state, _) = fx.run(&transport, 0, 3, AbortSignal::never()).await;
        assert!(matches!(outcome, Outcome::Retryable { attempts_remaining: 2, .. }));
        assert_eq!(state, SessionState::Idle);
        let system = fx.saved(Role::System);
        assert_eq!(
            system.iter().filter(|m| m.contains("Server error (503)")).count(),
            1
        );
        assert_eq!(transport.drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn auth_rejection_is_fatal() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Status(401, vec![])]);
        let (outcome, state, _) = fx.run(&transport, 0, 3, AbortSignal::never()).await;
        assert!(matches!(outcome, Outcome::Fatal(ChatError::Authentication { status: 401 })));
        assert_eq!(state, SessionState::Aborted);
        assert!(fx.saved(Role::System).contains(&"Error (401): Invalid API key".to_string()));
    }

    #[tokio::test]
    async fn refused_connection_on_last_attempt_is_fatal() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Refused]);
        let (outcome, _, _) = fx.run(&transport, 2, 3, AbortSignal::never()).await;
        let Outcome::Fatal(ChatError::Transport(message)) = outcome else {
            panic!("expected transport failure");
        };
        assert!(message.contains("connection refused"));
    }

    #[tokio::test]
    async fn read_error_discards_partial_text() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::ReadError(vec![HI])]);
        let (outcome, state, progress) = fx.run(&transport, 0, 3, AbortSignal::never()).await;
        assert!(matches!(outcome, Outcome::Fatal(ChatError::Transport(_))));
        assert_eq!(state, SessionState::Aborted);
        assert!(progress.text.is_empty());
        assert!(fx.saved(Role::Assistant).is_empty());
        assert_eq!(transport.drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_while_streaming_releases_body() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![Reply::Hanging(200, vec![HI])]);
        let (handle, signal) = abort_pair();

        let (result, ()) = tokio::join!(fx.run(&transport, 0, 1, signal), async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.abort();
        });

        let (outcome, state, _) = result;
        assert!(matches!(outcome, Outcome::Fatal(ChatError::Cancelled)));
        assert_eq!(state, SessionState::Aborted);
        assert!(fx.saved(Role::Assistant).is_empty());
        assert_eq!(transport.drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pre_aborted_attempt_never_dispatches() {
        let mut fx = Fixture::new();
        let transport = ScriptedTransport::new(vec![]);
        let (handle, signal) = abort_pair();
        handle.abort();
        let (outcome, _, _) = fx.run(&transport, 0, 1, signal).await;
        assert!(matches!(outcome, Outcome::Fatal(ChatError::Cancelled)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(fx.saved(Role::System).contains(&"Error: turn cancelled".to_string()));
    }
}
