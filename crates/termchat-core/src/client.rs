//! Conversation facade: prompt composition, history, and one streamed turn.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::abort::AbortSignal;
use crate::config::{ChatConfig, expand_env};
use crate::delta::ToolInvocation;
use crate::display::{DisplaySink, TerminalDisplay};
use crate::errors::ChatError;
use crate::executor::{CommandExecutor, PrintExecutor};
use crate::frame::StreamEnd;
use crate::request::{ChatMessage, RequestEnvelope, Role};
use crate::retry::{RetryDriver, RetryPolicy, RetryStatus};
use crate::session::{StreamSession, TurnContext};
use crate::store::{ConversationId, ConversationStore, MemoryStore};
use crate::transport::{ReqwestTransport, Transport};

/// One user turn.
#[derive(Debug, Clone, Default)]
pub struct TurnInput {
    pub prompt: String,
    /// Text piped into the CLI, appended as a reference block.
    pub piped_input: Option<String>,
    /// Recent terminal output, folded into the system prompt of a new
    /// conversation.
    pub terminal_buffer: Option<String>,
    /// Continue this conversation instead of starting a new one.
    pub conversation: Option<ConversationId>,
}

impl TurnInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn piped_input(mut self, text: impl Into<String>) -> Self {
        self.piped_input = Some(text.into());
        self
    }

    pub fn terminal_buffer(mut self, text: impl Into<String>) -> Self {
        self.terminal_buffer = Some(text.into());
        self
    }

    pub fn conversation(mut self, id: ConversationId) -> Self {
        self.conversation = Some(id);
        self
    }

    /// Prompt plus the piped reference block, as sent and stored.
    pub fn user_message(&self) -> String {
        match self.piped_input.as_deref().filter(|p| !p.trim().is_empty()) {
            Some(piped) => format!("{}\nReference: {piped}", self.prompt),
            None => self.prompt.clone(),
        }
    }
}

/// Result of a finished turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReport {
    pub conversation: ConversationId,
    pub text: String,
    pub tool_invocations: Vec<ToolInvocation>,
    pub directives: Vec<String>,
    /// `None` when every attempt asked for a retry and the budget ran out.
    pub end: Option<StreamEnd>,
    pub attempts: u32,
}

pub struct ChatClient {
    config: ChatConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ConversationStore>,
    display: Box<dyn DisplaySink>,
    executor: Arc<dyn CommandExecutor>,
}

impl ChatClient {
    pub fn builder(config: ChatConfig) -> ChatClientBuilder {
        ChatClientBuilder {
            config,
            transport: None,
            store: None,
            display: None,
            executor: None,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Sends one user message and streams the reply.
    ///
    /// Failures are written to the conversation log before they are
    /// returned.
    pub async fn send_message(
        &mut self,
        input: TurnInput,
        abort: AbortSignal,
    ) -> Result<TurnReport, ChatError> {
        if input.prompt.trim().is_empty() {
            return Err(ChatError::Request("prompt must not be empty".into()));
        }
        let user_message = input.user_message();

        let (conversation, mut messages) = match input.conversation {
            Some(id) => {
                let history = self.store.history(&id)?;
                debug!(conversation = %id, messages = history.len(), "continuing conversation");
                (id, replayable(history.into_iter().map(|m| ChatMessage::new(m.role, m.content))))
            }
            None => {
                let system = self.system_prompt(input.terminal_buffer.as_deref());
                let id = self.store.create_conversation(&self.config.model, &system)?;
                info!(conversation = %id, model = %self.config.model, "started conversation");
                (id, vec![ChatMessage::new(Role::System, system)])
            }
        };

        self.store.save(&conversation, Role::User, &user_message)?;
        messages.push(ChatMessage::new(Role::User, user_message));
        let envelope = RequestEnvelope::for_config(&self.config, messages)?;

        let driver = RetryDriver::new(RetryPolicy::from_config(&self.config));
        let ctx = TurnContext {
            conversation: &conversation,
            store: self.store.as_ref(),
            display: self.display.as_mut(),
            executor: self.executor.as_ref(),
        };
        let mut session = StreamSession::new(self.transport.as_ref(), &envelope, ctx, abort.clone());
        let status = driver.run(&mut session, abort).await?;
        let progress = session.into_progress();

        if let RetryStatus::Exhausted { attempts } = status {
            debug!(conversation = %conversation, attempts, "retry budget exhausted");
        }
        Ok(TurnReport {
            conversation,
            text: progress.text,
            tool_invocations: progress.tool_invocations,
            directives: progress.directives,
            end: progress.end,
            attempts: status.attempts(),
        })
    }

    /// Configured prompt, expanded dynamic prompt, and the terminal buffer.
    pub fn system_prompt(&self, terminal_buffer: Option<&str>) -> String {
        let dynamic = expand_env(&self.config.dynamic_prompt, |key| std::env::var(key).ok());
        let mut prompt = format!("{} {dynamic}", self.config.system_prompt);
        if let Some(buffer) = terminal_buffer.filter(|b| !b.trim().is_empty()) {
            let limit = self.config.capture_history_length;
            prompt.push_str(&format!(
                "\nTerminal Buffer (last {limit} lines): {}",
                last_lines(buffer, limit)
            ));
        }
        prompt
    }
}

/// Drops log-only entries (tool call dumps and error lines) from stored
/// history, keeping the leading system prompt.
fn replayable(history: impl Iterator<Item = ChatMessage>) -> Vec<ChatMessage> {
    let mut seen_system = false;
    history
        .filter(|m| match m.role {
            Role::System if !seen_system => {
                seen_system = true;
                true
            }
            Role::System | Role::Tool => false,
            Role::User | Role::Assistant => true,
        })
        .collect()
}

fn last_lines(text: &str, limit: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(limit);
    lines[start..].join("\n")
}

pub struct ChatClientBuilder {
    config: ChatConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn ConversationStore>>,
    display: Option<Box<dyn DisplaySink>>,
    executor: Option<Arc<dyn CommandExecutor>>,
}

impl ChatClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn display(mut self, display: Box<dyn DisplaySink>) -> Self {
        self.display = Some(display);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Validates the configuration and fills unset collaborators with the
    /// terminal defaults.
    pub fn build(self) -> Result<ChatClient, ChatError> {
        self.config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                ReqwestTransport::new(self.config.connect_timeout)
                    .map_err(|e| ChatError::Transport(e.to_string()))?,
            ),
        };
        Ok(ChatClient {
            transport,
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            display: self
                .display
                .unwrap_or_else(|| Box::new(TerminalDisplay::new())),
            executor: self.executor.unwrap_or_else(|| Arc::new(PrintExecutor)),
            config: self.config,
        })
    }
}
