use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::config::ChatConfig;
use crate::errors::ChatError;

/// Author of a conversation message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Typed chat-completions request body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

impl ChatRequest {
    /// Streaming request for `model`.
    pub fn streaming(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
        }
    }
}

/// Everything needed to dispatch one turn. Built once, never mutated; each
/// retry attempt re-sends the same serialized body.
#[derive(Clone)]
pub struct RequestEnvelope {
    endpoint: String,
    api_key: String,
    body: Bytes,
}

impl fmt::Debug for RequestEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEnvelope")
            .field("endpoint", &self.endpoint)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl RequestEnvelope {
    /// Serializes `request` once.
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        request: &ChatRequest,
    ) -> Result<Self, ChatError> {
        let body = serde_json::to_vec(request)
            .map_err(|e| ChatError::Request(format!("failed to serialize request: {e}")))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            body: Bytes::from(body),
        })
    }

    pub fn for_config(config: &ChatConfig, messages: Vec<ChatMessage>) -> Result<Self, ChatError> {
        Self::new(
            config.endpoint.clone(),
            config.api_key.clone(),
            &ChatRequest::streaming(config.model.clone(), messages),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Serialized JSON body. Cloning is cheap.
    pub fn body(&self) -> Bytes {
        self.body.clone()
    }
}
