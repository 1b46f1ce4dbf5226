//! Conversation log collaborators.
//!
//! The stream engine writes the user prompt, every protocol or classification
//! error, raw tool calls, and every finished turn through
//! [`ConversationStore`]. Stores must tolerate repeated error lines on retry
//! paths.

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead as _, Write as _};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::StoreError;
use crate::request::Role;

/// Identifier of a stored conversation.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Creates a fresh random id.
    pub fn generate() -> Self {
        Self(format!("conv_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One logged message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Header record written when a conversation is created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub model: String,
    pub system_prompt: String,
    pub created_at: DateTime<Utc>,
}

pub trait ConversationStore: Send + Sync {
    fn create_conversation(
        &self,
        model: &str,
        system_prompt: &str,
    ) -> Result<ConversationId, StoreError>;

    fn save(&self, id: &ConversationId, role: Role, content: &str) -> Result<(), StoreError>;

    /// Messages in the order they were saved, starting with the system prompt.
    fn history(&self, id: &ConversationId) -> Result<Vec<StoredMessage>, StoreError>;
}

/// In-process store, used by tests and one-shot runs.
#[derive(Default)]
pub struct MemoryStore {
    conversations: Mutex<HashMap<ConversationId, Vec<StoredMessage>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages saved under `id` with the given role.
    pub fn messages_with_role(&self, id: &ConversationId, role: Role) -> Vec<String> {
        self.history(id)
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.role == role)
            .map(|m| m.content)
            .collect()
    }
}

impl ConversationStore for MemoryStore {
    fn create_conversation(
        &self,
        model: &str,
        system_prompt: &str,
    ) -> Result<ConversationId, StoreError> {
        let id = ConversationId::generate();
        let mut conversations = self.conversations.lock().map_err(|_| StoreError::Poisoned)?;
        conversations.insert(
            id.clone(),
            vec![StoredMessage {
                role: Role::System,
                content: system_prompt.to_string(),
                created_at: Utc::now(),
            }],
        );
        debug!(conversation = %id, model, "created conversation");
        Ok(id)
    }

    fn save(&self, id: &ConversationId, role: Role, content: &str) -> Result<(), StoreError> {
        let mut conversations = self.conversations.lock().map_err(|_| StoreError::Poisoned)?;
        let messages = conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownConversation(id.to_string()))?;
        messages.push(StoredMessage {
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        });
        debug!(conversation = %id, ?role, len = content.len(), "saved message");
        Ok(())
    }

    fn history(&self, id: &ConversationId) -> Result<Vec<StoredMessage>, StoreError> {
        let conversations = self.conversations.lock().map_err(|_| StoreError::Poisoned)?;
        conversations
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownConversation(id.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum JsonlRecord {
    Meta(ConversationMeta),
    Message(StoredMessage),
}

/// Persists each conversation as `<dir>/<id>.jsonl`: one metadata record
/// followed by one record per message.
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    /// Creates the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path(&self, id: &ConversationId) -> Result<PathBuf, StoreError> {
        let valid = !id.as_str().is_empty()
            && id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::UnknownConversation(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.jsonl")))
    }

    fn append(&self, id: &ConversationId, record: &JsonlRecord, create: bool) -> Result<(), StoreError> {
        let path = self.path(id)?;
        if !create && !path.exists() {
            return Err(StoreError::UnknownConversation(id.to_string()));
        }
        let mut line = serde_json::to_string(record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

impl ConversationStore for JsonlStore {
    fn create_conversation(
        &self,
        model: &str,
        system_prompt: &str,
    ) -> Result<ConversationId, StoreError> {
        let id = ConversationId::generate();
        let now = Utc::now();
        self.append(
            &id,
            &JsonlRecord::Meta(ConversationMeta {
                model: model.to_string(),
                system_prompt: system_prompt.to_string(),
                created_at: now,
            }),
            true,
        )?;
        self.append(
            &id,
            &JsonlRecord::Message(StoredMessage {
                role: Role::System,
                content: system_prompt.to_string(),
                created_at: now,
            }),
            false,
        )?;
        debug!(conversation = %id, model, dir = %self.dir.display(), "created conversation");
        Ok(id)
    }

    fn save(&self, id: &ConversationId, role: Role, content: &str) -> Result<(), StoreError> {
        self.append(
            id,
            &JsonlRecord::Message(StoredMessage {
                role,
                content: content.to_string(),
                created_at: Utc::now(),
            }),
            false,
        )
    }

    fn history(&self, id: &ConversationId) -> Result<Vec<StoredMessage>, StoreError> {
        let path = self.path(id)?;
        let file = std::fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::UnknownConversation(id.to_string()),
            _ => StoreError::Io(e.to_string()),
        })?;
        let mut messages = Vec::new();
        for line in std::io::BufReader::new(file).lines() {
            let line = line.map_err(|e| StoreError::Io(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line).map_err(|e| StoreError::Corrupt(e.to_string()))? {
                JsonlRecord::Message(message) => messages.push(message),
                JsonlRecord::Meta(_) => {}
            }
        }
        Ok(messages)
    }
}
