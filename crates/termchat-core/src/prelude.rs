//! Common imports for sending a turn from application code.
pub use crate::{
    AbortHandle, AbortSignal, ChatClient, ChatConfig, ChatError, ConversationId, JsonlStore,
    MemoryStore, TurnInput, TurnReport, abort_pair,
};
