//! Message and conversation records and the stores that keep them.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConversationId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Sending,
    Sent,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub is_streaming: bool,
    pub is_edited: bool,
}

impl Message {
    /// A record not yet inserted; the store assigns the id.
    pub fn new(conversation_id: ConversationId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId(0),
            conversation_id,
            content: content.into(),
            role,
            created_at: Utc::now(),
            status: MessageStatus::Sent,
            is_streaming: false,
            is_edited: false,
        }
    }

    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.is_streaming = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId(0),
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: Message) -> MessageId;
    async fn get(&self, id: MessageId) -> Option<Message>;
    async fn update(&self, message: Message) -> Result<(), StorageError>;
    async fn delete(&self, id: MessageId) -> Result<(), StorageError>;
    /// Oldest first.
    async fn list_for_conversation(&self, conversation_id: ConversationId) -> Vec<Message>;
    async fn delete_for_conversation(&self, conversation_id: ConversationId);
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn insert(&self, conversation: Conversation) -> ConversationId;
    async fn get(&self, id: ConversationId) -> Option<Conversation>;
    async fn update(&self, conversation: Conversation) -> Result<(), StorageError>;
    async fn delete(&self, id: ConversationId) -> Result<(), StorageError>;
    /// Most recently updated first.
    async fn list(&self) -> Vec<Conversation>;
}

#[derive(Debug, Default)]
struct Tables {
    next_message_id: i64,
    next_conversation_id: i64,
    messages: BTreeMap<MessageId, Message>,
    conversations: BTreeMap<ConversationId, Conversation>,
}

/// In-process store with auto-incrementing ids starting at 1.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, mut message: Message) -> MessageId {
        let mut tables = self.tables.lock().await;
        tables.next_message_id += 1;
        message.id = MessageId(tables.next_message_id);
        let id = message.id;
        tables.messages.insert(id, message);
        id
    }

    async fn get(&self, id: MessageId) -> Option<Message> {
        self.tables.lock().await.messages.get(&id).cloned()
    }

    async fn update(&self, message: Message) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        match tables.messages.get_mut(&message.id) {
            Some(slot) => {
                *slot = message;
                Ok(())
            }
            None => Err(StorageError::MessageNotFound(message.id)),
        }
    }

    async fn delete(&self, id: MessageId) -> Result<(), StorageError> {
        self.tables
            .lock()
            .await
            .messages
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::MessageNotFound(id))
    }

    async fn list_for_conversation(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.tables
            .lock()
            .await
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    async fn delete_for_conversation(&self, conversation_id: ConversationId) {
        self.tables
            .lock()
            .await
            .messages
            .retain(|_, m| m.conversation_id != conversation_id);
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn insert(&self, mut conversation: Conversation) -> ConversationId {
        let mut tables = self.tables.lock().await;
        tables.next_conversation_id += 1;
        conversation.id = ConversationId(tables.next_conversation_id);
        let id = conversation.id;
        tables.conversations.insert(id, conversation);
        id
    }

    async fn get(&self, id: ConversationId) -> Option<Conversation> {
        self.tables.lock().await.conversations.get(&id).cloned()
    }

    async fn update(&self, conversation: Conversation) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        match tables.conversations.get_mut(&conversation.id) {
            Some(slot) => {
                *slot = conversation;
                Ok(())
            }
            None => Err(StorageError::ConversationNotFound(conversation.id)),
        }
    }

    async fn delete(&self, id: ConversationId) -> Result<(), StorageError> {
        self.tables
            .lock()
            .await
            .conversations
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::ConversationNotFound(id))
    }

    async fn list(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> =
            self.tables.lock().await.conversations.values().cloned().collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        conversations
    }
}
