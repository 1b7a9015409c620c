//! Chat documents and the store seam that persists them.
//!
//! One document per user holds the whole conversation. Writers must
//! serialize their read-modify-write cycles per user (see
//! `juris_agents::KeyedLockManager`); the store itself offers no isolation.

use async_trait::async_trait;
use chrono::Utc;
use juris_core::{StorageError, Timestamp};
use serde::{Deserialize, Serialize};

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    pub text: String,
    pub time: Timestamp,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
            time: Utc::now(),
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Bot,
            text: text.into(),
            time: Utc::now(),
        }
    }
}

/// A user's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatDocument {
    pub user_id: String,
    pub messages: Vec<ChatMessage>,
    /// Short digest of the conversation. Empty until one is generated.
    #[serde(default)]
    pub summary: String,
    /// Incremented on every save; lets stores detect lost updates.
    pub version: u64,
    pub updated_at: Timestamp,
}

impl ChatDocument {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            messages: Vec::new(),
            summary: String::new(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Append an exchange and bump the version.
    pub fn append_exchange(&mut self, user: ChatMessage, bot: ChatMessage) {
        self.messages.push(user);
        self.messages.push(bot);
        self.version += 1;
        self.updated_at = Utc::now();
    }

    /// Keep only the newest `max` messages.
    pub fn truncate_front(&mut self, max: usize) {
        if self.messages.len() > max {
            let excess = self.messages.len() - max;
            self.messages.drain(..excess);
        }
    }
}

/// Persistence of chat documents over a connection handle `H`.
#[async_trait]
pub trait ChatStore<H>: Send + Sync
where
    H: Send + Sync,
{
    async fn load(&self, conn: &H, user_id: &str) -> Result<Option<ChatDocument>, StorageError>;

    async fn save(&self, conn: &H, document: &ChatDocument) -> Result<(), StorageError>;

    /// Remove the document. Returns whether one existed.
    async fn delete(&self, conn: &H, user_id: &str) -> Result<bool, StorageError>;

    /// Remove every document without messages. Returns how many were removed.
    async fn delete_empty(&self, conn: &H) -> Result<u64, StorageError>;
}
