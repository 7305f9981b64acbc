use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::error::StoreResult;
use crate::models::{ConversationId, Message, new_id};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Conversation metadata kept alongside the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub created_at: i64, // Unix timestamp
    pub updated_at: i64, // Unix timestamp
}

impl ConversationRecord {
    pub fn new(id: ConversationId, title: String) -> Self {
        let now = unix_now();
        Self {
            id,
            title,
            project_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Durable per-conversation message log.
///
/// Reads may lag behind writes; callers must never treat a read-back as
/// authoritative for a conversation with a send in flight.
pub trait MessageStore: Send + Sync + 'static {
    /// All messages of a conversation in append order. Unknown ids yield an empty list.
    fn get_messages(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<Vec<Message>>>;

    fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, StoreResult<()>>;

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StoreResult<Option<ConversationRecord>>>;

    /// Insert or replace conversation metadata.
    fn put_conversation(&self, record: ConversationRecord) -> BoxFuture<'static, StoreResult<()>>;

    /// Conversation metadata, most recently updated first.
    fn list_conversations(&self) -> BoxFuture<'static, StoreResult<Vec<ConversationRecord>>>;

    /// Remove a conversation and its messages. Deleting an unknown id is not an error.
    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<()>>;

    /// Persist a new conversation record and return its id.
    fn create_conversation(&self, title: String) -> BoxFuture<'static, StoreResult<ConversationId>> {
        let id = new_id();
        let save = self.put_conversation(ConversationRecord::new(id.clone(), title));
        Box::pin(async move {
            save.await?;
            Ok(id)
        })
    }
}
