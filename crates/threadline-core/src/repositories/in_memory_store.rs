use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::error::StoreResult;
use super::message_store::{BoxFuture, ConversationRecord, MessageStore, unix_now};
use crate::models::Message;

#[derive(Default)]
struct StoreState {
    messages: HashMap<String, Vec<Message>>,
    conversations: HashMap<String, ConversationRecord>,
}

/// In-memory message store.
/// Useful for testing and for sessions that never touch disk.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn get_messages(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<Vec<Message>>> {
        let state = self.state.clone();
        let id = conversation_id.to_string();

        Box::pin(async move {
            Ok(state.lock().messages.get(&id).cloned().unwrap_or_default())
        })
    }

    fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let state = self.state.clone();
        let id = conversation_id.to_string();

        Box::pin(async move {
            let mut store = state.lock();
            if let Some(record) = store.conversations.get_mut(&id) {
                record.updated_at = unix_now();
            }
            store.messages.entry(id).or_default().push(message);
            Ok(())
        })
    }

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StoreResult<Option<ConversationRecord>>> {
        let state = self.state.clone();
        let id = conversation_id.to_string();

        Box::pin(async move { Ok(state.lock().conversations.get(&id).cloned()) })
    }

    fn put_conversation(&self, record: ConversationRecord) -> BoxFuture<'static, StoreResult<()>> {
        let state = self.state.clone();

        Box::pin(async move {
            state.lock().conversations.insert(record.id.clone(), record);
            Ok(())
        })
    }

    fn list_conversations(&self) -> BoxFuture<'static, StoreResult<Vec<ConversationRecord>>> {
        let state = self.state.clone();

        Box::pin(async move {
            let mut records: Vec<ConversationRecord> =
                state.lock().conversations.values().cloned().collect();

            // Sort by updated_at descending
            records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

            Ok(records)
        })
    }

    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<()>> {
        let state = self.state.clone();
        let id = conversation_id.to_string();

        Box::pin(async move {
            let mut store = state.lock();
            store.conversations.remove(&id);
            store.messages.remove(&id);
            Ok(())
        })
    }
}
