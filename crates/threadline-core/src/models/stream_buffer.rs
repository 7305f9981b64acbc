use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::message::{ConversationId, MessageId};
use crate::services::StreamChunk;

/// Value handed to subscribers when a conversation's stream is flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdate {
    pub conversation_id: ConversationId,
    pub assistant_message_id: MessageId,
    /// Full accumulated text, not the delta since the last update.
    pub text: String,
    pub reasoning: String,
    pub finished: bool,
}

/// Per-conversation accumulator for an in-flight assistant response.
///
/// Accumulation is never throttled; only notifications are. `dirty` records
/// whether anything arrived since the last flush so the coordinator can emit
/// at most one update per frame.
pub struct StreamBuffer {
    conversation_id: ConversationId,
    assistant_message_id: MessageId,
    text: String,
    reasoning: String,
    dirty: bool,
    chunk_count: usize,
    cancel_flag: Arc<AtomicBool>,
    started_at: Instant,
}

impl StreamBuffer {
    pub fn new(conversation_id: ConversationId, assistant_message_id: MessageId) -> Self {
        Self {
            conversation_id,
            assistant_message_id,
            text: String::new(),
            reasoning: String::new(),
            dirty: false,
            chunk_count: 0,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn assistant_message_id(&self) -> &str {
        &self.assistant_message_id
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::Text(text) => self.text.push_str(text),
            StreamChunk::Reasoning(text) => self.reasoning.push_str(text),
        }
        self.chunk_count += 1;
        self.dirty = true;
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }

    /// Force the next flush to notify even if no new chunk arrived.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Returns whether the buffer had unflushed content, clearing the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, finished: bool) -> StreamUpdate {
        StreamUpdate {
            conversation_id: self.conversation_id.clone(),
            assistant_message_id: self.assistant_message_id.clone(),
            text: self.text.clone(),
            reasoning: self.reasoning.clone(),
            finished,
        }
    }
}
