//! Shared test doubles for engine and loop tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::models::Message;
use crate::repositories::{
    BoxFuture, ConversationRecord, InMemoryMessageStore, MessageStore, StoreResult,
};
use crate::services::{
    CompletionRequest, CompletionResponse, CompletionTransport, StreamChunk, TransportError,
};

/// One scripted transport reply: chunks streamed first, then the result.
#[derive(Clone)]
pub struct ScriptedTurn {
    pub chunks: Vec<StreamChunk>,
    pub result: Result<CompletionResponse, TransportError>,
}

impl ScriptedTurn {
    pub fn streamed(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks
                .iter()
                .map(|c| StreamChunk::Text(c.to_string()))
                .collect(),
            result: Ok(CompletionResponse::text(chunks.concat())),
        }
    }

    pub fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Self {
            chunks: Vec::new(),
            result: Ok(CompletionResponse {
                data: json!({}),
                tool_calls: Some(json!([{ "id": id, "name": name, "arguments": arguments }])),
            }),
        }
    }

    pub fn failing(chunks: &[&str], error: TransportError) -> Self {
        Self {
            chunks: chunks
                .iter()
                .map(|c| StreamChunk::Text(c.to_string()))
                .collect(),
            result: Err(error),
        }
    }
}

/// Replays queued turns in order and records every request.
///
/// When `repeat_last` is set the final turn is replayed forever.
pub struct ScriptedTransport {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    repeat_last: bool,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedTransport {
    pub fn new(turns: Vec<ScriptedTurn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            repeat_last: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn repeating(turn: ScriptedTurn) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(VecDeque::from([turn])),
            repeat_last: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        let mut turns = self.turns.lock();
        if self.repeat_last && turns.len() == 1 {
            turns.front().cloned()
        } else {
            turns.pop_front()
        }
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    async fn send(
        &self,
        request: CompletionRequest,
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<CompletionResponse, TransportError> {
        self.requests.lock().push(request);
        let Some(turn) = self.next_turn() else {
            return Err(TransportError::Api {
                status: 500,
                message: "script exhausted".to_string(),
            });
        };
        for chunk in turn.chunks {
            on_chunk(chunk);
        }
        turn.result
    }
}

enum TransportEvent {
    Chunk(StreamChunk, oneshot::Sender<()>),
    Finish(Result<CompletionResponse, TransportError>),
}

/// Test-driven transport: the test pushes chunks and decides when the reply ends.
pub struct ChannelTransport {
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

/// Test side of a [`ChannelTransport`].
#[derive(Clone)]
pub struct TransportDriver {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, TransportDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: tokio::sync::Mutex::new(rx),
            }),
            TransportDriver { tx },
        )
    }
}

impl TransportDriver {
    /// Deliver a text chunk and wait until the engine has received it.
    pub async fn chunk(&self, text: &str) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(TransportEvent::Chunk(StreamChunk::Text(text.to_string()), ack_tx))
            .unwrap();
        ack_rx.await.unwrap();
    }

    pub fn finish(&self, result: Result<CompletionResponse, TransportError>) {
        let _ = self.tx.send(TransportEvent::Finish(result));
    }
}

#[async_trait]
impl CompletionTransport for ChannelTransport {
    async fn send(
        &self,
        _request: CompletionRequest,
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<CompletionResponse, TransportError> {
        let mut events = self.events.lock().await;
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Chunk(chunk, ack) => {
                    on_chunk(chunk);
                    let _ = ack.send(());
                }
                TransportEvent::Finish(result) => return result,
            }
        }
        Err(TransportError::Cancelled)
    }
}

/// Store whose reads can be made to lag behind its writes.
#[derive(Clone, Default)]
pub struct LaggingStore {
    pub inner: InMemoryMessageStore,
    lagging: Arc<AtomicBool>,
}

impl LaggingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While lagging, `get_messages` returns an empty list.
    pub fn set_lagging(&self, lagging: bool) {
        self.lagging.store(lagging, Ordering::SeqCst);
    }
}

impl MessageStore for LaggingStore {
    fn get_messages(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<Vec<Message>>> {
        if self.lagging.load(Ordering::SeqCst) {
            return Box::pin(async { Ok(Vec::new()) });
        }
        self.inner.get_messages(conversation_id)
    }

    fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, StoreResult<()>> {
        self.inner.append_message(conversation_id, message)
    }

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StoreResult<Option<ConversationRecord>>> {
        self.inner.get_conversation(conversation_id)
    }

    fn put_conversation(&self, record: ConversationRecord) -> BoxFuture<'static, StoreResult<()>> {
        self.inner.put_conversation(record)
    }

    fn list_conversations(&self) -> BoxFuture<'static, StoreResult<Vec<ConversationRecord>>> {
        self.inner.list_conversations()
    }

    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<()>> {
        self.inner.delete_conversation(conversation_id)
    }
}

/// Store that holds every assistant append until the test opens the gate.
///
/// User messages and conversation records pass straight through.
#[derive(Clone, Default)]
pub struct GatedStore {
    pub inner: InMemoryMessageStore,
    gate: Arc<Notify>,
    blocked: Arc<Notify>,
}

impl GatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until an assistant append is parked at the gate.
    pub async fn wait_until_blocked(&self) {
        self.blocked.notified().await;
    }

    pub fn open_gate(&self) {
        self.gate.notify_one();
    }
}

impl MessageStore for GatedStore {
    fn get_messages(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<Vec<Message>>> {
        self.inner.get_messages(conversation_id)
    }

    fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> BoxFuture<'static, StoreResult<()>> {
        if message.is_user() {
            return self.inner.append_message(conversation_id, message);
        }
        let append = self.inner.append_message(conversation_id, message);
        let gate = self.gate.clone();
        let blocked = self.blocked.clone();
        Box::pin(async move {
            blocked.notify_one();
            gate.notified().await;
            append.await
        })
    }

    fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, StoreResult<Option<ConversationRecord>>> {
        self.inner.get_conversation(conversation_id)
    }

    fn put_conversation(&self, record: ConversationRecord) -> BoxFuture<'static, StoreResult<()>> {
        self.inner.put_conversation(record)
    }

    fn list_conversations(&self) -> BoxFuture<'static, StoreResult<Vec<ConversationRecord>>> {
        self.inner.list_conversations()
    }

    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, StoreResult<()>> {
        self.inner.delete_conversation(conversation_id)
    }
}
