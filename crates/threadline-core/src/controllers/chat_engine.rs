use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    Attachment, ConversationId, FinalizedSend, Message, Notification, SessionError,
    StreamCoordinator, StreamUpdate, SubmitReceipt, SubscriptionId, SwitchOutcome,
};
use crate::repositories::message_store::unix_now;
use crate::repositories::{
    ConversationRecord, MessageStore, ReadDecision, ReadTicket, StoreResult,
};
use crate::services::{
    CompletionRequest, CompletionTransport, ContentResolver, ContinuationTurn, LoopOutcome,
    PlaceholderResolver, StreamChunk, ToolCallLoop, ToolRegistry, TransportError, derive_title,
};

const INTERRUPTED: &str = "Response interrupted before it finished";
const SHUT_DOWN: &str = "Response interrupted by shutdown";

type ChunkSink = Arc<dyn Fn(StreamChunk) + Send + Sync>;

/// Handle to a send running on the tokio runtime.
pub struct SendHandle {
    receipt: SubmitReceipt,
    task: JoinHandle<EngineResult<()>>,
}

impl SendHandle {
    pub fn receipt(&self) -> &SubmitReceipt {
        &self.receipt
    }

    /// Drop the send. Partial output is finalized and committed in the background.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> EngineResult<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                debug!(error = ?e, "Send task did not run to completion");
                Err(EngineError::Transport(TransportError::Cancelled))
            }
        }
    }
}

struct EngineInner {
    coordinator: Mutex<StreamCoordinator>,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn CompletionTransport>,
    tool_loop: ToolCallLoop,
    config: EngineConfig,
    shutting_down: AtomicBool,
}

impl EngineInner {
    /// Finalize a send that will not complete normally, returning what to commit.
    ///
    /// Covers both a registered stream and a send that never reached one. The
    /// send stays guarded until the result is passed to `commit_send`.
    fn release(
        &self,
        assistant_message_id: &str,
        conversation_id: Option<&str>,
        reason: String,
    ) -> Option<FinalizedSend> {
        let (finalized, notifications) = {
            let mut coordinator = self.coordinator.lock();
            match conversation_id {
                Some(id) if coordinator.streaming_conversation_id() == Some(id) => {
                    match coordinator.end_stream(id, None, Some(reason)) {
                        Some(completion) => (Some(completion.finalized), completion.notifications),
                        None => (None, Vec::new()),
                    }
                }
                _ => (coordinator.fail_send(assistant_message_id, reason), Vec::new()),
            }
        };
        deliver(notifications);
        finalized
    }

    async fn abort_send(
        self: &Arc<Self>,
        assistant_message_id: &str,
        conversation_id: Option<&str>,
        error: EngineError,
    ) -> EngineError {
        warn!(
            conv_id = ?conversation_id,
            assistant_message_id = %assistant_message_id,
            error = %error,
            "Send failed"
        );
        if let Some(finalized) = self.release(assistant_message_id, conversation_id, error.to_string())
            && let Err(e) = commit_send(self.clone(), finalized).await
        {
            error!(error = ?e, "Failed to commit partial response");
        }
        error
    }
}

fn deliver(notifications: Vec<Notification>) {
    for notification in notifications {
        notification.deliver();
    }
}

async fn commit_messages(
    store: Arc<dyn MessageStore>,
    conversation_id: ConversationId,
    messages: Vec<Message>,
) -> StoreResult<()> {
    let count = messages.len();
    for message in messages {
        store.append_message(&conversation_id, message).await?;
    }
    debug!(conv_id = %conversation_id, count, "Committed messages");
    Ok(())
}

/// Releases a finalized send's guard when dropped.
struct CommitRelease {
    inner: Arc<EngineInner>,
    assistant_message_id: String,
}

impl Drop for CommitRelease {
    fn drop(&mut self) {
        self.inner
            .coordinator
            .lock()
            .finish_commit(&self.assistant_message_id);
    }
}

/// Append a finalized send to storage, then release its guard.
///
/// The guard is released whether the commit succeeds, fails, or is dropped.
/// A send that never got a conversation id has nothing to commit.
async fn commit_send(inner: Arc<EngineInner>, finalized: FinalizedSend) -> StoreResult<()> {
    let _release = CommitRelease {
        inner: inner.clone(),
        assistant_message_id: finalized.assistant_message_id,
    };
    let Some(conversation_id) = finalized.conversation_id else {
        return Ok(());
    };
    commit_messages(inner.store.clone(), conversation_id, finalized.messages).await
}

/// Finalizes and commits a send whose future is dropped mid-flight.
struct InterruptGuard {
    inner: Arc<EngineInner>,
    assistant_message_id: String,
    conversation_id: Option<ConversationId>,
    armed: bool,
}

impl InterruptGuard {
    fn new(inner: Arc<EngineInner>, assistant_message_id: &str, conversation_id: Option<ConversationId>) -> Self {
        Self {
            inner,
            assistant_message_id: assistant_message_id.to_string(),
            conversation_id,
            armed: true,
        }
    }

    fn bind(&mut self, conversation_id: &str) {
        self.conversation_id = Some(conversation_id.to_string());
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            conv_id = ?self.conversation_id,
            assistant_message_id = %self.assistant_message_id,
            "Send dropped before completion"
        );

        let Some(finalized) = self.inner.release(
            &self.assistant_message_id,
            self.conversation_id.as_deref(),
            INTERRUPTED.to_string(),
        ) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    if let Err(e) = commit_send(inner, finalized).await {
                        error!(error = ?e, "Failed to commit interrupted response");
                    }
                });
            }
            Err(_) => {
                warn!(conv_id = ?finalized.conversation_id, "No runtime available, interrupted response not committed");
                self.inner
                    .coordinator
                    .lock()
                    .finish_commit(&finalized.assistant_message_id);
            }
        }
    }
}

/// Periodic flush of coalesced stream notifications. Stops when dropped.
struct FramePump {
    task: JoinHandle<()>,
}

impl FramePump {
    fn start(inner: Arc<EngineInner>, period: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let notifications = inner.coordinator.lock().flush_frame();
                deliver(notifications);
            }
        });
        Self { task }
    }
}

impl Drop for FramePump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// UI-facing chat engine.
///
/// Wires the stream coordinator to a message store, a completion transport,
/// and the tool loop. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChatEngine {
    inner: Arc<EngineInner>,
}

impl ChatEngine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn CompletionTransport>,
        tools: ToolRegistry,
        config: EngineConfig,
    ) -> Self {
        let tool_loop = ToolCallLoop::new(tools, config.max_tool_iterations);
        Self {
            inner: Arc::new(EngineInner {
                coordinator: Mutex::new(StreamCoordinator::new()),
                store,
                transport,
                tool_loop,
                config,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Optimistically add the user message and an empty reply to the viewed conversation.
    ///
    /// Synchronous; nothing touches the network until `complete` runs.
    pub fn submit(&self, text: &str, attachments: Vec<Attachment>) -> EngineResult<SubmitReceipt> {
        self.inner.coordinator.lock().submit(text, attachments)
    }

    /// `submit`, then run the send in the background.
    pub fn send(&self, text: &str, attachments: Vec<Attachment>) -> EngineResult<SendHandle> {
        let receipt = self.submit(text, attachments)?;
        let engine = self.clone();
        let task_receipt = receipt.clone();
        let task = tokio::spawn(async move { engine.complete(task_receipt).await });
        Ok(SendHandle { receipt, task })
    }

    /// Drive a submitted send to completion: stream, run tools, finalize, commit.
    ///
    /// Transport errors finalize the reply with its partial text and surface
    /// on the session as well as in the returned error.
    pub async fn complete(&self, receipt: SubmitReceipt) -> EngineResult<()> {
        let inner = &self.inner;
        let assistant_message_id = receipt.assistant_message_id.as_str();
        let mut guard = InterruptGuard::new(
            inner.clone(),
            assistant_message_id,
            receipt.conversation_id.clone(),
        );

        let conversation_id = match self.ensure_conversation(&receipt).await {
            Ok(id) => id,
            Err(e) => {
                guard.disarm();
                return Err(inner.abort_send(assistant_message_id, None, e).await);
            }
        };
        guard.bind(&conversation_id);

        if inner.shutting_down.load(Ordering::SeqCst) {
            guard.disarm();
            let error = EngineError::Transport(TransportError::Cancelled);
            return Err(inner.abort_send(assistant_message_id, Some(&conversation_id), error).await);
        }

        let registered = {
            let mut coordinator = inner.coordinator.lock();
            coordinator
                .begin_stream(&conversation_id, assistant_message_id)
                .map(|cancel| (cancel, coordinator.history_for(&conversation_id, assistant_message_id)))
        };
        let (cancel, history) = match registered {
            Ok(registered) => registered,
            Err(e) => {
                guard.disarm();
                return Err(inner.abort_send(assistant_message_id, Some(&conversation_id), e).await);
            }
        };

        info!(conv_id = %conversation_id, "Sending message");
        let _pump = FramePump::start(inner.clone(), inner.config.frame_interval());

        let on_chunk: ChunkSink = {
            let inner = inner.clone();
            let conversation_id = conversation_id.clone();
            let cancel = cancel.clone();
            Arc::new(move |chunk: StreamChunk| {
                if cancel.load(Ordering::Relaxed) {
                    return;
                }
                inner.coordinator.lock().on_chunk(&conversation_id, &chunk);
            })
        };

        let base = CompletionRequest {
            conversation_id: conversation_id.clone(),
            model_id: inner.config.model_id.clone(),
            messages: history,
            tools: inner.tool_loop.registry().declarations().to_vec(),
            include_history: false,
        };

        let outcome = match inner.transport.send(base.clone(), on_chunk.as_ref()).await {
            Ok(first) => {
                let mut transcript = base.messages.clone();
                inner
                    .tool_loop
                    .drive(first, |turn: ContinuationTurn| {
                        transcript.push(turn.to_message());
                        let request = CompletionRequest {
                            messages: transcript.clone(),
                            include_history: true,
                            ..base.clone()
                        };
                        let transport = inner.transport.clone();
                        let on_chunk = on_chunk.clone();
                        let cancel = cancel.clone();
                        async move {
                            if cancel.load(Ordering::Relaxed) {
                                return Err(TransportError::Cancelled);
                            }
                            transport.send(request, on_chunk.as_ref()).await
                        }
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                guard.disarm();
                let error = EngineError::Transport(e);
                return Err(inner.abort_send(assistant_message_id, Some(&conversation_id), error).await);
            }
        };

        if report.outcome == LoopOutcome::MaxIterationsExceeded {
            info!(
                conv_id = %conversation_id,
                iterations = report.iterations,
                "Finishing with the last response after the tool cap"
            );
        }

        let completion = {
            let mut coordinator = inner.coordinator.lock();
            let streamed = coordinator
                .stream_snapshot(&conversation_id)
                .map(|snapshot| snapshot.text)
                .unwrap_or_default();
            let final_text = if streamed.is_empty() {
                report.last_response.response_text()
            } else {
                streamed
            };
            coordinator.end_stream(&conversation_id, Some(final_text), None)
        };
        guard.disarm();

        let Some(completion) = completion else {
            debug!(conv_id = %conversation_id, "Send was cancelled, nothing to commit");
            return Err(EngineError::Transport(TransportError::Cancelled));
        };
        deliver(completion.notifications);

        commit_send(inner.clone(), completion.finalized).await?;
        info!(conv_id = %conversation_id, tool_rounds = report.iterations, "Send complete");
        Ok(())
    }

    /// Resolve the send's conversation id, creating the conversation if needed,
    /// and record a title for a first message.
    async fn ensure_conversation(&self, receipt: &SubmitReceipt) -> EngineResult<ConversationId> {
        let title = derive_title(&receipt.text, self.inner.config.title_max_chars);

        let Some(conversation_id) = &receipt.conversation_id else {
            let id = self.inner.store.create_conversation(title).await?;
            info!(conv_id = %id, "Created conversation");
            if !self
                .inner
                .coordinator
                .lock()
                .assign_conversation_id(&receipt.assistant_message_id, &id)
            {
                return Err(EngineError::UnknownSend {
                    assistant_message_id: receipt.assistant_message_id.clone(),
                });
            }
            return Ok(id);
        };

        if receipt.is_first_message {
            self.record_title(conversation_id, title).await;
        }
        Ok(conversation_id.clone())
    }

    async fn record_title(&self, conversation_id: &str, title: String) {
        let store = &self.inner.store;
        let record = match store.get_conversation(conversation_id).await {
            Ok(Some(mut record)) => {
                record.title = title;
                record.updated_at = unix_now();
                record
            }
            Ok(None) => {
                debug!(conv_id = %conversation_id, "Conversation is gone, skipping title");
                return;
            }
            Err(e) => {
                warn!(conv_id = %conversation_id, error = ?e, "Failed to load conversation for title");
                return;
            }
        };
        if let Err(e) = store.put_conversation(record).await {
            warn!(conv_id = %conversation_id, error = ?e, "Failed to save conversation title");
        }
    }

    /// Change the viewed conversation. In-flight sends keep streaming in the background.
    pub async fn switch_view(&self, conversation_id: Option<&str>) -> SwitchOutcome {
        let outcome = self.inner.coordinator.lock().switch_view(conversation_id);
        if let SwitchOutcome::NeedsLoad(ticket) = &outcome {
            self.load(ticket).await;
        }
        outcome
    }

    pub fn new_conversation(&self) {
        self.inner.coordinator.lock().switch_view(None);
    }

    /// Re-read the viewed conversation from storage, subject to the reconciliation guard.
    pub async fn refresh(&self) -> Option<ReadDecision> {
        let ticket = self.inner.coordinator.lock().begin_read()?;
        Some(self.load(&ticket).await)
    }

    async fn load(&self, ticket: &ReadTicket) -> ReadDecision {
        let result = self.inner.store.get_messages(&ticket.conversation_id).await;
        self.inner.coordinator.lock().apply_read(ticket, result)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.coordinator.lock().messages().to_vec()
    }

    pub fn viewed_conversation_id(&self) -> Option<ConversationId> {
        self.inner
            .coordinator
            .lock()
            .viewed_conversation_id()
            .map(str::to_string)
    }

    pub fn streaming_conversation_id(&self) -> Option<ConversationId> {
        self.inner
            .coordinator
            .lock()
            .streaming_conversation_id()
            .map(str::to_string)
    }

    pub fn is_loading(&self) -> bool {
        self.inner.coordinator.lock().is_loading()
    }

    pub fn error(&self) -> Option<SessionError> {
        self.inner.coordinator.lock().session().error().cloned()
    }

    pub fn stream_snapshot(&self, conversation_id: &str) -> Option<StreamUpdate> {
        self.inner.coordinator.lock().stream_snapshot(conversation_id)
    }

    pub fn subscribe<F>(&self, conversation_id: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&StreamUpdate) + Send + Sync + 'static,
    {
        self.inner
            .coordinator
            .lock()
            .subscribe(conversation_id, Arc::new(callback))
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.inner.coordinator.lock().unsubscribe(subscription)
    }

    /// Deliver any pending coalesced update now. Returns the number of callbacks run.
    pub fn flush_frame(&self) -> usize {
        let notifications = self.inner.coordinator.lock().flush_frame();
        let count = notifications.len();
        deliver(notifications);
        count
    }

    /// Renderer for content that may carry encrypted-attachment placeholders.
    pub fn placeholder_resolver(&self, resolver: Option<Arc<dyn ContentResolver>>) -> PlaceholderResolver {
        PlaceholderResolver::new(resolver, &self.inner.config)
    }

    pub async fn conversations(&self) -> EngineResult<Vec<ConversationRecord>> {
        Ok(self.inner.store.list_conversations().await?)
    }

    /// Delete a conversation. An in-flight send for it is cancelled without committing.
    pub async fn delete_conversation(&self, conversation_id: &str) -> EngineResult<()> {
        self.inner.coordinator.lock().forget_conversation(conversation_id);
        self.inner.store.delete_conversation(conversation_id).await?;
        info!(conv_id = %conversation_id, "Deleted conversation");
        Ok(())
    }

    /// Commit any in-flight response with its partial text, then cancel it.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let completion = {
            let mut coordinator = self.inner.coordinator.lock();
            let streaming = coordinator.streaming_conversation_id().map(str::to_string);
            match streaming {
                Some(id) => {
                    let cancel = coordinator.cancel_flag(&id);
                    let completion = coordinator.end_stream(&id, None, Some(SHUT_DOWN.to_string()));
                    if let Some(cancel) = cancel {
                        cancel.store(true, Ordering::Relaxed);
                    }
                    completion
                }
                None => None,
            }
        };

        if let Some(completion) = completion {
            info!(conv_id = %completion.conversation_id, "Committing partial response on shutdown");
            deliver(completion.notifications);
            commit_send(self.inner.clone(), completion.finalized).await?;
        }
        info!("Chat engine shut down");
        Ok(())
    }
}
