use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{debug, warn};

use super::conversation_session::{ConversationSession, FinalizedSend, SubmitReceipt};
use super::message::{Attachment, ConversationId, Message};
use super::stream_buffer::{StreamBuffer, StreamUpdate};
use crate::error::{EngineError, EngineResult};
use crate::repositories::{ReadDecision, ReadTicket, StoreResult, evaluate_read};
use crate::services::StreamChunk;

pub type UpdateCallback = Arc<dyn Fn(&StreamUpdate) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A subscriber callback paired with the update it should receive.
///
/// Collected under the coordinator's lock and delivered after it is released,
/// so callbacks may call back into the engine.
pub struct Notification {
    callback: UpdateCallback,
    update: StreamUpdate,
}

impl Notification {
    pub fn update(&self) -> &StreamUpdate {
        &self.update
    }

    pub fn deliver(self) {
        (self.callback)(&self.update);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// Already viewing this conversation.
    Unchanged,
    /// Fresh unassigned conversation; nothing to load.
    Fresh,
    /// In-flight state restored from the switch cache.
    Restored { conversation_id: ConversationId },
    /// Caller must read the conversation from storage and hand it to `apply_read`.
    NeedsLoad(ReadTicket),
}

/// Result of finalizing a stream.
pub struct StreamCompletion {
    pub conversation_id: ConversationId,
    pub finalized: FinalizedSend,
    pub notifications: Vec<Notification>,
}

/// Single authority for what is streaming and what is viewed.
///
/// Owns the viewed conversation's session, the one streaming slot, and a cache
/// of sessions with a send in flight that the user navigated away from. A
/// session lives in exactly one place at a time (viewed, cached, or parked), so
/// there is one writer per message list.
pub struct StreamCoordinator {
    session: ConversationSession,
    streaming: Option<StreamBuffer>,
    cache: HashMap<ConversationId, ConversationSession>,
    /// Unassigned session with a send in flight, waiting for its id.
    parked: Option<ConversationSession>,
    subscribers: HashMap<ConversationId, Vec<(SubscriptionId, UpdateCallback)>>,
    next_subscription: u64,
    view_generation: u64,
}

impl StreamCoordinator {
    pub fn new() -> Self {
        Self {
            session: ConversationSession::new(None),
            streaming: None,
            cache: HashMap::new(),
            parked: None,
            subscribers: HashMap::new(),
            next_subscription: 0,
            view_generation: 0,
        }
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    pub fn viewed_conversation_id(&self) -> Option<&str> {
        self.session.conversation_id()
    }

    pub fn streaming_conversation_id(&self) -> Option<&str> {
        self.streaming.as_ref().map(StreamBuffer::conversation_id)
    }

    pub fn messages(&self) -> &[Message] {
        self.session.messages()
    }

    /// True while the viewed conversation's response is still being produced.
    ///
    /// A send whose reply is final but not yet committed is guarded without loading.
    pub fn is_loading(&self) -> bool {
        self.session.phase().is_in_flight()
            || (self.viewed_conversation_id().is_some()
                && self.viewed_conversation_id() == self.streaming_conversation_id())
    }

    pub fn is_cached(&self, conversation_id: &str) -> bool {
        self.cache.contains_key(conversation_id)
    }

    pub fn stream_snapshot(&self, conversation_id: &str) -> Option<StreamUpdate> {
        self.streaming
            .as_ref()
            .filter(|buffer| buffer.conversation_id() == conversation_id)
            .map(|buffer| buffer.snapshot(false))
    }

    pub fn cancel_flag(&self, conversation_id: &str) -> Option<Arc<AtomicBool>> {
        self.streaming
            .as_ref()
            .filter(|buffer| buffer.conversation_id() == conversation_id)
            .map(StreamBuffer::cancel_flag)
    }

    /// Optimistic submit into the viewed session.
    ///
    /// Rejected while any send is in flight, viewed or not.
    pub fn submit(&mut self, text: &str, attachments: Vec<Attachment>) -> EngineResult<SubmitReceipt> {
        if let Some(busy) = self.send_in_flight_elsewhere() {
            debug!(busy = %busy, "Rejecting submit while another send is in flight");
            return Err(EngineError::ConcurrentSendRejected {
                conversation_id: busy,
            });
        }
        self.session.submit(text, attachments)
    }

    fn send_in_flight_elsewhere(&self) -> Option<ConversationId> {
        if let Some(streaming_id) = self.streaming_conversation_id()
            && Some(streaming_id) != self.viewed_conversation_id()
        {
            return Some(streaming_id.to_string());
        }
        // Cached sessions always hold a guard until their commit is released;
        // an unassigned parked send has no id yet.
        self.cache
            .keys()
            .next()
            .cloned()
            .or_else(|| self.parked.as_ref().map(|_| String::new()))
    }

    /// Bind a freshly obtained id to the unassigned session that owns the send.
    ///
    /// If the user navigated away in the meantime, the parked session is
    /// promoted into the cache under its new id.
    pub fn assign_conversation_id(&mut self, assistant_message_id: &str, conversation_id: &str) -> bool {
        if self.session.owns_send(assistant_message_id) {
            self.session.assign_conversation_id(conversation_id.to_string());
            return true;
        }

        match self.parked.take() {
            Some(mut parked) if parked.owns_send(assistant_message_id) => {
                debug!(conv_id = %conversation_id, "Promoting parked session to conversation");
                parked.assign_conversation_id(conversation_id.to_string());
                self.cache.insert(conversation_id.to_string(), parked);
                true
            }
            other => {
                self.parked = other;
                warn!(conv_id = %conversation_id, "No pending send to assign conversation id to");
                false
            }
        }
    }

    /// Register `conversation_id` as the streaming conversation.
    ///
    /// Idempotent for the conversation already streaming; rejected while a
    /// different conversation holds the slot. Returns the stream's cancel flag.
    pub fn begin_stream(
        &mut self,
        conversation_id: &str,
        assistant_message_id: &str,
    ) -> EngineResult<Arc<AtomicBool>> {
        if let Some(existing) = &self.streaming {
            if existing.conversation_id() == conversation_id {
                if existing.assistant_message_id() != assistant_message_id {
                    warn!(
                        conv_id = %conversation_id,
                        live = %existing.assistant_message_id(),
                        requested = %assistant_message_id,
                        "Ignoring second placeholder for a streaming conversation"
                    );
                }
                return Ok(existing.cancel_flag());
            }
            return Err(EngineError::ConcurrentSendRejected {
                conversation_id: existing.conversation_id().to_string(),
            });
        }

        let Some(owner) = self.owner_mut(conversation_id) else {
            return Err(EngineError::UnknownSend {
                assistant_message_id: assistant_message_id.to_string(),
            });
        };
        if !owner.owns_send(assistant_message_id) {
            return Err(EngineError::UnknownSend {
                assistant_message_id: assistant_message_id.to_string(),
            });
        }
        owner.mark_streaming();

        let buffer = StreamBuffer::new(conversation_id.to_string(), assistant_message_id.to_string());
        let cancel_flag = buffer.cancel_flag();
        self.streaming = Some(buffer);
        debug!(conv_id = %conversation_id, "Stream started");
        Ok(cancel_flag)
    }

    /// Append a chunk to the streaming conversation's accumulator.
    ///
    /// The viewed session's placeholder is patched right away; subscribers are
    /// only told on the next `flush_frame`. Unviewed streams accumulate silently.
    pub fn on_chunk(&mut self, conversation_id: &str, chunk: &StreamChunk) -> bool {
        let Some(buffer) = self
            .streaming
            .as_mut()
            .filter(|buffer| buffer.conversation_id() == conversation_id)
        else {
            debug!(conv_id = %conversation_id, "Dropping chunk for a conversation that is not streaming");
            return false;
        };
        if buffer.is_cancelled() {
            return false;
        }

        buffer.push(chunk);

        if self.session.conversation_id() == Some(conversation_id) {
            self.session.apply_stream_content(
                buffer.assistant_message_id(),
                buffer.text(),
                buffer.reasoning(),
            );
        }
        true
    }

    /// Collect at most one notification per subscriber of the viewed streaming conversation.
    pub fn flush_frame(&mut self) -> Vec<Notification> {
        let Some(buffer) = self.streaming.as_mut() else {
            return Vec::new();
        };
        if self.session.conversation_id() != Some(buffer.conversation_id()) || !buffer.take_dirty() {
            return Vec::new();
        }

        let update = buffer.snapshot(false);
        Self::notifications_for(&self.subscribers, update)
    }

    fn notifications_for(
        subscribers: &HashMap<ConversationId, Vec<(SubscriptionId, UpdateCallback)>>,
        update: StreamUpdate,
    ) -> Vec<Notification> {
        subscribers
            .get(&update.conversation_id)
            .map(|subs| {
                subs.iter()
                    .map(|(_, callback)| Notification {
                        callback: callback.clone(),
                        update: update.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Change the viewed conversation. `None` opens a fresh, unassigned conversation.
    pub fn switch_view(&mut self, conversation_id: Option<&str>) -> SwitchOutcome {
        if conversation_id.is_some() && self.session.conversation_id() == conversation_id {
            return SwitchOutcome::Unchanged;
        }

        let next = ConversationSession::new(conversation_id.map(str::to_string));
        let previous = std::mem::replace(&mut self.session, next);
        self.view_generation += 1;

        if previous.is_guarded() {
            match previous.conversation_id() {
                Some(id) => {
                    debug!(conv_id = %id, "Caching in-flight conversation on switch");
                    self.cache.insert(id.to_string(), previous);
                }
                None => {
                    debug!("Parking unassigned in-flight conversation on switch");
                    self.parked = Some(previous);
                }
            }
        }

        let Some(target) = conversation_id else {
            return SwitchOutcome::Fresh;
        };

        match self.cache.remove(target) {
            Some(mut cached) => {
                // Accumulation never paused while unviewed; catch the placeholder up.
                if let Some(buffer) = self
                    .streaming
                    .as_mut()
                    .filter(|buffer| buffer.conversation_id() == target)
                {
                    cached.apply_stream_content(
                        buffer.assistant_message_id(),
                        buffer.text(),
                        buffer.reasoning(),
                    );
                    buffer.mark_dirty();
                }
                self.session = cached;
                debug!(conv_id = %target, "Restored in-flight conversation from cache");
                SwitchOutcome::Restored {
                    conversation_id: target.to_string(),
                }
            }
            None => SwitchOutcome::NeedsLoad(ReadTicket {
                conversation_id: target.to_string(),
                generation: self.view_generation,
            }),
        }
    }

    /// Ticket for re-reading the viewed conversation from storage.
    pub fn begin_read(&self) -> Option<ReadTicket> {
        self.session.conversation_id().map(|id| ReadTicket {
            conversation_id: id.to_string(),
            generation: self.view_generation,
        })
    }

    /// Apply a storage read-back if the reconciliation guard allows it.
    ///
    /// Read errors are treated as "no messages yet".
    pub fn apply_read(&mut self, ticket: &ReadTicket, result: StoreResult<Vec<Message>>) -> ReadDecision {
        let messages = result.unwrap_or_else(|e| {
            warn!(conv_id = %ticket.conversation_id, error = ?e, "Failed to load messages, treating as empty");
            Vec::new()
        });

        let decision = evaluate_read(ticket, self.view_generation, &self.session, &messages);
        if decision.is_applied() {
            self.session.replace_messages(messages);
        } else {
            debug!(conv_id = %ticket.conversation_id, ?decision, "Discarded storage read-back");
        }
        decision
    }

    /// Finalize the stream for `conversation_id`.
    ///
    /// `final_text` of `None` keeps whatever accumulated. Works whether the
    /// conversation is viewed or cached. The streaming slot is cleared, but the
    /// owning session stays guarded (and cached, if unviewed) until
    /// `finish_commit`.
    pub fn end_stream(
        &mut self,
        conversation_id: &str,
        final_text: Option<String>,
        error: Option<String>,
    ) -> Option<StreamCompletion> {
        let buffer = match self.streaming.take() {
            Some(buffer) if buffer.conversation_id() == conversation_id => buffer,
            other => {
                self.streaming = other;
                warn!(conv_id = %conversation_id, "end_stream called but no stream found");
                return None;
            }
        };

        let text = final_text.unwrap_or_else(|| buffer.text().to_string());
        let viewed = self.session.conversation_id() == Some(conversation_id);

        let finalized = if viewed {
            self.session.finalize(&text, buffer.reasoning(), error)
        } else {
            self.cache
                .get_mut(conversation_id)
                .and_then(|cached| cached.finalize(&text, buffer.reasoning(), error))
        };

        let Some(finalized) = finalized else {
            warn!(conv_id = %conversation_id, "Streaming conversation had no owning session");
            return None;
        };

        debug!(
            conv_id = %conversation_id,
            chunks = buffer.chunk_count(),
            elapsed_ms = buffer.elapsed_ms(),
            viewed,
            "Stream ended"
        );

        let notifications = if viewed {
            let mut update = buffer.snapshot(true);
            update.text = text;
            Self::notifications_for(&self.subscribers, update)
        } else {
            Vec::new()
        };

        Some(StreamCompletion {
            conversation_id: conversation_id.to_string(),
            finalized,
            notifications,
        })
    }

    /// Finalize a send that failed before any stream was registered.
    ///
    /// Like `end_stream`, the session stays guarded until `finish_commit`.
    pub fn fail_send(&mut self, assistant_message_id: &str, error: String) -> Option<FinalizedSend> {
        self.sender_mut(assistant_message_id)?.finalize("", "", Some(error))
    }

    /// Release the guard held by a finalized send once its commit has resolved.
    ///
    /// An unviewed owner leaves the cache, or the parked slot, for good.
    pub fn finish_commit(&mut self, assistant_message_id: &str) -> bool {
        if self.session.owns_send(assistant_message_id) {
            return self.session.release_commit(assistant_message_id);
        }
        let committing = |session: &ConversationSession| {
            session.owns_send(assistant_message_id) && !session.phase().is_in_flight()
        };
        if self.parked.as_ref().is_some_and(committing) {
            self.parked = None;
            return true;
        }
        let Some(key) = self
            .cache
            .iter()
            .find(|(_, cached)| committing(*cached))
            .map(|(id, _)| id.clone())
        else {
            debug!(assistant_id = %assistant_message_id, "No committing send to release");
            return false;
        };
        self.cache.remove(&key);
        debug!(conv_id = %key, "Released cached conversation after commit");
        true
    }

    fn sender_mut(&mut self, assistant_message_id: &str) -> Option<&mut ConversationSession> {
        if self.session.owns_send(assistant_message_id) {
            return Some(&mut self.session);
        }
        if self
            .parked
            .as_ref()
            .is_some_and(|parked| parked.owns_send(assistant_message_id))
        {
            return self.parked.as_mut();
        }
        self.cache
            .values_mut()
            .find(|cached| cached.owns_send(assistant_message_id))
    }

    /// Abandon the stream for `conversation_id` without committing.
    ///
    /// Sets the cancel flag so the send loop stops resubmitting.
    pub fn cancel_stream(&mut self, conversation_id: &str) -> bool {
        let buffer = match self.streaming.take() {
            Some(buffer) if buffer.conversation_id() == conversation_id => buffer,
            other => {
                self.streaming = other;
                return false;
            }
        };
        buffer.cancel();

        if self.session.conversation_id() == Some(conversation_id) {
            self.session.finalize(buffer.text(), buffer.reasoning(), None);
            self.session.release_commit(buffer.assistant_message_id());
        }
        self.cache.remove(conversation_id);
        debug!(conv_id = %conversation_id, "Stream cancelled");
        true
    }

    /// Drop all ephemeral state for a conversation that no longer exists.
    pub fn forget_conversation(&mut self, conversation_id: &str) {
        self.cancel_stream(conversation_id);
        if self.session.conversation_id() == Some(conversation_id) {
            self.switch_view(None);
        }
        // A pending send that never reached the stream is still guarded and
        // may have been cached by the switch above.
        self.cache.remove(conversation_id);
        self.subscribers.remove(conversation_id);
    }

    pub fn subscribe(&mut self, conversation_id: &str, callback: UpdateCallback) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.subscribers
            .entry(conversation_id.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    pub fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool {
        let mut removed = false;
        self.subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|(id, _)| *id != subscription);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    pub fn subscriber_count(&self, conversation_id: &str) -> usize {
        self.subscribers.get(conversation_id).map_or(0, Vec::len)
    }

    fn owner_mut(&mut self, conversation_id: &str) -> Option<&mut ConversationSession> {
        if self.session.conversation_id() == Some(conversation_id) {
            Some(&mut self.session)
        } else {
            self.cache.get_mut(conversation_id)
        }
    }

    /// History to send for `conversation_id`, excluding the live placeholder.
    pub fn history_for(&self, conversation_id: &str, assistant_message_id: &str) -> Vec<Message> {
        if self.session.conversation_id() == Some(conversation_id) {
            self.session.history_for(assistant_message_id)
        } else {
            self.cache
                .get(conversation_id)
                .map(|cached| cached.history_for(assistant_message_id))
                .unwrap_or_default()
        }
    }
}

impl Default for StreamCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn text(chunk: &str) -> StreamChunk {
        StreamChunk::Text(chunk.to_string())
    }

    fn recorder() -> (UpdateCallback, Arc<Mutex<Vec<StreamUpdate>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: UpdateCallback = Arc::new(move |update: &StreamUpdate| {
            sink.lock().push(update.clone());
        });
        (callback, seen)
    }

    fn deliver(notifications: Vec<Notification>) {
        notifications.into_iter().for_each(Notification::deliver);
    }

    /// View `id`, submit `prompt`, and begin streaming. Returns the assistant id.
    fn start_send(coordinator: &mut StreamCoordinator, id: &str, prompt: &str) -> String {
        if let SwitchOutcome::NeedsLoad(ticket) = coordinator.switch_view(Some(id)) {
            coordinator.apply_read(&ticket, Ok(Vec::new()));
        }
        let receipt = coordinator.submit(prompt, Vec::new()).unwrap();
        coordinator
            .begin_stream(id, &receipt.assistant_message_id)
            .unwrap();
        receipt.assistant_message_id
    }

    #[test]
    fn test_hello_scenario_accumulates_and_finalizes() {
        let mut coordinator = StreamCoordinator::new();
        start_send(&mut coordinator, "conv-1", "Hello");

        let texts: Vec<String> = coordinator.messages().iter().map(Message::text).collect();
        assert_eq!(texts, vec!["Hello", ""]);

        for chunk in ["Hi", " there", "!"] {
            coordinator.on_chunk("conv-1", &text(chunk));
        }
        assert_eq!(coordinator.stream_snapshot("conv-1").unwrap().text, "Hi there!");

        let completion = coordinator.end_stream("conv-1", None, None).unwrap();
        let assistant = &completion.finalized.messages[1];
        assert_eq!(
            assistant.parts,
            vec![crate::models::MessagePart::Text {
                text: "Hi there!".to_string()
            }]
        );
        assert!(coordinator.streaming_conversation_id().is_none());
        assert!(!coordinator.is_loading());
        assert!(coordinator.session().is_guarded());

        assert!(coordinator.finish_commit(&completion.finalized.assistant_message_id));
        assert!(!coordinator.session().is_guarded());
    }

    #[test]
    fn test_switch_and_return_restores_accumulated_text() {
        let mut coordinator = StreamCoordinator::new();
        start_send(&mut coordinator, "a", "question");

        coordinator.on_chunk("a", &text("T1 "));
        assert!(matches!(
            coordinator.switch_view(Some("b")),
            SwitchOutcome::NeedsLoad(_)
        ));
        assert!(coordinator.is_cached("a"));
        assert!(!coordinator.is_loading());

        coordinator.on_chunk("a", &text("T2"));

        assert_eq!(
            coordinator.switch_view(Some("a")),
            SwitchOutcome::Restored {
                conversation_id: "a".to_string()
            }
        );
        assert_eq!(coordinator.messages()[1].text(), "T1 T2");
        assert!(coordinator.is_loading());
        assert!(!coordinator.is_cached("a"));
    }

    #[test]
    fn test_chunks_never_reach_other_conversation_subscribers() {
        let mut coordinator = StreamCoordinator::new();
        let (a_callback, a_seen) = recorder();
        let (b_callback, b_seen) = recorder();
        coordinator.subscribe("a", a_callback);
        coordinator.subscribe("b", b_callback);

        start_send(&mut coordinator, "a", "q");
        coordinator.on_chunk("a", &text("x"));
        deliver(coordinator.flush_frame());

        coordinator.switch_view(Some("b"));
        coordinator.on_chunk("a", &text("y"));
        deliver(coordinator.flush_frame());

        assert!(b_seen.lock().is_empty());
        let a_updates = a_seen.lock();
        assert_eq!(a_updates.len(), 1);
        assert_eq!(a_updates[0].text, "x");
    }

    #[test]
    fn test_notifications_coalesce_per_frame() {
        let mut coordinator = StreamCoordinator::new();
        let (callback, seen) = recorder();
        coordinator.subscribe("a", callback);
        start_send(&mut coordinator, "a", "q");

        for chunk in ["1", "2", "3"] {
            coordinator.on_chunk("a", &text(chunk));
        }
        deliver(coordinator.flush_frame());
        deliver(coordinator.flush_frame());

        let updates = seen.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].text, "123");
    }

    #[test]
    fn test_return_to_stream_resumes_fan_out() {
        let mut coordinator = StreamCoordinator::new();
        let (callback, seen) = recorder();
        coordinator.subscribe("a", callback);
        start_send(&mut coordinator, "a", "q");

        coordinator.switch_view(Some("b"));
        coordinator.on_chunk("a", &text("abc"));
        coordinator.switch_view(Some("a"));
        deliver(coordinator.flush_frame());

        assert_eq!(seen.lock().last().unwrap().text, "abc");
    }

    #[test]
    fn test_end_stream_while_unviewed_finalizes_cached_list() {
        let mut coordinator = StreamCoordinator::new();
        start_send(&mut coordinator, "a", "q");
        coordinator.on_chunk("a", &text("partial"));
        coordinator.switch_view(Some("b"));

        let completion = coordinator
            .end_stream("a", None, Some("connection reset".to_string()))
            .unwrap();

        assert_eq!(completion.finalized.messages[1].text(), "partial");
        assert!(completion.notifications.is_empty());
        assert_eq!(coordinator.viewed_conversation_id(), Some("b"));

        // Still cached until the commit resolves.
        assert!(coordinator.is_cached("a"));
        assert!(coordinator.finish_commit(&completion.finalized.assistant_message_id));
        assert!(!coordinator.is_cached("a"));
    }

    #[test]
    fn test_return_during_commit_restores_final_reply() {
        let mut coordinator = StreamCoordinator::new();
        let assistant_id = start_send(&mut coordinator, "a", "q");
        coordinator.on_chunk("a", &text("done"));
        coordinator.switch_view(Some("b"));
        coordinator.end_stream("a", None, None).unwrap();

        assert_eq!(
            coordinator.switch_view(Some("a")),
            SwitchOutcome::Restored {
                conversation_id: "a".to_string()
            }
        );
        assert_eq!(coordinator.messages()[1].text(), "done");
        assert!(!coordinator.is_loading());

        let ticket = coordinator.begin_read().unwrap();
        let truncated = vec![Message::user("q", Vec::new())];
        assert_eq!(
            coordinator.apply_read(&ticket, Ok(truncated)),
            ReadDecision::DiscardGuarded
        );
        assert_eq!(coordinator.messages()[1].text(), "done");

        assert!(coordinator.finish_commit(&assistant_id));
        assert!(!coordinator.session().is_guarded());
    }

    #[test]
    fn test_begin_stream_is_idempotent_and_exclusive() {
        let mut coordinator = StreamCoordinator::new();
        let assistant_id = start_send(&mut coordinator, "a", "q");

        assert!(coordinator.begin_stream("a", &assistant_id).is_ok());

        coordinator.switch_view(Some("b"));
        assert!(matches!(
            coordinator.submit("another", Vec::new()),
            Err(EngineError::ConcurrentSendRejected { conversation_id }) if conversation_id == "a"
        ));
        assert!(coordinator.begin_stream("b", "whatever").is_err());
    }

    #[test]
    fn test_submit_rejected_while_unstreamed_send_is_cached() {
        let mut coordinator = StreamCoordinator::new();
        coordinator.switch_view(Some("a"));
        coordinator.submit("q", Vec::new()).unwrap();
        coordinator.switch_view(Some("b"));

        assert!(matches!(
            coordinator.submit("other", Vec::new()),
            Err(EngineError::ConcurrentSendRejected { conversation_id }) if conversation_id == "a"
        ));
        assert!(coordinator.messages().is_empty());
    }

    #[test]
    fn test_fail_send_releases_cached_session() {
        let mut coordinator = StreamCoordinator::new();
        coordinator.switch_view(Some("a"));
        let receipt = coordinator.submit("q", Vec::new()).unwrap();
        coordinator.switch_view(Some("b"));

        let failed = coordinator
            .fail_send(&receipt.assistant_message_id, "store offline".to_string())
            .unwrap();

        assert_eq!(failed.messages.len(), 2);
        assert!(coordinator.submit("too soon", Vec::new()).is_err());

        assert!(coordinator.finish_commit(&receipt.assistant_message_id));
        assert!(!coordinator.is_cached("a"));
        assert!(coordinator.submit("now allowed", Vec::new()).is_ok());
    }

    #[test]
    fn test_storage_read_ignored_while_guarded() {
        let mut coordinator = StreamCoordinator::new();
        start_send(&mut coordinator, "a", "q");
        let ticket = coordinator.begin_read().unwrap();

        let decision = coordinator.apply_read(&ticket, Ok(Vec::new()));

        assert_eq!(decision, ReadDecision::DiscardGuarded);
        assert_eq!(coordinator.messages().len(), 2);
    }

    #[test]
    fn test_stale_read_discarded_after_switch() {
        let mut coordinator = StreamCoordinator::new();
        let SwitchOutcome::NeedsLoad(ticket) = coordinator.switch_view(Some("a")) else {
            panic!("expected a load");
        };
        coordinator.switch_view(Some("b"));

        let decision = coordinator.apply_read(&ticket, Ok(vec![Message::user("old", Vec::new())]));

        assert_eq!(decision, ReadDecision::DiscardStale);
        assert!(coordinator.messages().is_empty());
    }

    #[test]
    fn test_unassigned_send_promoted_after_switch() {
        let mut coordinator = StreamCoordinator::new();
        let receipt = coordinator.submit("hi", Vec::new()).unwrap();
        assert!(receipt.conversation_id.is_none());

        coordinator.switch_view(Some("b"));
        assert!(coordinator.assign_conversation_id(&receipt.assistant_message_id, "new-conv"));
        assert!(coordinator.is_cached("new-conv"));

        coordinator
            .begin_stream("new-conv", &receipt.assistant_message_id)
            .unwrap();
        coordinator.on_chunk("new-conv", &text("hello"));
        coordinator.switch_view(Some("new-conv"));

        assert_eq!(coordinator.messages()[0].text(), "hi");
        assert_eq!(coordinator.messages()[1].text(), "hello");
    }

    #[test]
    fn test_cancel_stream_drops_chunks_and_releases_guard() {
        let mut coordinator = StreamCoordinator::new();
        start_send(&mut coordinator, "a", "q");
        let flag = coordinator.cancel_flag("a").unwrap();

        assert!(coordinator.cancel_stream("a"));
        assert!(flag.load(std::sync::atomic::Ordering::Relaxed));
        assert!(!coordinator.on_chunk("a", &text("late")));
        assert!(!coordinator.is_loading());
        assert!(!coordinator.session().is_guarded());
        assert!(coordinator.end_stream("a", None, None).is_none());
    }

    #[test]
    fn test_unsubscribe_removes_callback() {
        let mut coordinator = StreamCoordinator::new();
        let (callback, seen) = recorder();
        let subscription = coordinator.subscribe("a", callback);
        assert!(coordinator.unsubscribe(subscription));
        assert!(!coordinator.unsubscribe(subscription));
        assert_eq!(coordinator.subscriber_count("a"), 0);

        start_send(&mut coordinator, "a", "q");
        coordinator.on_chunk("a", &text("x"));
        deliver(coordinator.flush_frame());
        assert!(seen.lock().is_empty());
    }
}
