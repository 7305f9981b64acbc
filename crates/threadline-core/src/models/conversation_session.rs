use tracing::{debug, warn};

use super::message::{Attachment, ConversationId, Message, MessageId};
use crate::error::{EngineError, EngineResult};

/// Send lifecycle of a single conversation.
///
/// Any phase other than `Idle` holds the SendGuard: storage read-backs are
/// ignored and further submissions are rejected until the send is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    /// Optimistic messages inserted, no stream registered yet.
    Sending {
        user_message_id: MessageId,
        assistant_message_id: MessageId,
    },
    Streaming {
        user_message_id: MessageId,
        assistant_message_id: MessageId,
    },
    /// Final content written; durable commit still running.
    Committing {
        user_message_id: MessageId,
        assistant_message_id: MessageId,
    },
}

impl SendPhase {
    pub fn is_guarded(&self) -> bool {
        !matches!(self, SendPhase::Idle)
    }

    /// Whether the response itself is still being produced.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SendPhase::Sending { .. } | SendPhase::Streaming { .. })
    }

    pub fn assistant_message_id(&self) -> Option<&str> {
        match self {
            SendPhase::Idle => None,
            SendPhase::Sending {
                assistant_message_id,
                ..
            }
            | SendPhase::Streaming {
                assistant_message_id,
                ..
            }
            | SendPhase::Committing {
                assistant_message_id,
                ..
            } => Some(assistant_message_id),
        }
    }

    pub fn user_message_id(&self) -> Option<&str> {
        match self {
            SendPhase::Idle => None,
            SendPhase::Sending {
                user_message_id, ..
            }
            | SendPhase::Streaming {
                user_message_id, ..
            }
            | SendPhase::Committing {
                user_message_id, ..
            } => Some(user_message_id),
        }
    }
}

/// Error sentinel attached to the assistant message of a failed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub assistant_message_id: MessageId,
    pub message: String,
}

/// Returned by `submit` so the caller can correlate streaming with the placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// `None` while the conversation has not been persisted yet.
    pub conversation_id: Option<ConversationId>,
    pub user_message_id: MessageId,
    pub assistant_message_id: MessageId,
    pub is_first_message: bool,
    /// The submitted text, kept for deriving a title on the first message.
    pub text: String,
}

/// Messages produced by a finished send, ready to be appended to storage.
///
/// The owning session stays guarded until `release_commit` is called with
/// `assistant_message_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedSend {
    pub conversation_id: Option<ConversationId>,
    pub assistant_message_id: MessageId,
    pub messages: Vec<Message>,
}

/// In-memory message list and send state for one conversation.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    phase: SendPhase,
    error: Option<SessionError>,
}

impl ConversationSession {
    pub fn new(conversation_id: Option<ConversationId>) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            phase: SendPhase::Idle,
            error: None,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn phase(&self) -> &SendPhase {
        &self.phase
    }

    pub fn is_guarded(&self) -> bool {
        self.phase.is_guarded()
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    /// Whether this session owns the send identified by `assistant_message_id`.
    pub fn owns_send(&self, assistant_message_id: &str) -> bool {
        self.phase.assistant_message_id() == Some(assistant_message_id)
    }

    /// Optimistically insert the user message and an empty assistant reply.
    ///
    /// Synchronous and network-free. "First message" is decided from the
    /// in-memory list, never from storage, which may lag behind.
    pub fn submit(&mut self, text: &str, attachments: Vec<Attachment>) -> EngineResult<SubmitReceipt> {
        if self.is_guarded() {
            return Err(EngineError::ConcurrentSendRejected {
                conversation_id: self.conversation_id.clone().unwrap_or_default(),
            });
        }
        if text.trim().is_empty() && attachments.is_empty() {
            return Err(EngineError::EmptySubmission);
        }

        let is_first_message = !self.messages.iter().any(Message::is_user);
        let user = Message::user(text, attachments);
        let assistant = Message::assistant_placeholder();

        let receipt = SubmitReceipt {
            conversation_id: self.conversation_id.clone(),
            user_message_id: user.id.clone(),
            assistant_message_id: assistant.id.clone(),
            is_first_message,
            text: text.to_string(),
        };

        self.phase = SendPhase::Sending {
            user_message_id: user.id.clone(),
            assistant_message_id: assistant.id.clone(),
        };
        self.error = None;
        self.messages.push(user);
        self.messages.push(assistant);

        debug!(
            conv_id = ?self.conversation_id,
            assistant_message_id = %receipt.assistant_message_id,
            first = is_first_message,
            "Optimistic messages inserted"
        );

        Ok(receipt)
    }

    /// Bind an id obtained after the first persistence.
    pub fn assign_conversation_id(&mut self, conversation_id: ConversationId) {
        if let Some(existing) = &self.conversation_id
            && existing != &conversation_id
        {
            warn!(existing = %existing, new = %conversation_id, "Reassigning conversation id");
        }
        self.conversation_id = Some(conversation_id);
    }

    /// `Sending` -> `Streaming`. No-op when already streaming.
    pub fn mark_streaming(&mut self) -> bool {
        match std::mem::replace(&mut self.phase, SendPhase::Idle) {
            SendPhase::Sending {
                user_message_id,
                assistant_message_id,
            }
            | SendPhase::Streaming {
                user_message_id,
                assistant_message_id,
            } => {
                self.phase = SendPhase::Streaming {
                    user_message_id,
                    assistant_message_id,
                };
                true
            }
            other => {
                self.phase = other;
                false
            }
        }
    }

    /// Patch the live assistant placeholder with the latest accumulated content.
    ///
    /// Only the message designated by the current phase may be mutated.
    pub fn apply_stream_content(&mut self, assistant_message_id: &str, text: &str, reasoning: &str) -> bool {
        if !self.owns_send(assistant_message_id) {
            return false;
        }
        match self.messages.iter_mut().find(|m| m.id == assistant_message_id) {
            Some(message) => {
                message.set_streamed_content(text, reasoning);
                true
            }
            None => false,
        }
    }

    /// Write the final content and hand back the messages to commit.
    ///
    /// The session moves to `Committing` and keeps its guard until
    /// `release_commit`, so storage cannot be read back mid-commit. The
    /// placeholder is never dropped: on error it keeps whatever partial text
    /// arrived and the session carries an error sentinel pointing at it.
    pub fn finalize(&mut self, text: &str, reasoning: &str, error: Option<String>) -> Option<FinalizedSend> {
        let (user_message_id, assistant_message_id) = match &self.phase {
            SendPhase::Sending {
                user_message_id,
                assistant_message_id,
            }
            | SendPhase::Streaming {
                user_message_id,
                assistant_message_id,
            } => (user_message_id.clone(), assistant_message_id.clone()),
            SendPhase::Idle | SendPhase::Committing { .. } => return None,
        };

        self.apply_stream_content(&assistant_message_id, text, reasoning);
        self.error = error.map(|message| SessionError {
            assistant_message_id: assistant_message_id.clone(),
            message,
        });

        let messages = self
            .messages
            .iter()
            .filter(|m| m.id == assistant_message_id || m.id == user_message_id)
            .cloned()
            .collect();

        self.phase = SendPhase::Committing {
            user_message_id,
            assistant_message_id: assistant_message_id.clone(),
        };

        Some(FinalizedSend {
            conversation_id: self.conversation_id.clone(),
            assistant_message_id,
            messages,
        })
    }

    /// `Committing` -> `Idle` for the given send. Releases the guard.
    pub fn release_commit(&mut self, assistant_message_id: &str) -> bool {
        match &self.phase {
            SendPhase::Committing {
                assistant_message_id: committing,
                ..
            } if committing == assistant_message_id => {
                self.phase = SendPhase::Idle;
                true
            }
            _ => false,
        }
    }

    /// Replace the message list with an authoritative storage snapshot.
    pub(crate) fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Messages to send as history for the given send, excluding its placeholder.
    pub fn history_for(&self, assistant_message_id: &str) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.id != assistant_message_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_inserts_user_and_placeholder() {
        let mut session = ConversationSession::new(Some("conv-1".to_string()));
        let receipt = session.submit("Hello", Vec::new()).unwrap();

        assert!(receipt.is_first_message);
        assert!(session.is_guarded());
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.messages()[0].text(), "Hello");
        assert_eq!(session.messages()[1].text(), "");
        assert_eq!(session.messages()[1].id, receipt.assistant_message_id);
    }

    #[test]
    fn test_second_submit_rejected_while_guarded() {
        let mut session = ConversationSession::new(Some("conv-1".to_string()));
        session.submit("one", Vec::new()).unwrap();

        let err = session.submit("two", Vec::new()).unwrap_err();
        assert!(matches!(err, EngineError::ConcurrentSendRejected { conversation_id } if conversation_id == "conv-1"));
        assert_eq!(session.messages().len(), 2);
    }

    #[test]
    fn test_empty_submission_rejected() {
        let mut session = ConversationSession::new(None);
        assert!(matches!(
            session.submit("   ", Vec::new()),
            Err(EngineError::EmptySubmission)
        ));
        assert!(!session.is_guarded());
    }

    #[test]
    fn test_first_message_detected_from_memory() {
        let mut session = ConversationSession::new(Some("conv-1".to_string()));
        let first = session.submit("one", Vec::new()).unwrap();
        session.finalize("reply", "", None);
        session.release_commit(&first.assistant_message_id);
        let second = session.submit("two", Vec::new()).unwrap();

        assert!(first.is_first_message);
        assert!(!second.is_first_message);
    }

    #[test]
    fn test_finalize_returns_pair_and_holds_guard_until_commit() {
        let mut session = ConversationSession::new(Some("conv-1".to_string()));
        let receipt = session.submit("Hello", Vec::new()).unwrap();
        session.mark_streaming();

        let finalized = session.finalize("Hi there!", "", None).unwrap();

        assert!(session.is_guarded());
        assert!(!session.phase().is_in_flight());
        assert!(session.release_commit(&finalized.assistant_message_id));
        assert!(!session.is_guarded());
        assert_eq!(finalized.messages.len(), 2);
        assert_eq!(finalized.messages[0].id, receipt.user_message_id);
        assert_eq!(finalized.messages[1].text(), "Hi there!");
        assert!(session.error().is_none());
    }

    #[test]
    fn test_finalize_with_error_keeps_partial_text() {
        let mut session = ConversationSession::new(Some("conv-1".to_string()));
        let receipt = session.submit("Hello", Vec::new()).unwrap();
        session.apply_stream_content(&receipt.assistant_message_id, "Hi th", "");

        session.finalize("Hi th", "", Some("connection reset".to_string()));

        assert_eq!(session.messages()[1].text(), "Hi th");
        let error = session.error().unwrap();
        assert_eq!(error.assistant_message_id, receipt.assistant_message_id);
        assert_eq!(error.message, "connection reset");
    }

    #[test]
    fn test_user_message_is_not_patchable() {
        let mut session = ConversationSession::new(None);
        let receipt = session.submit("Hello", Vec::new()).unwrap();

        assert!(!session.apply_stream_content(&receipt.user_message_id, "oops", ""));
        assert_eq!(session.messages()[0].text(), "Hello");
    }

    #[test]
    fn test_guard_held_until_commit_released() {
        let mut session = ConversationSession::new(Some("conv-1".to_string()));
        let receipt = session.submit("Hello", Vec::new()).unwrap();
        session.finalize("Hi", "", None).unwrap();

        assert!(session.finalize("again", "", None).is_none());
        assert!(matches!(
            session.submit("too soon", Vec::new()),
            Err(EngineError::ConcurrentSendRejected { .. })
        ));
        assert!(!session.release_commit(&receipt.user_message_id));

        assert!(session.release_commit(&receipt.assistant_message_id));
        assert!(!session.release_commit(&receipt.assistant_message_id));
        assert!(session.submit("now", Vec::new()).is_ok());
    }

    #[test]
    fn test_finalize_without_send_is_none() {
        let mut session = ConversationSession::new(None);
        assert!(session.finalize("x", "", None).is_none());
    }
}
