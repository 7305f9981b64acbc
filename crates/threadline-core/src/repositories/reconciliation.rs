use crate::models::{ConversationId, ConversationSession, Message};

/// Captured when a storage read is initiated, so the result can be checked
/// against the view state at the time it resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTicket {
    pub conversation_id: ConversationId,
    pub generation: u64,
}

/// What to do with a storage read-back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDecision {
    Apply,
    /// The viewed conversation changed while the read was in flight.
    DiscardStale,
    /// A send is in flight; storage may be behind the in-memory list.
    DiscardGuarded,
    /// Storage returned nothing while memory holds messages: not persisted yet.
    DiscardEmpty,
}

impl ReadDecision {
    pub fn is_applied(self) -> bool {
        self == ReadDecision::Apply
    }
}

/// Decide whether a read-back may replace the session's in-memory messages.
///
/// The in-memory list always wins over an empty storage snapshot.
pub fn evaluate_read(
    ticket: &ReadTicket,
    current_generation: u64,
    session: &ConversationSession,
    incoming: &[Message],
) -> ReadDecision {
    if ticket.generation != current_generation
        || session.conversation_id() != Some(ticket.conversation_id.as_str())
    {
        return ReadDecision::DiscardStale;
    }
    if session.is_guarded() {
        return ReadDecision::DiscardGuarded;
    }
    if incoming.is_empty() && !session.messages().is_empty() {
        return ReadDecision::DiscardEmpty;
    }
    ReadDecision::Apply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket(id: &str, generation: u64) -> ReadTicket {
        ReadTicket {
            conversation_id: id.to_string(),
            generation,
        }
    }

    #[test]
    fn test_applies_fresh_read() {
        let session = ConversationSession::new(Some("a".to_string()));
        let incoming = vec![Message::user("hi", Vec::new())];

        assert_eq!(
            evaluate_read(&ticket("a", 3), 3, &session, &incoming),
            ReadDecision::Apply
        );
    }

    #[test]
    fn test_discards_read_after_view_change() {
        let session = ConversationSession::new(Some("b".to_string()));
        let incoming = vec![Message::user("hi", Vec::new())];

        assert_eq!(
            evaluate_read(&ticket("a", 3), 4, &session, &incoming),
            ReadDecision::DiscardStale
        );
        assert_eq!(
            evaluate_read(&ticket("a", 4), 4, &session, &incoming),
            ReadDecision::DiscardStale
        );
    }

    #[test]
    fn test_discards_read_while_guarded() {
        let mut session = ConversationSession::new(Some("a".to_string()));
        session.submit("hello", Vec::new()).unwrap();
        let incoming = vec![Message::user("hello", Vec::new())];

        assert_eq!(
            evaluate_read(&ticket("a", 1), 1, &session, &incoming),
            ReadDecision::DiscardGuarded
        );
    }

    #[test]
    fn test_empty_read_never_clobbers_memory() {
        let mut session = ConversationSession::new(Some("a".to_string()));
        let receipt = session.submit("hello", Vec::new()).unwrap();
        session.finalize("reply", "", None);
        session.release_commit(&receipt.assistant_message_id);

        assert_eq!(
            evaluate_read(&ticket("a", 1), 1, &session, &[]),
            ReadDecision::DiscardEmpty
        );
    }

    #[test]
    fn test_empty_read_onto_empty_session_applies() {
        let session = ConversationSession::new(Some("a".to_string()));
        assert!(evaluate_read(&ticket("a", 0), 0, &session, &[]).is_applied());
    }
}
