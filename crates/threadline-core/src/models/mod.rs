pub mod conversation_session;
pub mod message;
pub mod stream_buffer;
pub mod stream_coordinator;

pub use conversation_session::{
    ConversationSession, FinalizedSend, SendPhase, SessionError, SubmitReceipt,
};
pub use message::{Attachment, ConversationId, Message, MessageId, MessagePart, Role, new_id};
pub use stream_buffer::{StreamBuffer, StreamUpdate};
pub use stream_coordinator::{
    Notification, StreamCompletion, StreamCoordinator, SubscriptionId, SwitchOutcome,
    UpdateCallback,
};
