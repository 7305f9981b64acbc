use thiserror::Error;

use crate::repositories::StoreError;
use crate::services::TransportError;

/// Errors surfaced by the chat engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Placeholder resolution gave up after {attempts} attempts")]
    ResolutionTimeout { attempts: u32 },

    #[error("A send is already in flight for conversation {conversation_id}")]
    ConcurrentSendRejected { conversation_id: String },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Nothing to send: message text and attachments are empty")]
    EmptySubmission,

    #[error("No pending send for assistant message {assistant_message_id}")]
    UnknownSend { assistant_message_id: String },
}

pub type EngineResult<T> = Result<T, EngineError>;
