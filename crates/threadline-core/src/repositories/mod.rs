pub mod error;
pub mod in_memory_store;
pub mod message_store;
pub mod reconciliation;
pub mod sqlite_store;

pub use error::{StoreError, StoreResult};
pub use in_memory_store::InMemoryMessageStore;
pub use message_store::{BoxFuture, ConversationRecord, MessageStore};
pub use reconciliation::{ReadDecision, ReadTicket, evaluate_read};
pub use sqlite_store::SqliteMessageStore;
