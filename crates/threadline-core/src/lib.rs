//! Conversation streaming and reconciliation engine.
//!
//! Optimistic sends, per-conversation stream accumulation that survives
//! navigation, storage reconciliation, a bounded tool-call loop, and
//! placeholder resolution for content that cannot be decrypted yet.

pub mod config;
pub mod controllers;
pub mod error;
pub mod logging;
pub mod models;
pub mod repositories;
pub mod services;

#[cfg(test)]
mod test_helpers;

pub use config::{ConfigError, EngineConfig};
pub use controllers::{ChatEngine, SendHandle};
pub use error::{EngineError, EngineResult};
