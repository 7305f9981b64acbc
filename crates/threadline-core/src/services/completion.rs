use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{ConversationId, Message};

/// Incremental output delivered while a completion is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Text(String),
    Reasoning(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Request cancelled")]
    Cancelled,
}

/// A tool the model may call, advertised with each request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub conversation_id: ConversationId,
    pub model_id: String,
    /// Full message history, including any continuation turn.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDeclaration>,
    pub include_history: bool,
}

/// Raw completion result. `data` keeps whatever shape the provider returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub data: Value,
    pub tool_calls: Option<Value>,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Value::String(text.into()),
            tool_calls: None,
        }
    }

    /// Best-effort text of the response across the provider shapes we accept.
    pub fn response_text(&self) -> String {
        extract_text(&self.data)
    }
}

fn extract_text(data: &Value) -> String {
    if let Some(text) = data.as_str() {
        return text.to_string();
    }
    if let Some(text) = data.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    if let Some(text) = data
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return text.to_string();
    }

    let blocks = data
        .get("content")
        .or_else(|| data.pointer("/candidates/0/content/parts"));
    match blocks {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|block| {
                block
                    .get("type")
                    .and_then(Value::as_str)
                    .is_none_or(|kind| kind == "text")
            })
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// Stateless completion API. Network framing lives behind this seam.
#[async_trait]
pub trait CompletionTransport: Send + Sync + 'static {
    /// Send a request, reporting incremental output through `on_chunk`.
    async fn send(
        &self,
        request: CompletionRequest,
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<CompletionResponse, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_text_from_known_shapes() {
        assert_eq!(CompletionResponse::text("plain").response_text(), "plain");

        let openai = CompletionResponse {
            data: json!({"choices": [{"message": {"content": "from choices"}}]}),
            tool_calls: None,
        };
        assert_eq!(openai.response_text(), "from choices");

        let anthropic = CompletionResponse {
            data: json!({"content": [
                {"type": "text", "text": "a"},
                {"type": "tool_use", "id": "t1", "name": "x", "input": {}},
                {"type": "text", "text": "b"}
            ]}),
            tool_calls: None,
        };
        assert_eq!(anthropic.response_text(), "ab");

        let gemini = CompletionResponse {
            data: json!({"candidates": [{"content": {"parts": [{"text": "g"}]}}]}),
            tool_calls: None,
        };
        assert_eq!(gemini.response_text(), "g");
    }

    #[test]
    fn test_unknown_shape_yields_empty_text() {
        let response = CompletionResponse {
            data: json!({"unexpected": true}),
            tool_calls: None,
        };
        assert_eq!(response.response_text(), "");
    }
}
