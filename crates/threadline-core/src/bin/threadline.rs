use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use threadline_core::models::{Message, StreamUpdate};
use threadline_core::repositories::InMemoryMessageStore;
use threadline_core::services::{
    CompletionRequest, CompletionResponse, CompletionTransport, StreamChunk, ToolDeclaration,
    ToolRegistry, TransportError,
};
use threadline_core::{ChatEngine, EngineConfig, SendHandle, logging};

/// Streams the last user message back word by word.
struct EchoTransport {
    delay: Duration,
}

#[async_trait]
impl CompletionTransport for EchoTransport {
    async fn send(
        &self,
        request: CompletionRequest,
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<CompletionResponse, TransportError> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.is_user())
            .map(Message::text)
            .unwrap_or_default();

        if prompt.trim() == "what time is it?" {
            return Ok(CompletionResponse {
                data: json!({}),
                tool_calls: Some(json!([{ "id": "t1", "name": "clock", "arguments": {} }])),
            });
        }

        let reply = format!("echo: {prompt}");
        for word in reply.split_inclusive(' ') {
            tokio::time::sleep(self.delay).await;
            on_chunk(StreamChunk::Text(word.to_string()));
        }
        Ok(CompletionResponse::text(reply))
    }
}

fn tools() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register_fn(
        ToolDeclaration {
            name: "clock".to_string(),
            description: "Current UTC time".to_string(),
            parameters: json!({"type": "object", "properties": {}}),
        },
        |_args| async move { Ok(json!(chrono::Utc::now().to_rfc3339())) },
    );
    registry
}

/// Prints only the text added since the previous update.
fn print_delta(printed: Arc<AtomicUsize>) -> impl Fn(&StreamUpdate) + Send + Sync + 'static {
    move |update: &StreamUpdate| {
        let seen = printed.swap(update.text.len(), Ordering::Relaxed);
        if let Some(delta) = update.text.get(seen..)
            && !delta.is_empty()
        {
            print!("{delta}");
            let _ = std::io::stdout().flush();
        }
    }
}

/// The send's conversation id only exists once its stream is registered.
async fn wait_for_stream(engine: &ChatEngine, handle: &SendHandle) -> Option<String> {
    let mut ticker = tokio::time::interval(engine.config().frame_interval());
    loop {
        if let Some(id) = engine.streaming_conversation_id() {
            return Some(id);
        }
        if handle.is_finished() {
            return None;
        }
        ticker.tick().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = EngineConfig::load().await.unwrap_or_else(|e| {
        warn!(error = ?e, "Failed to load engine config, using defaults");
        EngineConfig::default()
    });
    info!(model = %config.model_id, "Starting threadline");

    let transport = Arc::new(EchoTransport {
        delay: Duration::from_millis(40),
    });
    let engine = ChatEngine::new(Arc::new(InMemoryMessageStore::new()), transport, tools(), config);

    println!("Type a message. Commands: /new, /list, /open <id>, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/new", _) => engine.new_conversation(),
            ("/list", _) => {
                for record in engine.conversations().await? {
                    println!("{}  {}", record.id, record.title);
                }
            }
            ("/open", id) => {
                engine.switch_view(Some(id.trim())).await;
                let mut rendered = engine.placeholder_resolver(None);
                for message in engine.messages() {
                    println!("{:?}: {}", message.role, rendered.update(message.text()).await.text);
                }
            }
            _ if line.is_empty() => {}
            _ => {
                let handle = match engine.send(line, Vec::new()) {
                    Ok(handle) => handle,
                    Err(e) => {
                        println!("! {e}");
                        continue;
                    }
                };
                let printed = Arc::new(AtomicUsize::new(0));
                let subscription = wait_for_stream(&engine, &handle)
                    .await
                    .map(|id| engine.subscribe(&id, print_delta(printed.clone())));
                let result = handle.join().await;
                if let Some(subscription) = subscription {
                    engine.unsubscribe(subscription);
                }

                if printed.load(Ordering::Relaxed) > 0 {
                    println!();
                } else if let Some(reply) = engine.messages().last() {
                    let mut rendered = engine.placeholder_resolver(None);
                    println!("{}", rendered.update(reply.text()).await.text);
                }
                if let Err(e) = result {
                    println!("! {e}");
                }
            }
        }
    }

    engine.shutdown().await?;
    Ok(())
}
