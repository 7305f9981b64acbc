use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::completion::{CompletionResponse, ToolDeclaration, TransportError};
use crate::error::EngineError;
use crate::models::Message;

/// Maximum number of tool rounds before the loop gives up.
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;

/// Canonical tool call, independent of the provider's response shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Output of one executed call. `output` is always a JSON document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub output: String,
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        serde_json::from_str::<Value>(&self.output)
            .ok()
            .is_some_and(|v| v.get("error").is_some())
    }
}

/// Executes a single named tool.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, arguments: Value) -> anyhow::Result<Value>;
}

/// Adapter so plain async closures can be registered as executors.
struct FnExecutor<F>(F);

#[async_trait]
impl<F, Fut> ToolExecutor for FnExecutor<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn execute(&self, arguments: Value) -> anyhow::Result<Value> {
        (self.0)(arguments).await
    }
}

/// Tool name -> executor, plus the declarations advertised to the model.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    executors: HashMap<String, Arc<dyn ToolExecutor>>,
    declarations: Vec<ToolDeclaration>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, declaration: ToolDeclaration, executor: Arc<dyn ToolExecutor>) {
        self.declarations.retain(|d| d.name != declaration.name);
        self.executors.insert(declaration.name.clone(), executor);
        self.declarations.push(declaration);
    }

    pub fn register_fn<F, Fut>(&mut self, declaration: ToolDeclaration, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(declaration, Arc::new(FnExecutor(f)));
    }

    pub fn declarations(&self) -> &[ToolDeclaration] {
        &self.declarations
    }

    /// Run one call. Failures become `{"error": ...}` results instead of propagating.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let output = match self.executors.get(&call.name) {
            Some(executor) => match executor.execute(call.arguments.clone()).await {
                Ok(value) => serde_json::to_string(&value).unwrap_or_else(|e| {
                    error_output(&call.name, format!("Unserializable tool output: {e}"))
                }),
                Err(e) => {
                    debug!(tool = %call.name, call_id = %call.id, error = ?e, "Tool executor failed");
                    error_output(&call.name, format!("{e:#}"))
                }
            },
            None => {
                warn!(tool = %call.name, "Model requested an unknown tool");
                error_output(&call.name, format!("Unknown tool: {}", call.name))
            }
        };

        ToolResult {
            call_id: call.id.clone(),
            name: call.name.clone(),
            output,
        }
    }
}

fn error_output(tool: &str, message: String) -> String {
    let error = EngineError::ToolExecution {
        tool: tool.to_string(),
        message,
    };
    json!({ "error": error.to_string() }).to_string()
}

/// Results of one tool round, sent back to the model as a single turn.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationTurn {
    pub results: Vec<ToolResult>,
}

impl ContinuationTurn {
    pub fn to_message(&self) -> Message {
        let payload = serde_json::to_string(&self.results).unwrap_or_else(|_| "[]".to_string());
        Message::user(&format!("Tool results:\n{payload}"), Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Done,
    /// The model kept asking for tools; the last response is kept as-is.
    MaxIterationsExceeded,
}

#[derive(Debug, Clone)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    pub iterations: usize,
    pub last_response: CompletionResponse,
    pub results: Vec<ToolResult>,
}

enum LoopState {
    AwaitingResponse,
    Executing(Vec<ToolCall>),
    ResubmittingResults(Vec<ToolResult>),
}

/// Drives a stateless completion API through tool request/response rounds.
#[derive(Clone)]
pub struct ToolCallLoop {
    registry: ToolRegistry,
    max_iterations: usize,
}

impl ToolCallLoop {
    pub fn new(registry: ToolRegistry, max_iterations: usize) -> Self {
        Self {
            registry,
            max_iterations,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run the loop starting from `first`, calling `resubmit` with each round's results.
    ///
    /// Only transport errors from `resubmit` escape; executor failures are fed
    /// back to the model and the iteration cap ends the loop without an error.
    pub async fn drive<F, Fut>(
        &self,
        first: CompletionResponse,
        mut resubmit: F,
    ) -> Result<LoopReport, TransportError>
    where
        F: FnMut(ContinuationTurn) -> Fut,
        Fut: Future<Output = Result<CompletionResponse, TransportError>>,
    {
        let mut last_response = first;
        let mut iterations = 0;
        let mut all_results = Vec::new();
        let mut state = LoopState::AwaitingResponse;

        loop {
            state = match state {
                LoopState::AwaitingResponse => {
                    let calls = normalize_tool_calls(&last_response);
                    if calls.is_empty() {
                        return Ok(LoopReport {
                            outcome: LoopOutcome::Done,
                            iterations,
                            last_response,
                            results: all_results,
                        });
                    }
                    if iterations >= self.max_iterations {
                        warn!(
                            max_iterations = self.max_iterations,
                            pending_calls = calls.len(),
                            "Tool loop reached its iteration cap, stopping"
                        );
                        return Ok(LoopReport {
                            outcome: LoopOutcome::MaxIterationsExceeded,
                            iterations,
                            last_response,
                            results: all_results,
                        });
                    }
                    LoopState::Executing(calls)
                }
                LoopState::Executing(calls) => {
                    iterations += 1;
                    debug!(iteration = iterations, calls = calls.len(), "Executing tool calls");
                    let results = join_all(calls.iter().map(|call| self.registry.execute(call))).await;
                    all_results.extend(results.iter().cloned());
                    LoopState::ResubmittingResults(results)
                }
                LoopState::ResubmittingResults(results) => {
                    last_response = resubmit(ContinuationTurn { results }).await?;
                    LoopState::AwaitingResponse
                }
            };
        }
    }
}

/// Extract tool calls from any supported response shape.
///
/// Accepted: an explicit `tool_calls` field on the response, OpenAI
/// `tool_calls`/`choices[0].message.tool_calls`, Anthropic `tool_use` content
/// blocks, Gemini `functionCall` parts, and flat `{id, name, arguments}` or
/// `{toolCallId, toolName, args}` entries.
pub fn normalize_tool_calls(response: &CompletionResponse) -> Vec<ToolCall> {
    let source = response
        .tool_calls
        .as_ref()
        .filter(|v| !v.is_null())
        .or_else(|| locate_calls(&response.data));

    let entries: Vec<&Value> = match source {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(object @ Value::Object(map)) => {
            match map.get("tool_calls").or_else(|| map.get("toolCalls")) {
                Some(Value::Array(items)) => items.iter().collect(),
                _ => vec![object],
            }
        }
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .enumerate()
        .filter_map(|(index, entry)| normalize_entry(entry, index))
        .collect()
}

fn locate_calls(data: &Value) -> Option<&Value> {
    data.get("tool_calls")
        .or_else(|| data.get("toolCalls"))
        .or_else(|| data.pointer("/choices/0/message/tool_calls"))
        .or_else(|| {
            data.get("content")
                .filter(|c| c.as_array().is_some_and(|blocks| blocks.iter().any(is_tool_use)))
        })
        .or_else(|| data.pointer("/candidates/0/content/parts"))
}

fn is_tool_use(block: &Value) -> bool {
    block.get("type").and_then(Value::as_str) == Some("tool_use")
}

fn normalize_entry(entry: &Value, index: usize) -> Option<ToolCall> {
    // Gemini wraps the call one level down and carries no id.
    let call = entry.get("functionCall").unwrap_or(entry);
    let function = call.get("function");

    let name = function
        .and_then(|f| f.get("name"))
        .or_else(|| call.get("name"))
        .or_else(|| call.get("toolName"))
        .and_then(Value::as_str)?
        .to_string();

    let id = ["id", "toolCallId", "call_id"]
        .iter()
        .find_map(|key| call.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{index}"));

    let raw_arguments = function
        .and_then(|f| f.get("arguments"))
        .or_else(|| call.get("arguments"))
        .or_else(|| call.get("args"))
        .or_else(|| call.get("input"));

    let arguments = match raw_arguments {
        Some(Value::String(encoded)) => {
            serde_json::from_str(encoded).unwrap_or_else(|_| Value::String(encoded.clone()))
        }
        Some(value) => value.clone(),
        None => json!({}),
    };

    Some(ToolCall {
        id,
        name,
        arguments,
    })
}
