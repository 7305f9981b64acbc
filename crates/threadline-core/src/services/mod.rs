pub mod completion;
pub mod placeholder_resolver;
pub mod title;
pub mod tool_loop;

pub use completion::{
    CompletionRequest, CompletionResponse, CompletionTransport, StreamChunk, ToolDeclaration,
    TransportError,
};
pub use placeholder_resolver::{
    ContentResolver, PlaceholderResolver, RenderedContent, ResolutionStatus, has_placeholders,
    strip_placeholders,
};
pub use title::derive_title;
pub use tool_loop::{
    ContinuationTurn, DEFAULT_MAX_TOOL_ITERATIONS, LoopOutcome, LoopReport, ToolCall,
    ToolCallLoop, ToolExecutor, ToolRegistry, ToolResult, normalize_tool_calls,
};
