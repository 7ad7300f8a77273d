//! Provider-agnostic data model: messages, tool calls, and the request/event
//! shapes shared by every adapter and the agent loop.

pub mod message;
pub mod tool;

pub use message::{
    AnthropicThinkingBlock, ChatMessage, ContentPart, Role, StopReason, ToolCall, ToolResult,
    META_ANTHROPIC_THINKING_BLOCKS, META_GEMINI_THOUGHT_SIGNATURES, META_INPUT_TOKENS,
    META_OUTPUT_TOKENS,
};
pub use tool::{CompletionRequest, ThinkingEffort, Tool, ToolKind};
