//! Provider-agnostic streaming chat core: adapters for OpenAI-compatible,
//! Anthropic, Gemini, and Ollama back-ends behind one capability set, an
//! agent loop that dispatches tool calls to a uniform registry, and a
//! session store that persists conversation history and settings.

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logger;
pub mod providers;
pub mod session;
pub mod stream;
pub mod tools;
pub mod types;

pub use agent::{AgentError, AgentHooks, AgentLoop, AgentOutcome};
pub use dispatcher::{dispatch, resolve_provider};
pub use error::{ChatCoreError, Result};
pub use session::{FilesystemSessionStore, MemorySessionStore, Session, SessionMetadata, SessionStore};
pub use stream::StreamEvent;
pub use tools::{NativeTool, ToolRegistry};
pub use types::{
    ChatMessage, CompletionRequest, ContentPart, Role, StopReason, ThinkingEffort, Tool, ToolCall,
    ToolKind, ToolResult,
};
