//! Error taxonomy for the chat core.
//!
//! One [`ChatCoreError`] variant per kind named in the design: configuration
//! errors fail a request before any network call; transport/protocol errors
//! surface through the stream's `error` event; tool errors never reach here
//! (they become tool-result messages, see `crate::agent`).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatCoreError>;

#[derive(Debug, Error)]
pub enum ChatCoreError {
    /// Missing credential, unknown provider, malformed model string, invalid
    /// temperature, invalid context name, schema without `type`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Connection failed, timeout, provider HTTP error, subprocess spawn
    /// failure, remote-server handshake failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed chunk or missing required fields from a provider stream.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Tool parse/execution/timeout failure. Carried for logging only —
    /// the agent loop converts these into tool-result messages rather than
    /// propagating them to the caller.
    #[error("tool error: {0}")]
    Tool(String),

    /// stop_reason == content_filter. Not retried.
    #[error("blocked by content filter")]
    Policy,

    /// stop_reason == error (malformed model output). Not retried.
    #[error("malformed model output")]
    ModelOutput,

    /// Agent loop exhausted `max_iterations` without a terminal stop reason.
    #[error("iteration cap of {0} reached without a terminal stop reason")]
    IterationCap(usize),

    /// Session lock busy, corrupted index, or other on-disk store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The operation was cancelled via a `CancellationToken`.
    #[error("operation cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for ChatCoreError {
    fn from(err: reqwest::Error) -> Self {
        ChatCoreError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ChatCoreError {
    fn from(err: serde_json::Error) -> Self {
        ChatCoreError::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for ChatCoreError {
    fn from(err: std::io::Error) -> Self {
        ChatCoreError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_displays_message() {
        let err = ChatCoreError::Configuration("missing CHATCORE_OPENAIKEY".to_string());
        assert_eq!(
            err.to_string(),
            "configuration error: missing CHATCORE_OPENAIKEY"
        );
    }

    #[test]
    fn iteration_cap_carries_the_limit() {
        let err = ChatCoreError::IterationCap(10);
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn json_error_converts_to_protocol() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ChatCoreError = parse_err.into();
        assert!(matches!(err, ChatCoreError::Protocol(_)));
    }
}
