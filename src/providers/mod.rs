//! Provider adapters: one module per back-end, each translating native
//! chunks into `StreamState` mutations behind the same `ChatProvider`
//! capability (see design note "capability polymorphism over inheritance").

use crate::error::Result;
use crate::stream::StreamEvent;
use crate::types::CompletionRequest;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "openai")]
pub mod openai;
#[cfg(feature = "anthropic")]
pub mod anthropic;
#[cfg(feature = "gemini")]
pub mod gemini;
#[cfg(feature = "ollama")]
pub mod ollama;

/// A provider back-end: given a fully-resolved request, open a stream and
/// drive the streaming core via its own adapter, returning the consumer end
/// of the event channel.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEvent>>;
}

/// Shared HTTP client construction so `base_url`/`timeout` (both
/// configuration-recognized) apply uniformly across back-ends rather than
/// each adapter building its own client ad hoc.
pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .expect("reqwest client configuration is always valid")
}

pub(crate) fn resolve_base_url(base_url: &Option<String>, default: &str) -> String {
    base_url.clone().unwrap_or_else(|| default.to_string())
}
