//! Entry point tying a `model = "<provider>/<rest>"` string to a concrete
//! `ChatProvider`, resolving its credential from the environment before any
//! network call is attempted. The `<rest>` segment (everything after the
//! first `/`) is passed through untouched as the wire-level model name.

use crate::error::{ChatCoreError, Result};
use crate::providers::ChatProvider;
use crate::stream::StreamEvent;
use crate::types::CompletionRequest;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "openai")]
use crate::providers::openai::OpenAiProvider;
#[cfg(feature = "anthropic")]
use crate::providers::anthropic::AnthropicProvider;
#[cfg(feature = "gemini")]
use crate::providers::gemini::GeminiProvider;
#[cfg(feature = "ollama")]
use crate::providers::ollama::OllamaProvider;

/// Splits `model` on its first `/`, validates the provider segment against
/// the four known back-ends, and resolves its credential from
/// `{app_prefix}_{PROVIDER}KEY`. Configuration errors surface here, before
/// any request is built or sent.
pub fn resolve_provider(model: &str, app_prefix: &str) -> Result<Arc<dyn ChatProvider>> {
    let (provider_name, _) = model.split_once('/').ok_or_else(|| {
        ChatCoreError::Configuration(format!(
            "model \"{model}\" must be of the form <provider>/<model-name>"
        ))
    })?;
    let provider = crate::config::Provider::parse(provider_name)?;
    let credential = provider.resolve_credential(app_prefix)?;

    match provider {
        #[cfg(feature = "openai")]
        crate::config::Provider::OpenAi => Ok(Arc::new(OpenAiProvider::new(credential))),
        #[cfg(feature = "anthropic")]
        crate::config::Provider::Anthropic => Ok(Arc::new(AnthropicProvider::new(
            credential.expect("anthropic requires a credential"),
        ))),
        #[cfg(feature = "gemini")]
        crate::config::Provider::Gemini => Ok(Arc::new(GeminiProvider::new(
            credential.expect("gemini requires a credential"),
        ))),
        #[cfg(feature = "ollama")]
        crate::config::Provider::Ollama => Ok(Arc::new(OllamaProvider::new())),
        #[allow(unreachable_patterns)]
        other => Err(ChatCoreError::Configuration(format!(
            "provider {other:?} is not compiled into this build"
        ))),
    }
}

/// Resolve the provider and open its stream in one step.
pub async fn dispatch(
    request: CompletionRequest,
    app_prefix: &str,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<StreamEvent>> {
    request.validate()?;
    let provider = resolve_provider(&request.model, app_prefix)?;
    provider.stream(request, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_model_without_provider_prefix() {
        let err = resolve_provider("gpt-4o", "CHATCORE").unwrap_err();
        assert!(err.to_string().contains("<provider>/<model-name>"));
    }

    #[test]
    fn rejects_unknown_provider_before_any_network_call() {
        let err = resolve_provider("bedrock/claude", "CHATCORE").unwrap_err();
        assert!(err.to_string().contains("bedrock"));
    }

    #[test]
    fn ollama_resolves_without_a_credential() {
        let result = resolve_provider("ollama/llama3", "CHATCORE_DISPATCH_TEST_UNSET");
        assert!(result.is_ok());
    }
}
