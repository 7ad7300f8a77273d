//! Configuration: environment-variable credential resolution and the
//! `thinking_effort` → provider-budget mapping. `CompletionRequest`
//! construction/validation lives in `crate::types::tool`.

use crate::error::{ChatCoreError, Result};
use crate::types::ThinkingEffort;

/// One of the four back-ends named in the external interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    Ollama,
}

impl Provider {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "gemini" => Ok(Provider::Gemini),
            "ollama" => Ok(Provider::Ollama),
            other => Err(ChatCoreError::Configuration(format!(
                "unknown provider \"{other}\"; expected one of openai, anthropic, gemini, ollama"
            ))),
        }
    }

    /// Environment variable name holding this provider's credential, e.g.
    /// `CHATCORE_OPENAIKEY`. `app_prefix` is the caller's app name in
    /// upper-case, so an embedding application can namespace its own keys.
    pub fn env_var(self, app_prefix: &str) -> String {
        let suffix = match self {
            Provider::OpenAi => "OPENAIKEY",
            Provider::Anthropic => "ANTHROPICKEY",
            Provider::Gemini => "GEMINIKEY",
            Provider::Ollama => "OLLAMAKEY",
        };
        format!("{app_prefix}_{suffix}")
    }

    /// Ollama runs key-less by default; the others fail early with an
    /// actionable error naming the missing environment variable.
    pub fn requires_credential(self) -> bool {
        !matches!(self, Provider::Ollama)
    }

    pub fn resolve_credential(self, app_prefix: &str) -> Result<Option<String>> {
        let var = self.env_var(app_prefix);
        match std::env::var(&var) {
            Ok(value) if !value.is_empty() => Ok(Some(value)),
            _ if self.requires_credential() => Err(ChatCoreError::Configuration(format!(
                "missing credential: set {var}"
            ))),
            _ => Ok(None),
        }
    }
}

/// Maps `thinking_effort` to a token budget. Anthropic uses the budget
/// directly (extended-thinking token allowance); other providers treat any
/// non-`off` value as "enable thinking mode" and ignore the magnitude.
pub fn thinking_budget(effort: ThinkingEffort) -> Option<u32> {
    match effort {
        ThinkingEffort::Off => None,
        ThinkingEffort::Low => Some(4096),
        ThinkingEffort::Medium => Some(8192),
        ThinkingEffort::High => Some(16384),
    }
}

pub fn thinking_enabled(effort: ThinkingEffort) -> bool {
    effort != ThinkingEffort::Off
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_providers_case_insensitively() {
        assert_eq!(Provider::parse("OpenAI").unwrap(), Provider::OpenAi);
        assert_eq!(Provider::parse("anthropic").unwrap(), Provider::Anthropic);
    }

    #[test]
    fn rejects_unknown_provider() {
        let err = Provider::parse("bedrock").unwrap_err();
        assert!(err.to_string().contains("bedrock"));
    }

    #[test]
    fn ollama_does_not_require_a_credential() {
        assert!(!Provider::Ollama.requires_credential());
        assert!(Provider::OpenAi.requires_credential());
    }

    #[test]
    fn thinking_budget_matches_anthropic_tiers() {
        assert_eq!(thinking_budget(ThinkingEffort::Low), Some(4096));
        assert_eq!(thinking_budget(ThinkingEffort::Medium), Some(8192));
        assert_eq!(thinking_budget(ThinkingEffort::High), Some(16384));
        assert_eq!(thinking_budget(ThinkingEffort::Off), None);
    }

    #[test]
    fn env_var_name_is_namespaced_by_app_prefix() {
        assert_eq!(Provider::OpenAi.env_var("CHATCORE"), "CHATCORE_OPENAIKEY");
    }
}
