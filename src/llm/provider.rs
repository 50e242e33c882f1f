//! Provider set: the uniform interface every chat backend implements

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::anthropic::AnthropicProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAiProvider;
use super::types::{ChatRequest, ChatResponse};
use crate::error::LlmError;

/// Model substituted when falling back to a local provider without an
/// explicit `name:tag` model.
pub const DEFAULT_LOCAL_MODEL: &str = "llama3.2:latest";

/// Supported chat backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Groq,
    OpenRouter,
    Ollama,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Groq,
        ProviderKind::OpenRouter,
        ProviderKind::Ollama,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Groq => "groq",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Ollama => "ollama",
        }
    }

    /// Runs on this host; needs no API key.
    pub fn is_local(&self) -> bool {
        matches!(self, ProviderKind::Ollama)
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Groq => "https://api.groq.com/openai/v1",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::Ollama => "http://localhost:11434",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "gpt-4o-mini",
            ProviderKind::Anthropic => "claude-3-5-haiku-latest",
            ProviderKind::Groq => "llama-3.1-8b-instant",
            ProviderKind::OpenRouter => "openai/gpt-4o-mini",
            ProviderKind::Ollama => DEFAULT_LOCAL_MODEL,
        }
    }

    /// Environment variable holding this provider's API key.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("OPENAI_API_KEY"),
            ProviderKind::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderKind::Groq => Some("GROQ_API_KEY"),
            ProviderKind::OpenRouter => Some("OPENROUTER_API_KEY"),
            ProviderKind::Ollama => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|k| k.as_str() == lower)
            .ok_or_else(|| format!("unknown provider '{}'", s))
    }
}

/// Per-provider connection settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Model used when this provider is reached by fallback
    pub model: Option<String>,
}

/// A chat backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Builds provider clients for the LLM Service's cache.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        kind: ProviderKind,
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn LlmProvider>, LlmError>;
}

/// Builds the real HTTP clients.
pub struct DefaultProviderFactory {
    timeout: Duration,
}

impl DefaultProviderFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn http_client(&self, kind: ProviderKind) -> Result<reqwest::Client, LlmError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| LlmError::Request {
                provider: kind.to_string(),
                reason: e.to_string(),
            })
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn create(
        &self,
        kind: ProviderKind,
        settings: &ProviderSettings,
    ) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| kind.default_base_url().to_string());
        let client = self.http_client(kind)?;

        if kind.is_local() {
            return Ok(Arc::new(OllamaProvider::new(client, base_url)));
        }

        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| LlmError::MissingApiKey(kind.to_string()))?;

        Ok(match kind {
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(client, base_url, api_key)),
            _ => Arc::new(OpenAiProvider::new(kind, client, base_url, api_key)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_names_roundtrip() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::json!(kind.as_str())
            );
        }
        assert_eq!(" OpenAI ".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert!("bard".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_factory_requires_key_for_remote() {
        let factory = DefaultProviderFactory::new(Duration::from_secs(5));
        let err = factory
            .create(ProviderKind::Groq, &ProviderSettings::default())
            .err()
            .unwrap();
        assert!(matches!(err, LlmError::MissingApiKey(p) if p == "groq"));

        let local = factory
            .create(ProviderKind::Ollama, &ProviderSettings::default())
            .unwrap();
        assert_eq!(local.kind(), ProviderKind::Ollama);
    }
}
