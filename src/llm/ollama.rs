//! Ollama `/api/chat` provider with tool calling

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::provider::{LlmProvider, ProviderKind};
use super::types::{parse_tool_calls_from_text, ChatMessage, ChatRequest, ChatResponse, Role, ToolCall};
use crate::error::LlmError;

/// Message in Ollama's wire format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Response from /api/chat
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: OllamaMessage,
    #[serde(default)]
    model: String,
}

/// Client for Ollama's /api/chat endpoint with tool support
#[derive(Clone)]
pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    /// # Arguments
    /// * `client` - Shared HTTP client (carries the request timeout)
    /// * `base_url` - Base URL of the Ollama server (e.g., "http://localhost:11434")
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn to_wire(message: &ChatMessage) -> OllamaMessage {
        OllamaMessage {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
            tool_calls: message
                .tool_calls
                .iter()
                .map(|c| OllamaToolCall {
                    function: OllamaFunctionCall {
                        name: c.name.clone(),
                        arguments: c.arguments.clone(),
                    },
                })
                .collect(),
        }
    }

    fn err(reason: impl ToString) -> LlmError {
        LlmError::Request {
            provider: ProviderKind::Ollama.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let endpoint = format!("{}/api/chat", self.base_url);

        let messages: Vec<OllamaMessage> = request.messages.iter().map(Self::to_wire).collect();
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": request.temperature
            }
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }

        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(Self::err)?;

        let status = response.status();
        let text = response.text().await.map_err(Self::err)?;
        if !status.is_success() {
            return Err(LlmError::Status {
                provider: ProviderKind::Ollama.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Err(LlmError::EmptyResponse(ProviderKind::Ollama.to_string()));
        }

        let parsed: OllamaChatResponse = serde_json::from_str(&text).map_err(|e| LlmError::Parse {
            provider: ProviderKind::Ollama.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.message.role != Role::Assistant.as_str() && !parsed.message.role.is_empty() {
            tracing::debug!(role = %parsed.message.role, "unexpected role in ollama reply");
        }

        let mut tool_calls: Vec<ToolCall> = parsed
            .message
            .tool_calls
            .into_iter()
            .map(|c| ToolCall::new(c.function.name, c.function.arguments))
            .collect();

        // Small local models often print the call instead of using tool_calls
        if tool_calls.is_empty() && !request.tools.is_empty() {
            tool_calls = parse_tool_calls_from_text(&parsed.message.content, &request.tools);
        }

        Ok(ChatResponse {
            content: parsed.message.content,
            tool_calls,
            provider: ProviderKind::Ollama.to_string(),
            model: if parsed.model.is_empty() {
                request.model.clone()
            } else {
                parsed.model
            },
        })
    }
}
