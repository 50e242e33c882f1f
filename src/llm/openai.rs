//! OpenAI chat-completions wire format
//!
//! Also serves Groq and OpenRouter, which speak the same protocol at
//! different base URLs.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::provider::{LlmProvider, ProviderKind};
use super::types::{ChatMessage, ChatRequest, ChatResponse, Role, ToolCall};
use crate::error::LlmError;

pub struct OpenAiProvider {
    kind: ProviderKind,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    model: String,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    #[serde(default)]
    id: Option<String>,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    /// JSON-encoded argument object
    #[serde(default)]
    arguments: String,
}

impl OpenAiProvider {
    pub fn new(
        kind: ProviderKind,
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn message_to_wire(message: &ChatMessage) -> Value {
        let mut wire = json!({
            "role": message.role.as_str(),
            "content": message.content,
        });
        if !message.tool_calls.is_empty() {
            wire["tool_calls"] = message
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect();
        }
        if message.role == Role::Tool {
            if let Some(id) = &message.tool_call_id {
                wire["tool_call_id"] = json!(id);
            }
        }
        wire
    }

    fn request_body(request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages.iter().map(Self::message_to_wire).collect::<Vec<_>>(),
            "temperature": request.temperature,
        });
        if !request.tools.is_empty() {
            body["tools"] = request
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
        }
        body
    }

    fn parse(&self, text: &str, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let parse_err = |reason: String| LlmError::Parse {
            provider: self.kind.to_string(),
            reason,
        };
        let parsed: CompletionResponse =
            serde_json::from_str(text).map_err(|e| parse_err(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::EmptyResponse(self.kind.to_string()))?;

        let mut tool_calls = Vec::with_capacity(choice.message.tool_calls.len());
        for call in choice.message.tool_calls {
            let arguments: Value = if call.function.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.function.arguments)
                    .map_err(|e| parse_err(format!("tool call arguments: {}", e)))?
            };
            let mut tc = ToolCall::new(call.function.name, arguments);
            if let Some(id) = call.id {
                tc.id = id;
            }
            tool_calls.push(tc);
        }

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            provider: self.kind.to_string(),
            model: if parsed.model.is_empty() {
                request.model.clone()
            } else {
                parsed.model
            },
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&Self::request_body(request))
            .send()
            .await
            .map_err(|e| LlmError::Request {
                provider: self.kind.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| LlmError::Request {
            provider: self.kind.to_string(),
            reason: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(LlmError::Status {
                provider: self.kind.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        self.parse(&text, request)
    }
}
