//! Anthropic Messages API provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::provider::{LlmProvider, ProviderKind};
use super::types::{ChatMessage, ChatRequest, ChatResponse, Role, ToolCall};
use crate::error::LlmError;

/// Current Anthropic API version header value.
const API_VERSION: &str = "2023-06-01";

const MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiToolDef>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String },
    /// Block types this client does not act on (thinking, ...)
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
struct ApiToolDef {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: String,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Split out system text and fold the rest into alternating turns.
    ///
    /// Tool results travel as `tool_result` blocks in a user turn; consecutive
    /// messages mapping to the same role are merged.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<ApiMessage>) {
        let mut system = Vec::new();
        let mut out: Vec<ApiMessage> = Vec::new();

        for m in messages {
            let (role, blocks) = match m.role {
                Role::System => {
                    system.push(m.content.clone());
                    continue;
                }
                Role::User => ("user", vec![ContentBlock::Text { text: m.content.clone() }]),
                Role::Tool => (
                    "user",
                    vec![ContentBlock::ToolResult {
                        tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                        content: m.content.clone(),
                    }],
                ),
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !m.content.is_empty() {
                        blocks.push(ContentBlock::Text { text: m.content.clone() });
                    }
                    for c in &m.tool_calls {
                        blocks.push(ContentBlock::ToolUse {
                            id: c.id.clone(),
                            name: c.name.clone(),
                            input: c.arguments.clone(),
                        });
                    }
                    ("assistant", blocks)
                }
            };
            if blocks.is_empty() {
                continue;
            }
            match out.last_mut() {
                Some(last) if last.role == role => last.content.extend(blocks),
                _ => out.push(ApiMessage { role, content: blocks }),
            }
        }

        let system = (!system.is_empty()).then(|| system.join("\n\n"));
        (system, out)
    }

    fn parse_response(resp: MessagesResponse, request: &ChatRequest) -> ChatResponse {
        let mut text_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in resp.content {
            match block {
                ContentBlock::Text { text } => text_parts.push(text),
                ContentBlock::ToolUse { id, name, input } => {
                    let mut call = ToolCall::new(name, input);
                    call.id = id;
                    tool_calls.push(call);
                }
                ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
            }
        }
        ChatResponse {
            content: text_parts.join(""),
            tool_calls,
            provider: ProviderKind::Anthropic.to_string(),
            model: if resp.model.is_empty() {
                request.model.clone()
            } else {
                resp.model
            },
        }
    }

    fn request_err(e: reqwest::Error) -> LlmError {
        LlmError::Request {
            provider: ProviderKind::Anthropic.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let (system, messages) = Self::convert_messages(&request.messages);
        let body = MessagesRequest {
            model: request.model.clone(),
            max_tokens: MAX_TOKENS,
            system,
            messages,
            temperature: request.temperature,
            tools: request
                .tools
                .iter()
                .map(|t| ApiToolDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.parameters.clone(),
                })
                .collect(),
        };

        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(Self::request_err)?;

        let status = response.status();
        let text = response.text().await.map_err(Self::request_err)?;
        if !status.is_success() {
            return Err(LlmError::Status {
                provider: ProviderKind::Anthropic.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: MessagesResponse = serde_json::from_str(&text).map_err(|e| LlmError::Parse {
            provider: ProviderKind::Anthropic.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::parse_response(parsed, request))
    }
}
