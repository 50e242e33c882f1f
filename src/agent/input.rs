//! The `input` object of a job submission

use serde::Deserialize;
use serde_json::Value;

use super::sessions::is_valid_session_id;
use crate::llm::ProviderKind;

/// What a client asks the agent to do.
///
/// Only `message` is required; everything else overrides a service default
/// for this one job. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentInput {
    pub message: String,
    /// System prompt override
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub fallback_order: Option<Vec<ProviderKind>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_steps: Option<usize>,
    /// Allow-list of local tool names; all registered tools when absent
    #[serde(default)]
    pub tools: Option<Vec<String>>,
    /// MCP servers whose tools this job may use; all configured when absent
    #[serde(default)]
    pub mcp_servers: Option<Vec<String>>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl AgentInput {
    /// Parse and check a job's `input`, returning a client-facing message on
    /// failure.
    pub fn parse(input: &Value) -> Result<Self, String> {
        if !input.is_object() {
            return Err("input must be a JSON object".to_string());
        }
        let parsed: AgentInput =
            serde_json::from_value(input.clone()).map_err(|e| e.to_string())?;

        if parsed.message.trim().is_empty() {
            return Err("'message' must be a non-empty string".to_string());
        }
        if parsed.max_steps == Some(0) {
            return Err("'max_steps' must be at least 1".to_string());
        }
        if let Some(id) = &parsed.session_id {
            if !is_valid_session_id(id) {
                return Err(format!(
                    "invalid session_id '{}': use letters, digits, '_', '-' or '.'",
                    id
                ));
            }
        }
        Ok(parsed)
    }
}
