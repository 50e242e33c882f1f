//! JSON-RPC 2.0 / MCP message shapes

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::McpError;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// How to launch one external tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Added on top of the scrubbed environment
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// A tool advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Serialize one message as a single newline-terminated line.
///
/// A JSON-RPC message must occupy exactly one line; a payload with an
/// embedded newline is rejected before anything is written.
pub fn frame_line(method: &str, payload: String) -> Result<Vec<u8>, McpError> {
    if payload.contains('\n') || payload.contains('\r') {
        return Err(McpError::Framing {
            method: method.to_string(),
        });
    }
    let mut line = payload.into_bytes();
    line.push(b'\n');
    Ok(line)
}

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "roots": {"listChanged": false}
        },
        "roots": [],
    })
}

/// A parsed response line: the id it answers and its outcome.
pub fn parse_response(line: &str) -> Option<(u64, Result<Value, McpError>)> {
    let value: Value = serde_json::from_str(line).ok()?;
    let id = value.get("id")?.as_u64()?;
    if let Some(error) = value.get("error") {
        return Some((
            id,
            Err(McpError::Rpc {
                code: error.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
        ));
    }
    Some((id, Ok(value.get("result").cloned().unwrap_or(Value::Null))))
}

/// Text of a `tools/call` result, content blocks joined by newlines.
pub fn call_result_text(result: &Value) -> Result<String, McpError> {
    let text = match result.get("content").and_then(|c| c.as_array()) {
        Some(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        None => result.to_string(),
    };
    if result.get("isError").and_then(|e| e.as_bool()).unwrap_or(false) {
        return Err(McpError::ToolFailed(text));
    }
    Ok(text)
}
