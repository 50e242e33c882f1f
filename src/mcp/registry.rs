//! Many named MCP servers behind one handle.
//!
//! Tools are exposed to the model as `<server>__<tool>` and routed back to
//! the owning server by that prefix.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::client::McpClient;
use super::protocol::{McpServerConfig, McpTool};
use crate::error::McpError;
use crate::llm::ToolDefinition;

const TOOL_SEPARATOR: &str = "__";

pub struct McpRegistry {
    clients: BTreeMap<String, Arc<McpClient>>,
}

impl McpRegistry {
    pub fn new(configs: &[McpServerConfig], request_timeout: Duration) -> Self {
        let clients = configs
            .iter()
            .map(|c| {
                (
                    c.id.clone(),
                    Arc::new(McpClient::new(c.clone(), request_timeout)),
                )
            })
            .collect();
        Self { clients }
    }

    pub fn empty() -> Self {
        Self {
            clients: BTreeMap::new(),
        }
    }

    /// Add an already-built client (e.g. over a custom transport).
    pub fn insert(&mut self, client: McpClient) {
        self.clients
            .insert(client.server_id().to_string(), Arc::new(client));
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn client(&self, server_id: &str) -> Result<Arc<McpClient>, McpError> {
        self.clients
            .get(server_id)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer(server_id.to_string()))
    }

    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<McpTool>, McpError> {
        self.client(server_id)?.list_tools().await
    }

    pub async fn call_tool(&self, server_id: &str, tool: &str, arguments: Value) -> Result<String, McpError> {
        self.client(server_id)?.call_tool(tool, arguments).await
    }

    pub fn qualified_name(server_id: &str, tool: &str) -> String {
        format!("{}{}{}", server_id, TOOL_SEPARATOR, tool)
    }

    /// Split `<server>__<tool>` when `<server>` is a registered id.
    pub fn resolve(&self, qualified: &str) -> Option<(String, String)> {
        let (server, tool) = qualified.split_once(TOOL_SEPARATOR)?;
        if tool.is_empty() || !self.clients.contains_key(server) {
            return None;
        }
        Some((server.to_string(), tool.to_string()))
    }

    /// Catalogue entries for the given servers. A server that fails to list
    /// is logged and skipped so local tools stay usable.
    pub async fn tool_definitions(&self, server_ids: &[String]) -> Vec<ToolDefinition> {
        let mut defs = Vec::new();
        for id in server_ids {
            match self.list_tools(id).await {
                Ok(tools) => defs.extend(tools.into_iter().map(|t| ToolDefinition {
                    name: Self::qualified_name(id, &t.name),
                    description: t.description,
                    parameters: t.input_schema,
                })),
                Err(e) => warn!(server = %id, error = %e, "skipping MCP server tools"),
            }
        }
        defs
    }

    /// Close every server.
    pub async fn close_all(&self) {
        for client in self.clients.values() {
            client.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_qualified_names() {
        let registry = McpRegistry::new(
            &[McpServerConfig {
                id: "files".into(),
                command: "true".into(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            }],
            Duration::from_secs(1),
        );
        let name = McpRegistry::qualified_name("files", "read_file");
        assert_eq!(name, "files__read_file");
        assert_eq!(
            registry.resolve(&name),
            Some(("files".to_string(), "read_file".to_string()))
        );
        assert_eq!(registry.resolve("other__read_file"), None);
        assert_eq!(registry.resolve("echo"), None);
        assert!(matches!(registry.client("nope"), Err(McpError::UnknownServer(_))));
    }
}
