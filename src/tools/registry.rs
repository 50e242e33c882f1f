//! Tool registry for managing available tools.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use super::builtin::{EchoTool, ShellConfig, ShellTool, TimeTool};
use super::tool::{Tool, ToolContext, ToolOutput};
use crate::error::ToolError;
use crate::llm::ToolDefinition;

/// Name → tool map. Tools are registered at startup and never replaced.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; a second tool with the same name is rejected.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ToolError::AlreadyRegistered(name));
        }
        debug!(tool = %name, "registered tool");
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Register echo, current_time and (when enabled) shell.
    pub fn register_builtin_tools(&mut self, shell: &ShellConfig) -> Result<(), ToolError> {
        self.register(Arc::new(EchoTool))?;
        self.register(Arc::new(TimeTool))?;
        if shell.enabled {
            self.register(Arc::new(ShellTool::new(shell.clone())))?;
        }
        info!(count = self.tools.len(), "registered built-in tools");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn requires_approval(&self, name: &str) -> bool {
        self.tools.get(name).map(|t| t.requires_approval()).unwrap_or(false)
    }

    /// Tool definitions for LLM function calling, optionally limited to an
    /// allow-list.
    pub fn tool_definitions(&self, allow: Option<&[String]>) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .filter(|t| allow.map(|names| names.iter().any(|n| n == t.name())).unwrap_or(true))
            .map(|t| t.definition())
            .collect()
    }

    /// Look up, validate and run a tool.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.parameters()
            .validate(&params)
            .map_err(ToolError::InvalidParameters)?;
        tool.execute(params, ctx).await
    }
}
