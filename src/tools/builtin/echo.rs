//! Echo tool for testing.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;
use crate::tools::schema::ParamSchema;
use crate::tools::tool::{require_str, Tool, ToolContext, ToolOutput};

/// Returns its `text` argument verbatim.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the input text. Useful for testing tool execution."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object().property(
            "text",
            ParamSchema::string().describe("The text to echo back"),
            true,
        )
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let text = require_str(&params, "text")?;
        Ok(ToolOutput::text(text, start.elapsed()))
    }
}
