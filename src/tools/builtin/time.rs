//! Time utility tool.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::error::ToolError;
use crate::tools::schema::ParamSchema;
use crate::tools::tool::{Tool, ToolContext, ToolOutput};

/// Current UTC time in RFC 3339.
pub struct TimeTool;

#[async_trait]
impl Tool for TimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current UTC date and time in RFC 3339 format."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object()
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let start = std::time::Instant::now();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        Ok(ToolOutput::text(now, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rfc3339_output() {
        let out = TimeTool
            .execute(serde_json::json!({}), &ToolContext::detached())
            .await
            .unwrap();
        let text = out.result.as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(text).is_ok());
        assert!(text.ends_with('Z'));
    }
}
