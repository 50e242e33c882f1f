//! Shell execution tool.
//!
//! Runs `sh -c <command>` with:
//! - its own process group, registered with the job's Process Registry so
//!   cancellation kills the whole tree
//! - an environment scrubbed to a safe allow-list
//! - timeout enforcement and output truncation
//! - each stdout/stderr line streamed as a `tool.output` event

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::ToolError;
use crate::process::{kill_process_group, safe_env};
use crate::tools::schema::ParamSchema;
use crate::tools::tool::{optional_str, require_str, Tool, ToolContext, ToolOutput};

/// Commands that are always blocked.
const BLOCKED_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    ":(){ :|:& };:",
    "dd if=/dev/zero",
    "mkfs",
    "chmod -r 777 /",
    "> /dev/sda",
];

/// Shell tool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub enabled: bool,
    /// Default working directory; the service's cwd when unset
    pub working_dir: Option<PathBuf>,
    pub timeout_ms: u64,
    /// Bytes of combined output kept in the tool result
    pub max_output_bytes: usize,
    pub require_approval: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            working_dir: None,
            timeout_ms: 120_000,
            max_output_bytes: 64 * 1024,
            require_approval: true,
        }
    }
}

/// Shell command execution tool.
#[derive(Debug)]
pub struct ShellTool {
    config: ShellConfig,
}

enum Stream {
    Stdout,
    Stderr,
}

impl ShellTool {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    fn is_blocked(command: &str) -> bool {
        let normalized = command.to_lowercase();
        BLOCKED_COMMANDS.iter().any(|b| normalized.contains(b))
    }

    fn push_capped(&self, buf: &mut String, line: &str, truncated: &mut bool) {
        if *truncated {
            return;
        }
        if buf.len() + line.len() + 1 > self.config.max_output_bytes {
            let room = self.config.max_output_bytes.saturating_sub(buf.len());
            let mut cut = room.min(line.len());
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            buf.push_str(&line[..cut]);
            buf.push_str("\n[output truncated]");
            *truncated = true;
            return;
        }
        buf.push_str(line);
        buf.push('\n');
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command with sh -c and return its exit code and combined output."
    }

    fn parameters(&self) -> ParamSchema {
        ParamSchema::object()
            .property(
                "command",
                ParamSchema::string().describe("The shell command to run"),
                true,
            )
            .property(
                "cwd",
                ParamSchema::string().describe("Working directory for the command"),
                false,
            )
    }

    fn requires_approval(&self) -> bool {
        self.config.require_approval
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let command = require_str(&params, "command")?;
        if Self::is_blocked(command) {
            return Err(ToolError::ExecutionFailed(
                "command contains a blocked pattern".to_string(),
            ));
        }

        let cwd = optional_str(&params, "cwd")
            .map(PathBuf::from)
            .or_else(|| self.config.working_dir.clone());

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .env_clear()
            .envs(safe_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn shell: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::ExecutionFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolError::ExecutionFailed("stderr not captured".to_string()))?;

        let tracked = ctx.processes.register_job_process(ctx.job_id, child);
        let pid = tracked.pid();
        tracing::debug!(job_id = %ctx.job_id, pid = ?pid, command = %command, "shell command started");

        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut output = String::new();
        let mut truncated = false;

        let run = async {
            let (mut out_done, mut err_done) = (false, false);
            while !(out_done && err_done) {
                let next = tokio::select! {
                    l = out_lines.next_line(), if !out_done => (Stream::Stdout, l),
                    l = err_lines.next_line(), if !err_done => (Stream::Stderr, l),
                };
                match next {
                    (_, Ok(Some(line))) => {
                        ctx.stream_output(line.clone());
                        self.push_capped(&mut output, &line, &mut truncated);
                    }
                    (Stream::Stdout, _) => out_done = true,
                    (Stream::Stderr, _) => err_done = true,
                }
            }
            tracked.wait().await
        };

        let timeout = Duration::from_millis(self.config.timeout_ms);
        let status = tokio::select! {
            status = tokio::time::timeout(timeout, run) => match status {
                Ok(status) => status.map_err(|e| ToolError::ExecutionFailed(e.to_string()))?,
                Err(_) => {
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    return Err(ToolError::Timeout(timeout));
                }
            },
            _ = ctx.cancel.cancelled() => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                return Err(ToolError::ExecutionFailed("cancelled".to_string()));
            }
        };

        Ok(ToolOutput::success(
            json!({
                "exit_code": status.code(),
                "output": output,
            }),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRegistry;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(registry: &ProcessRegistry, job: Uuid) -> ToolContext {
        ToolContext::new(job, "call_1", CancellationToken::new(), registry.clone())
    }

    #[tokio::test]
    async fn test_runs_and_streams() {
        let registry = ProcessRegistry::new();
        let job = Uuid::now_v7();
        let ctx = ctx(&registry, job);
        let tool = ShellTool::new(ShellConfig::default());

        let out = tool
            .execute(json!({"command": "echo one; echo two >&2; exit 3"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.result["exit_code"], 3);
        let text = out.result["output"].as_str().unwrap();
        assert!(text.contains("one") && text.contains("two"));
        assert!(ctx.has_streamed());
        assert_eq!(registry.count(job), 0);
    }

    #[tokio::test]
    async fn test_env_is_scrubbed() {
        std::env::set_var("AGENTJOBS_TEST_SECRET", "leak");
        let registry = ProcessRegistry::new();
        let tool = ShellTool::new(ShellConfig::default());
        let out = tool
            .execute(
                json!({"command": "echo \"[$AGENTJOBS_TEST_SECRET]\""}),
                &ctx(&registry, Uuid::now_v7()),
            )
            .await
            .unwrap();
        assert_eq!(out.result["output"], "[]\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let registry = ProcessRegistry::new();
        let job = Uuid::now_v7();
        let tool = ShellTool::new(ShellConfig {
            timeout_ms: 200,
            ..ShellConfig::default()
        });
        let err = tool
            .execute(json!({"command": "sleep 30"}), &ctx(&registry, job))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));

        // Watcher drops the entry once the killed process is reaped
        for _ in 0..50 {
            if registry.count(job) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.count(job), 0);
    }

    #[tokio::test]
    async fn test_blocked_and_truncated() {
        let registry = ProcessRegistry::new();
        let tool = ShellTool::new(ShellConfig {
            max_output_bytes: 16,
            ..ShellConfig::default()
        });
        let c = ctx(&registry, Uuid::now_v7());
        assert!(tool.execute(json!({"command": "rm -rf /"}), &c).await.is_err());

        let out = tool
            .execute(json!({"command": "printf 'aaaaaaaaaa\\nbbbbbbbbbb\\ncccc\\n'"}), &c)
            .await
            .unwrap();
        assert!(out.result["output"].as_str().unwrap().ends_with("[output truncated]"));
    }
}
