//! Service configuration
//!
//! Loaded from an optional JSON file named by `AGENTJOBS_CONFIG`, then
//! overridden by environment variables, then validated. Every section has
//! defaults, so an empty file (or none) yields a working local setup:
//! Ollama on localhost, in-memory stores, console logs.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::agent::AgentConfig;
use crate::error::ConfigError;
use crate::guardrail::GuardrailConfig;
use crate::llm::{LlmConfig, ProviderKind};
use crate::mcp::{McpServerConfig, DEFAULT_REQUEST_TIMEOUT};
use crate::tools::ShellConfig;
use crate::tracing::TelemetryConfig;

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "AGENTJOBS_CONFIG";

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Job defaults and the agent loop's policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Safety timeout for jobs submitted without `timeout_ms`
    pub default_timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub agent: AgentConfig,
}

/// Where jobs, events and sessions are persisted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// In-memory stores when unset
    pub data_dir: Option<PathBuf>,
}

/// MCP transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    pub request_timeout_secs: u64,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl McpSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// The whole service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub jobs: JobsConfig,
    pub llm: LlmConfig,
    pub guardrails: GuardrailConfig,
    pub shell: ShellConfig,
    pub mcp: McpSettings,
    pub mcp_servers: Vec<McpServerConfig>,
    pub store: StoreConfig,
    pub telemetry: TelemetryConfig,
}

impl ServiceConfig {
    /// File (if `AGENTJOBS_CONFIG` is set), then environment, then validation.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text).map_err(|message| ConfigError::Parse {
            path: path.display().to_string(),
            message,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| e.to_string())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(bind) = get("AGENTJOBS_BIND") {
            self.server.bind = bind;
        }
        if let Some(dir) = get("AGENTJOBS_DATA_DIR") {
            self.store.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(provider) = get("AGENTJOBS_PROVIDER") {
            self.llm.provider = parse_provider("AGENTJOBS_PROVIDER", &provider)?;
        }
        if let Some(list) = get("AGENTJOBS_FALLBACK") {
            self.llm.fallback_order = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_provider("AGENTJOBS_FALLBACK", s))
                .collect::<Result<_, _>>()?;
        }
        if let Some(model) = get("AGENTJOBS_MODEL") {
            self.llm.model = Some(model);
        }
        for kind in ProviderKind::ALL {
            if let Some(key) = kind.api_key_env().and_then(|env| get(env)) {
                self.llm.providers.entry(kind).or_default().api_key = Some(key);
            }
        }
        if let Some(url) = get("OLLAMA_BASE_URL") {
            self.llm
                .providers
                .entry(ProviderKind::Ollama)
                .or_default()
                .base_url = Some(url);
        }
        if let Some(endpoint) = get("OTEL_EXPORTER_OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(endpoint);
        }
        if let Some(format) = get("AGENTJOBS_LOG_FORMAT") {
            self.telemetry.json_logs = format.eq_ignore_ascii_case("json");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;
        if self.jobs.agent.max_steps == 0 {
            return Err(invalid("jobs.max_steps", "must be at least 1"));
        }
        if self.jobs.agent.approval_timeout_ms == 0 {
            return Err(invalid("jobs.approval_timeout_ms", "must be positive"));
        }
        if self.jobs.default_timeout_ms == Some(0) {
            return Err(invalid("jobs.default_timeout_ms", "must be positive"));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(invalid("llm.request_timeout_secs", "must be positive"));
        }
        if self.shell.timeout_ms == 0 {
            return Err(invalid("shell.timeout_ms", "must be positive"));
        }
        if self.shell.max_output_bytes == 0 {
            return Err(invalid("shell.max_output_bytes", "must be positive"));
        }
        if self.mcp.request_timeout_secs == 0 {
            return Err(invalid("mcp.request_timeout_secs", "must be positive"));
        }

        let mut ids = HashSet::new();
        for server in &self.mcp_servers {
            if server.id.is_empty() || server.id.contains("__") {
                return Err(invalid(
                    "mcp_servers.id",
                    format!("'{}' must be non-empty and may not contain '__'", server.id),
                ));
            }
            if server.command.trim().is_empty() {
                return Err(invalid(
                    "mcp_servers.command",
                    format!("server '{}' has no command", server.id),
                ));
            }
            if !ids.insert(server.id.as_str()) {
                return Err(invalid(
                    "mcp_servers.id",
                    format!("duplicate server id '{}'", server.id),
                ));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.server
            .bind
            .parse()
            .map_err(|e| invalid("server.bind", format!("'{}': {}", self.server.bind, e)))
    }
}

fn parse_provider(key: &str, value: &str) -> Result<ProviderKind, ConfigError> {
    value.parse().map_err(|message| ConfigError::InvalidValue {
        key: key.to_string(),
        message,
    })
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.llm.provider, ProviderKind::Ollama);
        assert_eq!(config.jobs.agent.max_steps, 10);
        assert!(config.store.data_dir.is_none());
    }

    #[test]
    fn test_file_sections() {
        let config = ServiceConfig::from_json(
            r#"{
                "server": {"bind": "0.0.0.0:9000"},
                "jobs": {"default_timeout_ms": 30000, "max_steps": 4, "approval_tools": ["files__write"]},
                "llm": {"provider": "anthropic", "fallback_order": ["ollama"]},
                "guardrails": {"forbidden_terms": ["secret"]},
                "shell": {"enabled": false},
                "mcp_servers": [{"id": "files", "command": "mcp-files", "args": ["--root", "/srv"]}],
                "store": {"data_dir": "/var/lib/agentjobs"},
                "telemetry": {"json_logs": true}
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.jobs.default_timeout_ms, Some(30_000));
        assert_eq!(config.jobs.agent.max_steps, 4);
        assert_eq!(config.jobs.agent.approval_tools, vec!["files__write"]);
        assert_eq!(config.llm.provider, ProviderKind::Anthropic);
        assert!(!config.shell.enabled);
        assert_eq!(config.mcp_servers[0].args, vec!["--root", "/srv"]);
        assert!(config.telemetry.json_logs);
    }

    #[test]
    fn test_unknown_provider_in_file_fails() {
        assert!(ServiceConfig::from_json(r#"{"llm": {"provider": "skynet"}}"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServiceConfig::default();
        config
            .apply_env(env(&[
                ("AGENTJOBS_BIND", "0.0.0.0:7000"),
                ("AGENTJOBS_PROVIDER", "OpenAI"),
                ("AGENTJOBS_FALLBACK", "groq, ollama,"),
                ("AGENTJOBS_MODEL", "gpt-4o"),
                ("OPENAI_API_KEY", "sk-test"),
                ("OLLAMA_BASE_URL", "http://gpu-box:11434"),
                ("AGENTJOBS_LOG_FORMAT", "json"),
                ("AGENTJOBS_DATA_DIR", "  "),
            ]))
            .unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:7000");
        assert_eq!(config.llm.provider, ProviderKind::OpenAi);
        assert_eq!(
            config.llm.fallback_order,
            vec![ProviderKind::Groq, ProviderKind::Ollama]
        );
        assert_eq!(config.llm.model.as_deref(), Some("gpt-4o"));
        assert_eq!(
            config.llm.settings(ProviderKind::OpenAi).api_key.as_deref(),
            Some("sk-test")
        );
        assert_eq!(
            config.llm.settings(ProviderKind::Ollama).base_url.as_deref(),
            Some("http://gpu-box:11434")
        );
        assert!(config.telemetry.json_logs);
        assert!(config.store.data_dir.is_none());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = ServiceConfig::default();
        assert!(matches!(
            config.apply_env(env(&[("AGENTJOBS_PROVIDER", "skynet")])),
            Err(ConfigError::InvalidValue { key, .. }) if key == "AGENTJOBS_PROVIDER"
        ));

        let mut zero_steps = ServiceConfig::default();
        zero_steps.jobs.agent.max_steps = 0;
        assert!(matches!(
            zero_steps.validate(),
            Err(ConfigError::InvalidValue { key, .. }) if key == "jobs.max_steps"
        ));

        let mut bad_bind = ServiceConfig::default();
        bad_bind.server.bind = "not an address".into();
        assert!(bad_bind.validate().is_err());

        let dup = ServiceConfig::from_json(
            r#"{"mcp_servers": [{"id": "a", "command": "x"}, {"id": "a", "command": "y"}]}"#,
        )
        .unwrap();
        assert!(dup.validate().is_err());

        let sep = ServiceConfig::from_json(r#"{"mcp_servers": [{"id": "a__b", "command": "x"}]}"#)
            .unwrap();
        assert!(sep.validate().is_err());
    }
}
