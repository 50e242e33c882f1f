//! Guardrail Service - deterministic policy checks
//!
//! Every check is a pure function of its configuration and arguments:
//!
//! ```text
//! user prompt ──► check_input ──► LLM ──► check_output ──► result
//!                                  │
//!                                  └─► tool call ──► check_tool_call ──► handler
//! ```
//!
//! A rejection is reported as a [`GuardrailViolation`]; nothing here logs,
//! allocates shared state or talks to the outside world.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{GuardrailCheck, GuardrailViolation};

/// Policy knobs for the guardrail checks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Longest prompt accepted by `check_input`, in characters
    pub max_prompt_length: usize,
    /// Longest model response accepted by `check_output`, in characters
    pub max_output_length: usize,
    /// Terms rejected anywhere in a prompt, matched case-insensitively
    pub forbidden_terms: Vec<String>,
    /// Reject prompts containing SSNs, card numbers, emails, phones or IPv4s
    pub detect_pii: bool,
    /// Substrings that mark a command argument as dangerous
    pub dangerous_commands: Vec<String>,
    /// Path prefixes tools may not touch
    pub restricted_paths: Vec<String>,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_prompt_length: 10_000,
            max_output_length: 20_000,
            forbidden_terms: Vec::new(),
            detect_pii: true,
            dangerous_commands: [
                "rm -rf",
                "rm -fr",
                "sudo ",
                "mkfs",
                "dd if=",
                ":(){",
                "chmod 777",
                "chown -r",
                "> /dev/sd",
                "shutdown",
                "reboot",
                "| sh",
                "| bash",
                "nc -e",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            restricted_paths: ["/etc", "/root", "/proc", "/sys", "/boot", "/dev", "/var/run"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Patterns
// ─────────────────────────────────────────────────────────────────────────────

lazy_static! {
    /// (label, pattern) pairs for personally identifiable information.
    static ref PII_PATTERNS: Vec<(&'static str, Regex)> = [
        ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
        ("credit_card", r"\b(?:\d{4}[ -]?){3}\d{4}\b"),
        ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
        ("phone", r"(?:\+?1[-. ]?)?\(?\b\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b"),
        (
            "ipv4",
            r"\b(?:(?:25[0-5]|2[0-4]\d|1?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|1?\d?\d)\b",
        ),
    ]
    .into_iter()
    .map(|(label, re)| (label, Regex::new(re).expect("PII pattern must compile")))
    .collect();

    /// Content a model response must never carry.
    static ref HARMFUL_PATTERNS: Vec<(&'static str, Regex)> = [
        (
            "weapons",
            r"(?i)\bhow\s+to\s+(?:make|build|assemble)\s+(?:a\s+)?(?:bomb|explosive|pipe\s*bomb)",
        ),
        ("private_key", r"-----BEGIN (?:RSA |EC |OPENSSH )?PRIVATE KEY-----"),
        (
            "credential",
            r"(?i)\b(?:api[_-]?key|secret[_-]?key|password)\s*[:=]\s*\S{8,}",
        ),
        ("self_harm", r"(?i)\b(?:ways|methods)\s+to\s+(?:kill|harm)\s+(?:yourself|myself)\b"),
    ]
    .into_iter()
    .map(|(label, re)| (label, Regex::new(re).expect("harmful pattern must compile")))
    .collect();
}

/// Argument keys that hold something executed by a shell.
const COMMAND_KEYS: &[&str] = &["command", "cmd", "script", "shell", "args"];

/// Argument keys that hold a filesystem path.
const PATH_KEYS: &[&str] = &[
    "path",
    "file",
    "file_path",
    "filepath",
    "filename",
    "cwd",
    "dir",
    "directory",
    "source",
    "destination",
    "target",
];

/// Stateless policy checks over prompts, responses and tool calls.
#[derive(Debug, Clone)]
pub struct GuardrailService {
    config: GuardrailConfig,
    forbidden_lower: Vec<String>,
    dangerous_lower: Vec<String>,
}

impl GuardrailService {
    pub fn new(config: GuardrailConfig) -> Self {
        let forbidden_lower = config
            .forbidden_terms
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();
        let dangerous_lower = config
            .dangerous_commands
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();
        Self {
            config,
            forbidden_lower,
            dangerous_lower,
        }
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    /// Validate a prompt before it reaches the model.
    pub fn check_input(&self, text: &str) -> Result<(), GuardrailViolation> {
        let len = text.chars().count();
        if len > self.config.max_prompt_length {
            return Err(GuardrailViolation::new(
                GuardrailCheck::Input,
                format!(
                    "prompt is {} characters, limit is {}",
                    len, self.config.max_prompt_length
                ),
            ));
        }

        let lower = text.to_lowercase();
        if let Some(term) = self.forbidden_lower.iter().find(|t| lower.contains(t.as_str())) {
            return Err(GuardrailViolation::new(
                GuardrailCheck::Input,
                format!("prompt contains forbidden term '{}'", term),
            ));
        }

        if self.config.detect_pii {
            if let Some((label, _)) = PII_PATTERNS.iter().find(|(_, re)| re.is_match(text)) {
                return Err(GuardrailViolation::new(
                    GuardrailCheck::Input,
                    format!("prompt contains personal data ({})", label),
                ));
            }
        }

        Ok(())
    }

    /// Validate a final model response.
    pub fn check_output(&self, text: &str) -> Result<(), GuardrailViolation> {
        let len = text.chars().count();
        if len > self.config.max_output_length {
            return Err(GuardrailViolation::new(
                GuardrailCheck::Output,
                format!(
                    "response is {} characters, limit is {}",
                    len, self.config.max_output_length
                ),
            ));
        }

        if let Some((label, _)) = HARMFUL_PATTERNS.iter().find(|(_, re)| re.is_match(text)) {
            return Err(GuardrailViolation::new(
                GuardrailCheck::Output,
                format!("response matches harmful content pattern ({})", label),
            ));
        }

        Ok(())
    }

    /// Validate a tool invocation's arguments before the handler runs.
    ///
    /// Nested objects are walked; only values under command-like or
    /// path-like keys are inspected.
    pub fn check_tool_call(&self, name: &str, args: &Value) -> Result<(), GuardrailViolation> {
        self.check_value(name, None, args)
    }

    fn check_value(
        &self,
        tool: &str,
        key: Option<&str>,
        value: &Value,
    ) -> Result<(), GuardrailViolation> {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    self.check_value(tool, Some(k.as_str()), v)?;
                }
                Ok(())
            }
            Value::Array(items) => {
                if let Some(k) = key.filter(|k| is_command_key(k)) {
                    let joined = items
                        .iter()
                        .filter_map(|v| v.as_str())
                        .collect::<Vec<_>>()
                        .join(" ");
                    self.check_command(tool, k, &joined)?;
                }
                for item in items {
                    self.check_value(tool, key, item)?;
                }
                Ok(())
            }
            Value::String(s) => match key {
                Some(k) if is_command_key(k) => self.check_command(tool, k, s),
                Some(k) if is_path_key(k) => self.check_path(tool, k, s),
                _ => Ok(()),
            },
            _ => Ok(()),
        }
    }

    fn check_command(&self, tool: &str, key: &str, command: &str) -> Result<(), GuardrailViolation> {
        let lower = command.to_lowercase();
        if let Some(pattern) = self.dangerous_lower.iter().find(|p| lower.contains(p.as_str())) {
            return Err(GuardrailViolation::new(
                GuardrailCheck::ToolCall,
                format!(
                    "{}: argument '{}' contains dangerous command '{}'",
                    tool,
                    key,
                    pattern.trim()
                ),
            ));
        }
        Ok(())
    }

    fn check_path(&self, tool: &str, key: &str, path: &str) -> Result<(), GuardrailViolation> {
        if path.contains("..") {
            return Err(GuardrailViolation::new(
                GuardrailCheck::ToolCall,
                format!("{}: argument '{}' contains '..'", tool, key),
            ));
        }
        self.check_command(tool, key, path)?;

        let restricted = self.config.restricted_paths.iter().find(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            !prefix.is_empty()
                && (path == prefix || path.starts_with(&format!("{}/", prefix)))
        });
        if let Some(prefix) = restricted {
            return Err(GuardrailViolation::new(
                GuardrailCheck::ToolCall,
                format!("{}: argument '{}' is under restricted path {}", tool, key, prefix),
            ));
        }
        Ok(())
    }

    /// Redact PII and drop lines that carry dangerous commands.
    pub fn sanitize_input(&self, text: &str) -> String {
        let kept: Vec<&str> = text
            .lines()
            .filter(|line| {
                let lower = line.to_lowercase();
                !self.dangerous_lower.iter().any(|p| lower.contains(p.as_str()))
            })
            .collect();

        let mut out = kept.join("\n");
        for (label, re) in PII_PATTERNS.iter() {
            let replacement = format!("[REDACTED_{}]", label.to_uppercase());
            out = re.replace_all(&out, replacement.as_str()).into_owned();
        }
        out
    }
}

fn is_command_key(key: &str) -> bool {
    COMMAND_KEYS.contains(&key.to_ascii_lowercase().as_str())
}

fn is_path_key(key: &str) -> bool {
    PATH_KEYS.contains(&key.to_ascii_lowercase().as_str())
}
