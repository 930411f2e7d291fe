//! Bridge configuration loading and validation.
//!
//! Reads `bridge.yaml` and resolves environment variables. Every field has a
//! default, so a missing file runs the bridge against a local Ollama.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::conversation::HistoryLimits;
use crate::agent_core::correlator::CorrelatorSettings;
use crate::agent_core::prompt::DEFAULT_SYSTEM_PROMPT;
use crate::inference::thinking::{default_markers, MarkerPair};
use crate::inference::{ReconstructOptions, RequestOptions, RetryPolicy};

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "GMOD_BRIDGE_CONFIG";

const CONFIG_FILE_NAME: &str = "bridge.yaml";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    #[error("provider '{provider}' requires {field}")]
    MissingProviderValue {
        provider: &'static str,
        field: &'static str,
    },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which completion provider to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    Ollama,
    Lmstudio,
    Cerebras,
    OpenaiCompatible,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Lmstudio => "lmstudio",
            ProviderKind::Cerebras => "cerebras",
            ProviderKind::OpenaiCompatible => "openai_compatible",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// Endpoint, credentials and model after per-provider defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProvider {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

impl ProviderConfig {
    pub fn resolve(&self) -> Result<ResolvedProvider, ConfigError> {
        let set = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
        let provider = self.kind.as_str();

        let (base_url, api_key, model) = match self.kind {
            ProviderKind::Ollama => (
                set(&self.base_url).unwrap_or_else(|| "http://localhost:11434/v1".into()),
                set(&self.api_key).unwrap_or_else(|| "ollama".into()),
                set(&self.model).unwrap_or_else(|| "gpt-oss:20b".into()),
            ),
            ProviderKind::Lmstudio => (
                set(&self.base_url).unwrap_or_else(|| "http://localhost:1234/v1".into()),
                set(&self.api_key).unwrap_or_else(|| "lm-studio".into()),
                set(&self.model).unwrap_or_else(|| "openai/gpt-oss-20b".into()),
            ),
            ProviderKind::Cerebras => (
                set(&self.base_url).unwrap_or_else(|| "https://api.cerebras.ai/v1".into()),
                set(&self.api_key).ok_or(ConfigError::MissingProviderValue {
                    provider,
                    field: "api_key",
                })?,
                set(&self.model).unwrap_or_else(|| "gpt-oss-120b".into()),
            ),
            ProviderKind::OpenaiCompatible => (
                set(&self.base_url).ok_or(ConfigError::MissingProviderValue {
                    provider,
                    field: "base_url",
                })?,
                set(&self.api_key).ok_or(ConfigError::MissingProviderValue {
                    provider,
                    field: "api_key",
                })?,
                set(&self.model).unwrap_or_default(),
            ),
        };

        Ok(ResolvedProvider {
            base_url,
            api_key,
            model,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8765,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub system_prompt: String,
    pub stream_responses: bool,
    /// Scan for in-band thinking markers and send reasoning parameters.
    pub thinking_model: bool,
    /// Forward thinking text to the game.
    pub show_thinking: bool,
    /// Sent as `max_completion_tokens`.
    pub thinking_budget: Option<u32>,
    /// `low`, `medium` or `high`.
    pub reasoning_effort: Option<String>,
    pub thinking_markers: Vec<MarkerPair>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            stream_responses: true,
            thinking_model: true,
            show_thinking: true,
            thinking_budget: None,
            reasoning_effort: None,
            thinking_markers: default_markers(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_turns: usize,
    pub recent_window: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        let limits = HistoryLimits::default();
        Self {
            max_turns: limits.max_turns,
            recent_window: limits.recent_window,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Fail a dispatched call that gets no result in this many seconds.
    pub result_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub filter: String,
    /// Log to this file instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "gmod_bridge=info,warn".into(),
            file: None,
        }
    }
}

/// Top-level configuration (mirrors `bridge.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub provider: ProviderConfig,
    pub server: ServerConfig,
    pub assistant: AssistantConfig,
    pub history: HistoryConfig,
    pub retry: RetryConfig,
    pub tools: ToolsConfig,
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let h = &self.history;
        if h.recent_window == 0 || h.recent_window >= h.max_turns {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "history.recent_window ({}) must be > 0 and < history.max_turns ({})",
                    h.recent_window, h.max_turns
                ),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                reason: "retry.max_attempts must be at least 1".into(),
            });
        }
        if self.assistant.thinking_markers.iter().any(|m| m.open.is_empty() || m.close.is_empty()) {
            return Err(ConfigError::Invalid {
                reason: "thinking markers must be non-empty".into(),
            });
        }
        self.provider.resolve()?;
        Ok(())
    }

    pub fn history_limits(&self) -> HistoryLimits {
        HistoryLimits {
            max_turns: self.history.max_turns,
            recent_window: self.history.recent_window,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
        }
    }

    pub fn request_options(&self, model: String) -> RequestOptions {
        RequestOptions {
            model,
            stream: self.assistant.stream_responses,
            max_completion_tokens: self.assistant.thinking_budget,
            reasoning_effort: self.assistant.reasoning_effort.clone(),
        }
    }

    pub fn reconstruct_options(&self) -> ReconstructOptions {
        ReconstructOptions {
            thinking_model: self.assistant.thinking_model,
            forward_thinking: self.assistant.thinking_model && self.assistant.show_thinking,
            markers: self.assistant.thinking_markers.clone(),
        }
    }

    pub fn correlator_settings(&self) -> CorrelatorSettings {
        CorrelatorSettings {
            show_thinking: self.assistant.thinking_model && self.assistant.show_thinking,
            result_timeout: self.tools.result_timeout_secs.map(Duration::from_secs),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Find the config file to load.
///
/// Order: `explicit`, `GMOD_BRIDGE_CONFIG`, `./bridge.yaml`, then
/// `<config_dir>/gmod-bridge/bridge.yaml`. `None` means run on defaults.
pub fn find_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(expand_tilde(&path)));
        }
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.exists() {
        return Some(local);
    }

    dirs::config_dir()
        .map(|dir| dir.join("gmod-bridge").join(CONFIG_FILE_NAME))
        .filter(|candidate| candidate.exists())
}

/// Load, interpolate, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_config(&raw)
}

/// Parse config text. An empty document yields the defaults.
pub fn parse_config(raw: &str) -> Result<BridgeConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);

    let config: BridgeConfig = if interpolated.trim().is_empty() {
        BridgeConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })?
    };

    config.validate()?;
    Ok(config)
}

/// Resolve and load the active configuration.
///
/// Returns the path that was loaded, if any.
pub fn load(explicit: Option<&Path>) -> Result<(BridgeConfig, Option<PathBuf>), ConfigError> {
    match find_config_path(explicit) {
        Some(path) => load_config(&path).map(|config| (config, Some(path))),
        None => {
            let config = BridgeConfig::default();
            config.validate()?;
            Ok((config, None))
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset without a default is empty.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
