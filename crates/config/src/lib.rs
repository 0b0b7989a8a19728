//! Configuration loading, validation, and management for ChatMinds.
//!
//! Loads configuration from `~/.chatminds/config.toml` (or the file named by
//! `CHATMINDS_CONFIG`) with environment variable overrides. Validates all
//! settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.chatminds/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Active completion backend: "gemini", "openai", "openrouter", "ollama",
    /// or any name paired with an OpenAI-compatible `api_url`.
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Model identifier passed to the provider
    #[serde(default = "default_model")]
    pub model: String,

    /// API key for the active provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL override for the active provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Sampling temperature, fixed for every turn
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum output tokens per response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Whole-request timeout for provider HTTP calls
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub context: ContextConfig,

    #[serde(default)]
    pub prompts: PromptsConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_provider() -> String {
    "gemini".into()
}
fn default_model() -> String {
    "gemini-2.0-flash".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("store", &self.store)
            .field("context", &self.context)
            .field("prompts", &self.prompts)
            .field("engine", &self.engine)
            .field("gateway", &self.gateway)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file, or `sqlite::memory:`
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Directory holding uploaded files. Document storage paths are
    /// relative to it, and nothing outside it is ever removed.
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: String,
}

fn default_store_path() -> String {
    AppConfig::config_dir()
        .join("chatminds.db")
        .to_string_lossy()
        .into_owned()
}

fn default_uploads_dir() -> String {
    AppConfig::config_dir()
        .join("uploads")
        .to_string_lossy()
        .into_owned()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            uploads_dir: default_uploads_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Characters of document text injected into a document turn
    #[serde(default = "default_document_char_budget")]
    pub document_char_budget: usize,

    /// Estimated-token ceiling for replayed history (0 = unbounded)
    #[serde(default = "default_history_token_budget")]
    pub history_token_budget: usize,
}

fn default_document_char_budget() -> usize {
    15_000
}
fn default_history_token_budget() -> usize {
    24_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            document_char_budget: default_document_char_budget(),
            history_token_budget: default_history_token_budget(),
        }
    }
}

/// System directives for the two turn kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default = "default_general_prompt")]
    pub general: String,

    #[serde(default = "default_document_prompt")]
    pub document: String,
}

fn default_general_prompt() -> String {
    "You are a helpful assistant.".into()
}
fn default_document_prompt() -> String {
    "You are a helpful assistant that answers questions based on the provided document content. \
     Use the following document content to answer the user's questions:"
        .into()
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            general: default_general_prompt(),
            document: default_document_prompt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Serialize turns that share an (owner, key)
    #[serde(default = "default_true")]
    pub serialize_turns: bool,

    /// Longest wait between two stream fragments before the turn fails
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
}

fn default_stream_idle_timeout_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            serialize_turns: true,
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Allow any origin (for a browser UI served elsewhere)
    #[serde(default)]
    pub permissive_cors: bool,
}

fn default_port() -> u16 {
    3000
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            permissive_cors: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from `$CHATMINDS_CONFIG` or the default path
    /// (~/.chatminds/config.toml), then apply environment overrides:
    /// - `CHATMINDS_API_KEY` (highest priority), then the provider's own key
    ///   variable (`GEMINI_API_KEY`, `OPENAI_API_KEY`, `OPENROUTER_API_KEY`)
    /// - `CHATMINDS_PROVIDER`, `CHATMINDS_MODEL`, `CHATMINDS_DB`,
    ///   `CHATMINDS_UPLOADS`, `PORT`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CHATMINDS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"));
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(provider) = lookup("CHATMINDS_PROVIDER") {
            self.provider = provider;
        }

        if let Some(model) = lookup("CHATMINDS_MODEL") {
            self.model = model;
        }

        let provider_key_var = match self.provider.as_str() {
            "gemini" => Some("GEMINI_API_KEY"),
            "openai" => Some("OPENAI_API_KEY"),
            "openrouter" => Some("OPENROUTER_API_KEY"),
            _ => None,
        };
        if let Some(key) = lookup("CHATMINDS_API_KEY")
            .or_else(|| provider_key_var.and_then(&lookup))
            .filter(|k| !k.trim().is_empty())
        {
            self.api_key = Some(key);
        }

        if let Some(path) = lookup("CHATMINDS_DB") {
            self.store.path = path;
        }
        if let Some(dir) = lookup("CHATMINDS_UPLOADS") {
            self.store.uploads_dir = dir;
        }

        if let Some(port) = lookup("PORT").and_then(|p| p.parse().ok()) {
            self.gateway.port = port;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".chatminds")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.max_tokens == 0 {
            return Err(ConfigError::ValidationError("max_tokens must be > 0".into()));
        }

        if self.context.document_char_budget == 0 {
            return Err(ConfigError::ValidationError(
                "context.document_char_budget must be > 0".into(),
            ));
        }

        if self.engine.stream_idle_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "engine.stream_idle_timeout_secs must be > 0".into(),
            ));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model must not be empty".into()));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            api_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            store: StoreConfig::default(),
            context: ContextConfig::default(),
            prompts: PromptsConfig::default(),
            engine: EngineConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
