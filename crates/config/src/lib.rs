//! Configuration loading, validation, and management for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model backend
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Search / extract tools
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Context window budget
    #[serde(default)]
    pub context: ContextConfig,

    /// Per-turn limits
    #[serde(default)]
    pub turn: TurnConfig,

    /// Incremental rendering
    #[serde(default)]
    pub render: RenderConfig,

    /// Telegram bot connection
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Who may talk to the bot
    #[serde(default)]
    pub access: AccessConfig,

    /// Turn storage
    #[serde(default)]
    pub store: StoreConfig,

    /// System prompt and bot persona
    #[serde(default)]
    pub identity: IdentityConfig,
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Connect timeout for the streaming HTTP client
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_connect_timeout_secs() -> u64 {
    15
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tavily_api_key: Option<String>,

    #[serde(default = "default_tavily_base_url")]
    pub tavily_base_url: String,

    #[serde(default = "default_search_max_results")]
    pub search_max_results: u32,

    /// "basic" or "advanced"
    #[serde(default = "default_search_depth")]
    pub search_depth: String,

    /// Per-call timeout
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,

    /// Extracted page text is cut to this many characters
    #[serde(default = "default_max_extract_chars")]
    pub max_extract_chars: usize,
}

fn default_tavily_base_url() -> String {
    "https://api.tavily.com".into()
}
fn default_search_max_results() -> u32 {
    5
}
fn default_search_depth() -> String {
    "basic".into()
}
fn default_tool_timeout_secs() -> u64 {
    30
}
fn default_max_extract_chars() -> usize {
    20_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            tavily_api_key: None,
            tavily_base_url: default_tavily_base_url(),
            search_max_results: default_search_max_results(),
            search_depth: default_search_depth(),
            timeout_secs: default_tool_timeout_secs(),
            max_extract_chars: default_max_extract_chars(),
        }
    }
}

impl std::fmt::Debug for ToolsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolsConfig")
            .field("tavily_api_key", &redact(&self.tavily_api_key))
            .field("tavily_base_url", &self.tavily_base_url)
            .field("search_max_results", &self.search_max_results)
            .field("search_depth", &self.search_depth)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_extract_chars", &self.max_extract_chars)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Total prompt budget B, system prompt and completion headroom included
    #[serde(default = "default_token_limit")]
    pub token_limit: u32,

    /// Tokens reserved for the model's answer
    #[serde(default = "default_completion_headroom")]
    pub completion_headroom: u32,

    /// Fixed cost charged for each image or document block
    #[serde(default = "default_media_block_tokens")]
    pub media_block_tokens: u32,

    /// How many stored turns to consider before budgeting
    #[serde(default = "default_history_fetch_limit")]
    pub history_fetch_limit: usize,
}

fn default_token_limit() -> u32 {
    8000
}
fn default_completion_headroom() -> u32 {
    1024
}
fn default_media_block_tokens() -> u32 {
    85
}
fn default_history_fetch_limit() -> usize {
    50
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_limit: default_token_limit(),
            completion_headroom: default_completion_headroom(),
            media_block_tokens: default_media_block_tokens(),
            history_fetch_limit: default_history_fetch_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Tool batches allowed per turn before the answer is forced
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    /// Wall-clock budget for one turn
    #[serde(default = "default_turn_timeout_secs")]
    pub timeout_secs: u64,

    /// Whether reasoning is shown to users who haven't toggled it
    #[serde(default)]
    pub show_reasoning: bool,
}

fn default_max_tool_rounds() -> u32 {
    8
}
fn default_turn_timeout_secs() -> u64 {
    300
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            timeout_secs: default_turn_timeout_secs(),
            show_reasoning: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Minimum spacing between two live updates
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Largest snapshot sent in one message
    #[serde(default = "default_max_payload_chars")]
    pub max_payload_chars: usize,
}

fn default_min_interval_ms() -> u64 {
    1000
}
fn default_max_payload_chars() -> usize {
    3900
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_payload_chars: default_max_payload_chars(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,

    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,

    /// Long-poll timeout passed to getUpdates
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".into()
}
fn default_poll_timeout_secs() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_telegram_api_base(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &redact(&self.bot_token))
            .field("api_base", &self.api_base)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    /// Allowlist of user IDs. Empty = deny all. ["*"] = allow all.
    #[serde(default)]
    pub allowed_users: Vec<String>,

    /// Admins are always allowed.
    #[serde(default)]
    pub admin_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

fn default_database_url() -> String {
    "sqlite://parley.db".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_bot_name")]
    pub bot_name: String,

    /// Inline system prompt template; wins over `system_prompt_file`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_file: Option<PathBuf>,

    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_bot_name() -> String {
    "Parley".into()
}
fn default_timezone() -> String {
    "UTC".into()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            bot_name: default_bot_name(),
            system_prompt: None,
            system_prompt_file: None,
            timezone: default_timezone(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// Environment overrides are not applied; see [`AppConfig::apply_env`].
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

    /// Apply environment overrides. Environment wins over the file.
    ///
    /// `lookup` is injected so tests don't have to mutate the process env.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(token);
        }
        if let Some(key) = lookup("OPENROUTER_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(model) = lookup("OPENROUTER_MODEL") {
            self.provider.model = model;
        }
        if let Some(key) = lookup("TAVILY_API_KEY") {
            self.tools.tavily_api_key = Some(key);
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.store.database_url = url;
        }
        if let Some(limit) = lookup("CONTEXT_TOKEN_LIMIT") {
            match limit.trim().parse() {
                Ok(limit) => self.context.token_limit = limit,
                Err(_) => tracing::warn!(value = %limit, "Ignoring unparseable CONTEXT_TOKEN_LIMIT"),
            }
        }
        if let Some(ids) = lookup("PARLEY_ADMIN_IDS") {
            self.access.admin_ids = split_list(&ids);
        }
        if let Some(ids) = lookup("PARLEY_ALLOWED_USERS") {
            self.access.allowed_users = split_list(&ids);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.context.token_limit == 0 {
            return Err(ConfigError::ValidationError(
                "context.token_limit must be > 0".into(),
            ));
        }
        if self.context.completion_headroom >= self.context.token_limit {
            return Err(ConfigError::ValidationError(
                "context.completion_headroom must be smaller than context.token_limit".into(),
            ));
        }
        if self.turn.max_tool_rounds == 0 {
            return Err(ConfigError::ValidationError(
                "turn.max_tool_rounds must be > 0".into(),
            ));
        }
        if self.turn.timeout_secs == 0 || self.tools.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "turn.timeout_secs and tools.timeout_secs must be > 0".into(),
            ));
        }
        if self.render.max_payload_chars < 64 {
            return Err(ConfigError::ValidationError(
                "render.max_payload_chars must be at least 64".into(),
            ));
        }
        if !matches!(self.tools.search_depth.as_str(), "basic" | "advanced") {
            return Err(ConfigError::ValidationError(
                "tools.search_depth must be \"basic\" or \"advanced\"".into(),
            ));
        }
        Ok(())
    }

    /// Load the system prompt template: inline text, then file, then built-in.
    pub fn system_prompt_template(&self) -> Result<String, ConfigError> {
        if let Some(inline) = &self.identity.system_prompt {
            return Ok(inline.clone());
        }
        if let Some(path) = &self.identity.system_prompt_file {
            return std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.clone(),
                reason: e.to_string(),
            });
        }
        Ok(DEFAULT_SYSTEM_PROMPT.to_string())
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Built-in system prompt template.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are {bot_name}, a helpful assistant running on {model_name}.
Today is {date}, the time is {time} ({timezone}).
You are talking to {user_name}. Reply in {user_lang} unless asked otherwise.
Use web_search for anything recent and extract_webpage to read a specific page.
Cite the URLs you relied on.";

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.provider.model, "moonshotai/kimi-k2.5");
        assert_eq!(config.context.token_limit, 8000);
        assert_eq!(config.context.media_block_tokens, 85);
        assert_eq!(config.turn.max_tool_rounds, 8);
        assert_eq!(config.turn.timeout_secs, 300);
        assert_eq!(config.tools.timeout_secs, 30);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.provider.model, config.provider.model);
        assert_eq!(parsed.render.max_payload_chars, config.render.max_payload_chars);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let mut config = AppConfig::default();
        config.provider.temperature = 5.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn headroom_must_fit_inside_budget() {
        let mut config = AppConfig::default();
        config.context.token_limit = 1000;
        config.context.completion_headroom = 1000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("completion_headroom"));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.provider.base_url, "https://openrouter.ai/api/v1");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[turn]\nmax_tool_rounds = 3\n\n[access]\nallowed_users = [\"*\"]\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.turn.max_tool_rounds, 3);
        assert_eq!(config.turn.timeout_secs, 300);
        assert_eq!(config.access.allowed_users, vec!["*"]);
    }

    #[test]
    fn invalid_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[turn\n").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OPENROUTER_MODEL", "openai/gpt-4o"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("CONTEXT_TOKEN_LIMIT", "16000"),
            ("PARLEY_ADMIN_IDS", "1, 2,,3"),
        ]);
        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.provider.model, "openai/gpt-4o");
        assert_eq!(config.telegram.bot_token.as_deref(), Some("123:abc"));
        assert_eq!(config.context.token_limit, 16000);
        assert_eq!(config.access.admin_ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn unparseable_token_limit_is_ignored() {
        let mut config = AppConfig::default();
        config.apply_env(|k| (k == "CONTEXT_TOKEN_LIMIT").then(|| "lots".to_string()));
        assert_eq!(config.context.token_limit, 8000);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut config = AppConfig::default();
        config.provider.api_key = Some("sk-secret".into());
        config.telegram.bot_token = Some("123:secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(!debug.contains("123:secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn system_prompt_prefers_inline_text() {
        let mut config = AppConfig::default();
        assert!(config.system_prompt_template().unwrap().contains("{bot_name}"));
        config.identity.system_prompt = Some("Be brief.".into());
        assert_eq!(config.system_prompt_template().unwrap(), "Be brief.");
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("moonshotai/kimi-k2.5"));
        assert!(toml_str.contains("max_tool_rounds"));
    }
}
