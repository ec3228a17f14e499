//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.threadline/config.json`) and environment.
//! Secrets (tokens, API keys) are normally supplied through the environment; when both are
//! set, the environment wins.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// WhatsApp Cloud API settings.
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,

    /// Assistant provider settings.
    #[serde(default)]
    pub assistant: AssistantConfig,

    /// Thread store settings.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the webhook listener (default 8000).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// True if the bind address only accepts local connections.
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "localhost"
        || b.parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

/// WhatsApp Cloud API config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppConfig {
    /// Graph API access token. Overridden by ACCESS_TOKEN env.
    pub access_token: Option<String>,
    /// Sender phone number id. Overridden by PHONE_NUMBER_ID env.
    pub phone_number_id: Option<String>,
    /// Graph API version segment (default "v18.0"). Overridden by VERSION env.
    #[serde(default = "default_graph_version")]
    pub version: String,
    /// Graph API base URL (default https://graph.facebook.com).
    #[serde(default = "default_graph_api_base")]
    pub api_base: String,
    /// Token Meta echoes back on webhook verification. Overridden by VERIFY_TOKEN env.
    pub verify_token: Option<String>,
    /// App secret used to check X-Hub-Signature-256. Overridden by APP_SECRET env.
    /// When unset, signatures are not checked.
    pub app_secret: Option<String>,
}

fn default_graph_version() -> String {
    "v18.0".to_string()
}

fn default_graph_api_base() -> String {
    "https://graph.facebook.com".to_string()
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            phone_number_id: None,
            version: default_graph_version(),
            api_base: default_graph_api_base(),
            verify_token: None,
            app_secret: None,
        }
    }
}

/// Assistant provider config (OpenAI Assistants API or compatible).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantConfig {
    /// API key. Overridden by OPENAI_API_KEY env.
    pub api_key: Option<String>,
    /// Pre-provisioned assistant id. Overridden by OPENAI_ASSISTANT_ID env.
    pub assistant_id: Option<String>,
    /// API base URL (default https://api.openai.com/v1).
    #[serde(default = "default_assistant_base_url")]
    pub base_url: String,
    /// Delay between run status polls, in milliseconds (default 500).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on run status polls before giving up (default 120).
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
}

fn default_assistant_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_poll_attempts() -> u32 {
    120
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            assistant_id: None,
            base_url: default_assistant_base_url(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
        }
    }
}

/// Thread store config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Path of the thread mapping file. Relative paths resolve against the working directory.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("threads_db.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// A required setting was absent from both the environment and the config file.
#[derive(Debug, thiserror::Error)]
#[error("missing {setting}: set {env} or {field} in the config file")]
pub struct ConfigError {
    pub setting: &'static str,
    pub env: &'static str,
    pub field: &'static str,
}

/// Read an env var, treating blank values as unset.
fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn file_nonempty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the Graph API access token: env ACCESS_TOKEN overrides config.
pub fn resolve_access_token(config: &Config) -> Option<String> {
    env_nonempty("ACCESS_TOKEN").or_else(|| file_nonempty(config.whatsapp.access_token.as_ref()))
}

/// Resolve the sender phone number id: env PHONE_NUMBER_ID overrides config.
pub fn resolve_phone_number_id(config: &Config) -> Option<String> {
    env_nonempty("PHONE_NUMBER_ID")
        .or_else(|| file_nonempty(config.whatsapp.phone_number_id.as_ref()))
}

/// Resolve the Graph API version: env VERSION overrides config.
pub fn resolve_graph_version(config: &Config) -> String {
    env_nonempty("VERSION").unwrap_or_else(|| config.whatsapp.version.trim().to_string())
}

/// Resolve the webhook verify token: env VERIFY_TOKEN overrides config.
pub fn resolve_verify_token(config: &Config) -> Option<String> {
    env_nonempty("VERIFY_TOKEN").or_else(|| file_nonempty(config.whatsapp.verify_token.as_ref()))
}

/// Resolve the app secret for signature checks: env APP_SECRET overrides config.
pub fn resolve_app_secret(config: &Config) -> Option<String> {
    env_nonempty("APP_SECRET").or_else(|| file_nonempty(config.whatsapp.app_secret.as_ref()))
}

/// Resolve the assistant API key: env OPENAI_API_KEY overrides config.
pub fn resolve_api_key(config: &Config) -> Option<String> {
    env_nonempty("OPENAI_API_KEY").or_else(|| file_nonempty(config.assistant.api_key.as_ref()))
}

/// Resolve the assistant id: env OPENAI_ASSISTANT_ID overrides config.
pub fn resolve_assistant_id(config: &Config) -> Option<String> {
    env_nonempty("OPENAI_ASSISTANT_ID")
        .or_else(|| file_nonempty(config.assistant.assistant_id.as_ref()))
}

/// Resolved outbound channel settings.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub api_base: String,
    pub version: String,
    pub phone_number_id: String,
    pub access_token: String,
}

/// Resolved assistant provider settings.
#[derive(Debug, Clone)]
pub struct AssistantSettings {
    pub base_url: String,
    pub api_key: String,
    pub assistant_id: String,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
}

/// Everything the relay needs, resolved once at startup and handed to each component.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub channel: ChannelSettings,
    pub assistant: AssistantSettings,
    pub store_path: PathBuf,
    pub verify_token: Option<String>,
    pub app_secret: Option<String>,
}

impl ChannelSettings {
    /// Resolve the WhatsApp sender from config and environment.
    pub fn resolve(config: &Config) -> Result<Self, ConfigError> {
        let access_token = resolve_access_token(config).ok_or(ConfigError {
            setting: "WhatsApp access token",
            env: "ACCESS_TOKEN",
            field: "whatsapp.accessToken",
        })?;
        let phone_number_id = resolve_phone_number_id(config).ok_or(ConfigError {
            setting: "WhatsApp phone number id",
            env: "PHONE_NUMBER_ID",
            field: "whatsapp.phoneNumberId",
        })?;
        Ok(Self {
            api_base: config.whatsapp.api_base.trim_end_matches('/').to_string(),
            version: resolve_graph_version(config),
            phone_number_id,
            access_token,
        })
    }
}

impl AssistantSettings {
    /// Resolve the assistant provider from config and environment.
    pub fn resolve(config: &Config) -> Result<Self, ConfigError> {
        let api_key = resolve_api_key(config).ok_or(ConfigError {
            setting: "assistant API key",
            env: "OPENAI_API_KEY",
            field: "assistant.apiKey",
        })?;
        let assistant_id = resolve_assistant_id(config).ok_or(ConfigError {
            setting: "assistant id",
            env: "OPENAI_ASSISTANT_ID",
            field: "assistant.assistantId",
        })?;
        Ok(Self {
            base_url: config.assistant.base_url.trim_end_matches('/').to_string(),
            api_key,
            assistant_id,
            poll_interval: Duration::from_millis(config.assistant.poll_interval_ms),
            max_poll_attempts: config.assistant.max_poll_attempts.max(1),
        })
    }
}

impl RelaySettings {
    /// Resolve all settings from config and environment. Fails on the first missing required value.
    pub fn resolve(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            channel: ChannelSettings::resolve(config)?,
            assistant: AssistantSettings::resolve(config)?,
            store_path: config.store.path.clone(),
            verify_token: resolve_verify_token(config),
            app_secret: resolve_app_secret(config),
        })
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("THREADLINE_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".threadline").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the default path (or THREADLINE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
