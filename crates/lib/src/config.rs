//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.herald/config.json`) and environment.
//! Every section has defaults, so an empty `{}` file is a valid config.

use crate::dispatch::DEFAULT_ERROR_NOTICE;
use crate::limiter::{
    DEFAULT_EXPIRY_SAFETY_MARGIN_SECS, DEFAULT_STORE_ATTEMPTS, DEFAULT_STORE_BACKOFF,
};
use crate::notifier::{NotifierSettings, DEFAULT_FALLBACK_TEXT};
use crate::retry::{RetryPolicy, DEFAULT_BASE_SECS, DEFAULT_MAX_ATTEMPTS};
use crate::transport::TransportMode;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server settings (health + webhook endpoint).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Telegram bot and transport settings.
    #[serde(default)]
    pub telegram: TelegramConfig,

    /// Retry policy for platform and state-machine calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Outbound notification rate limiting.
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Fallback notice for unmatched input.
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// Canned command replies: command (with or without `/`) -> reply text.
    #[serde(default)]
    pub commands: HashMap<String, String>,

    /// Generic notice shown when handling fails internally.
    #[serde(default = "default_error_notice")]
    pub error_notice: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            telegram: TelegramConfig::default(),
            retry: RetryConfig::default(),
            limiter: LimiterConfig::default(),
            notifier: NotifierConfig::default(),
            commands: HashMap::new(),
            error_notice: default_error_notice(),
        }
    }
}

impl Config {
    /// Reject settings the HTTP server cannot be built with.
    pub fn validate(&self) -> Result<()> {
        let path = &self.telegram.webhook_path;
        if !path.starts_with('/') || path == "/" {
            anyhow::bail!(
                "telegram.webhookPath must start with '/' and differ from the health route: {:?}",
                path
            );
        }
        Ok(())
    }
}

fn default_error_notice() -> String {
    DEFAULT_ERROR_NOTICE.to_string()
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1"). Webhook mode usually sits behind a TLS proxy.
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    15151
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

/// Telegram channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// Bot API base URL (default https://api.telegram.org). Overridden by TELEGRAM_API_BASE env.
    pub api_base: Option<String>,
    /// Requested transport. Webhook falls back to long-poll when registration cannot be verified.
    #[serde(default)]
    pub mode: TransportMode,
    /// Public HTTPS URL Telegram POSTs updates to. Required for webhook mode.
    pub webhook_url: Option<String>,
    /// Local route that receives webhook POSTs.
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    /// Optional secret checked against X-Telegram-Bot-Api-Secret-Token.
    pub webhook_secret: Option<String>,
    /// getUpdates long-poll timeout in seconds.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_webhook_path() -> String {
    "/telegram/webhook".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: None,
            mode: TransportMode::default(),
            webhook_url: None,
            webhook_path: default_webhook_path(),
            webhook_secret: None,
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Exponential base in seconds: delays are base^attempt.
    #[serde(default = "default_base_secs")]
    pub base_secs: f64,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_secs() -> f64 {
    DEFAULT_BASE_SECS
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_secs: default_base_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.base_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterConfig {
    /// Redis URL (e.g. redis://127.0.0.1/). Overridden by HERALD_REDIS_URL env. When unset, a
    /// process-local store is used.
    pub redis_url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Added to the window length when setting key expiry.
    #[serde(default = "default_expiry_margin")]
    pub expiry_safety_margin_secs: u64,
    #[serde(default = "default_store_attempts")]
    pub store_attempts: u32,
    #[serde(default = "default_store_backoff_ms")]
    pub store_backoff_ms: u64,
    /// Generic error notices allowed per subject per window.
    #[serde(default = "default_error_notice_limit")]
    pub error_notice_limit: u64,
    #[serde(default = "default_error_notice_window_secs")]
    pub error_notice_window_secs: u64,
}

fn default_key_prefix() -> String {
    "herald:rl:".to_string()
}

fn default_expiry_margin() -> u64 {
    DEFAULT_EXPIRY_SAFETY_MARGIN_SECS
}

fn default_store_attempts() -> u32 {
    DEFAULT_STORE_ATTEMPTS
}

fn default_store_backoff_ms() -> u64 {
    u64::try_from(DEFAULT_STORE_BACKOFF.as_millis()).unwrap_or(100)
}

fn default_error_notice_limit() -> u64 {
    5
}

fn default_error_notice_window_secs() -> u64 {
    60
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            expiry_safety_margin_secs: default_expiry_margin(),
            store_attempts: default_store_attempts(),
            store_backoff_ms: default_store_backoff_ms(),
            error_notice_limit: default_error_notice_limit(),
            error_notice_window_secs: default_error_notice_window_secs(),
        }
    }
}

impl LimiterConfig {
    pub fn store_retry(&self) -> RetryPolicy {
        RetryPolicy::linear(self.store_attempts, Duration::from_millis(self.store_backoff_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierConfig {
    #[serde(default = "default_fallback_text")]
    pub text: String,
    #[serde(default = "default_suppression_ttl_secs")]
    pub suppression_ttl_secs: u64,
    #[serde(default = "default_delete_after_secs")]
    pub delete_after_secs: u64,
}

fn default_fallback_text() -> String {
    DEFAULT_FALLBACK_TEXT.to_string()
}

fn default_suppression_ttl_secs() -> u64 {
    10
}

fn default_delete_after_secs() -> u64 {
    3
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            text: default_fallback_text(),
            suppression_ttl_secs: default_suppression_ttl_secs(),
            delete_after_secs: default_delete_after_secs(),
        }
    }
}

impl NotifierConfig {
    pub fn settings(&self) -> NotifierSettings {
        NotifierSettings {
            text: self.text.clone(),
            suppression_ttl: Duration::from_secs(self.suppression_ttl_secs),
            delete_after: Duration::from_secs(self.delete_after_secs),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    non_empty_env("TELEGRAM_BOT_TOKEN").or_else(|| non_empty(config.telegram.bot_token.as_ref()))
}

/// Resolve the Bot API base URL: env TELEGRAM_API_BASE overrides config.
pub fn resolve_telegram_api_base(config: &Config) -> Option<String> {
    non_empty_env("TELEGRAM_API_BASE").or_else(|| non_empty(config.telegram.api_base.as_ref()))
}

/// Resolve the limiter Redis URL: env HERALD_REDIS_URL overrides config.
pub fn resolve_redis_url(config: &Config) -> Option<String> {
    non_empty_env("HERALD_REDIS_URL").or_else(|| non_empty(config.limiter.redis_url.as_ref()))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("HERALD_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".herald").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or HERALD_CONFIG_PATH).
/// Missing file => default config. Returns the config and the path that was used.
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
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok((config, path))
}
