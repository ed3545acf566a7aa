//! Configuration schema definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Idle ticks before a session is evicted when the config leaves it unset
pub const DEFAULT_SESSION_TIMEOUT_TICKS: u64 = 600;

/// Root configuration for threadline
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Telegram channel configuration
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Backend configuration
    #[serde(default)]
    pub backends: BackendsConfig,
    /// Conversation threading configuration
    #[serde(default)]
    pub threads: ThreadsConfig,
    /// Backend retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Module-specific overrides
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: default_log_dir(),
            overrides: HashMap::new(),
        }
    }
}

/// Telegram channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    /// Bot API server override; the official server when unset
    #[serde(default)]
    pub api_url: Option<String>,
    /// Chats the bot answers in (empty = every chat)
    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,
    #[serde(default)]
    pub proxy: Option<String>,
}

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackendsConfig {
    #[serde(default)]
    pub stateless: StatelessBackendConfig,
    #[serde(default)]
    pub stateful: StatefulBackendConfig,
}

impl BackendsConfig {
    /// Names of the enabled backends
    pub fn enabled(&self) -> Vec<&'static str> {
        let mut enabled = Vec::new();
        if self.stateless.enabled {
            enabled.push("stateless");
        }
        if self.stateful.enabled {
            enabled.push("stateful");
        }
        enabled
    }
}

/// Chat-completion backend that needs the whole transcript every call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatelessBackendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_stateless_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Prepended as a system message when non-empty
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_stateless_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_temperature() -> f32 {
    0.9
}

impl Default for StatelessBackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: default_stateless_api_base(),
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            system_prompt: String::new(),
            extra_headers: HashMap::new(),
        }
    }
}

/// Conversation backend that keeps history server-side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatefulBackendConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_stateful_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_stateful_api_base() -> String {
    "http://localhost:3000".to_string()
}

impl Default for StatefulBackendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: default_stateful_api_base(),
            api_key: String::new(),
            extra_headers: HashMap::new(),
        }
    }
}

/// Conversation threading configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadsConfig {
    /// Idle ticks before a conversation is dropped; unset or null means
    /// [`DEFAULT_SESSION_TIMEOUT_TICKS`]
    #[serde(default)]
    pub session_timeout_ticks: Option<u64>,
    /// Milliseconds between lifecycle ticks
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Log a dump of all sessions every N ticks (0 = never)
    #[serde(default = "default_debug_dump_every")]
    pub debug_dump_every: u64,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_debug_dump_every() -> u64 {
    30
}

impl ThreadsConfig {
    /// Configured timeout, or the default when the field is absent
    pub fn effective_timeout(&self) -> u64 {
        self.session_timeout_ticks
            .unwrap_or(DEFAULT_SESSION_TIMEOUT_TICKS)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for ThreadsConfig {
    fn default() -> Self {
        Self {
            session_timeout_ticks: None,
            tick_interval_ms: default_tick_interval_ms(),
            debug_dump_every: default_debug_dump_every(),
        }
    }
}

/// Backend retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per backend call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Milliseconds to wait between attempts
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.delay_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}
