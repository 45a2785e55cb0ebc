pub mod validation;

use serde::{Deserialize, Serialize};
use std::fmt;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_http_pool_max_idle_per_host")]
    pub http_pool_max_idle_per_host: usize,
    #[serde(default = "default_http_pool_idle_timeout_secs")]
    pub http_pool_idle_timeout_secs: u64,
    #[serde(default)]
    pub http_use_env_proxy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(
        default = "default_runtime_max_blocking_threads",
        skip_serializing_if = "Option::is_none"
    )]
    pub runtime_max_blocking_threads: Option<usize>,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_pool_max_idle_per_host() -> usize {
    16
}
fn default_http_pool_idle_timeout_secs() -> u64 {
    15
}
#[allow(clippy::unnecessary_wraps)]
fn default_runtime_max_blocking_threads() -> Option<usize> {
    Some(8)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            base_path: String::new(),
            http_pool_max_idle_per_host: default_http_pool_max_idle_per_host(),
            http_pool_idle_timeout_secs: default_http_pool_idle_timeout_secs(),
            http_use_env_proxy: false,
            runtime_worker_threads: None,
            runtime_max_blocking_threads: default_runtime_max_blocking_threads(),
        }
    }
}

/// Upstream chat-completion service the relay forwards to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Full URL of the streaming chat endpoint.
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// JSON Pointer to the cumulative response text inside each upstream event.
    #[serde(default = "default_response_pointer")]
    pub response_pointer: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Maximum idle time between two upstream body chunks.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_response_pointer() -> String {
    "/response".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_read_timeout_secs() -> u64 {
    60
}

impl UpstreamConfig {
    /// Upstream config pointing at `url` with every optional field defaulted.
    #[must_use]
    pub fn with_url(url: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            default_model: default_model.into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            response_pointer: default_response_pointer(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            proxy: None,
        }
    }
}

/// Relay behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default = "default_max_consecutive_malformed")]
    pub max_consecutive_malformed: u32,
}

fn default_chat_path() -> String {
    "/api/chat".to_string()
}
fn default_max_consecutive_malformed() -> u32 {
    crate::stream::translator::DEFAULT_MAX_CONSECUTIVE_MALFORMED
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chat_path: default_chat_path(),
            max_consecutive_malformed: default_max_consecutive_malformed(),
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

/// HTTP method a static mock route answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MockMethod {
    #[default]
    Get,
    Post,
    Any,
}

impl MockMethod {
    #[must_use]
    pub fn matches(self, method: &http::Method) -> bool {
        match self {
            MockMethod::Get => method == http::Method::GET,
            MockMethod::Post => method == http::Method::POST,
            MockMethod::Any => true,
        }
    }
}

impl fmt::Display for MockMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MockMethod::Get => write!(f, "GET"),
            MockMethod::Post => write!(f, "POST"),
            MockMethod::Any => write!(f, "ANY"),
        }
    }
}

/// A fixed payload served on a fixed path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockRouteConfig {
    pub path: String,
    #[serde(default)]
    pub method: MockMethod,
    #[serde(default = "default_mock_status")]
    pub status: u16,
    #[serde(default = "default_mock_content_type")]
    pub content_type: String,
    pub body: String,
}

fn default_mock_status() -> u16 {
    200
}
fn default_mock_content_type() -> String {
    "text/plain; charset=utf-8".to_string()
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub mock_routes: Vec<MockRouteConfig>,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] or [`ConfigError::Validation`].
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}
