use std::collections::HashSet;

use super::{AppConfig, ConfigError, MockMethod};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_relay(config)?;
    validate_log_level(config)?;
    validate_mock_routes(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.http_pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "server.http_pool_max_idle_per_host must be greater than 0",
        ));
    }
    if server.runtime_worker_threads == Some(0) {
        return Err(validation_err(
            "server.runtime_worker_threads must be greater than 0 when set",
        ));
    }
    if server.runtime_max_blocking_threads == Some(0) {
        return Err(validation_err(
            "server.runtime_max_blocking_threads must be greater than 0 when set",
        ));
    }
    Ok(())
}

fn validate_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value)
        .map_err(|err| validation_err(format!("{field} is not a valid URL: {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "{field} must start with http:// or https://"
        )));
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    validate_http_url("upstream.url", &upstream.url)?;
    if upstream.default_model.trim().is_empty() {
        return Err(validation_err("upstream.default_model cannot be empty"));
    }
    if let Some(api_key) = upstream.api_key.as_deref() {
        if api_key.trim().is_empty() {
            return Err(validation_err(
                "upstream.api_key cannot be empty when set; omit it instead",
            ));
        }
    }
    if !upstream.response_pointer.is_empty() && !upstream.response_pointer.starts_with('/') {
        return Err(validation_err(format!(
            "upstream.response_pointer '{}' must be a JSON Pointer starting with '/'",
            upstream.response_pointer
        )));
    }
    if upstream.connect_timeout_secs == 0 {
        return Err(validation_err(
            "upstream.connect_timeout_secs must be greater than 0",
        ));
    }
    if upstream.read_timeout_secs == 0 {
        return Err(validation_err(
            "upstream.read_timeout_secs must be greater than 0",
        ));
    }
    if let Some(proxy) = upstream.proxy.as_deref() {
        validate_http_url("upstream.proxy", proxy)?;
    }
    Ok(())
}

fn validate_relay(config: &AppConfig) -> Result<(), ConfigError> {
    let relay = &config.relay;
    if !relay.chat_path.starts_with('/') {
        return Err(validation_err("relay.chat_path must start with '/'"));
    }
    if relay.max_consecutive_malformed == 0 {
        return Err(validation_err(
            "relay.max_consecutive_malformed must be at least 1",
        ));
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "Invalid log_level '{}'. Must be one of: {}",
            config.features.log_level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}

fn validate_mock_routes(config: &AppConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for route in &config.mock_routes {
        if !route.path.starts_with('/') {
            return Err(validation_err(format!(
                "mock route '{}' must start with '/'",
                route.path
            )));
        }
        if route.path == "/" || route.path == config.relay.chat_path {
            return Err(validation_err(format!(
                "mock route '{}' shadows a built-in route",
                route.path
            )));
        }
        if http::StatusCode::from_u16(route.status).is_err() {
            return Err(validation_err(format!(
                "mock route '{}' has invalid status {}",
                route.path, route.status
            )));
        }
        if http::HeaderValue::from_str(&route.content_type).is_err() {
            return Err(validation_err(format!(
                "mock route '{}' has an invalid content_type",
                route.path
            )));
        }
        let overlaps_any = config.mock_routes.iter().any(|other| {
            !std::ptr::eq(other, route)
                && other.path == route.path
                && (other.method == MockMethod::Any || route.method == MockMethod::Any)
        });
        if overlaps_any {
            return Err(validation_err(format!(
                "mock route '{}' uses ANY and cannot share its path with another route",
                route.path
            )));
        }
        if !seen.insert((route.path.as_str(), route.method)) {
            return Err(validation_err(format!(
                "Duplicate mock route '{} {}'",
                route.method, route.path
            )));
        }
    }
    Ok(())
}
