use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (DEBUG, INFO, ERROR)
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init_tracing(log_level: &str, json: bool) {
    let Some(tracing_level) = tracing_level_for(log_level) else {
        return;
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(tracing_level))
        .unwrap_or_else(|_| EnvFilter::new("INFO"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn tracing_level_for(log_level: &str) -> Option<&'static str> {
    match log_level.to_uppercase().as_str() {
        "DISABLED" => None,
        "DEBUG" => Some("DEBUG"),
        "WARNING" | "WARN" => Some("WARN"),
        "ERROR" | "CRITICAL" => Some("ERROR"),
        _ => Some("INFO"),
    }
}
