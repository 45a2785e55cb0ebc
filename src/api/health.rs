use std::sync::Arc;

use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary.
pub fn health_handler(state: &Arc<AppState>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "status": "chat-relay is running",
        "config": {
            "chat_path": config.relay.chat_path,
            "upstream_url": state.upstream.url().as_str(),
            "default_model": config.upstream.default_model,
            "mock_routes_count": config.mock_routes.len(),
            "features": {
                "log_level": config.features.log_level,
                "max_consecutive_malformed": config.relay.max_consecutive_malformed,
            }
        }
    }))
}
