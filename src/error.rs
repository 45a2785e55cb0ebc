use serde::Serialize;

/// Error type shared by the relay, the upstream client and the handlers.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream unavailable: {message}")]
    UpstreamUnavailable {
        status: Option<u16>,
        message: String,
    },
    #[error("Upstream stream error: {0}")]
    UpstreamStream(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    BadGateway,
    ServerError,
}

impl RelayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            RelayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            RelayError::UpstreamUnavailable { .. } | RelayError::UpstreamStream(_) => {
                ErrorCategory::BadGateway
            }
            RelayError::Config(_) | RelayError::Internal(_) => ErrorCategory::ServerError,
        }
    }

    /// HTTP status the upstream answered with, when it answered at all.
    #[must_use]
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            RelayError::UpstreamUnavailable { status, .. } => *status,
            _ => None,
        }
    }

    pub(crate) fn unavailable(message: impl Into<String>) -> Self {
        RelayError::UpstreamUnavailable {
            status: None,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Category -> HTTP status code / body status code
// ---------------------------------------------------------------------------

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCategory::BadGateway => http::StatusCode::BAD_GATEWAY,
        ErrorCategory::ServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Body-level status codes are the HTTP status offset by 10000.
fn body_status_code(status: http::StatusCode) -> u32 {
    10_000 + u32::from(status.as_u16())
}

/// Caller-facing error body: `{status_code, message, data: null}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status_code: u32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Format an error, returning (`status_code`, body).
#[must_use]
pub fn format_error(err: &RelayError) -> (http::StatusCode, ErrorBody) {
    let status = http_status_for_category(err.category());
    let body = ErrorBody {
        status_code: body_status_code(status),
        message: err.to_string(),
        data: None,
    };
    (status, body)
}

impl axum::response::IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}
