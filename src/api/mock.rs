use axum::body::Body;
use axum::response::Response;

use crate::config::MockRouteConfig;

/// Serve a configured fixed payload.
#[must_use]
pub fn handler(route: &MockRouteConfig) -> Response {
    let mut response = Response::new(Body::from(route.body.clone()));
    *response.status_mut() =
        http::StatusCode::from_u16(route.status).unwrap_or(http::StatusCode::OK);
    if let Ok(content_type) = http::HeaderValue::from_str(&route.content_type) {
        response
            .headers_mut()
            .insert(http::header::CONTENT_TYPE, content_type);
    }
    response
}
