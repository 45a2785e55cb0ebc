use std::sync::Arc;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tracing::Instrument;

use crate::error::RelayError;
use crate::protocol::{normalize, parse_chat_request};
use crate::state::AppState;
use crate::stream::{relay_frames, EventTranslator, RelayBody};

#[inline]
fn sse_ok_response(body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}

/// Streaming chat handler.
///
/// Errors before the first frame become ordinary JSON error responses; once a
/// frame has been produced the caller gets an SSE stream, and a later upstream
/// failure ends it without `[DONE]`.
pub async fn handler(state: Arc<AppState>, body: bytes::Bytes) -> Response {
    let request_id = state.next_request_id();
    let span = tracing::info_span!("relay", %request_id);
    match relay_chat(state, body, request_id).instrument(span).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                RelayError::InvalidRequest(_) => {
                    tracing::info!(%request_id, error = %err, "rejected chat request");
                }
                _ => tracing::warn!(
                    %request_id,
                    upstream_status = ?err.upstream_status(),
                    error = %err,
                    "relay failed before streaming"
                ),
            }
            err.into_response()
        }
    }
}

async fn relay_chat(
    state: Arc<AppState>,
    body: bytes::Bytes,
    request_id: uuid::Uuid,
) -> Result<Response, RelayError> {
    let request = parse_chat_request(&body)?;
    let chat = normalize(request, &state.config.upstream.default_model)?;
    tracing::info!(
        model = %chat.model,
        history = chat.history.len(),
        "relaying chat request"
    );

    let events = state.upstream.open_stream(&chat).await?;
    let translator = EventTranslator::new(
        state.config.upstream.response_pointer.clone(),
        state.config.relay.max_consecutive_malformed,
    );
    let mut frames = Box::pin(relay_frames(events, translator, chat.model));

    // The response is committed only once the first frame exists.
    let first = match frames.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(err)) => return Err(err),
        None => {
            return Err(RelayError::Internal(
                "relay ended without producing a frame".to_string(),
            ))
        }
    };

    let stream =
        futures_util::stream::once(async move { Ok::<_, RelayError>(first) }).chain(frames);
    Ok(sse_ok_response(Body::from_stream(RelayBody::new(
        stream, request_id,
    ))))
}
