//! Upstream events → caller SSE frames.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use super::sse::{data_frame, done_frame, SseEventStream};
use super::translator::{EventTranslator, Translation};
use crate::error::RelayError;
use crate::protocol::{CallerEnvelope, ResponseDelta};

/// One caller-facing SSE frame, or the error that ends the stream.
pub type RelayFrame = Result<Bytes, RelayError>;

struct RelayState {
    events: SseEventStream,
    translator: EventTranslator,
    model: String,
    finished: bool,
}

/// Encode a delta as `data: {"choices":[{role,content}],"model":...}\n\n`.
///
/// # Errors
///
/// Returns [`RelayError::Internal`] if the envelope cannot be serialized.
pub fn encode_delta_frame(delta: &ResponseDelta, model: &str) -> Result<Bytes, RelayError> {
    let json = serde_json::to_string(&CallerEnvelope::new(delta, model))
        .map_err(|err| RelayError::Internal(format!("failed to encode delta frame: {err}")))?;
    Ok(Bytes::from(data_frame(&json)))
}

/// Drive `events` through `translator`, yielding caller frames in arrival order.
///
/// A successful stream ends with exactly one `[DONE]` frame. A failed stream
/// yields one `Err` and no `[DONE]`. Nothing is yielded after either.
pub fn relay_frames(
    events: SseEventStream,
    translator: EventTranslator,
    model: String,
) -> impl Stream<Item = RelayFrame> + Send {
    let state = RelayState {
        events,
        translator,
        model,
        finished: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            let frame = match st.events.next().await {
                None => Ok(Bytes::from_static(done_frame().as_bytes())),
                Some(Err(err)) => Err(err),
                Some(Ok(event)) => match st.translator.translate(&event) {
                    Ok(Translation::Delta(delta)) => {
                        let frame = encode_delta_frame(&delta, &st.model);
                        st.finished = frame.is_err();
                        return Some((frame, st));
                    }
                    Ok(Translation::Skip) => continue,
                    Ok(Translation::Complete) => Ok(Bytes::from_static(done_frame().as_bytes())),
                    Err(err) => Err(err),
                },
            };
            st.finished = true;
            return Some((frame, st));
        }
    })
}

pin_project_lite::pin_project! {
    /// Caller-facing body stream. Counts frames and logs how the stream ended
    /// when it is dropped, including when the caller disconnects early.
    pub struct RelayBody<S> {
        #[pin]
        inner: S,
        request_id: uuid::Uuid,
        frames: usize,
        outcome: Outcome,
    }

    impl<S> PinnedDrop for RelayBody<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            match this.outcome {
                Outcome::Open => tracing::info!(
                    request_id = %this.request_id,
                    frames = *this.frames,
                    "caller disconnected before relay finished; upstream released"
                ),
                Outcome::Completed => tracing::debug!(
                    request_id = %this.request_id,
                    frames = *this.frames,
                    "relay stream completed"
                ),
                Outcome::Failed => tracing::debug!(
                    request_id = %this.request_id,
                    frames = *this.frames,
                    "relay stream aborted without [DONE]"
                ),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Open,
    Completed,
    Failed,
}

impl<S> RelayBody<S> {
    pub fn new(inner: S, request_id: uuid::Uuid) -> Self {
        Self {
            inner,
            request_id,
            frames: 0,
            outcome: Outcome::Open,
        }
    }
}

impl<S> Stream for RelayBody<S>
where
    S: Stream<Item = RelayFrame>,
{
    type Item = RelayFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                *this.frames += 1;
                if frame.as_ref() == done_frame().as_bytes() {
                    *this.outcome = Outcome::Completed;
                }
            }
            Poll::Ready(Some(Err(err))) => {
                tracing::warn!(request_id = %this.request_id, error = %err, "upstream failed mid-stream");
                *this.outcome = Outcome::Failed;
            }
            Poll::Ready(None) => {
                if *this.outcome == Outcome::Open {
                    *this.outcome = Outcome::Completed;
                }
            }
            Poll::Pending => {}
        }
        polled
    }
}
