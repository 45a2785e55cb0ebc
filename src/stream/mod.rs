pub mod relay;
pub mod sse;
pub mod translator;

pub use relay::{encode_delta_frame, relay_frames, RelayBody, RelayFrame};
pub use sse::{sse_event_stream, SseEventStream, SseParser};
pub use translator::{EventTranslator, StreamState, Translation};

/// A parsed SSE frame from the upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}
