/// SSE (Server-Sent Events) frame parser, encoder, and stream utilities.
///
/// Handles the low-level parsing of SSE frames from a byte stream,
/// including buffering partial lines and handling field semantics per the
/// [SSE specification](https://html.spec.whatwg.org/multipage/server-sent-events.html).
use super::SseEvent;
use crate::error::RelayError;
use futures_util::{Stream, StreamExt};
use memchr::memchr_iter;
use smallvec::SmallVec;
use std::pin::Pin;
use std::time::Duration;

const DONE_PAYLOAD: &str = "[DONE]";
const DONE_FRAME: &str = "data: [DONE]\n\n";

struct PendingEvents {
    events: SmallVec<[SseEvent; 8]>,
    head: usize,
}

impl PendingEvents {
    #[inline]
    fn with_capacity(capacity: usize) -> Self {
        let mut events = SmallVec::new();
        events.reserve(capacity);
        Self { events, head: 0 }
    }

    #[inline]
    fn pop_front(&mut self) -> Option<SseEvent> {
        if self.head >= self.events.len() {
            return None;
        }
        let event = std::mem::take(&mut self.events[self.head]);
        self.head += 1;
        if self.head == self.events.len() {
            self.events.clear();
            self.head = 0;
        }
        Some(event)
    }

    #[inline]
    fn extend_from_vec(&mut self, parsed: &mut Vec<SseEvent>) {
        if parsed.is_empty() {
            return;
        }
        self.events.reserve(parsed.len());
        self.events.extend(parsed.drain(..));
    }
}

// ---------------------------------------------------------------------------
// SseParser — incremental SSE line parser
// ---------------------------------------------------------------------------

/// Incremental SSE line parser.
///
/// Feed it raw text chunks (potentially arriving in arbitrary byte
/// boundaries) and it yields fully-assembled [`SseEvent`] frames.
pub struct SseParser {
    buffer: String,
    read_offset: usize,
    frame: FrameFields,
}

#[derive(Default)]
struct FrameFields {
    event_type: Option<String>,
    data_buffer: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            read_offset: 0,
            frame: FrameFields::default(),
        }
    }

    /// Feed raw text and return any complete events parsed.
    ///
    /// SSE rules:
    /// - `event:` sets the event type for the next frame
    /// - `data:` appends to the data buffer (one leading space stripped)
    /// - an empty line terminates a frame
    /// - lines starting with `:` are comments
    /// - `id:` sets the last event ID, `retry:` the reconnection hint
    /// - multiple `data:` lines are joined with `\n`
    pub fn feed(&mut self, chunk: &str) -> Vec<SseEvent> {
        let mut out = Vec::new();
        self.feed_into(chunk, &mut out);
        out
    }

    /// Feed raw text and append complete events into a caller-provided buffer.
    pub fn feed_into(&mut self, chunk: &str, out: &mut Vec<SseEvent>) {
        self.buffer.push_str(chunk);
        let mut processed_up_to = self.read_offset;
        let bytes = self.buffer.as_bytes();
        let scan_start = processed_up_to;
        for rel_pos in memchr_iter(b'\n', &bytes[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let mut line = &self.buffer[processed_up_to..line_end];
            if let Some(stripped) = line.strip_suffix('\r') {
                line = stripped;
            }
            self.frame.process_line(line, out);
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}

impl FrameFields {
    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if self.has_data {
                events.push(SseEvent {
                    event: self.event_type.take(),
                    data: std::mem::take(&mut self.data_buffer),
                    id: self.last_event_id.clone(),
                    retry: self.retry.take(),
                });
                self.has_data = false;
            } else {
                self.event_type = None;
            }
            return;
        }

        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.has_data {
                    self.data_buffer.push('\n');
                } else {
                    self.has_data = true;
                }
                self.data_buffer.push_str(value);
            }
            "event" => self.event_type = Some(value.to_string()),
            "id" => self.last_event_id = Some(value.to_string()),
            "retry" => self.retry = value.trim().parse::<u64>().ok(),
            // Unknown field names are ignored
            _ => {}
        }
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

/// Check if an [`SseEvent`] is the terminal `[DONE]` sentinel.
#[must_use]
pub fn is_done_event(event: &SseEvent) -> bool {
    event.data.trim() == DONE_PAYLOAD
}

/// Format a `[DONE]` frame as SSE text.
#[must_use]
pub fn done_frame() -> &'static str {
    DONE_FRAME
}

/// Format an unnamed single-payload SSE frame.
#[must_use]
pub fn data_frame(json: &str) -> String {
    let mut out = String::with_capacity(8 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    out
}

// ---------------------------------------------------------------------------
// Stream utility
// ---------------------------------------------------------------------------

/// Lazy, finite sequence of upstream events. Transport failures surface as
/// [`RelayError::UpstreamStream`] and end the sequence.
pub type SseEventStream = Pin<Box<dyn Stream<Item = Result<SseEvent, RelayError>> + Send>>;

struct EventStreamState<S> {
    bytes: Pin<Box<S>>,
    parser: SseParser,
    remainder: Vec<u8>,
    parsed: Vec<SseEvent>,
    pending: PendingEvents,
    read_timeout: Option<Duration>,
    finished: bool,
}

impl<S> EventStreamState<S> {
    /// Decode as much of `chunk` as forms complete UTF-8 and feed it to the parser.
    /// A multi-byte character split across chunks waits in `remainder`.
    fn feed(&mut self, chunk: &[u8]) {
        self.remainder.extend_from_slice(chunk);
        let consumed = match std::str::from_utf8(&self.remainder) {
            Ok(text) => {
                self.parser.feed_into(text, &mut self.parsed);
                self.remainder.len()
            }
            Err(err) if err.error_len().is_none() => {
                let valid_up_to = err.valid_up_to();
                let text = String::from_utf8_lossy(&self.remainder[..valid_up_to]);
                self.parser.feed_into(&text, &mut self.parsed);
                valid_up_to
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.remainder).into_owned();
                self.parser.feed_into(&text, &mut self.parsed);
                self.remainder.len()
            }
        };
        self.remainder.drain(..consumed);
        self.pending.extend_from_vec(&mut self.parsed);
    }
}

/// Split a byte stream into SSE events using [`SseParser`].
///
/// The sequence ends when the byte stream ends or a `[DONE]` sentinel
/// arrives. A byte-stream error, or no chunk within `read_timeout`, yields one
/// [`RelayError::UpstreamStream`] and then ends the sequence.
pub fn sse_event_stream<S, E>(byte_stream: S, read_timeout: Option<Duration>) -> SseEventStream
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = EventStreamState {
        bytes: Box::pin(byte_stream),
        parser: SseParser::new(),
        remainder: Vec::new(),
        parsed: Vec::with_capacity(8),
        pending: PendingEvents::with_capacity(8),
        read_timeout,
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                if is_done_event(&event) {
                    return None;
                }
                return Some((Ok(event), st));
            }
            if st.finished {
                return None;
            }

            let next = match st.read_timeout {
                Some(limit) => {
                    if let Ok(next) = tokio::time::timeout(limit, st.bytes.as_mut().next()).await {
                        next
                    } else {
                        st.finished = true;
                        let err = RelayError::UpstreamStream(format!(
                            "no data from upstream for {}ms",
                            limit.as_millis()
                        ));
                        return Some((Err(err), st));
                    }
                }
                None => st.bytes.as_mut().next().await,
            };

            match next {
                Some(Ok(bytes)) => st.feed(&bytes),
                Some(Err(err)) => {
                    st.finished = true;
                    let err = RelayError::UpstreamStream(format!("upstream connection lost: {err}"));
                    return Some((Err(err), st));
                }
                None => st.finished = true,
            }
        }
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
