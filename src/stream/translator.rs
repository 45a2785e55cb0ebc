//! Upstream event → caller delta translation.
//!
//! Upstream events carry the *cumulative* assistant text. The translator keeps
//! a per-stream [`StreamState`] and emits only the newly produced suffix.

use std::borrow::Cow;

use serde_json::Value;

use super::sse::is_done_event;
use super::SseEvent;
use crate::error::RelayError;
use crate::protocol::ResponseDelta;

/// Default number of back-to-back malformed events that aborts a stream.
pub const DEFAULT_MAX_CONSECUTIVE_MALFORMED: u32 = 3;

/// Outcome of translating one upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    /// New text to forward to the caller.
    Delta(ResponseDelta),
    /// Nothing to forward for this event.
    Skip,
    /// Upstream signalled completion.
    Complete,
}

/// Per-stream accumulator. Owned by exactly one relay, never shared.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamState {
    previous_response_length: usize,
    consecutive_malformed: u32,
}

impl StreamState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Characters of the cumulative response already emitted.
    #[must_use]
    pub fn previous_response_length(&self) -> usize {
        self.previous_response_length
    }

    /// Return the suffix of `cumulative` past what was already emitted, and
    /// advance the bookkeeping. Lengths count `char`s. The length never moves
    /// backwards, so a shorter cumulative text yields nothing.
    pub fn advance(&mut self, cumulative: &str) -> Option<String> {
        let start = cumulative
            .char_indices()
            .nth(self.previous_response_length)
            .map(|(offset, _)| offset)?;
        let delta = &cumulative[start..];
        self.previous_response_length += delta.chars().count();
        Some(delta.to_owned())
    }
}

/// Translates raw upstream events into caller deltas.
#[derive(Debug, Clone)]
pub struct EventTranslator {
    response_pointer: String,
    max_consecutive_malformed: u32,
    state: StreamState,
}

impl EventTranslator {
    /// `response_pointer` is a JSON Pointer (`/response`, `/message/content`);
    /// an empty pointer means the event payload itself is a JSON string.
    #[must_use]
    pub fn new(response_pointer: impl Into<String>, max_consecutive_malformed: u32) -> Self {
        Self {
            response_pointer: response_pointer.into(),
            max_consecutive_malformed: max_consecutive_malformed.max(1),
            state: StreamState::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Translate one upstream event.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::UpstreamStream`] once `max_consecutive_malformed`
    /// unparseable events arrive back to back.
    pub fn translate(&mut self, event: &SseEvent) -> Result<Translation, RelayError> {
        if is_done_event(event) {
            return Ok(Translation::Complete);
        }

        let Ok(payload) = serde_json::from_str::<Value>(&event.data) else {
            return self.malformed(event);
        };
        self.state.consecutive_malformed = 0;

        let Some(cumulative) = self.cumulative_text(&payload) else {
            tracing::trace!(data = %event.data, "upstream event carries no response text");
            return Ok(Translation::Skip);
        };

        Ok(match self.state.advance(&cumulative) {
            Some(delta) if !delta.is_empty() => Translation::Delta(ResponseDelta::assistant(delta)),
            _ => Translation::Skip,
        })
    }

    /// Strings are taken as-is, arrays are joined with a space, numbers and
    /// booleans use their JSON text. Objects and `null` carry no text.
    fn cumulative_text<'v>(&self, payload: &'v Value) -> Option<Cow<'v, str>> {
        match payload.pointer(&self.response_pointer)? {
            Value::String(text) => Some(Cow::Borrowed(text)),
            Value::Array(items) => Some(Cow::Owned(
                items.iter().map(scalar_text).collect::<Vec<_>>().join(" "),
            )),
            scalar @ (Value::Number(_) | Value::Bool(_)) => Some(Cow::Owned(scalar.to_string())),
            Value::Object(_) | Value::Null => None,
        }
    }

    fn malformed(&mut self, event: &SseEvent) -> Result<Translation, RelayError> {
        self.state.consecutive_malformed += 1;
        let streak = self.state.consecutive_malformed;
        if streak >= self.max_consecutive_malformed {
            return Err(RelayError::UpstreamStream(format!(
                "{streak} consecutive malformed upstream events"
            )));
        }
        tracing::debug!(streak, data = %event.data, "skipping malformed upstream event");
        Ok(Translation::Skip)
    }
}

fn scalar_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(text) => Cow::Borrowed(text),
        other => Cow::Owned(other.to_string()),
    }
}
