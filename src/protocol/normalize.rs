use crate::error::RelayError;

use super::chat::{ChatMessage, ChatRequest, UpstreamChatRequest};

/// A chat request flattened into what the upstream client needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedChat {
    pub model: String,
    pub current_turn: ChatMessage,
    pub history: Vec<ChatMessage>,
}

impl NormalizedChat {
    #[must_use]
    pub fn current_turn_text(&self) -> &str {
        &self.current_turn.content
    }

    /// Build the streaming upstream body: history first, current turn last.
    #[must_use]
    pub fn upstream_body(&self, temperature: f32, max_tokens: u32) -> UpstreamChatRequest<'_> {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.extend(self.history.iter());
        messages.push(&self.current_turn);
        UpstreamChatRequest {
            model: &self.model,
            messages,
            temperature,
            max_tokens,
            stream: true,
        }
    }
}

/// Decode an inbound request body.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] when the body is not a valid chat request.
pub fn parse_chat_request(body: &[u8]) -> Result<ChatRequest, RelayError> {
    serde_json::from_slice(body)
        .map_err(|err| RelayError::InvalidRequest(format!("malformed chat request: {err}")))
}

/// Split a chat request into `(model, current turn, history)`.
///
/// The model falls back to `default_model` when the request omits it or sends
/// a blank one.
///
/// # Errors
///
/// Returns [`RelayError::InvalidRequest`] when the message sequence is empty.
pub fn normalize(request: ChatRequest, default_model: &str) -> Result<NormalizedChat, RelayError> {
    let mut history = request.messages;
    let Some(current_turn) = history.pop() else {
        return Err(RelayError::InvalidRequest(
            "messages must contain at least one message".to_string(),
        ));
    };

    let model = match request.model {
        Some(model) if !model.trim().is_empty() => model,
        _ => default_model.to_string(),
    };

    Ok(NormalizedChat {
        model,
        current_turn,
        history,
    })
}
