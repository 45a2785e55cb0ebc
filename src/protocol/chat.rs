use serde::{Deserialize, Serialize};

/// Conversation role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One turn of a conversation. Callers may send the text as `content` or `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(alias = "message")]
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Inbound chat request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Outbound request body sent to the upstream chat endpoint.
#[derive(Debug, Serialize)]
pub struct UpstreamChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<&'a ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
}

/// Text produced since the previous event of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseDelta {
    pub role: Role,
    pub content: String,
}

impl ResponseDelta {
    #[must_use]
    pub fn assistant(content: String) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }
}

/// Caller-facing payload of one SSE frame: `{choices: [{role, content}], model}`.
#[derive(Debug, Serialize)]
pub struct CallerEnvelope<'a> {
    pub choices: [&'a ResponseDelta; 1],
    pub model: &'a str,
}

impl<'a> CallerEnvelope<'a> {
    #[must_use]
    pub fn new(delta: &'a ResponseDelta, model: &'a str) -> Self {
        Self {
            choices: [delta],
            model,
        }
    }
}
