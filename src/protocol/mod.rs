pub mod chat;
pub mod normalize;

pub use chat::{
    CallerEnvelope, ChatMessage, ChatRequest, ResponseDelta, Role, UpstreamChatRequest,
};
pub use normalize::{normalize, parse_chat_request, NormalizedChat};
