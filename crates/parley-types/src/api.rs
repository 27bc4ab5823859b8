use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatSession, Message, MessageStatus, Role};

// -- JWT Claims --

/// Claims minted by the identity provider. Shared by the REST middleware
/// and the socket `identify` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub role: Role,
    pub exp: usize,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateStatusRequest {
    pub status: MessageStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub message: Message,
    /// False when the request was a duplicate or a regression.
    pub changed: bool,
}

// -- Sessions --

#[derive(Debug, Serialize, Deserialize)]
pub struct LifecycleResponse {
    pub session: ChatSession,
    /// False when the session was already in the requested state.
    pub changed: bool,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}
