use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatSession, Message, MessageStatus, Role};

/// Events sent FROM server TO client over the relay socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum RelayEvent {
    /// Server confirms successful identification
    Ready { principal_id: Uuid, role: Role },

    /// Join acknowledged; carries the session the connection is now in
    Joined { session: ChatSession },

    /// A message was committed to the room
    MessageReceived { message: Message },

    /// A message advanced to a later delivery status
    StatusUpdated {
        room_id: Uuid,
        message_id: Uuid,
        status: MessageStatus,
    },

    /// An admin closed the session
    SessionClosed { room_id: Uuid },

    /// The session was reopened
    SessionContinued { room_id: Uuid },

    /// A command from this connection was rejected. Never fanned out.
    Error {
        code: String,
        message: String,
        command: String,
    },
}

/// Commands sent FROM client TO server over the relay socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum RelayCommand {
    /// Authenticate the socket; must be the first frame
    Identify { token: String },

    /// Join a room. Customers may omit the id to join their own session.
    Join {
        #[serde(default)]
        room_id: Option<Uuid>,
    },

    /// Leave whatever room this connection is in
    Leave,

    Send { room_id: Uuid, text: String },

    StatusUpdate {
        message_id: Uuid,
        status: MessageStatus,
    },

    /// Admin only
    Close { room_id: Uuid },

    Continue { room_id: Uuid },
}

impl RelayCommand {
    /// Wire name of the command, echoed back in `error` events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::Send { .. } => "send",
            Self::StatusUpdate { .. } => "statusUpdate",
            Self::Close { .. } => "close",
            Self::Continue { .. } => "continue",
        }
    }
}
