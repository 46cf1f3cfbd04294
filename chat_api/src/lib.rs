use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type HouseId = i64;
pub type MessageId = i64;
pub type UserId = i64;

/// Correlates a client invocation with the hub's completion frame.
pub type InvocationId = u64;

/// A persisted chat message as it travels over the wire.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub house_id: HouseId,
    pub sender_id: UserId,
    pub sender_name: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub is_read: bool,
}

/// Frames sent by a client to the hub. Every frame is answered by exactly one
/// [`ServerFrame::Completion`] carrying the same invocation id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientFrame {
    JoinHouse {
        invocation_id: InvocationId,
        house_id: HouseId,
    },
    LeaveHouse {
        invocation_id: InvocationId,
        house_id: HouseId,
    },
    SendMessage {
        invocation_id: InvocationId,
        house_id: HouseId,
        text: String,
    },
    MarkRead {
        invocation_id: InvocationId,
        message_id: MessageId,
    },
}

impl ClientFrame {
    pub fn invocation_id(&self) -> InvocationId {
        match self {
            ClientFrame::JoinHouse { invocation_id, .. }
            | ClientFrame::LeaveHouse { invocation_id, .. }
            | ClientFrame::SendMessage { invocation_id, .. }
            | ClientFrame::MarkRead { invocation_id, .. } => *invocation_id,
        }
    }
}

/// Frames pushed by the hub to a client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerFrame {
    Completion {
        invocation_id: InvocationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
    ReceiveMessage {
        message: Message,
    },
}

/// Error categories shared by hub and client.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    Forbidden,
    InvalidArgument,
    NotFound,
    PersistenceFailure,
    Malformed,
}

/// Standard RPC style error object.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}
