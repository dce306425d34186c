//! Message protocol definitions
//!
//! JSON-based bidirectional message protocol using Serde's tagged enum
//! for type-safe serialization/deserialization.

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::geo::Location;
use crate::lobby::LobbyStats;
use crate::relay::ChatMessage;
use crate::session::SessionSummary;
use crate::types::{EndReason, QueueType, SessionId};
use crate::user::UserProfile;

/// Client → Server message
///
/// All messages from client to server. Uses tagged enum with snake_case naming.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register a user on this connection (required before anything else)
    Register {
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        location: Option<Location>,
        #[serde(default)]
        attributes: Vec<String>,
        #[serde(default)]
        preference: Option<String>,
    },
    /// Wait in a queue
    JoinQueue {
        queue_type: QueueType,
        #[serde(default)]
        location: Option<Location>,
    },
    /// Stop waiting
    LeaveQueue,
    /// Look for a partner now (queue type defaults to the current one, else chat)
    RequestMatch {
        #[serde(default)]
        queue_type: Option<QueueType>,
    },
    /// Send a chat message
    SendMessage { session_id: SessionId, text: String },
    /// Indicate typing started
    Typing,
    /// Indicate typing stopped
    StopTyping,
    /// End the session and look for someone else
    Skip { session_id: SessionId },
    /// End the session and go idle
    EndSession { session_id: SessionId },
    /// Keep-alive
    Heartbeat,
    /// Fetch recent messages of a session
    History {
        session_id: SessionId,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        newest_first: bool,
    },
    /// Current active session, if any
    ActiveSession,
    /// Server counters
    Stats,
}

/// Server → Client message
///
/// All messages from server to client. Uses tagged enum with snake_case naming.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection successful, connection ID issued
    Connected { connection_id: String },
    /// User registered
    Registered { user: UserProfile },
    /// Now waiting in a queue (position is 1-based)
    QueueJoined { queue_type: QueueType, position: usize },
    /// Left the queue
    QueueLeft { was_waiting: bool },
    /// Match requested, nobody available yet
    Waiting { queue_type: QueueType },
    /// Partner found
    MatchFound {
        session_id: SessionId,
        partner: UserProfile,
        #[serde(skip_serializing_if = "Option::is_none")]
        distance_km: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tier: Option<&'static str>,
    },
    /// Own message accepted
    MessageSent { message: ChatMessage },
    /// Chat message from the partner
    Message { message: ChatMessage },
    /// Partner is typing
    PartnerTyping,
    /// Partner stopped typing
    PartnerStopTyping,
    /// Session over
    SessionEnded {
        session_id: SessionId,
        reason: EndReason,
        by_partner: bool,
    },
    /// Nobody found within the search window; no longer waiting
    SearchTimeout { queue_type: QueueType },
    /// History page
    History {
        session_id: SessionId,
        messages: Vec<ChatMessage>,
    },
    /// Active session lookup result
    ActiveSession { session: Option<SessionSummary> },
    /// Server counters
    Stats(LobbyStats),
    /// Counters pushed after someone comes online or leaves
    StatsUpdate(LobbyStats),
    /// Error occurred
    Error { code: ErrorCode, message: String },
}

/// Error codes for ServerMessage::Error
///
/// Represents different error scenarios that can be communicated to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Attempted action before registering
    NotRegistered,
    /// Rejected display name or field
    InvalidInput,
    /// Stale or foreign session id
    InvalidSession,
    /// Already waiting in this queue
    AlreadySearching,
    /// Already in an active session
    AlreadyInSession,
    /// Message over the length bound
    MessageTooLong,
    /// Message with no visible content
    MessageEmpty,
    /// Invalid message format
    InvalidMessage,
}

/// Convert AppError to ServerMessage for client notification
impl From<AppError> for ServerMessage {
    fn from(err: AppError) -> Self {
        let (code, message) = match &err {
            AppError::NotRegistered => (ErrorCode::NotRegistered, "Register first".to_string()),
            AppError::InvalidInput(reason) => (ErrorCode::InvalidInput, reason.clone()),
            AppError::InvalidSession => {
                (ErrorCode::InvalidSession, "Session is not active".to_string())
            }
            AppError::AlreadySearching => {
                (ErrorCode::AlreadySearching, "You are already searching".to_string())
            }
            AppError::AlreadyInSession => {
                (ErrorCode::AlreadyInSession, "You are already in a session".to_string())
            }
            AppError::MessageTooLong { .. } => (ErrorCode::MessageTooLong, err.to_string()),
            AppError::MessageEmpty => (ErrorCode::MessageEmpty, "Message is empty".to_string()),
            AppError::Json(e) => {
                (ErrorCode::InvalidMessage, format!("Invalid message format: {}", e))
            }
            // Fatal errors are not typically converted (connection closes)
            _ => (ErrorCode::InvalidMessage, "Internal error".to_string()),
        };
        ServerMessage::Error { code, message }
    }
}
