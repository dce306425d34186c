//! Basic type definitions for the matching server
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: one live WebSocket connection
//! - `UserId`: a registered user (outlives nothing but its connection)
//! - `SessionId`: a matched 1:1 chat session
//! - `MessageId`: a relayed chat message
//!
//! plus the small state enums shared by every component.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_newtype!(
    /// Identifier of a live transport connection (the `connectionRef`)
    ConnectionId
);
uuid_newtype!(
    /// Identifier of a registered user
    UserId
);
uuid_newtype!(
    /// Identifier of a matched chat session
    SessionId
);
uuid_newtype!(
    /// Identifier of a chat message
    MessageId
);

/// Channel a user is searching in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Chat,
    Video,
    Group,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Chat, QueueType::Video, QueueType::Group];
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueType::Chat => "chat",
            QueueType::Video => "video",
            QueueType::Group => "group",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a user
///
/// Idle -> Waiting -> Matching -> InSession -> Idle (or Waiting after a skip).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Idle,
    Waiting,
    Matching,
    InSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Skip,
    Disconnect,
    Timeout,
    UserQuit,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndReason::Skip => "skip",
            EndReason::Disconnect => "disconnect",
            EndReason::Timeout => "timeout",
            EndReason::UserQuit => "user_quit",
        };
        f.write_str(name)
    }
}
