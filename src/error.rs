//! Error types for the matching server
//!
//! Defines application-level errors, message send errors and configuration errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (connection termination) and
/// business errors (send error message to client).
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send error (fatal - internal channel broken)
    #[error("Channel send error")]
    ChannelSend,

    /// Connection has not registered a user yet
    #[error("Not registered")]
    NotRegistered,

    /// Display name or other client-supplied value rejected
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Session is unknown, ended, or does not include the caller
    #[error("Invalid session")]
    InvalidSession,

    /// Already waiting in this queue
    #[error("Already searching")]
    AlreadySearching,

    /// Already participating in an active session
    #[error("Already in session")]
    AlreadyInSession,

    /// Selected candidate was taken between selection and commit
    #[error("Match candidate no longer available")]
    RaceLost,

    /// Message exceeds the configured bound
    #[error("Message too long ({len} > {max} characters)")]
    MessageTooLong { len: usize, max: usize },

    /// Message is empty after trimming
    #[error("Message empty")]
    MessageEmpty,
}

/// Message send errors
///
/// Occurs when attempting to send messages through closed channels.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,

    /// The receiver is not draining its buffer
    #[error("Channel full")]
    Full,
}

/// Environment configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}
