//! Anonymous stranger-chat matching server
//!
//! Pairs anonymous users into 1:1 chat sessions over WebSocket, preferring
//! partners that are geographically close, and relays their messages.
//!
//! # Features
//! - Registration with a validated display name or a generated pseudonym
//! - Per-type waiting queues (chat, video, group) with FIFO order
//! - Proximity matching: Haversine distance when both sides have
//!   coordinates, else same city / region / country / anywhere
//! - Optional mutual preference filter on user attributes
//! - Skip (re-enqueue) and quit, with notices to both participants
//! - Message relay with length bound and per-session history
//! - Heartbeats, typing indicators and periodic cleanup sweeps
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `MatchServer` is the central actor; it owns a synchronous [`Lobby`]
//! - Each connection has a `handler` task communicating with the server
//! - Every lobby operation runs to completion before the next starts, and
//!   the matching step commits with a compare-and-swap on the queue entry
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use tokio::sync::mpsc;
//! use stranger_chat::{handle_connection, Config, MatchServer};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().unwrap();
//!     let listener = TcpListener::bind(&config.bind_addr).await.unwrap();
//!     let (cmd_tx, cmd_rx) = mpsc::channel(256);
//!     let ping_interval = config.ping_interval;
//!
//!     tokio::spawn(MatchServer::new(cmd_rx, config).run());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         let cmd_tx = cmd_tx.clone();
//!         tokio::spawn(handle_connection(stream, cmd_tx, ping_interval));
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod geo;
pub mod handler;
pub mod lobby;
pub mod matching;
pub mod message;
pub mod presence;
pub mod queue;
pub mod relay;
pub mod server;
pub mod session;
pub mod types;
pub mod user;
pub mod validation;

// Re-export main types for convenience
pub use config::{Config, LobbyConfig};
pub use connection::Connection;
pub use error::{AppError, ConfigError, SendError};
pub use geo::{haversine_km, Coordinates, LocalityTier, Location};
pub use handler::handle_connection;
pub use lobby::{Lobby, LobbyStats, Notice, SweepReport};
pub use matching::{MatchOutcome, MatchPlan, Proximity};
pub use message::{ClientMessage, ErrorCode, ServerMessage};
pub use presence::Registration;
pub use relay::{ChatMessage, HistoryOrder};
pub use server::{MatchServer, ServerCommand};
pub use session::{Session, SessionSummary};
pub use types::{ConnectionId, EndReason, MessageId, QueueType, SessionId, UserId, UserState};
pub use user::{User, UserProfile};
