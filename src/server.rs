//! MatchServer Actor implementation
//!
//! The central actor owning the matching lobby and the table of open
//! connections. Uses the Actor pattern with mpsc channels for message passing:
//! every command runs to completion before the next one starts, which makes
//! each lobby operation atomic with respect to all other requests.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::AppError;
use crate::geo::Location;
use crate::lobby::Lobby;
use crate::matching::MatchOutcome;
use crate::message::ServerMessage;
use crate::presence::Registration;
use crate::relay::HistoryOrder;
use crate::types::{ConnectionId, EndReason, QueueType, SessionId, UserId};

/// Commands sent from handlers to the MatchServer actor
#[derive(Debug)]
pub enum ServerCommand {
    /// New connection opened
    Connect {
        connection_id: ConnectionId,
        sender: mpsc::Sender<ServerMessage>,
    },
    /// Connection closed
    Disconnect { connection_id: ConnectionId },
    /// Register a user on the connection
    Register {
        connection_id: ConnectionId,
        registration: Registration,
    },
    /// Wait in a queue
    JoinQueue {
        connection_id: ConnectionId,
        queue_type: QueueType,
        location: Option<Location>,
    },
    /// Stop waiting
    LeaveQueue { connection_id: ConnectionId },
    /// Look for a partner now
    RequestMatch {
        connection_id: ConnectionId,
        queue_type: Option<QueueType>,
    },
    /// Send a chat message
    SendMessage {
        connection_id: ConnectionId,
        session_id: SessionId,
        text: String,
    },
    /// Client started typing
    Typing { connection_id: ConnectionId },
    /// Client stopped typing
    StopTyping { connection_id: ConnectionId },
    /// End a session (skip or quit)
    EndSession {
        connection_id: ConnectionId,
        session_id: SessionId,
        reason: EndReason,
    },
    /// Keep-alive
    Heartbeat { connection_id: ConnectionId },
    /// Fetch message history
    History {
        connection_id: ConnectionId,
        session_id: SessionId,
        limit: Option<usize>,
        newest_first: bool,
    },
    /// Current active session
    ActiveSession { connection_id: ConnectionId },
    /// Server counters
    Stats { connection_id: ConnectionId },
}

/// The main MatchServer actor
///
/// Owns all state and processes commands from connection handlers. Nothing
/// in here awaits a client: outbound messages are queued with `try_send`,
/// and a connection whose buffer is full or closed is dropped.
pub struct MatchServer {
    /// Matching core
    lobby: Lobby,
    /// All open connections: ConnectionId -> Connection
    connections: HashMap<ConnectionId, Connection>,
    /// Connections dropped during delivery, awaiting deregistration
    evicted: Vec<ConnectionId>,
    /// Period of the maintenance sweep
    sweep_interval: Duration,
    /// Command receiver channel
    receiver: mpsc::Receiver<ServerCommand>,
}

impl MatchServer {
    /// Create a new MatchServer with the given command receiver
    pub fn new(receiver: mpsc::Receiver<ServerCommand>, config: Config) -> Self {
        Self {
            lobby: Lobby::new(config.lobby),
            connections: HashMap::new(),
            evicted: Vec::new(),
            sweep_interval: config.sweep_interval,
            receiver,
        }
    }

    /// Run the MatchServer event loop
    ///
    /// Processes commands until all senders are dropped, sweeping the lobby
    /// on a fixed interval in between.
    pub async fn run(mut self) {
        info!("MatchServer started");

        let mut sweep = time::interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = sweep.tick() => {
                    self.lobby.sweep(Instant::now());
                    self.deliver_notices();
                }
            }
            self.drop_evicted();
        }

        info!("MatchServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: ServerCommand) {
        match cmd {
            ServerCommand::Connect {
                connection_id,
                sender,
            } => {
                self.handle_connect(connection_id, sender);
            }
            ServerCommand::Disconnect { connection_id } => {
                self.handle_disconnect(connection_id);
            }
            ServerCommand::Register {
                connection_id,
                registration,
            } => {
                self.handle_register(connection_id, registration);
            }
            ServerCommand::JoinQueue {
                connection_id,
                queue_type,
                location,
            } => {
                self.handle_join_queue(connection_id, queue_type, location);
            }
            ServerCommand::LeaveQueue { connection_id } => {
                self.handle_leave_queue(connection_id);
            }
            ServerCommand::RequestMatch {
                connection_id,
                queue_type,
            } => {
                self.handle_request_match(connection_id, queue_type);
            }
            ServerCommand::SendMessage {
                connection_id,
                session_id,
                text,
            } => {
                self.handle_send_message(connection_id, session_id, text);
            }
            ServerCommand::Typing { connection_id } => {
                self.handle_typing(connection_id);
            }
            ServerCommand::StopTyping { connection_id } => {
                self.handle_stop_typing(connection_id);
            }
            ServerCommand::EndSession {
                connection_id,
                session_id,
                reason,
            } => {
                self.handle_end_session(connection_id, session_id, reason);
            }
            ServerCommand::Heartbeat { connection_id } => {
                if let Ok(user_id) = self.lobby.user_for(connection_id) {
                    self.lobby.touch(user_id, Instant::now());
                }
            }
            ServerCommand::History {
                connection_id,
                session_id,
                limit,
                newest_first,
            } => {
                self.handle_history(connection_id, session_id, limit, newest_first);
            }
            ServerCommand::ActiveSession { connection_id } => {
                self.handle_active_session(connection_id);
            }
            ServerCommand::Stats { connection_id } => {
                let stats = self.lobby.stats();
                self.reply(connection_id, ServerMessage::Stats(stats));
            }
        }
    }

    /// Handle new connection
    fn handle_connect(&mut self, connection_id: ConnectionId, sender: mpsc::Sender<ServerMessage>) {
        info!("Connection {} opened", connection_id);
        self.connections
            .insert(connection_id, Connection::new(connection_id, sender));
        debug!("Total connections: {}", self.connections.len());
    }

    /// Handle connection close
    ///
    /// Deregisters the user, which evicts it from the queue and ends its
    /// session; the partner is told before the connection is dropped.
    fn handle_disconnect(&mut self, connection_id: ConnectionId) {
        info!("Connection {} closed", connection_id);

        let removed = self.lobby.deregister(connection_id, Instant::now());
        self.deliver_notices();
        self.connections.remove(&connection_id);
        if removed.is_some() {
            self.broadcast_stats();
        }

        debug!(
            "Total connections: {}, active sessions: {}",
            self.connections.len(),
            self.lobby.sessions().active_count()
        );
    }

    fn handle_register(&mut self, connection_id: ConnectionId, registration: Registration) {
        let result = self
            .lobby
            .register(connection_id, registration, Instant::now());
        match result {
            Ok(user) => {
                self.reply(connection_id, ServerMessage::Registered { user });
                self.broadcast_stats();
            }
            Err(e) => self.reply(connection_id, e.into()),
        }
    }

    fn handle_join_queue(
        &mut self,
        connection_id: ConnectionId,
        queue_type: QueueType,
        location: Option<Location>,
    ) {
        let result = self.lobby.user_for(connection_id).and_then(|user_id| {
            self.lobby
                .join_queue(user_id, queue_type, location, Instant::now())
        });
        let reply = match result {
            Ok(position) => ServerMessage::QueueJoined {
                queue_type,
                position,
            },
            Err(e) => e.into(),
        };
        self.reply(connection_id, reply);
    }

    fn handle_leave_queue(&mut self, connection_id: ConnectionId) {
        let result = self
            .lobby
            .user_for(connection_id)
            .and_then(|user_id| self.lobby.leave_queue(user_id));
        let reply = match result {
            Ok(was_waiting) => ServerMessage::QueueLeft { was_waiting },
            Err(e) => e.into(),
        };
        self.reply(connection_id, reply);
    }

    /// Handle match request
    ///
    /// On a match both participants learn about it through notices; only
    /// the waiting case and errors are answered directly.
    fn handle_request_match(&mut self, connection_id: ConnectionId, queue_type: Option<QueueType>) {
        let result = self.lobby.user_for(connection_id).and_then(|user_id| {
            self.lobby
                .request_match(user_id, queue_type, Instant::now())
        });
        match result {
            Ok(outcome) => self.reply_outcome(connection_id, outcome),
            Err(e) => self.reply(connection_id, e.into()),
        }
        self.deliver_notices();
    }

    /// Handle chat message
    fn handle_send_message(&mut self, connection_id: ConnectionId, session_id: SessionId, text: String) {
        let user_id = match self.lobby.user_for(connection_id) {
            Ok(user_id) => user_id,
            Err(e) => return self.reply(connection_id, e.into()),
        };

        let result = self
            .lobby
            .send_message(user_id, session_id, &text, Instant::now());
        let message = match result {
            Ok(message) => message,
            Err(e) => return self.reply(connection_id, e.into()),
        };

        // Sending clears the typing indicator
        let was_typing = self
            .connections
            .get_mut(&connection_id)
            .map(|c| std::mem::replace(&mut c.is_typing, false))
            .unwrap_or(false);
        if was_typing {
            self.send_to_partner(user_id, ServerMessage::PartnerStopTyping);
        }

        self.reply(connection_id, ServerMessage::MessageSent { message });
        self.deliver_notices();
    }

    /// Handle typing indicator start
    fn handle_typing(&mut self, connection_id: ConnectionId) {
        let user_id = match self.lobby.user_for(connection_id) {
            Ok(user_id) => user_id,
            Err(e) => return self.reply(connection_id, e.into()),
        };
        if self.lobby.partner_of(user_id).is_none() {
            return self.reply(connection_id, AppError::InvalidSession.into());
        }

        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        // Already typing? Skip
        if connection.is_typing {
            return;
        }
        connection.set_typing(true);

        self.send_to_partner(user_id, ServerMessage::PartnerTyping);
    }

    /// Handle typing indicator stop
    fn handle_stop_typing(&mut self, connection_id: ConnectionId) {
        let Ok(user_id) = self.lobby.user_for(connection_id) else {
            return;
        };
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };
        // Not typing? Skip
        if !connection.is_typing {
            return;
        }
        connection.set_typing(false);

        self.send_to_partner(user_id, ServerMessage::PartnerStopTyping);
    }

    /// Handle skip / quit
    fn handle_end_session(&mut self, connection_id: ConnectionId, session_id: SessionId, reason: EndReason) {
        let result = self.lobby.user_for(connection_id).and_then(|user_id| {
            self.lobby
                .end_session(user_id, session_id, reason, Instant::now())
        });
        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.set_typing(false);
        }

        // Session-end notices go out before the skipper's new search result
        self.deliver_notices();
        match result {
            Ok(Some(outcome)) => self.reply_outcome(connection_id, outcome),
            Ok(None) => {}
            Err(e) => self.reply(connection_id, e.into()),
        }
    }

    fn handle_history(
        &mut self,
        connection_id: ConnectionId,
        session_id: SessionId,
        limit: Option<usize>,
        newest_first: bool,
    ) {
        let order = if newest_first {
            HistoryOrder::NewestFirst
        } else {
            HistoryOrder::Chronological
        };
        let result = self
            .lobby
            .user_for(connection_id)
            .and_then(|user_id| self.lobby.history(user_id, session_id, limit, order));
        let reply = match result {
            Ok(messages) => ServerMessage::History {
                session_id,
                messages,
            },
            Err(e) => e.into(),
        };
        self.reply(connection_id, reply);
    }

    fn handle_active_session(&mut self, connection_id: ConnectionId) {
        let reply = match self.lobby.user_for(connection_id) {
            Ok(user_id) => ServerMessage::ActiveSession {
                session: self.lobby.active_session_summary(user_id),
            },
            Err(e) => e.into(),
        };
        self.reply(connection_id, reply);
    }

    /// Helper: answer a match attempt whose result is not already a notice
    fn reply_outcome(&mut self, connection_id: ConnectionId, outcome: MatchOutcome) {
        match outcome {
            MatchOutcome::Waiting { queue_type } => {
                self.reply(connection_id, ServerMessage::Waiting { queue_type })
            }
            MatchOutcome::Matched { .. } => {}
        }
    }

    /// Helper: queue a message for one connection
    ///
    /// A connection that cannot take it is dropped and deregistered after the
    /// current command.
    fn reply(&mut self, connection_id: ConnectionId, msg: ServerMessage) {
        let Some(connection) = self.connections.get(&connection_id) else {
            return;
        };
        if let Err(e) = connection.send(msg) {
            warn!("Dropping connection {}: {}", connection_id, e);
            self.connections.remove(&connection_id);
            self.evicted.push(connection_id);
        }
    }

    /// Helper: send to the partner in the user's active session
    fn send_to_partner(&mut self, user_id: UserId, msg: ServerMessage) {
        let Some(partner) = self.lobby.partner_of(user_id) else {
            return;
        };
        if let Some(connection_id) = self.lobby.presence().connection_of(partner) {
            self.reply(connection_id, msg);
        }
    }

    /// Helper: push fresh counters to every registered connection
    fn broadcast_stats(&mut self) {
        let stats = self.lobby.stats();
        let targets: Vec<ConnectionId> = self
            .connections
            .keys()
            .copied()
            .filter(|id| self.lobby.user_for(*id).is_ok())
            .collect();
        for connection_id in targets {
            self.reply(connection_id, ServerMessage::StatsUpdate(stats.clone()));
        }
    }

    /// Helper: hand queued lobby notices to their connections
    ///
    /// Users that are gone are skipped.
    fn deliver_notices(&mut self) {
        for notice in self.lobby.drain_notices() {
            let Some(connection_id) = self.lobby.presence().connection_of(notice.to) else {
                continue;
            };
            if matches!(notice.message, ServerMessage::SessionEnded { .. }) {
                if let Some(connection) = self.connections.get_mut(&connection_id) {
                    connection.set_typing(false);
                }
            }
            self.reply(connection_id, notice.message);
        }
    }

    /// Helper: deregister connections dropped during delivery
    ///
    /// Telling their partners can drop further connections, so this runs
    /// until nothing is left.
    fn drop_evicted(&mut self) {
        while let Some(connection_id) = self.evicted.pop() {
            if self.lobby.deregister(connection_id, Instant::now()).is_some() {
                self.deliver_notices();
                self.broadcast_stats();
            }
        }
    }
}
