//! WebSocket connection handler
//!
//! Performs the handshake for one TCP connection, then pumps frames in both
//! directions: decoded client messages become `ServerCommand`s for the
//! MatchServer, and everything the MatchServer sends back is written out as
//! JSON text frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::message::{ClientMessage, ServerMessage};
use crate::presence::Registration;
use crate::server::ServerCommand;
use crate::types::{ConnectionId, EndReason};

/// Outbound buffer per connection; a peer that lets it fill up is dropped
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Unanswered pings after which the peer is considered gone
const MAX_MISSED_PONGS: u8 = 2;

/// Handle a new TCP connection
///
/// Pings the peer every `ping_interval`. Returns once either direction of the
/// socket is finished, including a peer that stops answering pings; the
/// MatchServer is always told about the disconnect before returning.
pub async fn handle_connection(
    stream: TcpStream,
    cmd_tx: mpsc::Sender<ServerCommand>,
    ping_interval: Duration,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id = ConnectionId::new();
    info!("Connection {} accepted from {}", connection_id, peer_addr);

    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER_SIZE);

    if cmd_tx
        .send(ServerCommand::Connect {
            connection_id,
            sender: msg_tx.clone(),
        })
        .await
        .is_err()
    {
        error!("Failed to open connection {} - server closed", connection_id);
        return Err(AppError::ChannelSend);
    }

    let connected_msg = ServerMessage::Connected {
        connection_id: connection_id.to_string(),
    };
    let json = serde_json::to_string(&connected_msg)?;
    ws_sender.send(Message::Text(json.into())).await?;

    let cmd_tx_read = cmd_tx.clone();
    // Decode errors are answered on the outbound channel directly. The handle
    // is weak so the channel still closes once the MatchServer drops it.
    let error_tx = msg_tx.downgrade();
    drop(msg_tx);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_read = pong_received.clone();

    // Read task (WebSocket -> ServerCommand)
    let mut read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            let cmd = match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => client_message_to_command(connection_id, client_msg),
                    Err(e) => {
                        warn!("Invalid JSON from {}: {}", connection_id, e);
                        if let Some(tx) = error_tx.upgrade() {
                            let _ = tx.try_send(AppError::Json(e).into());
                        }
                        continue;
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("Connection {} sent close frame", connection_id);
                    break;
                }
                Ok(Message::Pong(_)) => {
                    pong_flag_read.store(true, Ordering::Release);
                    ServerCommand::Heartbeat { connection_id }
                }
                // Pong replies are handled by tungstenite; a ping still proves liveness
                Ok(Message::Ping(_)) => ServerCommand::Heartbeat { connection_id },
                Ok(_) => continue,
                Err(e) => {
                    error!("WebSocket error for {}: {}", connection_id, e);
                    break;
                }
            };
            if cmd_tx_read.send(cmd).await.is_err() {
                debug!("Server closed, ending read task for {}", connection_id);
                break;
            }
        }
        debug!("Read task ended for {}", connection_id);
    });

    // Write task (ServerMessage -> WebSocket), pinging the peer on an interval
    let mut write_task = tokio::spawn(async move {
        let mut ping = time::interval(ping_interval);
        ping.tick().await;
        let mut missed_pongs: u8 = 0;

        loop {
            tokio::select! {
                msg = msg_rx.recv() => {
                    let Some(msg) = msg else {
                        debug!("Outbound channel closed for {}", connection_id);
                        break;
                    };
                    match serde_json::to_string(&msg) {
                        Ok(json) => {
                            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                                debug!("WebSocket send failed, ending write task");
                                break;
                            }
                        }
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                        }
                    }
                }
                _ = ping.tick() => {
                    if pong_received.swap(false, Ordering::Acquire) {
                        missed_pongs = 0;
                    } else {
                        missed_pongs += 1;
                        if missed_pongs >= MAX_MISSED_PONGS {
                            warn!("Connection {} missed {} pongs, dropping it", connection_id, missed_pongs);
                            break;
                        }
                    }
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", connection_id);
            write_task.abort();
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", connection_id);
            read_task.abort();
        }
    }

    let _ = cmd_tx
        .send(ServerCommand::Disconnect { connection_id })
        .await;

    info!("Connection {} closed", connection_id);

    Ok(())
}

/// Convert a ClientMessage to a ServerCommand
pub fn client_message_to_command(connection_id: ConnectionId, msg: ClientMessage) -> ServerCommand {
    match msg {
        ClientMessage::Register {
            display_name,
            location,
            attributes,
            preference,
        } => ServerCommand::Register {
            connection_id,
            registration: Registration {
                display_name,
                location,
                attributes,
                preference,
            },
        },
        ClientMessage::JoinQueue {
            queue_type,
            location,
        } => ServerCommand::JoinQueue {
            connection_id,
            queue_type,
            location,
        },
        ClientMessage::LeaveQueue => ServerCommand::LeaveQueue { connection_id },
        ClientMessage::RequestMatch { queue_type } => ServerCommand::RequestMatch {
            connection_id,
            queue_type,
        },
        ClientMessage::SendMessage { session_id, text } => ServerCommand::SendMessage {
            connection_id,
            session_id,
            text,
        },
        ClientMessage::Typing => ServerCommand::Typing { connection_id },
        ClientMessage::StopTyping => ServerCommand::StopTyping { connection_id },
        ClientMessage::Skip { session_id } => ServerCommand::EndSession {
            connection_id,
            session_id,
            reason: EndReason::Skip,
        },
        ClientMessage::EndSession { session_id } => ServerCommand::EndSession {
            connection_id,
            session_id,
            reason: EndReason::UserQuit,
        },
        ClientMessage::Heartbeat => ServerCommand::Heartbeat { connection_id },
        ClientMessage::History {
            session_id,
            limit,
            newest_first,
        } => ServerCommand::History {
            connection_id,
            session_id,
            limit,
            newest_first,
        },
        ClientMessage::ActiveSession => ServerCommand::ActiveSession { connection_id },
        ClientMessage::Stats => ServerCommand::Stats { connection_id },
    }
}
