//! End-to-end flows through the MatchServer actor, driven over its command
//! channel the same way connection handlers drive it.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use stranger_chat::{
    handle_connection, Config, ConnectionId, EndReason, ErrorCode, LobbyStats, Location,
    MatchServer, QueueType, Registration, ServerCommand, ServerMessage, SessionId, UserId,
    UserProfile,
};

struct TestClient {
    connection_id: ConnectionId,
    rx: mpsc::Receiver<ServerMessage>,
    user: Option<UserProfile>,
}

impl TestClient {
    /// Next message, skipping pushed stats updates
    async fn recv(&mut self) -> ServerMessage {
        loop {
            match self.recv_any().await {
                ServerMessage::StatsUpdate(_) => continue,
                msg => return msg,
            }
        }
    }

    async fn recv_any(&mut self) -> ServerMessage {
        timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a server message")
            .expect("server closed the connection channel")
    }

    async fn stats(&mut self, cmd_tx: &mpsc::Sender<ServerCommand>) -> LobbyStats {
        cmd_tx
            .send(ServerCommand::Stats {
                connection_id: self.connection_id,
            })
            .await
            .unwrap();
        match self.recv().await {
            ServerMessage::Stats(stats) => stats,
            other => panic!("Expected Stats, got {:?}", other),
        }
    }

    fn user_id(&self) -> UserId {
        self.user.as_ref().expect("client not registered").id
    }
}

fn start_server() -> mpsc::Sender<ServerCommand> {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    tokio::spawn(MatchServer::new(cmd_rx, Config::default()).run());
    cmd_tx
}

async fn connect(cmd_tx: &mpsc::Sender<ServerCommand>) -> TestClient {
    connect_with_buffer(cmd_tx, 64).await
}

async fn connect_with_buffer(cmd_tx: &mpsc::Sender<ServerCommand>, buffer: usize) -> TestClient {
    let connection_id = ConnectionId::new();
    let (sender, rx) = mpsc::channel(buffer);
    cmd_tx
        .send(ServerCommand::Connect {
            connection_id,
            sender,
        })
        .await
        .unwrap();
    TestClient {
        connection_id,
        rx,
        user: None,
    }
}

async fn join(
    cmd_tx: &mpsc::Sender<ServerCommand>,
    name: &str,
    location: Option<Location>,
) -> TestClient {
    let mut client = connect(cmd_tx).await;
    register(cmd_tx, &client, name, location).await;
    match client.recv().await {
        ServerMessage::Registered { user } => client.user = Some(user),
        other => panic!("Expected Registered, got {:?}", other),
    }
    client
}

async fn register(
    cmd_tx: &mpsc::Sender<ServerCommand>,
    client: &TestClient,
    name: &str,
    location: Option<Location>,
) {
    cmd_tx
        .send(ServerCommand::Register {
            connection_id: client.connection_id,
            registration: Registration {
                display_name: Some(name.to_string()),
                location,
                ..Default::default()
            },
        })
        .await
        .unwrap();
}

async fn request_match(cmd_tx: &mpsc::Sender<ServerCommand>, client: &TestClient) {
    cmd_tx
        .send(ServerCommand::RequestMatch {
            connection_id: client.connection_id,
            queue_type: Some(QueueType::Chat),
        })
        .await
        .unwrap();
}

async fn expect_match(client: &mut TestClient) -> (SessionId, UserProfile, Option<f64>) {
    match client.recv().await {
        ServerMessage::MatchFound {
            session_id,
            partner,
            distance_km,
            ..
        } => (session_id, partner, distance_km),
        other => panic!("Expected MatchFound, got {:?}", other),
    }
}

fn point(lat: f64, lon: f64) -> Option<Location> {
    Some(Location {
        lat: Some(lat),
        lon: Some(lon),
        ..Default::default()
    })
}

/// Two users matched with each other, returning the session id
async fn pair(
    cmd_tx: &mpsc::Sender<ServerCommand>,
    a: &mut TestClient,
    b: &mut TestClient,
) -> SessionId {
    request_match(cmd_tx, a).await;
    assert!(matches!(a.recv().await, ServerMessage::Waiting { .. }));
    request_match(cmd_tx, b).await;
    let (session_a, _, _) = expect_match(a).await;
    let (session_b, _, _) = expect_match(b).await;
    assert_eq!(session_a, session_b);
    session_a
}

async fn join_queue(cmd_tx: &mpsc::Sender<ServerCommand>, client: &mut TestClient) -> usize {
    cmd_tx
        .send(ServerCommand::JoinQueue {
            connection_id: client.connection_id,
            queue_type: QueueType::Chat,
            location: None,
        })
        .await
        .unwrap();
    match client.recv().await {
        ServerMessage::QueueJoined { position, .. } => position,
        other => panic!("Expected QueueJoined, got {:?}", other),
    }
}

#[tokio::test]
async fn test_nearest_waiting_user_is_matched() {
    let cmd_tx = start_server();
    let mut tokyo = join(&cmd_tx, "tokyo", point(35.6762, 139.6503)).await;
    let mut berlin = join(&cmd_tx, "berlin", point(52.52, 13.405)).await;
    let mut paris = join(&cmd_tx, "paris", point(48.8566, 2.3522)).await;

    // Tokyo has waited longest, but Berlin is closer to Paris
    assert_eq!(join_queue(&cmd_tx, &mut tokyo).await, 1);
    assert_eq!(join_queue(&cmd_tx, &mut berlin).await, 2);

    request_match(&cmd_tx, &paris).await;
    let (session_id, partner, distance_km) = expect_match(&mut paris).await;
    assert_eq!(partner.id, berlin.user_id());
    let distance_km = distance_km.expect("both sides have coordinates");
    assert!((distance_km - 878.0).abs() < 5.0, "got {}", distance_km);

    let (berlin_session, partner, _) = expect_match(&mut berlin).await;
    assert_eq!(berlin_session, session_id);
    assert_eq!(partner.id, paris.user_id());

    // Tokyo is still waiting at the head of the queue
    cmd_tx
        .send(ServerCommand::Stats {
            connection_id: tokyo.connection_id,
        })
        .await
        .unwrap();
    match tokyo.recv().await {
        ServerMessage::Stats(stats) => assert_eq!(stats.waiting.get(&QueueType::Chat), Some(&1)),
        other => panic!("Expected Stats, got {:?}", other),
    }
}

#[tokio::test]
async fn test_message_relay_and_typing() {
    let cmd_tx = start_server();
    let mut alice = join(&cmd_tx, "alice", None).await;
    let mut bob = join(&cmd_tx, "bob", None).await;
    let session_id = pair(&cmd_tx, &mut alice, &mut bob).await;

    cmd_tx
        .send(ServerCommand::Typing {
            connection_id: alice.connection_id,
        })
        .await
        .unwrap();
    assert!(matches!(bob.recv().await, ServerMessage::PartnerTyping));

    cmd_tx
        .send(ServerCommand::SendMessage {
            connection_id: alice.connection_id,
            session_id,
            text: "hello there".to_string(),
        })
        .await
        .unwrap();

    match alice.recv().await {
        ServerMessage::MessageSent { message } => assert_eq!(message.text, "hello there"),
        other => panic!("Expected MessageSent, got {:?}", other),
    }
    // Sending clears the indicator before the message lands
    assert!(matches!(bob.recv().await, ServerMessage::PartnerStopTyping));
    match bob.recv().await {
        ServerMessage::Message { message } => {
            assert_eq!(message.text, "hello there");
            assert_eq!(message.sender_id, alice.user_id());
        }
        other => panic!("Expected Message, got {:?}", other),
    }

    cmd_tx
        .send(ServerCommand::History {
            connection_id: bob.connection_id,
            session_id,
            limit: None,
            newest_first: false,
        })
        .await
        .unwrap();
    match bob.recv().await {
        ServerMessage::History { messages, .. } => assert_eq!(messages.len(), 1),
        other => panic!("Expected History, got {:?}", other),
    }
}

#[tokio::test]
async fn test_message_too_long_is_rejected() {
    let cmd_tx = start_server();
    let mut alice = join(&cmd_tx, "alice", None).await;
    let mut bob = join(&cmd_tx, "bob", None).await;
    let session_id = pair(&cmd_tx, &mut alice, &mut bob).await;

    cmd_tx
        .send(ServerCommand::SendMessage {
            connection_id: alice.connection_id,
            session_id,
            text: "x".repeat(1001),
        })
        .await
        .unwrap();
    match alice.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::MessageTooLong),
        other => panic!("Expected Error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_skip_notifies_both_and_requeues_skipper() {
    let cmd_tx = start_server();
    let mut alice = join(&cmd_tx, "alice", None).await;
    let mut bob = join(&cmd_tx, "bob", None).await;
    let session_id = pair(&cmd_tx, &mut alice, &mut bob).await;

    cmd_tx
        .send(ServerCommand::EndSession {
            connection_id: alice.connection_id,
            session_id,
            reason: EndReason::Skip,
        })
        .await
        .unwrap();

    match alice.recv().await {
        ServerMessage::SessionEnded {
            reason, by_partner, ..
        } => {
            assert_eq!(reason, EndReason::Skip);
            assert!(!by_partner);
        }
        other => panic!("Expected SessionEnded, got {:?}", other),
    }
    match bob.recv().await {
        ServerMessage::SessionEnded {
            reason, by_partner, ..
        } => {
            assert_eq!(reason, EndReason::Skip);
            assert!(by_partner);
        }
        other => panic!("Expected SessionEnded, got {:?}", other),
    }
    // Bob went idle, so the skipper is left waiting
    assert!(matches!(
        alice.recv().await,
        ServerMessage::Waiting {
            queue_type: QueueType::Chat
        }
    ));

    // Bob asking again picks up the waiting skipper
    request_match(&cmd_tx, &bob).await;
    let (_, partner, _) = expect_match(&mut bob).await;
    assert_eq!(partner.id, alice.user_id());
}

#[tokio::test]
async fn test_disconnect_ends_session_for_partner() {
    let cmd_tx = start_server();
    let mut alice = join(&cmd_tx, "alice", None).await;
    let mut bob = join(&cmd_tx, "bob", None).await;
    let session_id = pair(&cmd_tx, &mut alice, &mut bob).await;

    cmd_tx
        .send(ServerCommand::Disconnect {
            connection_id: alice.connection_id,
        })
        .await
        .unwrap();

    match bob.recv().await {
        ServerMessage::SessionEnded {
            session_id: ended,
            reason,
            by_partner,
        } => {
            assert_eq!(ended, session_id);
            assert_eq!(reason, EndReason::Disconnect);
            assert!(by_partner);
        }
        other => panic!("Expected SessionEnded, got {:?}", other),
    }

    cmd_tx
        .send(ServerCommand::ActiveSession {
            connection_id: bob.connection_id,
        })
        .await
        .unwrap();
    assert!(matches!(
        bob.recv().await,
        ServerMessage::ActiveSession { session: None }
    ));
}

#[tokio::test]
async fn test_concurrent_requests_form_a_perfect_matching() {
    let cmd_tx = start_server();
    let mut clients = Vec::new();
    for i in 0..10 {
        clients.push(join(&cmd_tx, &format!("user_{}", i), None).await);
    }

    let mut tasks = Vec::new();
    for client in &clients {
        let cmd_tx = cmd_tx.clone();
        let connection_id = client.connection_id;
        tasks.push(tokio::spawn(async move {
            cmd_tx
                .send(ServerCommand::RequestMatch {
                    connection_id,
                    queue_type: None,
                })
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut sessions: HashMap<SessionId, Vec<UserId>> = HashMap::new();
    for client in &mut clients {
        let me = client.user_id();
        loop {
            match client.recv().await {
                ServerMessage::Waiting { .. } => continue,
                ServerMessage::MatchFound {
                    session_id,
                    partner,
                    ..
                } => {
                    assert_ne!(partner.id, me);
                    sessions.entry(session_id).or_default().push(me);
                    break;
                }
                other => panic!("Unexpected message {:?}", other),
            }
        }
    }

    assert_eq!(sessions.len(), 5);
    assert!(sessions.values().all(|members| members.len() == 2));

    cmd_tx
        .send(ServerCommand::Stats {
            connection_id: clients[0].connection_id,
        })
        .await
        .unwrap();
    match clients[0].recv().await {
        ServerMessage::Stats(stats) => {
            assert_eq!(stats.online_users, 10);
            assert_eq!(stats.active_sessions, 5);
            assert_eq!(stats.waiting.values().sum::<usize>(), 0);
        }
        other => panic!("Expected Stats, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unregistered_and_invalid_requests_get_errors() {
    let cmd_tx = start_server();
    let mut anon = connect(&cmd_tx).await;

    request_match(&cmd_tx, &anon).await;
    match anon.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotRegistered),
        other => panic!("Expected Error, got {:?}", other),
    }

    cmd_tx
        .send(ServerCommand::Register {
            connection_id: anon.connection_id,
            registration: Registration {
                display_name: Some("admin_1".to_string()),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    match anon.recv().await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidInput),
        other => panic!("Expected Error, got {:?}", other),
    }

    // No display name means a generated pseudonym
    cmd_tx
        .send(ServerCommand::Register {
            connection_id: anon.connection_id,
            registration: Registration::default(),
        })
        .await
        .unwrap();
    match anon.recv().await {
        ServerMessage::Registered { user } => assert!(user.display_name.starts_with("Stranger_")),
        other => panic!("Expected Registered, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stats_pushed_when_users_come_and_go() {
    let cmd_tx = start_server();
    let mut alice = join(&cmd_tx, "alice", None).await;
    match alice.recv_any().await {
        ServerMessage::StatsUpdate(stats) => assert_eq!(stats.online_users, 1),
        other => panic!("Expected StatsUpdate, got {:?}", other),
    }

    let bob = join(&cmd_tx, "bob", None).await;
    match alice.recv_any().await {
        ServerMessage::StatsUpdate(stats) => assert_eq!(stats.online_users, 2),
        other => panic!("Expected StatsUpdate, got {:?}", other),
    }

    cmd_tx
        .send(ServerCommand::Disconnect {
            connection_id: bob.connection_id,
        })
        .await
        .unwrap();
    match alice.recv_any().await {
        ServerMessage::StatsUpdate(stats) => assert_eq!(stats.online_users, 1),
        other => panic!("Expected StatsUpdate, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stalled_client_does_not_block_others() {
    let cmd_tx = start_server();
    let mut bob = join(&cmd_tx, "bob", None).await;

    // Room for exactly one message, and nobody ever reads it
    let stalled = connect_with_buffer(&cmd_tx, 1).await;
    register(&cmd_tx, &stalled, "stalled", None).await;
    cmd_tx
        .send(ServerCommand::Stats {
            connection_id: stalled.connection_id,
        })
        .await
        .unwrap();

    let stats = timeout(Duration::from_secs(1), bob.stats(&cmd_tx))
        .await
        .expect("server stuck behind a stalled client");
    assert_eq!(stats.online_users, 1);
}

#[tokio::test]
async fn test_stalled_partner_is_dropped_and_session_ended() {
    let cmd_tx = start_server();
    let mut alice = join(&cmd_tx, "alice", None).await;
    request_match(&cmd_tx, &alice).await;
    assert!(matches!(alice.recv().await, ServerMessage::Waiting { .. }));

    // Fits Registered, its StatsUpdate and MatchFound, then nothing more
    let stalled = connect_with_buffer(&cmd_tx, 3).await;
    register(&cmd_tx, &stalled, "stalled", None).await;
    request_match(&cmd_tx, &stalled).await;
    let (session_id, _, _) = expect_match(&mut alice).await;

    cmd_tx
        .send(ServerCommand::SendMessage {
            connection_id: alice.connection_id,
            session_id,
            text: "hello?".to_string(),
        })
        .await
        .unwrap();
    assert!(matches!(alice.recv().await, ServerMessage::MessageSent { .. }));
    match alice.recv().await {
        ServerMessage::SessionEnded {
            session_id: ended,
            reason,
            by_partner,
        } => {
            assert_eq!(ended, session_id);
            assert_eq!(reason, EndReason::Disconnect);
            assert!(by_partner);
        }
        other => panic!("Expected SessionEnded, got {:?}", other),
    }
    assert_eq!(alice.stats(&cmd_tx).await.online_users, 1);
}

#[tokio::test]
async fn test_socket_that_stops_answering_pings_is_dropped() {
    let cmd_tx = start_server();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_tx = cmd_tx.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let cmd_tx = accept_tx.clone();
            tokio::spawn(handle_connection(stream, cmd_tx, Duration::from_millis(100)));
        }
    });

    let mut bob = join(&cmd_tx, "bob", None).await;
    request_match(&cmd_tx, &bob).await;
    assert!(matches!(bob.recv().await, ServerMessage::Waiting { .. }));

    // Sends its requests, then never reads again, so pings go unanswered
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type": "register"}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type": "request_match"}"#.into()))
        .await
        .unwrap();

    let (session_id, _, _) = expect_match(&mut bob).await;
    match bob.recv().await {
        ServerMessage::SessionEnded {
            session_id: ended,
            reason,
            by_partner,
        } => {
            assert_eq!(ended, session_id);
            assert_eq!(reason, EndReason::Disconnect);
            assert!(by_partner);
        }
        other => panic!("Expected SessionEnded, got {:?}", other),
    }
    drop(ws);
}
