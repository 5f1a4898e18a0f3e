//! Integration tests for the Dicehall server, handler, and full connection flow.

use std::sync::Arc;
use std::time::Duration;

use dicehall::prelude::*;
use dicehall_engine::{ActionKind, LifecycleState};
use dicehall_protocol::{Envelope, PROTOCOL_VERSION, Payload, SystemMessage};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.bind = "127.0.0.1:0".to_string();
    config.admins = vec![("ops".to_string(), AdminRole::Owner)];
    config
}

/// Starts a server on a random port and returns the address.
async fn start_server() -> String {
    start_server_with(test_config()).await
}

async fn start_server_with(config: ServerConfig) -> String {
    let server = DicehallServerBuilder::new()
        .config(config)
        .legacy_accounts(LegacyLookup::new().with_account("ops-key", Identity::new("ops")))
        .build(Arc::new(MemoryStore::<Session>::new()))
        .await
        .expect("server should build");

    let addr = server.local_addr().expect("should have local addr").to_string();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    addr
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

fn encode_envelope(envelope: &Envelope) -> Message {
    let bytes = serde_json::to_vec(envelope).expect("encode");
    Message::Binary(bytes.into())
}

fn system(msg: SystemMessage) -> Envelope {
    Envelope {
        seq: 0,
        timestamp: 0,
        payload: Payload::System(msg),
    }
}

async fn send_request(ws: &mut ClientWs, request: &ClientRequest) {
    let envelope = Envelope {
        seq: 1,
        timestamp: 0,
        payload: Payload::Game(serde_json::to_vec(request).expect("encode request")),
    };
    ws.send(encode_envelope(&envelope)).await.expect("send request");
}

/// Next data frame from the server, skipping pings.
async fn next_envelope(ws: &mut ClientWs) -> Envelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if msg.is_binary() || msg.is_text() {
            return serde_json::from_slice(&msg.into_data()).expect("decode");
        }
    }
}

fn reply_of(envelope: &Envelope) -> Option<ServerReply> {
    match &envelope.payload {
        Payload::Game(body) => Some(serde_json::from_slice(body).expect("decode reply")),
        Payload::System(_) => None,
    }
}

/// Next reply that is not a broadcast event.
async fn next_reply(ws: &mut ClientWs) -> ServerReply {
    loop {
        let envelope = next_envelope(ws).await;
        if let Payload::System(SystemMessage::Error { code, reason, message }) = &envelope.payload {
            panic!("unexpected error {code} {reason}: {message}");
        }
        match reply_of(&envelope) {
            Some(ServerReply::Event { .. }) | None => continue,
            Some(reply) => return reply,
        }
    }
}

/// Next error frame, skipping broadcast events.
async fn next_error(ws: &mut ClientWs) -> (u16, String) {
    loop {
        let envelope = next_envelope(ws).await;
        match envelope.payload {
            Payload::System(SystemMessage::Error { code, reason, .. }) => return (code, reason),
            Payload::Game(_) => match reply_of(&envelope) {
                Some(ServerReply::Event { .. }) => continue,
                other => panic!("expected an error, got {other:?}"),
            },
            other => panic!("expected an error, got {other:?}"),
        }
    }
}

/// Sends a handshake and returns the HandshakeAck envelope.
async fn handshake(ws: &mut ClientWs, token: Option<String>) -> Envelope {
    let hs = system(SystemMessage::Handshake {
        version: PROTOCOL_VERSION,
        token,
    });
    ws.send(encode_envelope(&hs)).await.expect("send handshake");
    next_envelope(ws).await
}

fn join(room: &str) -> ClientRequest {
    ClientRequest::Join {
        room: RoomRef::Code(room.to_string()),
        display_name: None,
        as_observer: false,
        difficulty: None,
        assertion: None,
    }
}

struct Seated {
    participant_id: ParticipantId,
    session_id: SessionId,
    tokens: TokenPair,
    snapshot: SessionSnapshot,
}

/// Connects, handshakes and joins `room`.
async fn seated(addr: &str, request: ClientRequest) -> (ClientWs, Seated) {
    let mut ws = connect(addr).await;
    handshake(&mut ws, None).await;
    send_request(&mut ws, &request).await;
    match next_reply(&mut ws).await {
        ServerReply::Joined {
            participant_id,
            session_id,
            tokens,
            snapshot,
            ..
        } => (
            ws,
            Seated {
                participant_id,
                session_id,
                tokens,
                snapshot,
            },
        ),
        other => panic!("expected Joined, got {other:?}"),
    }
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_handshake_without_token_is_anonymous() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;

    let ack = handshake(&mut ws, None).await;
    match ack.payload {
        Payload::System(SystemMessage::HandshakeAck {
            participant_id,
            session_id,
            server_time,
        }) => {
            assert_eq!(participant_id, None);
            assert_eq!(session_id, None);
            assert!(server_time > 0);
        }
        other => panic!("expected HandshakeAck, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;

    let hs = system(SystemMessage::Handshake {
        version: 999,
        token: None,
    });
    ws.send(encode_envelope(&hs)).await.expect("send");

    match next_envelope(&mut ws).await.payload {
        Payload::System(SystemMessage::Error { code, reason, .. }) => {
            assert_eq!(code, 400);
            assert_eq!(reason, "bad_request");
        }
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_bad_token_unauthenticated() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;

    let ack = handshake(&mut ws, Some("not-a-token".into())).await;
    match ack.payload {
        Payload::System(SystemMessage::Error { code, reason, .. }) => {
            assert_eq!(code, 401);
            assert_eq!(reason, "unauthenticated");
        }
        other => panic!("expected Error 401, got {other:?}"),
    }
}

#[tokio::test]
async fn test_handshake_non_handshake_first_message() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;

    let hb = system(SystemMessage::Heartbeat { client_time: 1 });
    ws.send(encode_envelope(&hb)).await.expect("send");

    match next_envelope(&mut ws).await.payload {
        Payload::System(SystemMessage::Error { code, .. }) => assert_eq!(code, 400),
        other => panic!("expected Error 400, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subprotocol_required_when_configured() {
    let mut config = test_config();
    config.handshake.subprotocol = Some("dicehall.v1".to_string());
    let addr = start_server_with(config).await;

    let plain = tokio_tungstenite::connect_async(format!("ws://{addr}")).await;
    assert!(plain.is_err(), "upgrade without the subprotocol should fail");

    let mut request = format!("ws://{addr}").into_client_request().expect("request");
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "dicehall.v1".parse().expect("header"));
    let (mut ws, response) = tokio_tungstenite::connect_async(request).await.expect("should connect");
    assert_eq!(
        response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok()),
        Some("dicehall.v1")
    );
    let ack = handshake(&mut ws, None).await;
    assert!(matches!(ack.payload, Payload::System(SystemMessage::HandshakeAck { .. })));
}

#[tokio::test]
async fn test_heartbeat_response() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;
    handshake(&mut ws, None).await;

    let hb = system(SystemMessage::Heartbeat { client_time: 12345 });
    ws.send(encode_envelope(&hb)).await.expect("send");

    match next_envelope(&mut ws).await.payload {
        Payload::System(SystemMessage::HeartbeatAck { client_time, .. }) => {
            assert_eq!(client_time, 12345);
        }
        other => panic!("expected HeartbeatAck, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_closes_connection() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;
    handshake(&mut ws, None).await;

    let disc = system(SystemMessage::Disconnect {
        reason: "bye".into(),
    });
    ws.send(encode_envelope(&disc)).await.expect("send");

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) => return,
                Some(Ok(msg)) if msg.is_close() => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server should close the connection");
}

#[tokio::test]
async fn test_invalid_game_body_rejected() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;
    handshake(&mut ws, None).await;

    let envelope = Envelope {
        seq: 1,
        timestamp: 0,
        payload: Payload::Game(b"{\"type\":\"teleport\"}".to_vec()),
    };
    ws.send(encode_envelope(&envelope)).await.expect("send");

    let (code, reason) = next_error(&mut ws).await;
    assert_eq!(code, 400);
    assert_eq!(reason, "invalid_message");
}

#[tokio::test]
async fn test_request_before_join_unauthenticated() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;
    handshake(&mut ws, None).await;

    send_request(&mut ws, &ClientRequest::QueueNext).await;
    let (code, reason) = next_error(&mut ws).await;
    assert_eq!(code, 401);
    assert_eq!(reason, "unauthenticated");
}

#[tokio::test]
async fn test_join_by_code_seats_and_opens_turn() {
    let addr = start_server().await;
    let (_ws, me) = seated(&addr, join("Corner")).await;

    assert_eq!(me.snapshot.id, me.session_id);
    assert_eq!(me.snapshot.code, "corner");
    assert_eq!(me.snapshot.state, LifecycleState::Active);
    assert_eq!(me.snapshot.turn.map(|t| t.participant_id), Some(me.participant_id));
    assert!(!me.tokens.access_token.is_empty());
}

#[tokio::test]
async fn test_action_roll_returns_result() {
    let addr = start_server().await;
    let (mut ws, me) = seated(&addr, join("dice")).await;
    let turn_seq = me.snapshot.turn.expect("open turn").turn_seq;

    send_request(
        &mut ws,
        &ClientRequest::Action {
            turn_seq,
            action: Action::Roll,
        },
    )
    .await;
    match next_reply(&mut ws).await {
        ServerReply::ActionResult { result } => {
            assert_eq!(result.action, ActionKind::Roll);
            assert!(result.turn_seq.is_some_and(|seq| seq > turn_seq));
        }
        other => panic!("expected ActionResult, got {other:?}"),
    }
}

#[tokio::test]
async fn test_action_stale_turn_seq_conflict() {
    let addr = start_server().await;
    let (mut ws, me) = seated(&addr, join("stale")).await;
    let turn_seq = me.snapshot.turn.expect("open turn").turn_seq;

    send_request(
        &mut ws,
        &ClientRequest::Action {
            turn_seq: turn_seq + 100,
            action: Action::Roll,
        },
    )
    .await;
    let (code, reason) = next_error(&mut ws).await;
    assert_eq!(code, 409);
    assert_eq!(reason, "stale_turn");
}

#[tokio::test]
async fn test_chat_broadcasts_to_other_participant() {
    let addr = start_server().await;
    let (mut alice, a) = seated(&addr, join("parlor")).await;
    let (mut bob, _) = seated(&addr, join("parlor")).await;

    send_request(
        &mut alice,
        &ClientRequest::Chat {
            channel: ChatChannel::Public,
            body: "good game".into(),
        },
    )
    .await;
    match next_reply(&mut alice).await {
        ServerReply::Ack { op } => assert_eq!(op, "chat"),
        other => panic!("expected Ack, got {other:?}"),
    }

    let received = loop {
        let envelope = next_envelope(&mut bob).await;
        if let Some(ServerReply::Event {
            event: GameEvent::RoomChannelMessage { from, body, .. },
        }) = reply_of(&envelope)
        {
            break (from, body);
        }
    };
    assert_eq!(received, (a.participant_id, "good game".to_string()));
}

#[tokio::test]
async fn test_chat_policy_rejection() {
    let addr = start_server().await;
    let (mut ws, _) = seated(&addr, join("rude")).await;

    send_request(
        &mut ws,
        &ClientRequest::Chat {
            channel: ChatChannel::Public,
            body: "what a cheater".into(),
        },
    )
    .await;
    let (code, reason) = next_error(&mut ws).await;
    assert_eq!(code, 451);
    assert_eq!(reason, "policy_rejected");
}

#[tokio::test]
async fn test_reconnect_with_token_resends_snapshot() {
    let addr = start_server().await;
    let (ws, me) = seated(&addr, join("return")).await;
    drop(ws);

    let mut ws = connect(&addr).await;
    let ack = handshake(&mut ws, Some(me.tokens.access_token.clone())).await;
    match ack.payload {
        Payload::System(SystemMessage::HandshakeAck {
            participant_id,
            session_id,
            ..
        }) => {
            assert_eq!(participant_id, Some(me.participant_id));
            assert_eq!(session_id, Some(me.session_id));
        }
        other => panic!("expected HandshakeAck, got {other:?}"),
    }

    match next_reply(&mut ws).await {
        ServerReply::Snapshot { snapshot } => {
            assert_eq!(snapshot.id, me.session_id);
            assert!(snapshot.participants.iter().any(|p| p.id == me.participant_id));
            assert!(snapshot.version >= me.snapshot.version);
        }
        other => panic!("expected Snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_refresh_replaces_tokens() {
    let addr = start_server().await;
    let (mut ws, me) = seated(&addr, join("fresh")).await;

    send_request(
        &mut ws,
        &ClientRequest::Refresh {
            refresh_token: me.tokens.refresh_token.clone(),
        },
    )
    .await;
    let tokens = match next_reply(&mut ws).await {
        ServerReply::Tokens { tokens } => tokens,
        other => panic!("expected Tokens, got {other:?}"),
    };
    assert_ne!(tokens.refresh_token, me.tokens.refresh_token);

    // The connection keeps working under the new token.
    send_request(&mut ws, &ClientRequest::Resync { known_version: 0 }).await;
    assert!(matches!(next_reply(&mut ws).await, ServerReply::Snapshot { .. }));
}

#[tokio::test]
async fn test_admin_list_sessions_forbidden_for_guest() {
    let addr = start_server().await;
    let (mut ws, _) = seated(&addr, join("nosy")).await;

    send_request(&mut ws, &ClientRequest::ListSessions).await;
    let (code, reason) = next_error(&mut ws).await;
    assert_eq!(code, 403);
    assert_eq!(reason, "forbidden");
}

#[tokio::test]
async fn test_admin_remove_participant_ejects_connection() {
    let addr = start_server().await;
    let (mut guest, g) = seated(&addr, join("hall")).await;
    let ops_join = ClientRequest::Join {
        room: RoomRef::Code("ops-desk".into()),
        display_name: Some("Ops".into()),
        as_observer: false,
        difficulty: None,
        assertion: Some("ops-key".into()),
    };
    let (mut ops, _) = seated(&addr, ops_join).await;

    send_request(&mut ops, &ClientRequest::ListSessions).await;
    match next_reply(&mut ops).await {
        ServerReply::Sessions { sessions } => {
            assert!(sessions.iter().any(|s| s.id == g.session_id));
        }
        other => panic!("expected Sessions, got {other:?}"),
    }

    send_request(
        &mut ops,
        &ClientRequest::RemoveParticipant {
            session_id: g.session_id,
            participant_id: g.participant_id,
        },
    )
    .await;
    assert!(matches!(next_reply(&mut ops).await, ServerReply::Ack { .. }));

    let reason = loop {
        if let Payload::System(SystemMessage::Disconnect { reason }) = next_envelope(&mut guest).await.payload {
            break reason;
        }
    };
    assert_eq!(reason, "removed");
}

#[tokio::test]
async fn test_sign_in_lists_sessions_without_a_seat() {
    let addr = start_server().await;
    let (_guest, g) = seated(&addr, join("busy-table")).await;

    let mut ops = connect(&addr).await;
    handshake(&mut ops, None).await;
    send_request(
        &mut ops,
        &ClientRequest::SignIn {
            assertion: "ops-key".into(),
        },
    )
    .await;
    let (ops_id, tokens) = match next_reply(&mut ops).await {
        ServerReply::SignedIn { participant_id, tokens } => (participant_id, tokens),
        other => panic!("expected SignedIn, got {other:?}"),
    };

    send_request(&mut ops, &ClientRequest::ListSessions).await;
    match next_reply(&mut ops).await {
        ServerReply::Sessions { sessions } => {
            assert_eq!(sessions.len(), 1);
            assert_eq!(sessions[0].id, g.session_id);
            assert!(sessions[0].participants.iter().all(|p| p.id != ops_id));
        }
        other => panic!("expected Sessions, got {other:?}"),
    }

    // Session calls need a seat.
    send_request(&mut ops, &ClientRequest::QueueNext).await;
    let (code, _) = next_error(&mut ops).await;
    assert_eq!(code, 401);

    // The unbound token also works across reconnects.
    drop(ops);
    let mut ops = connect(&addr).await;
    match handshake(&mut ops, Some(tokens.access_token)).await.payload {
        Payload::System(SystemMessage::HandshakeAck {
            participant_id,
            session_id,
            ..
        }) => {
            assert_eq!(participant_id, Some(ops_id));
            assert_eq!(session_id, None);
        }
        other => panic!("expected HandshakeAck, got {other:?}"),
    }
    send_request(&mut ops, &ClientRequest::ListSessions).await;
    assert!(matches!(next_reply(&mut ops).await, ServerReply::Sessions { .. }));
}

#[tokio::test]
async fn test_sign_in_unknown_assertion_rejected() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;
    handshake(&mut ws, None).await;
    send_request(
        &mut ws,
        &ClientRequest::SignIn {
            assertion: "stolen-key".into(),
        },
    )
    .await;
    let (code, reason) = next_error(&mut ws).await;
    assert_eq!(code, 401);
    assert_eq!(reason, "unauthenticated");
}

#[tokio::test]
async fn test_multiple_connections_independent() {
    let addr = start_server().await;
    let (_a, first) = seated(&addr, join("alpha")).await;
    let (_b, second) = seated(&addr, join("beta")).await;

    assert_ne!(first.session_id, second.session_id);
    assert_ne!(first.participant_id, second.participant_id);
}
