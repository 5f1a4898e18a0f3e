//! Per-connection handler: handshake, request routing and event delivery.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive Handshake → validate version, verify the optional token
//!   2. Send HandshakeAck; on a reconnect, subscribe and send a snapshot
//!   3. Loop: inbound frames → services, session events → client

use std::sync::Arc;

use dicehall_auth::Principal;
use dicehall_engine::{Session, SessionSnapshot};
use dicehall_protocol::{Codec, Envelope, Framer, PROTOCOL_VERSION, Payload, ProtocolError, SessionId, SystemMessage};
use dicehall_store::SessionStore;
use dicehall_transport::{Connection, WebSocketConnection};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};

use crate::DicehallError;
use crate::requests::{ClientRequest, ServerReply};
use crate::room::{EventSender, SessionEvent, SessionHandle};
use crate::server::ServerState;
use crate::service::{JoinRequest, SessionService};

/// Ends a session subscription when the connection lets go of it.
///
/// `Drop` is synchronous, so the unsubscribe is a fire-and-forget task.
struct SubscriptionGuard {
    handle: SessionHandle,
    subscription: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let handle = self.handle.clone();
        let subscription = self.subscription;
        tokio::spawn(async move {
            handle.unsubscribe(subscription).await;
        });
    }
}

/// What one connection knows about its client.
struct Link {
    framer: Framer,
    principal: Option<Principal>,
    access_token: Option<String>,
    subscription: Option<SubscriptionGuard>,
    events: EventSender,
}

impl Link {
    fn authenticated(&self) -> Result<&Principal, DicehallError> {
        self.principal.as_ref().ok_or(DicehallError::Unauthenticated)
    }

    /// The principal and the session its token is bound to.
    fn bound(&self) -> Result<(&Principal, SessionId), DicehallError> {
        let principal = self.authenticated()?;
        let session = principal.session_id.ok_or(DicehallError::Unauthenticated)?;
        Ok((principal, session))
    }

    /// Adopts `principal` and moves the broadcast subscription to its
    /// session.
    async fn attach<S: SessionStore<Session>>(
        &mut self,
        sessions: &SessionService<S>,
        principal: Principal,
        access_token: String,
    ) -> Result<SessionSnapshot, DicehallError> {
        self.subscription = None;
        let session = principal.session_id.ok_or(DicehallError::Unauthenticated)?;
        let subscribed = sessions.subscribe(&principal, session, self.events.clone()).await;
        self.principal = Some(principal);
        self.access_token = Some(access_token);

        let (handle, subscription, snapshot) = subscribed?;
        self.subscription = Some(SubscriptionGuard { handle, subscription });
        Ok(snapshot)
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<S, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<S, C>>,
) -> Result<(), DicehallError>
where
    S: SessionStore<Session>,
    C: Codec,
{
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let (events, mut inbox) = mpsc::unbounded_channel();
    let mut link = Link {
        framer: Framer::new(),
        principal: None,
        access_token: None,
        subscription: None,
        events,
    };

    perform_handshake(&conn, &state, &mut link).await?;
    let result = message_loop(&conn, &state, &mut link, &mut inbox).await;

    // The seat is kept; only presence notices the client is gone.
    drop(link);
    if let Err(e) = conn.close().await {
        tracing::debug!(%conn_id, error = %e, "close failed");
    }
    result
}

async fn message_loop<S, C>(
    conn: &WebSocketConnection,
    state: &ServerState<S, C>,
    link: &mut Link,
    inbox: &mut mpsc::UnboundedReceiver<SessionEvent>,
) -> Result<(), DicehallError>
where
    S: SessionStore<Session>,
    C: Codec,
{
    let conn_id = conn.id();
    let mut deadline = Instant::now() + state.receive_timeout;

    loop {
        tokio::select! {
            inbound = conn.recv() => {
                let data = match inbound {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        tracing::info!(%conn_id, "connection closed cleanly");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::debug!(%conn_id, error = %e, "recv error");
                        return Ok(());
                    }
                };
                deadline = Instant::now() + state.receive_timeout;
                if handle_frame(conn, state, link, &data).await? {
                    return Ok(());
                }
            }
            Some(event) = inbox.recv() => {
                if deliver(conn, state, link, event).await? {
                    return Ok(());
                }
            }
            () = sleep_until(deadline) => {
                tracing::info!(%conn_id, "connection timed out");
                return Ok(());
            }
        }
    }
}

/// Performs the handshake: receive Handshake, validate, verify the token,
/// send the Ack and, on a reconnect, the current snapshot.
async fn perform_handshake<S, C>(
    conn: &WebSocketConnection,
    state: &ServerState<S, C>,
    link: &mut Link,
) -> Result<(), DicehallError>
where
    S: SessionStore<Session>,
    C: Codec,
{
    let data = match timeout(state.handshake_timeout, conn.recv()).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            return Err(ProtocolError::InvalidMessage("connection closed before handshake".into()).into());
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(ProtocolError::InvalidMessage("handshake timed out".into()).into());
        }
    };

    let envelope: Envelope = state.codec.decode(&data)?;
    let (version, token) = match envelope.payload {
        Payload::System(SystemMessage::Handshake { version, token }) => (version, token),
        _ => {
            let err = DicehallError::BadRequest("first message must be Handshake".into());
            send_error(conn, &state.codec, &mut link.framer, &err).await?;
            return Err(err);
        }
    };

    if version != PROTOCOL_VERSION {
        let err = DicehallError::BadRequest(format!("version mismatch: expected {PROTOCOL_VERSION}, got {version}"));
        send_error(conn, &state.codec, &mut link.framer, &err).await?;
        return Err(err);
    }

    let reconnect = match token {
        Some(token) => match state.sessions.authenticate(&token) {
            Ok(principal) => Some((principal, token)),
            Err(e) => {
                send_error(conn, &state.codec, &mut link.framer, &e).await?;
                return Err(e);
            }
        },
        None => None,
    };

    let ack = link.framer.system(SystemMessage::HandshakeAck {
        participant_id: reconnect.as_ref().map(|(p, _)| p.participant_id),
        session_id: reconnect.as_ref().and_then(|(p, _)| p.session_id),
        server_time: state.clock.now_ms(),
    });
    send(conn, &state.codec, &ack).await?;

    if let Some((principal, token)) = reconnect {
        if principal.session_id.is_none() {
            link.principal = Some(principal);
            link.access_token = Some(token);
            return Ok(());
        }
        tracing::info!(participant = %principal.participant_id, "participant reconnected");
        // A lost seat is not fatal: the client can still join elsewhere.
        match link.attach(&state.sessions, principal, token).await {
            Ok(snapshot) => send_reply(conn, state, link, &ServerReply::Snapshot { snapshot }).await?,
            Err(e) => send_error(conn, &state.codec, &mut link.framer, &e).await?,
        }
    }
    Ok(())
}

/// Handles one inbound frame. Returns `true` if the connection should close.
async fn handle_frame<S, C>(
    conn: &WebSocketConnection,
    state: &ServerState<S, C>,
    link: &mut Link,
    data: &[u8],
) -> Result<bool, DicehallError>
where
    S: SessionStore<Session>,
    C: Codec,
{
    let envelope: Envelope = match state.codec.decode(data) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(error = %e, "failed to decode envelope");
            send_error(conn, &state.codec, &mut link.framer, &e.into()).await?;
            return Ok(false);
        }
    };

    match envelope.payload {
        Payload::System(msg) => handle_system_message(conn, state, link, msg).await,
        Payload::Game(body) => {
            handle_game_message(conn, state, link, &body).await?;
            Ok(false)
        }
    }
}

/// Handles a system message. Returns `true` if the connection should close.
async fn handle_system_message<S, C>(
    conn: &WebSocketConnection,
    state: &ServerState<S, C>,
    link: &mut Link,
    msg: SystemMessage,
) -> Result<bool, DicehallError>
where
    S: SessionStore<Session>,
    C: Codec,
{
    match msg {
        SystemMessage::Heartbeat { client_time } => {
            let ack = link.framer.system(SystemMessage::HeartbeatAck {
                client_time,
                server_time: state.clock.now_ms(),
            });
            send(conn, &state.codec, &ack).await?;

            if let Ok((principal, session)) = link.bound() {
                if let Err(e) = state.sessions.heartbeat(principal, session).await {
                    tracing::debug!(%session, error = %e, "heartbeat not applied");
                }
            }
        }

        SystemMessage::Disconnect { reason } => {
            tracing::info!(conn_id = %conn.id(), %reason, "client disconnected");
            return Ok(true);
        }

        _ => {
            tracing::debug!(conn_id = %conn.id(), "ignoring unexpected system message");
        }
    }
    Ok(false)
}

/// Decodes a game frame and answers it with a reply or an error.
async fn handle_game_message<S, C>(
    conn: &WebSocketConnection,
    state: &ServerState<S, C>,
    link: &mut Link,
    body: &[u8],
) -> Result<(), DicehallError>
where
    S: SessionStore<Session>,
    C: Codec,
{
    let request: ClientRequest = match state.codec.decode(body) {
        Ok(request) => request,
        Err(e) => {
            return send_error(conn, &state.codec, &mut link.framer, &e.into()).await;
        }
    };

    let op = request.name();
    match handle_request(state, link, request).await {
        Ok(reply) => send_reply(conn, state, link, &reply).await,
        Err(e) => {
            tracing::debug!(op, code = e.code(), error = %e, "request failed");
            send_error(conn, &state.codec, &mut link.framer, &e).await
        }
    }
}

async fn handle_request<S, C>(
    state: &ServerState<S, C>,
    link: &mut Link,
    request: ClientRequest,
) -> Result<ServerReply, DicehallError>
where
    S: SessionStore<Session>,
    C: Codec,
{
    let sessions = &state.sessions;
    let ack = ServerReply::Ack {
        op: request.name().to_string(),
    };

    match request {
        ClientRequest::Join {
            room,
            display_name,
            as_observer,
            difficulty,
            assertion,
        } => {
            let request = JoinRequest {
                room,
                display_name,
                as_observer,
                difficulty,
                assertion,
            };
            let joined = sessions.join(request, link.principal.as_ref()).await?;
            let principal = sessions.authenticate(&joined.tokens.access_token)?;
            link.attach(sessions, principal, joined.tokens.access_token.clone())
                .await?;
            Ok(ServerReply::Joined {
                participant_id: joined.participant_id,
                session_id: joined.session_id,
                rejoined: joined.rejoined,
                tokens: joined.tokens,
                snapshot: joined.snapshot,
            })
        }

        ClientRequest::SignIn { assertion } => {
            let (principal, tokens) = sessions.sign_in(&assertion).await?;
            let participant_id = principal.participant_id;
            link.subscription = None;
            link.principal = Some(principal);
            link.access_token = Some(tokens.access_token.clone());
            Ok(ServerReply::SignedIn { participant_id, tokens })
        }

        ClientRequest::Refresh { refresh_token } => {
            let (principal, tokens) = sessions.refresh_auth(&refresh_token)?;
            link.principal = Some(principal);
            link.access_token = Some(tokens.access_token.clone());
            Ok(ServerReply::Tokens { tokens })
        }

        ClientRequest::Action { turn_seq, action } => {
            let (principal, session) = link.bound()?;
            let result = sessions
                .submit_action(principal, session, turn_seq, action)
                .await?;
            Ok(ServerReply::ActionResult { result })
        }

        ClientRequest::QueueNext => {
            let (principal, session) = link.bound()?;
            sessions.queue_next(principal, session).await?;
            Ok(ack)
        }

        ClientRequest::Chat { channel, body } => {
            let (principal, session) = link.bound()?;
            sessions
                .room_channel_message(principal, session, channel, body)
                .await?;
            Ok(ack)
        }

        ClientRequest::SetBlock { target, blocked } => {
            let (principal, session) = link.bound()?;
            let changed = sessions.set_block(principal, session, target, blocked).await?;
            Ok(ServerReply::BlockUpdated {
                target,
                blocked,
                changed,
            })
        }

        ClientRequest::AddBots { count } => {
            let (principal, session) = link.bound()?;
            let snapshot = sessions.add_bots(principal, session, count).await?;
            Ok(ServerReply::Snapshot { snapshot })
        }

        ClientRequest::Resync { known_version } => {
            let (principal, session) = link.bound()?;
            let snapshot = sessions.resync(principal, session, known_version).await?;
            Ok(ServerReply::Snapshot { snapshot })
        }

        ClientRequest::Leave => {
            let (principal, session) = link.bound()?;
            sessions.leave(principal, session).await?;
            link.subscription = None;
            Ok(ack)
        }

        ClientRequest::Logout => {
            let token = link.access_token.take().ok_or(DicehallError::Unauthenticated)?;
            sessions.logout(&token)?;
            link.principal = None;
            link.subscription = None;
            Ok(ack)
        }

        ClientRequest::ListSessions => {
            let sessions = state.admin.list_sessions(link.authenticated()?).await?;
            Ok(ServerReply::Sessions { sessions })
        }

        ClientRequest::ExpireSession { session_id } => {
            state
                .admin
                .force_expire(link.authenticated()?, session_id)
                .await?;
            Ok(ack)
        }

        ClientRequest::RemoveParticipant {
            session_id,
            participant_id,
        } => {
            state
                .admin
                .remove_participant(link.authenticated()?, session_id, participant_id)
                .await?;
            Ok(ack)
        }

        ClientRequest::ClearConduct {
            session_id,
            participant_id,
        } => {
            state
                .admin
                .clear_conduct(link.authenticated()?, session_id, participant_id)
                .await?;
            Ok(ack)
        }

        ClientRequest::UpsertRole { subject, role } => {
            let previous = state.admin.upsert_role(link.authenticated()?, &subject, role)?;
            Ok(ServerReply::RoleUpdated { subject, previous })
        }
    }
}

/// Forwards a session event. Returns `true` if the connection should close.
async fn deliver<S, C>(
    conn: &WebSocketConnection,
    state: &ServerState<S, C>,
    link: &mut Link,
    event: SessionEvent,
) -> Result<bool, DicehallError>
where
    S: SessionStore<Session>,
    C: Codec,
{
    match event {
        SessionEvent::Game(event) => {
            send_reply(conn, state, link, &ServerReply::Event { event }).await?;
            Ok(false)
        }
        SessionEvent::Closed { reason } => match reason.as_str() {
            "banned" | "removed" => {
                tracing::info!(conn_id = %conn.id(), %reason, "participant ejected");
                link.subscription = None;
                link.principal = None;
                let bye = link.framer.system(SystemMessage::Disconnect { reason });
                send(conn, &state.codec, &bye).await?;
                Ok(true)
            }
            _ => {
                tracing::debug!(conn_id = %conn.id(), %reason, "subscription ended");
                Ok(false)
            }
        },
    }
}

async fn send_reply<S, C>(
    conn: &WebSocketConnection,
    state: &ServerState<S, C>,
    link: &mut Link,
    reply: &ServerReply,
) -> Result<(), DicehallError>
where
    S: SessionStore<Session>,
    C: Codec,
{
    let envelope = link.framer.frame(state.codec.encode_game(reply)?);
    send(conn, &state.codec, &envelope).await
}

/// Sends a `SystemMessage::Error` envelope to the client.
async fn send_error(
    conn: &WebSocketConnection,
    codec: &impl Codec,
    framer: &mut Framer,
    err: &DicehallError,
) -> Result<(), DicehallError> {
    let envelope = framer.system(SystemMessage::Error {
        code: err.code(),
        reason: err.reason().to_string(),
        message: err.to_string(),
    });
    send(conn, codec, &envelope).await
}

async fn send(conn: &WebSocketConnection, codec: &impl Codec, envelope: &Envelope) -> Result<(), DicehallError> {
    let bytes = codec.encode(envelope)?;
    conn.send(&bytes).await?;
    Ok(())
}
