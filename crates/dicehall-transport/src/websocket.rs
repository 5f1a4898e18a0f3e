//! WebSocket transport implementation using `tokio-tungstenite`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::http::header::{
    HeaderName, HeaderValue, ORIGIN, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::{
    Connection, ConnectionId, ConnectionState, HandshakePolicy, Transport,
    TransportError,
};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// A WebSocket-based [`Transport`] that listens for incoming connections.
pub struct WebSocketTransport {
    listener: TcpListener,
    policy: HandshakePolicy,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(
        addr: &str,
        policy: HandshakePolicy,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket transport listening");
        Ok(Self { listener, policy })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;
    type Error = TransportError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let id = ConnectionId::new(
            NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        );
        let mut state = ConnectionState::Connecting;

        let policy = &self.policy;
        let callback = |req: &Request,
                        mut resp: Response|
         -> Result<Response, ErrorResponse> {
            let header = |name: HeaderName| {
                req.headers().get(name).and_then(|v| v.to_str().ok())
            };
            match policy.check(header(SEC_WEBSOCKET_PROTOCOL), header(ORIGIN)) {
                Ok(Some(proto)) => {
                    if let Ok(value) = HeaderValue::from_str(&proto) {
                        resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                    }
                    Ok(resp)
                }
                Ok(None) => Ok(resp),
                Err(e) => {
                    let mut reject = ErrorResponse::new(Some(e.to_string()));
                    *reject.status_mut() = StatusCode::BAD_REQUEST;
                    Err(reject)
                }
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await
        {
            Ok(ws) => ws,
            Err(e) => {
                state = state.transition(ConnectionState::Closed)?;
                tracing::debug!(%id, %addr, %state, error = %e, "handshake failed");
                return Err(TransportError::HandshakeRejected(e.to_string()));
            }
        };
        state = state.transition(ConnectionState::Open)?;

        tracing::debug!(%id, %addr, "accepted WebSocket connection");

        let (sink, stream) = ws.split();
        Ok(WebSocketConnection {
            id,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            state: StdMutex::new(state),
        })
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// A single WebSocket connection.
///
/// Reading and writing halves are locked independently so a handler can
/// wait on `recv` while broadcasts are being sent.
pub struct WebSocketConnection {
    id: ConnectionId,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    state: StdMutex<ConnectionState>,
}

impl WebSocketConnection {
    fn set_state(&self, target: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.transition(target) {
            Ok(next) => *state = next,
            Err(e) => tracing::trace!(id = %self.id, error = %e, "ignored transition"),
        }
    }
}

impl Connection for WebSocketConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        if !self.state().is_open() {
            return Err(TransportError::ConnectionClosed(format!(
                "{} is {}",
                self.id,
                self.state()
            )));
        }
        let msg = Message::Binary(data.to_vec().into());
        let result = self.sink.lock().await.send(msg).await;
        result.map_err(|e| {
            self.set_state(ConnectionState::Closed);
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        loop {
            let msg = self.stream.lock().await.next().await;
            match msg {
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(data.into()));
                }
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(text.as_bytes().to_vec()));
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.set_state(ConnectionState::Closed);
                    return Ok(None);
                }
                Some(Ok(_)) => continue, // ping/pong/frame
                Some(Err(e)) => {
                    self.set_state(ConnectionState::Closed);
                    return Err(TransportError::ReceiveFailed(
                        std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            e,
                        ),
                    ));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.set_state(ConnectionState::Closing);
        let result = self.sink.lock().await.close().await;
        self.set_state(ConnectionState::Closed);
        result.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
