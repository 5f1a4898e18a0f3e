//! Transport abstraction layer for Dicehall.
//!
//! Provides the [`Transport`] and [`Connection`] traits that abstract over
//! the persistent bidirectional channel clients hold with the server, the
//! per-connection lifecycle ([`ConnectionState`]), and the upgrade-time
//! header checks ([`HandshakePolicy`]).
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

#![allow(async_fn_in_trait)]

mod error;
mod handshake;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use handshake::HandshakePolicy;
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketTransport};

use std::fmt;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Lifecycle of a single connection.
///
/// ```text
/// Connecting ──→ Open ──→ Closing ──→ Closed
///      │           │                    ↑
///      └───────────┴────────────────────┘  (failed handshake / abrupt drop)
/// ```
///
/// - **Connecting**: upgrade request received, handshake being validated.
/// - **Open**: frames flow in both directions, heartbeats are exchanged.
/// - **Closing**: a close was requested by either side; no new frames.
/// - **Closed**: terminal. The connection is eligible for cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Returns `true` if transitioning to `target` is allowed.
    pub fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Connecting, Self::Open)
                | (Self::Connecting, Self::Closed)
                | (Self::Open, Self::Closing)
                | (Self::Open, Self::Closed)
                | (Self::Closing, Self::Closed)
        )
    }

    /// Moves to `target`, or reports the forbidden transition.
    pub fn transition(self, target: Self) -> Result<Self, TransportError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(TransportError::InvalidTransition {
                from: self,
                to: target,
            })
        }
    }

    /// Returns `true` while frames may still be exchanged.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    ///
    /// The returned connection has completed its handshake and is `Open`.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Gracefully shuts down the transport, stopping new connections.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// A single connection that can send and receive bytes.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Sends data to the remote peer.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next message from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// Returns the current lifecycle state.
    fn state(&self) -> ConnectionState;
}
