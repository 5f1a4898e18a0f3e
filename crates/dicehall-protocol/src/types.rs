//! Core protocol types for Dicehall's wire format.
//!
//! Everything in this module is serialized onto the persistent channel
//! between a dice client and the server. Game-level requests and events
//! are carried as opaque bytes inside [`Payload::Game`]; the protocol layer
//! only understands the framework messages in [`SystemMessage`].

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A unique identifier for a seat occupant (human or bot).
///
/// Newtype over `u64` so a `SessionId` can never be passed where a
/// participant is expected. `#[serde(transparent)]` keeps the JSON form a
/// plain number: `ParticipantId(42)` is written as `42`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{}", self.0)
    }
}

/// A unique identifier for a session (one game room).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}", self.0)
    }
}

/// How a client names the room it wants: a known session id, or a
/// human-readable room code shared out of band ("lobby", "fridaydice").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RoomRef {
    Id(SessionId),
    Code(String),
}

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Code(code) => write!(f, "#{code}"),
        }
    }
}

/// Which room channel a chat message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "to", rename_all = "snake_case")]
pub enum ChatChannel {
    /// Everyone in the room.
    Public,
    /// One participant.
    Direct(ParticipantId),
}

// ---------------------------------------------------------------------------
// Recipient: who should receive a message?
// ---------------------------------------------------------------------------

/// Who an outbound event is addressed to.
///
/// Engines return `(Recipient, Event)` pairs; the session actor resolves
/// each recipient against its current subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// Every subscriber of the session.
    All,

    /// One participant (all of their connections).
    Participant(ParticipantId),

    /// Everyone except the given participant.
    AllExcept(ParticipantId),
}

impl Recipient {
    /// Returns `true` if `participant` should receive the message.
    pub fn includes(&self, participant: ParticipantId) -> bool {
        match self {
            Self::All => true,
            Self::Participant(p) => *p == participant,
            Self::AllExcept(p) => *p != participant,
        }
    }
}

// ---------------------------------------------------------------------------
// SystemMessage: framework-level messages
// ---------------------------------------------------------------------------

/// Messages handled by the framework itself rather than the game services.
///
/// Internally tagged (`#[serde(tag = "type")]`), so a heartbeat looks like
/// `{ "type": "Heartbeat", "client_time": 5000 }` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SystemMessage {
    // -- Connection lifecycle --

    /// Client → Server: first frame on every connection.
    /// `token` is an access token when the client is reconnecting to a
    /// session it already holds a seat in; new clients send `None` and
    /// join afterwards.
    Handshake {
        version: u32,
        token: Option<String>,
    },

    /// Server → Client: the handshake was accepted.
    /// `participant_id`/`session_id` are filled in for a reconnect, in
    /// which case a fresh session snapshot follows immediately.
    HandshakeAck {
        participant_id: Option<ParticipantId>,
        session_id: Option<SessionId>,
        server_time: u64,
    },

    /// Either direction: "I'm disconnecting."
    Disconnect { reason: String },

    // -- Heartbeat --

    /// Client → Server: keep-alive, also the seat's liveness signal.
    Heartbeat { client_time: u64 },

    /// Server → Client: echo for RTT and clock offset estimation.
    HeartbeatAck {
        client_time: u64,
        server_time: u64,
    },

    // -- Errors --

    /// Server → Client: a request failed.
    /// `code` follows HTTP conventions; `reason` is a stable machine
    /// string (`"unauthenticated"`, `"room_full"`, ...) clients switch on.
    Error {
        code: u16,
        reason: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Payload / Envelope
// ---------------------------------------------------------------------------

/// The content of a frame: a system message or game data.
///
/// Adjacently tagged: `{ "type": "System", "data": { ... } }` or
/// `{ "type": "Game", "data": [ ...bytes... ] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    System(SystemMessage),

    /// A game request or reply, encoded by the codec and opaque here.
    Game(Vec<u8>),
}

/// The top-level wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Per-direction sequence number.
    pub seq: u64,

    /// Milliseconds since the sender's connection started.
    pub timestamp: u64,

    pub payload: Payload,
}

// =========================================================================
// Tests
// =========================================================================
