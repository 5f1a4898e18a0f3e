//! Game-frame bodies: what clients ask for and what the server answers.
//!
//! Both travel JSON-encoded inside `Payload::Game`. Failures are not a
//! reply variant; they go out as `SystemMessage::Error`.

use dicehall_auth::{AdminRole, TokenPair};
use dicehall_engine::{Action, Difficulty, GameEvent, SessionSnapshot, TurnResult};
use dicehall_protocol::{ChatChannel, ParticipantId, RoomRef, SessionId};
use serde::{Deserialize, Serialize};

/// Client → Server.
///
/// Everything except `join`, `sign_in`, `refresh` and the admin requests
/// acts on the session the connection's access token is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    Join {
        room: RoomRef,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        as_observer: bool,
        /// Only used when the join creates the room.
        #[serde(default)]
        difficulty: Option<Difficulty>,
        /// External identity assertion. Absent joins as a guest.
        #[serde(default)]
        assertion: Option<String>,
    },
    /// Authenticates without taking a seat.
    SignIn {
        assertion: String,
    },
    Action {
        turn_seq: u64,
        action: Action,
    },
    QueueNext,
    Chat {
        channel: ChatChannel,
        body: String,
    },
    SetBlock {
        target: ParticipantId,
        blocked: bool,
    },
    AddBots {
        count: u32,
    },
    Resync {
        known_version: u64,
    },
    Refresh {
        refresh_token: String,
    },
    Leave,
    Logout,

    ListSessions,
    ExpireSession {
        session_id: SessionId,
    },
    RemoveParticipant {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    ClearConduct {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    UpsertRole {
        subject: String,
        role: Option<AdminRole>,
    },
}

impl ClientRequest {
    /// Short name for logs and acks.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::SignIn { .. } => "sign_in",
            Self::Action { .. } => "action",
            Self::QueueNext => "queue_next",
            Self::Chat { .. } => "chat",
            Self::SetBlock { .. } => "set_block",
            Self::AddBots { .. } => "add_bots",
            Self::Resync { .. } => "resync",
            Self::Refresh { .. } => "refresh",
            Self::Leave => "leave",
            Self::Logout => "logout",
            Self::ListSessions => "list_sessions",
            Self::ExpireSession { .. } => "expire_session",
            Self::RemoveParticipant { .. } => "remove_participant",
            Self::ClearConduct { .. } => "clear_conduct",
            Self::UpsertRole { .. } => "upsert_role",
        }
    }
}

/// Server → Client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Joined {
        participant_id: ParticipantId,
        session_id: SessionId,
        rejoined: bool,
        tokens: TokenPair,
        snapshot: SessionSnapshot,
    },
    ActionResult {
        result: TurnResult,
    },
    Snapshot {
        snapshot: SessionSnapshot,
    },
    Tokens {
        tokens: TokenPair,
    },
    SignedIn {
        participant_id: ParticipantId,
        tokens: TokenPair,
    },
    Sessions {
        sessions: Vec<SessionSnapshot>,
    },
    BlockUpdated {
        target: ParticipantId,
        blocked: bool,
        changed: bool,
    },
    RoleUpdated {
        subject: String,
        previous: Option<AdminRole>,
    },
    /// The named request succeeded with nothing else to report.
    Ack {
        op: String,
    },
    /// A broadcast from the session.
    Event {
        event: GameEvent,
    },
}
