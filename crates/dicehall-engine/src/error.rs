//! Error types for the engine.

use dicehall_protocol::{ParticipantId, SessionId};

use crate::session::LifecycleState;
use crate::turn::TurnPhase;

/// A rejected transition. Engines never panic past their boundary; every
/// refusal is one of these and leaves the session untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("participant {0} is not in this session")]
    NotParticipant(ParticipantId),

    #[error("session {session} is full ({max_seats} seats)")]
    RoomFull { session: SessionId, max_seats: u32 },

    #[error("participant {0} is banned from this session")]
    Banned(ParticipantId),

    #[error("session {0} has expired")]
    SessionExpired(SessionId),

    #[error("no turn is in progress")]
    NoActiveTurn,

    #[error("a turn is already in progress")]
    TurnInProgress,

    #[error("it is {active}'s turn, not {got}'s")]
    NotYourTurn {
        active: ParticipantId,
        got: ParticipantId,
    },

    /// The client acted on an outdated view (duplicate or late retry).
    #[error("stale turn sequence {got} (current {expected})")]
    StaleTurn { expected: u64, got: u64 },

    #[error("{action} is not allowed while {phase}")]
    IllegalAction {
        action: &'static str,
        phase: TurnPhase,
    },

    #[error("invalid dice selection: {0}")]
    InvalidSelection(String),

    #[error("operation requires {expected}, session is {actual}")]
    InvalidState {
        expected: LifecycleState,
        actual: LifecycleState,
    },

    #[error("cannot move from {from} to {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("the active seat is not a bot")]
    NotBotTurn,

    #[error("participant {0} cannot queue for the next round")]
    CannotQueue(ParticipantId),

    #[error("invalid recipient {0}")]
    InvalidRecipient(ParticipantId),

    #[error("too many bots requested ({requested}, max {max})")]
    TooManyBots { requested: u32, max: u32 },
}

impl EngineError {
    /// Stable machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotParticipant(_) => "not_participant",
            Self::RoomFull { .. } => "room_full",
            Self::Banned(_) => "banned",
            Self::SessionExpired(_) => "session_expired",
            Self::NoActiveTurn => "no_active_turn",
            Self::TurnInProgress => "turn_in_progress",
            Self::NotYourTurn { .. } => "not_your_turn",
            Self::StaleTurn { .. } => "stale_turn",
            Self::IllegalAction { .. } => "illegal_action",
            Self::InvalidSelection(_) => "invalid_selection",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotBotTurn => "not_bot_turn",
            Self::CannotQueue(_) => "cannot_queue",
            Self::InvalidRecipient(_) => "invalid_recipient",
            Self::TooManyBots { .. } => "too_many_bots",
        }
    }
}
