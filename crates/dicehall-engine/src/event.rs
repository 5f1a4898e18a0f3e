//! Events engines emit for broadcast.

use dicehall_protocol::{ChatChannel, ParticipantId, Recipient};
use serde::{Deserialize, Serialize};

use crate::session::{DICE, ParticipantView};
use crate::turn::{ActionKind, TurnPhase};

/// Events paired with who should receive them.
pub type Outbound = Vec<(Recipient, GameEvent)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEndReason {
    /// The participant scored.
    Scored,
    /// Timed out; the pending selection was committed.
    AutoCommitted,
    /// Timed out with nothing selected.
    TimedOut,
    /// The participant left or was removed mid-turn.
    Forfeited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    Left,
    Removed,
    Banned,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    ParticipantJoined {
        participant: ParticipantView,
    },
    ParticipantRemoved {
        participant_id: ParticipantId,
        reason: RemovalReason,
    },
    TurnStarted {
        turn_id: u64,
        turn_seq: u64,
        participant_id: ParticipantId,
        round: u32,
        deadline: u64,
    },
    ActionApplied {
        turn_seq: u64,
        participant_id: ParticipantId,
        action: ActionKind,
        phase: TurnPhase,
        rolls_used: u32,
        dice: [u8; DICE],
        preview: Vec<usize>,
    },
    TurnEnded {
        turn_id: u64,
        participant_id: ParticipantId,
        points: u32,
        total_score: u32,
        reason: TurnEndReason,
    },
    ParticipantDemoted {
        participant_id: ParticipantId,
        consecutive_timeouts: u32,
    },
    RoundCompleted {
        round: u32,
        winner: Option<ParticipantId>,
        scores: Vec<(ParticipantId, u32)>,
        next_game_starts_at: u64,
    },
    NextRoundCountdown {
        next_game_starts_at: u64,
        queued: Vec<ParticipantId>,
    },
    NextRoundStarted {
        round: u32,
        game_started_at: u64,
    },
    RoomChannelMessage {
        from: ParticipantId,
        channel: ChatChannel,
        body: String,
        sent_at: u64,
    },
    ConductUpdated {
        participant_id: ParticipantId,
        strikes: u32,
        muted_until: Option<u64>,
        banned: bool,
    },
    SessionExpiring {
        expires_at: u64,
    },
    SessionExpired {
        /// `true` when a public room was reset instead of torn down.
        reset: bool,
    },
}
