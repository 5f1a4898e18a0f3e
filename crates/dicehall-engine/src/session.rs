//! The session record and its parts.
//!
//! A [`Session`] is one game room. It is plain data: every transition lives
//! in the sibling modules as a function over `&mut Session`, and the session
//! actor in the server crate is the only caller.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use dicehall_protocol::{ParticipantId, SessionId};
use dicehall_store::Versioned;
use serde::{Deserialize, Serialize};

use crate::EngineError;
use crate::conduct::ConductState;
use crate::turn::TurnState;

/// Number of dice in play.
pub const DICE: usize = 5;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Player,
    Observer,
    Bot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    /// Missed heartbeats since `since` (epoch ms).
    Disconnected { since: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Easy => f.write_str("easy"),
            Self::Normal => f.write_str("normal"),
            Self::Hard => f.write_str("hard"),
        }
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(Self::Easy),
            "normal" => Ok(Self::Normal),
            "hard" => Ok(Self::Hard),
            other => Err(format!("unknown difficulty: {other}")),
        }
    }
}

/// Public rooms are long-lived defaults that reset when idle; private rooms
/// are created on demand and torn down when idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Public,
    Private,
}

/// The room-level state machine.
///
/// ```text
/// Idle ──→ Active ⇄ PostRoundQueue
///   │        │           │
///   └────────┴───────────┴──→ Expired
/// ```
///
/// `Active`/`PostRoundQueue` may also fall back to `Idle` when the last
/// human leaves or a public room resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Active,
    PostRoundQueue,
    Expired,
}

impl LifecycleState {
    pub fn can_transition_to(self, target: Self) -> bool {
        use LifecycleState::*;
        matches!(
            (self, target),
            (Idle, Active)
                | (Active, PostRoundQueue)
                | (PostRoundQueue, Active)
                | (Active | PostRoundQueue, Idle)
                | (Idle | Active | PostRoundQueue, Expired)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Active => f.write_str("active"),
            Self::PostRoundQueue => f.write_str("post_round_queue"),
            Self::Expired => f.write_str("expired"),
        }
    }
}

// ---------------------------------------------------------------------------
// GameConfig
// ---------------------------------------------------------------------------

/// Game settings frozen into the session when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameConfig {
    pub difficulty: Difficulty,
    pub turn_timeout_ms: u64,
    pub turns_per_round: u32,
    pub max_rolls: u32,
    pub max_seats: u32,
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub seat: u32,
    pub role: Role,
    pub display_name: String,
    pub status: ConnectionStatus,
    /// Last heartbeat or request, epoch ms.
    pub last_seen: u64,
    pub score: u32,
    pub turns_taken: u32,
    /// Dice indices the participant has set aside this turn.
    pub preview: Vec<usize>,
    pub consecutive_timeouts: u32,
    /// Moved to observer by the timeout rule; restored at round start.
    pub demoted: bool,
    pub queued_next: bool,
    pub blocks: BTreeSet<ParticipantId>,
}

impl Participant {
    pub fn new(id: ParticipantId, seat: u32, role: Role, display_name: String, now: u64) -> Self {
        Self {
            id,
            seat,
            role,
            display_name,
            status: ConnectionStatus::Connected,
            last_seen: now,
            score: 0,
            turns_taken: 0,
            preview: Vec::new(),
            consecutive_timeouts: 0,
            demoted: false,
            queued_next: false,
            blocks: BTreeSet::new(),
        }
    }

    pub fn is_human(&self) -> bool {
        self.role != Role::Bot
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.status, ConnectionStatus::Connected)
    }

    /// Takes turns this round (players and bots).
    pub fn is_required(&self) -> bool {
        matches!(self.role, Role::Player | Role::Bot)
    }

    /// Will play in the next round: a player, or someone demoted this round.
    pub fn plays_next_round(&self) -> bool {
        self.role == Role::Player || self.demoted
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub code: String,
    pub kind: RoomKind,
    pub state: LifecycleState,
    pub participants: BTreeMap<ParticipantId, Participant>,
    pub turn: Option<TurnState>,
    pub conduct: ConductState,
    pub config: GameConfig,
    pub round: u32,
    pub game_started_at: Option<u64>,
    pub round_completed_at: Option<u64>,
    pub next_game_starts_at: Option<u64>,
    pub expires_at: Option<u64>,
    /// When the last connected human went away.
    pub idle_since: Option<u64>,
    pub winner: Option<ParticipantId>,
    pub dice: [u8; DICE],
    pub seed: u64,
    /// Last issued turn id.
    pub turn_counter: u64,
    /// Last issued action sequence number.
    pub seq_counter: u64,
    /// Seat that held the previous turn, for rotation.
    pub last_seat: Option<u32>,
    pub created_at: u64,
    pub version: u64,
}

impl Session {
    pub fn new(
        id: SessionId,
        code: impl Into<String>,
        kind: RoomKind,
        config: GameConfig,
        seed: u64,
        now: u64,
    ) -> Self {
        Self {
            id,
            code: code.into(),
            kind,
            state: LifecycleState::Idle,
            participants: BTreeMap::new(),
            turn: None,
            conduct: ConductState::default(),
            config,
            round: 0,
            game_started_at: None,
            round_completed_at: None,
            next_game_starts_at: None,
            expires_at: None,
            idle_since: None,
            winner: None,
            dice: [0; DICE],
            seed,
            turn_counter: 0,
            seq_counter: 0,
            last_seat: None,
            created_at: now,
            version: 0,
        }
    }

    /// Moves to `target`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, target: LifecycleState) -> Result<(), EngineError> {
        if !self.state.can_transition_to(target) {
            return Err(EngineError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        tracing::debug!(session = %self.id, from = %self.state, to = %target, "lifecycle transition");
        self.state = target;
        Ok(())
    }

    pub fn participant(&self, id: ParticipantId) -> Result<&Participant, EngineError> {
        self.participants.get(&id).ok_or(EngineError::NotParticipant(id))
    }

    pub fn participant_mut(&mut self, id: ParticipantId) -> Result<&mut Participant, EngineError> {
        self.participants
            .get_mut(&id)
            .ok_or(EngineError::NotParticipant(id))
    }

    /// Participants ordered by seat.
    pub fn by_seat(&self) -> Vec<&Participant> {
        let mut seated: Vec<_> = self.participants.values().collect();
        seated.sort_by_key(|p| p.seat);
        seated
    }

    /// Lowest seat index nobody holds.
    pub fn free_seat(&self) -> Option<u32> {
        let taken: BTreeSet<u32> = self.participants.values().map(|p| p.seat).collect();
        (0..self.config.max_seats).find(|s| !taken.contains(s))
    }

    pub fn has_connected_human(&self) -> bool {
        self.participants
            .values()
            .any(|p| p.is_human() && p.is_connected())
    }

    /// A connected human who plays this round or the next. Without one the
    /// room has nobody to run rounds for.
    pub fn has_connected_player(&self) -> bool {
        self.participants
            .values()
            .any(|p| p.is_human() && p.is_connected() && p.plays_next_round())
    }

    pub fn active_participant(&self) -> Option<ParticipantId> {
        self.turn.as_ref().map(|t| t.participant_id)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot::from(self)
    }
}

impl Versioned for Session {
    fn key(&self) -> SessionId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// What clients see of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub id: ParticipantId,
    pub seat: u32,
    pub role: Role,
    pub display_name: String,
    pub connected: bool,
    pub score: u32,
    pub turns_taken: u32,
    pub preview: Vec<usize>,
    pub consecutive_timeouts: u32,
    pub demoted: bool,
    pub queued_next: bool,
}

impl From<&Participant> for ParticipantView {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id,
            seat: p.seat,
            role: p.role,
            display_name: p.display_name.clone(),
            connected: p.is_connected(),
            score: p.score,
            turns_taken: p.turns_taken,
            preview: p.preview.clone(),
            consecutive_timeouts: p.consecutive_timeouts,
            demoted: p.demoted,
            queued_next: p.queued_next,
        }
    }
}

/// The authoritative state sent on join, heartbeat and resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub code: String,
    pub kind: RoomKind,
    pub state: LifecycleState,
    pub version: u64,
    pub round: u32,
    pub config: GameConfig,
    pub participants: Vec<ParticipantView>,
    pub turn: Option<TurnState>,
    pub dice: [u8; DICE],
    pub winner: Option<ParticipantId>,
    pub game_started_at: Option<u64>,
    pub round_completed_at: Option<u64>,
    pub next_game_starts_at: Option<u64>,
    pub expires_at: Option<u64>,
}

impl From<&Session> for SessionSnapshot {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            code: s.code.clone(),
            kind: s.kind,
            state: s.state,
            version: s.version,
            round: s.round,
            config: s.config.clone(),
            participants: s.by_seat().into_iter().map(ParticipantView::from).collect(),
            turn: s.turn.clone(),
            dice: s.dice,
            winner: s.winner,
            game_started_at: s.game_started_at,
            round_completed_at: s.round_completed_at,
            next_game_starts_at: s.next_game_starts_at,
            expires_at: s.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GameConfig {
        GameConfig {
            difficulty: Difficulty::Normal,
            turn_timeout_ms: 30_000,
            turns_per_round: 3,
            max_rolls: 3,
            max_seats: 3,
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        use LifecycleState::*;
        assert!(Idle.can_transition_to(Active));
        assert!(Active.can_transition_to(PostRoundQueue));
        assert!(PostRoundQueue.can_transition_to(Active));
        assert!(PostRoundQueue.can_transition_to(Expired));
        assert!(!Idle.can_transition_to(PostRoundQueue));
        assert!(!Expired.can_transition_to(Idle));
        assert!(!Active.can_transition_to(Active));
    }

    #[test]
    fn test_transition_invalid_returns_error() {
        let mut s = Session::new(SessionId(1), "abc", RoomKind::Private, config(), 7, 0);
        let err = s.transition(LifecycleState::PostRoundQueue).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(s.state, LifecycleState::Idle);
    }

    #[test]
    fn test_free_seat_fills_gaps() {
        let mut s = Session::new(SessionId(1), "abc", RoomKind::Private, config(), 7, 0);
        for (id, seat) in [(1, 0), (2, 2)] {
            s.participants.insert(
                ParticipantId(id),
                Participant::new(ParticipantId(id), seat, Role::Player, "p".into(), 0),
            );
        }
        assert_eq!(s.free_seat(), Some(1));
        s.participants.insert(
            ParticipantId(3),
            Participant::new(ParticipantId(3), 1, Role::Player, "p".into(), 0),
        );
        assert_eq!(s.free_seat(), None);
    }

    #[test]
    fn test_by_seat_orders_by_seat_not_id() {
        let mut s = Session::new(SessionId(1), "abc", RoomKind::Private, config(), 7, 0);
        s.participants.insert(
            ParticipantId(1),
            Participant::new(ParticipantId(1), 2, Role::Player, "a".into(), 0),
        );
        s.participants.insert(
            ParticipantId(9),
            Participant::new(ParticipantId(9), 0, Role::Player, "b".into(), 0),
        );
        let seats: Vec<_> = s.by_seat().iter().map(|p| p.id).collect();
        assert_eq!(seats, [ParticipantId(9), ParticipantId(1)]);
    }

    #[test]
    fn test_difficulty_from_str() {
        assert_eq!("HARD".parse::<Difficulty>(), Ok(Difficulty::Hard));
        assert!("nightmare".parse::<Difficulty>().is_err());
    }

    #[test]
    fn test_snapshot_json_uses_snake_case_state() {
        let s = Session::new(SessionId(1), "abc", RoomKind::Public, config(), 7, 0);
        let json = serde_json::to_value(s.snapshot()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["kind"], "public");
    }
}
