//! Turn state and the turn/action transitions.
//!
//! A turn moves through three phases:
//!
//! ```text
//! AwaitingRoll ──roll──→ AwaitingSelection ──roll (last)──→ AwaitingScore
//!                          │  ↺ select, roll                  │  ↺ select
//!                          └──────────── score ───────────────┴──→ turn ends
//! ```
//!
//! Every accepted action and every new turn advances the session's
//! sequence number. Clients echo the latest `turn_seq` they saw; anything
//! else is rejected as stale, which catches duplicates and late retries.

use std::fmt;

use dicehall_protocol::{ParticipantId, Recipient};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::EngineError;
use crate::config::EngineConfig;
use crate::event::{GameEvent, Outbound, TurnEndReason};
use crate::lifecycle;
use crate::scoring::{score_selection, validate_selection};
use crate::session::{DICE, LifecycleState, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    AwaitingRoll,
    AwaitingSelection,
    AwaitingScore,
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AwaitingRoll => f.write_str("awaiting_roll"),
            Self::AwaitingSelection => f.write_str("awaiting_selection"),
            Self::AwaitingScore => f.write_str("awaiting_score"),
        }
    }
}

/// The live turn. At most one per session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnState {
    /// Identifies the turn; timeouts carry it so a superseded timer is a no-op.
    pub turn_id: u64,
    /// Sequence number the next action must echo.
    pub turn_seq: u64,
    pub participant_id: ParticipantId,
    pub phase: TurnPhase,
    pub rolls_used: u32,
    pub started_at: u64,
    /// Epoch ms at which the turn times out.
    pub deadline: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Roll,
    Select { dice: Vec<usize> },
    Score,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Roll,
    Select,
    Score,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Roll => ActionKind::Roll,
            Self::Select { .. } => ActionKind::Select,
            Self::Score => ActionKind::Score,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Roll => "roll",
            Self::Select { .. } => "select",
            Self::Score => "score",
        }
    }
}

/// What the acting participant gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnResult {
    pub action: ActionKind,
    /// Sequence for the next action, `None` once the turn has ended.
    pub turn_seq: Option<u64>,
    pub phase: Option<TurnPhase>,
    pub dice: [u8; DICE],
    pub preview: Vec<usize>,
    /// Points committed, for `score`.
    pub points: Option<u32>,
}

// ---------------------------------------------------------------------------
// start_turn
// ---------------------------------------------------------------------------

/// Opens the next turn, or completes the round if nobody has turns left.
///
/// # Errors
/// [`EngineError::TurnInProgress`] if a turn is live;
/// [`EngineError::InvalidState`] outside an active round.
pub fn start_turn(session: &mut Session, now: u64, config: &EngineConfig) -> Result<Outbound, EngineError> {
    require_active(session)?;
    if session.turn.is_some() {
        return Err(EngineError::TurnInProgress);
    }
    let mut out = Vec::new();
    advance(session, now, config, &mut out)?;
    Ok(out)
}

fn require_active(session: &Session) -> Result<(), EngineError> {
    if session.state != LifecycleState::Active {
        return Err(EngineError::InvalidState {
            expected: LifecycleState::Active,
            actual: session.state,
        });
    }
    Ok(())
}

/// Next participant in seat order after the previous turn's seat
/// (wrapping) who still owes turns this round. Observers never qualify.
pub(crate) fn next_eligible(session: &Session) -> Option<ParticipantId> {
    let turns = session.config.turns_per_round;
    let eligible: Vec<_> = session
        .by_seat()
        .into_iter()
        .filter(|p| p.is_required() && p.turns_taken < turns)
        .collect();
    eligible
        .iter()
        .find(|p| session.last_seat.is_none_or(|s| p.seat > s))
        .or_else(|| eligible.first())
        .map(|p| p.id)
}

/// Starts the next turn or completes the round. Requires no live turn.
pub(crate) fn advance(
    session: &mut Session,
    now: u64,
    config: &EngineConfig,
    out: &mut Outbound,
) -> Result<(), EngineError> {
    match next_eligible(session) {
        Some(next) => {
            open_turn(session, next, now);
            out.push((Recipient::All, turn_started(session)));
            Ok(())
        }
        None => lifecycle::complete_round(session, now, config, out),
    }
}

fn open_turn(session: &mut Session, participant_id: ParticipantId, now: u64) {
    session.turn_counter += 1;
    session.seq_counter += 1;
    session.dice = [0; DICE];
    if let Some(p) = session.participants.get_mut(&participant_id) {
        p.preview.clear();
    }
    session.turn = Some(TurnState {
        turn_id: session.turn_counter,
        turn_seq: session.seq_counter,
        participant_id,
        phase: TurnPhase::AwaitingRoll,
        rolls_used: 0,
        started_at: now,
        deadline: now + session.config.turn_timeout_ms,
    });
    debug!(session = %session.id, participant = %participant_id, turn = session.turn_counter, "turn started");
}

fn turn_started(session: &Session) -> GameEvent {
    // Only called right after open_turn.
    let turn = session.turn.as_ref();
    GameEvent::TurnStarted {
        turn_id: turn.map_or(0, |t| t.turn_id),
        turn_seq: turn.map_or(0, |t| t.turn_seq),
        participant_id: turn.map_or(ParticipantId(0), |t| t.participant_id),
        round: session.round,
        deadline: turn.map_or(0, |t| t.deadline),
    }
}

// ---------------------------------------------------------------------------
// apply_action
// ---------------------------------------------------------------------------

/// Applies `action` from `participant` against the live turn.
///
/// # Errors
/// Stale sequence, wrong participant, illegal action for the phase, or a
/// malformed selection. The session is unchanged on error.
pub fn apply_action(
    session: &mut Session,
    participant: ParticipantId,
    turn_seq: u64,
    action: Action,
    now: u64,
    config: &EngineConfig,
) -> Result<(TurnResult, Outbound), EngineError> {
    require_active(session)?;
    let turn = session.turn.as_ref().ok_or(EngineError::NoActiveTurn)?;
    if turn_seq != turn.turn_seq {
        return Err(EngineError::StaleTurn {
            expected: turn.turn_seq,
            got: turn_seq,
        });
    }
    if participant != turn.participant_id {
        return Err(EngineError::NotYourTurn {
            active: turn.participant_id,
            got: participant,
        });
    }

    let phase = turn.phase;
    let rolls_used = turn.rolls_used;
    let max_rolls = session.config.max_rolls;
    let illegal = || EngineError::IllegalAction {
        action: action.name(),
        phase,
    };

    // Validate fully before touching anything.
    let selection = match (&action, phase) {
        (Action::Roll, TurnPhase::AwaitingRoll) => None,
        (Action::Roll, TurnPhase::AwaitingSelection) if rolls_used < max_rolls => None,
        (Action::Select { dice }, TurnPhase::AwaitingSelection | TurnPhase::AwaitingScore) => {
            Some(validate_selection(dice)?)
        }
        (Action::Score, TurnPhase::AwaitingSelection | TurnPhase::AwaitingScore) => None,
        _ => return Err(illegal()),
    };

    session.seq_counter += 1;
    let seq = session.seq_counter;
    let mut out = Vec::new();

    match action {
        Action::Roll => {
            let held = session.participant(participant)?.preview.clone();
            let mut rng = dice_rng(session.seed, session.turn_counter, rolls_used);
            for (i, die) in session.dice.iter_mut().enumerate() {
                if !held.contains(&i) {
                    *die = rng.random_range(1..=6);
                }
            }
            if let Some(turn) = session.turn.as_mut() {
                turn.rolls_used += 1;
                turn.phase = if turn.rolls_used >= max_rolls {
                    TurnPhase::AwaitingScore
                } else {
                    TurnPhase::AwaitingSelection
                };
            }
        }
        Action::Select { .. } => {
            session.participant_mut(participant)?.preview = selection.unwrap_or_default();
        }
        Action::Score => {}
    }

    let preview = session.participant(participant)?.preview.clone();
    if let Some(turn) = session.turn.as_mut() {
        turn.turn_seq = seq;
    }
    let (phase_after, rolls_after) = session
        .turn
        .as_ref()
        .map_or((phase, rolls_used), |t| (t.phase, t.rolls_used));

    out.push((
        Recipient::All,
        GameEvent::ActionApplied {
            turn_seq: seq,
            participant_id: participant,
            action: action.kind(),
            phase: phase_after,
            rolls_used: rolls_after,
            dice: session.dice,
            preview: preview.clone(),
        },
    ));

    let result = if action == Action::Score {
        let points = score_selection(&session.dice, &preview);
        end_turn(session, points, TurnEndReason::Scored, &mut out)?;
        advance(session, now, config, &mut out)?;
        TurnResult {
            action: ActionKind::Score,
            turn_seq: None,
            phase: None,
            dice: session.dice,
            preview,
            points: Some(points),
        }
    } else {
        TurnResult {
            action: action.kind(),
            turn_seq: Some(seq),
            phase: Some(phase_after),
            dice: session.dice,
            preview,
            points: None,
        }
    };
    Ok((result, out))
}

/// Closes the live turn, crediting `points` to its holder.
///
/// Only a turn the participant scored themselves clears their consecutive
/// timeout count. Does not start the next turn.
pub(crate) fn end_turn(
    session: &mut Session,
    points: u32,
    reason: TurnEndReason,
    out: &mut Outbound,
) -> Result<(), EngineError> {
    let turn = session.turn.take().ok_or(EngineError::NoActiveTurn)?;
    let p = session.participant_mut(turn.participant_id)?;
    p.turns_taken += 1;
    p.score += points;
    p.preview.clear();
    if reason == TurnEndReason::Scored {
        p.consecutive_timeouts = 0;
    }
    let (seat, total) = (p.seat, p.score);
    session.last_seat = Some(seat);

    debug!(
        session = %session.id,
        participant = %turn.participant_id,
        points,
        ?reason,
        "turn ended"
    );
    out.push((
        Recipient::All,
        GameEvent::TurnEnded {
            turn_id: turn.turn_id,
            participant_id: turn.participant_id,
            points,
            total_score: total,
            reason,
        },
    ));
    Ok(())
}

fn dice_rng(seed: u64, turn_id: u64, roll: u32) -> StdRng {
    let mixed = seed
        ^ turn_id.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ u64::from(roll).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    StdRng::seed_from_u64(mixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Participant, Role, RoomKind};
    use dicehall_protocol::SessionId;

    fn active_session(players: &[(u64, Role)]) -> Session {
        let config = EngineConfig::default();
        let mut s = Session::new(SessionId(1), "t", RoomKind::Private, config.game_config(None), 42, 0);
        for (seat, (id, role)) in players.iter().enumerate() {
            s.participants.insert(
                ParticipantId(*id),
                Participant::new(ParticipantId(*id), seat as u32, *role, format!("p{id}"), 0),
            );
        }
        s.state = LifecycleState::Active;
        s.round = 1;
        s
    }

    fn seq(s: &Session) -> u64 {
        s.turn.as_ref().unwrap().turn_seq
    }

    #[test]
    fn test_start_turn_picks_first_seat_and_sets_deadline() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Player), (2, Role::Player)]);
        let out = start_turn(&mut s, 1_000, &config).unwrap();

        let turn = s.turn.as_ref().unwrap();
        assert_eq!(turn.participant_id, ParticipantId(1));
        assert_eq!(turn.phase, TurnPhase::AwaitingRoll);
        assert_eq!(turn.deadline, 31_000);
        assert!(matches!(out[0].1, GameEvent::TurnStarted { .. }));
    }

    #[test]
    fn test_start_turn_while_live_rejected() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Player)]);
        start_turn(&mut s, 0, &config).unwrap();
        assert_eq!(start_turn(&mut s, 0, &config), Err(EngineError::TurnInProgress));
    }

    #[test]
    fn test_start_turn_skips_observers() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Observer), (2, Role::Player)]);
        start_turn(&mut s, 0, &config).unwrap();
        assert_eq!(s.active_participant(), Some(ParticipantId(2)));
    }

    #[test]
    fn test_roll_moves_to_selection_and_bumps_seq() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Player)]);
        start_turn(&mut s, 0, &config).unwrap();
        let before = seq(&s);

        let (result, _) = apply_action(&mut s, ParticipantId(1), before, Action::Roll, 10, &config).unwrap();
        assert_eq!(result.phase, Some(TurnPhase::AwaitingSelection));
        assert_eq!(result.turn_seq, Some(before + 1));
        assert!(s.dice.iter().all(|d| (1..=6).contains(d)));
    }

    #[test]
    fn test_duplicate_action_rejected_as_stale() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Player)]);
        start_turn(&mut s, 0, &config).unwrap();
        let first = seq(&s);
        apply_action(&mut s, ParticipantId(1), first, Action::Roll, 10, &config).unwrap();

        let err = apply_action(&mut s, ParticipantId(1), first, Action::Roll, 11, &config).unwrap_err();
        assert_eq!(err, EngineError::StaleTurn { expected: first + 1, got: first });
    }

    #[test]
    fn test_wrong_participant_rejected() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Player), (2, Role::Player)]);
        start_turn(&mut s, 0, &config).unwrap();
        let cur_seq = seq(&s);
        let err = apply_action(&mut s, ParticipantId(2), cur_seq, Action::Roll, 0, &config).unwrap_err();
        assert!(matches!(err, EngineError::NotYourTurn { .. }));
    }

    #[test]
    fn test_score_before_roll_illegal() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Player)]);
        start_turn(&mut s, 0, &config).unwrap();
        let cur_seq = seq(&s);
        let err = apply_action(&mut s, ParticipantId(1), cur_seq, Action::Score, 0, &config).unwrap_err();
        assert_eq!(
            err,
            EngineError::IllegalAction {
                action: "score",
                phase: TurnPhase::AwaitingRoll
            }
        );
    }

    #[test]
    fn test_last_roll_moves_to_awaiting_score() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Player)]);
        start_turn(&mut s, 0, &config).unwrap();
        for _ in 0..3 {
            let cur_seq = seq(&s);
            apply_action(&mut s, ParticipantId(1), cur_seq, Action::Roll, 0, &config).unwrap();
        }
        assert_eq!(s.turn.as_ref().unwrap().phase, TurnPhase::AwaitingScore);
        let cur_seq = seq(&s);
        let err = apply_action(&mut s, ParticipantId(1), cur_seq, Action::Roll, 0, &config).unwrap_err();
        assert!(matches!(err, EngineError::IllegalAction { action: "roll", .. }));
    }

    #[test]
    fn test_select_keeps_phase_and_held_dice_survive_reroll() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Player)]);
        start_turn(&mut s, 0, &config).unwrap();
        let cur_seq = seq(&s);
        apply_action(&mut s, ParticipantId(1), cur_seq, Action::Roll, 0, &config).unwrap();
        let held = s.dice[0];

        let cur_seq = seq(&s);
        let (result, _) = apply_action(
            &mut s,
            ParticipantId(1),
            cur_seq,
            Action::Select { dice: vec![0] },
            0,
            &config,
        )
        .unwrap();
        assert_eq!(result.phase, Some(TurnPhase::AwaitingSelection));

        let cur_seq = seq(&s);
        apply_action(&mut s, ParticipantId(1), cur_seq, Action::Roll, 0, &config).unwrap();
        assert_eq!(s.dice[0], held);
        assert_eq!(s.participants[&ParticipantId(1)].preview, vec![0]);
    }

    #[test]
    fn test_invalid_selection_leaves_session_untouched() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Player)]);
        start_turn(&mut s, 0, &config).unwrap();
        let cur_seq = seq(&s);
        apply_action(&mut s, ParticipantId(1), cur_seq, Action::Roll, 0, &config).unwrap();
        let before = s.clone();

        let cur_seq = seq(&s);
        let err = apply_action(
            &mut s,
            ParticipantId(1),
            cur_seq,
            Action::Select { dice: vec![7] },
            0,
            &config,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSelection(_)));
        assert_eq!(s, before);
    }

    #[test]
    fn test_score_commits_preview_and_advances() {
        let config = EngineConfig::default();
        let mut s = active_session(&[(1, Role::Player), (2, Role::Player)]);
        start_turn(&mut s, 0, &config).unwrap();
        let cur_seq = seq(&s);
        apply_action(&mut s, ParticipantId(1), cur_seq, Action::Roll, 0, &config).unwrap();
        s.dice = [1, 1, 1, 2, 3];
        let cur_seq = seq(&s);
        apply_action(
            &mut s,
            ParticipantId(1),
            cur_seq,
            Action::Select { dice: vec![0, 1, 2] },
            0,
            &config,
        )
        .unwrap();
        s.participants.get_mut(&ParticipantId(1)).unwrap().consecutive_timeouts = 1;

        let cur_seq = seq(&s);
        let (result, _) = apply_action(&mut s, ParticipantId(1), cur_seq, Action::Score, 0, &config).unwrap();
        assert_eq!(result.points, Some(1000));
        let p1 = &s.participants[&ParticipantId(1)];
        assert_eq!(p1.score, 1000);
        assert_eq!(p1.turns_taken, 1);
        assert_eq!(p1.consecutive_timeouts, 0);
        assert_eq!(s.active_participant(), Some(ParticipantId(2)));
    }

    #[test]
    fn test_dice_deterministic_per_seed() {
        let config = EngineConfig::default();
        let roll = || {
            let mut s = active_session(&[(1, Role::Player)]);
            start_turn(&mut s, 0, &config).unwrap();
            let cur_seq = seq(&s);
            apply_action(&mut s, ParticipantId(1), cur_seq, Action::Roll, 0, &config).unwrap();
            s.dice
        };
        assert_eq!(roll(), roll());
    }
}
