//! Session lifecycle: membership, presence, rounds, idle expiry.
//!
//! Every public operation here ends with [`reconcile`], which drives the
//! state machine forward until nothing more applies. Reconcile is
//! idempotent, so the session actor calls it again after every command and
//! timer without double-firing anything.

use std::cmp::Ordering;

use dicehall_protocol::{ParticipantId, Recipient};
use tracing::{debug, info};

use crate::EngineError;
use crate::config::EngineConfig;
use crate::event::{GameEvent, Outbound, RemovalReason, TurnEndReason};
use crate::session::{
    ConnectionStatus, DICE, LifecycleState, Participant, ParticipantView, Role, RoomKind, Session,
};
use crate::turn::{advance, end_turn};

/// Bound on reconcile passes. Each pass makes at most one lifecycle
/// transition, so a handful is always enough.
const MAX_PASSES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinInfo {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub as_observer: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub participant: ParticipantView,
    /// The participant already held a seat and reconnected to it.
    pub rejoined: bool,
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Seats a participant, or reconnects one who already has a seat.
///
/// # Errors
/// [`EngineError::SessionExpired`], [`EngineError::Banned`], or
/// [`EngineError::RoomFull`] when no seat is free.
pub fn join(
    session: &mut Session,
    info: JoinInfo,
    now: u64,
    config: &EngineConfig,
) -> Result<(JoinOutcome, Outbound), EngineError> {
    if session.state == LifecycleState::Expired {
        return Err(EngineError::SessionExpired(session.id));
    }
    let pid = info.participant_id;
    if session.conduct.is_banned(pid) {
        return Err(EngineError::Banned(pid));
    }

    let rejoined = session.participants.contains_key(&pid);
    if rejoined {
        let p = session.participant_mut(pid)?;
        p.status = ConnectionStatus::Connected;
        p.last_seen = now;
        debug!(session = %session.id, participant = %pid, "participant rejoined");
    } else {
        let seat = session.free_seat().ok_or(EngineError::RoomFull {
            session: session.id,
            max_seats: session.config.max_seats,
        })?;
        let role = if info.as_observer { Role::Observer } else { Role::Player };
        session
            .participants
            .insert(pid, Participant::new(pid, seat, role, info.display_name, now));
        info!(session = %session.id, participant = %pid, seat, ?role, "participant joined");
    }

    let view = ParticipantView::from(session.participant(pid)?);
    let mut out = vec![(
        Recipient::AllExcept(pid),
        GameEvent::ParticipantJoined {
            participant: view.clone(),
        },
    )];
    reconcile_into(session, now, config, &mut out)?;
    Ok((
        JoinOutcome {
            participant: view,
            rejoined,
        },
        out,
    ))
}

/// Fills `count` free seats with bots.
///
/// # Errors
/// [`EngineError::TooManyBots`] past the configured limit, or
/// [`EngineError::RoomFull`] when there are not enough free seats.
pub fn add_bots(
    session: &mut Session,
    count: u32,
    now: u64,
    config: &EngineConfig,
) -> Result<Outbound, EngineError> {
    if session.state == LifecycleState::Expired {
        return Err(EngineError::SessionExpired(session.id));
    }
    let existing = session.participants.values().filter(|p| !p.is_human()).count() as u32;
    if existing + count > config.max_bots {
        return Err(EngineError::TooManyBots {
            requested: count,
            max: config.max_bots,
        });
    }
    let free = session.config.max_seats as usize - session.participants.len().min(session.config.max_seats as usize);
    if (count as usize) > free {
        return Err(EngineError::RoomFull {
            session: session.id,
            max_seats: session.config.max_seats,
        });
    }

    let mut out = Vec::new();
    for _ in 0..count {
        let Some(seat) = session.free_seat() else {
            break;
        };
        let id = bot_id(session, seat);
        let bot = Participant::new(id, seat, Role::Bot, format!("Bot {}", seat + 1), now);
        out.push((
            Recipient::All,
            GameEvent::ParticipantJoined {
                participant: ParticipantView::from(&bot),
            },
        ));
        session.participants.insert(id, bot);
    }
    info!(session = %session.id, count, "bots added");
    reconcile_into(session, now, config, &mut out)?;
    Ok(out)
}

/// Bot ids live in the top half of the id space, away from the hashed ids
/// handed to humans.
fn bot_id(session: &Session, seat: u32) -> ParticipantId {
    ParticipantId(1 << 63 | (session.id.0 & 0x7FFF_FFFF_FFFF) << 8 | u64::from(seat))
}

/// The participant leaves voluntarily.
pub fn leave(
    session: &mut Session,
    participant: ParticipantId,
    now: u64,
    config: &EngineConfig,
) -> Result<Outbound, EngineError> {
    remove_participant(session, participant, RemovalReason::Left, now, config)
}

/// Drops a participant. A live turn they hold is forfeited for zero points.
pub fn remove_participant(
    session: &mut Session,
    participant: ParticipantId,
    reason: RemovalReason,
    now: u64,
    config: &EngineConfig,
) -> Result<Outbound, EngineError> {
    session.participant(participant)?;
    let mut out = Vec::new();
    remove_into(session, participant, reason, &mut out)?;
    reconcile_into(session, now, config, &mut out)?;
    Ok(out)
}

pub(crate) fn remove_into(
    session: &mut Session,
    participant: ParticipantId,
    reason: RemovalReason,
    out: &mut Outbound,
) -> Result<(), EngineError> {
    if session.active_participant() == Some(participant) {
        end_turn(session, 0, TurnEndReason::Forfeited, out)?;
    }
    session.participants.remove(&participant);
    for p in session.participants.values_mut() {
        p.blocks.remove(&participant);
    }
    info!(session = %session.id, participant = %participant, ?reason, "participant removed");
    out.push((
        Recipient::All,
        GameEvent::ParticipantRemoved {
            participant_id: participant,
            reason,
        },
    ));
    Ok(())
}

// ---------------------------------------------------------------------------
// Presence
// ---------------------------------------------------------------------------

/// Records a heartbeat, reconnecting the participant if they had lapsed.
pub fn heartbeat(
    session: &mut Session,
    participant: ParticipantId,
    now: u64,
    config: &EngineConfig,
) -> Result<Outbound, EngineError> {
    let p = session.participant_mut(participant)?;
    p.last_seen = now;
    if !p.is_connected() {
        p.status = ConnectionStatus::Connected;
        debug!(participant = %participant, "participant reconnected");
    }
    let mut out = Vec::new();
    reconcile_into(session, now, config, &mut out)?;
    Ok(out)
}

/// Marks humans whose heartbeats lapsed as disconnected. Their seats are
/// kept; a later heartbeat or rejoin restores them.
pub fn sweep_presence(session: &mut Session, now: u64, config: &EngineConfig) -> Result<Outbound, EngineError> {
    let timeout = config.presence_timeout_ms();
    for p in session.participants.values_mut() {
        if p.is_human() && p.is_connected() && now.saturating_sub(p.last_seen) >= timeout {
            p.status = ConnectionStatus::Disconnected { since: now };
            debug!(participant = %p.id, "participant presence lapsed");
        }
    }
    let mut out = Vec::new();
    reconcile_into(session, now, config, &mut out)?;
    Ok(out)
}

/// Earliest `last_seen + presence_timeout` among connected humans.
pub fn next_presence_check(session: &Session, config: &EngineConfig) -> Option<u64> {
    session
        .participants
        .values()
        .filter(|p| p.is_human() && p.is_connected())
        .map(|p| p.last_seen + config.presence_timeout_ms())
        .min()
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

/// Opts into the next round during the post-round window. Once every
/// eligible participant has queued the round starts without waiting for
/// the countdown.
///
/// # Errors
/// [`EngineError::InvalidState`] outside the post-round window;
/// [`EngineError::CannotQueue`] for observers, bots and disconnected seats.
pub fn queue_next(
    session: &mut Session,
    participant: ParticipantId,
    now: u64,
    config: &EngineConfig,
) -> Result<Outbound, EngineError> {
    if session.state != LifecycleState::PostRoundQueue {
        return Err(EngineError::InvalidState {
            expected: LifecycleState::PostRoundQueue,
            actual: session.state,
        });
    }
    let p = session.participant_mut(participant)?;
    if !can_queue(p) {
        return Err(EngineError::CannotQueue(participant));
    }
    let mut out = Vec::new();
    if p.queued_next {
        return Ok(out);
    }
    p.queued_next = true;

    out.push((Recipient::All, countdown(session, now)));
    reconcile_into(session, now, config, &mut out)?;
    Ok(out)
}

fn can_queue(p: &Participant) -> bool {
    p.is_human() && p.is_connected() && p.plays_next_round()
}

fn all_queued(session: &Session) -> bool {
    let mut eligible = session.participants.values().filter(|p| can_queue(p)).peekable();
    eligible.peek().is_some() && eligible.all(|p| p.queued_next)
}

fn countdown(session: &Session, now: u64) -> GameEvent {
    GameEvent::NextRoundCountdown {
        next_game_starts_at: session.next_game_starts_at.unwrap_or(now),
        queued: session
            .by_seat()
            .into_iter()
            .filter(|p| p.queued_next)
            .map(|p| p.id)
            .collect(),
    }
}

fn start_round(session: &mut Session, now: u64, config: &EngineConfig, out: &mut Outbound) -> Result<(), EngineError> {
    session.transition(LifecycleState::Active)?;
    session.round += 1;
    session.game_started_at = Some(now);
    session.round_completed_at = None;
    session.next_game_starts_at = None;
    session.winner = None;
    session.last_seat = None;
    session.turn = None;
    session.dice = [0; DICE];
    for p in session.participants.values_mut() {
        p.score = 0;
        p.turns_taken = 0;
        p.consecutive_timeouts = 0;
        p.preview.clear();
        p.queued_next = false;
        if p.demoted {
            p.role = Role::Player;
            p.demoted = false;
        }
    }
    info!(session = %session.id, round = session.round, "round started");
    out.push((
        Recipient::All,
        GameEvent::NextRoundStarted {
            round: session.round,
            game_started_at: now,
        },
    ));
    advance(session, now, config, out)
}

/// Closes the round and opens the post-round window. This is the only
/// place `next_game_starts_at` is set.
pub(crate) fn complete_round(
    session: &mut Session,
    now: u64,
    config: &EngineConfig,
    out: &mut Outbound,
) -> Result<(), EngineError> {
    session.transition(LifecycleState::PostRoundQueue)?;
    session.turn = None;

    let took_turn = |id: &ParticipantId| session.participants.get(id).is_some_and(|p| p.turns_taken > 0);
    let scores: Vec<_> = standings(session)
        .into_iter()
        .filter(|(id, _)| took_turn(id) || session.participants.get(id).is_some_and(Participant::is_required))
        .collect();
    let winner = scores.iter().map(|(id, _)| *id).find(|id| took_turn(id));

    let starts_at = now + config.restart_delay_ms();
    session.winner = winner;
    session.round_completed_at = Some(now);
    session.next_game_starts_at = Some(starts_at);
    info!(session = %session.id, round = session.round, winner = ?winner, "round completed");

    out.push((
        Recipient::All,
        GameEvent::RoundCompleted {
            round: session.round,
            winner,
            scores,
            next_game_starts_at: starts_at,
        },
    ));
    out.push((Recipient::All, countdown(session, now)));
    Ok(())
}

fn reset_to_idle(session: &mut Session) -> Result<(), EngineError> {
    session.transition(LifecycleState::Idle)?;
    session.turn = None;
    session.game_started_at = None;
    session.round_completed_at = None;
    session.next_game_starts_at = None;
    session.last_seat = None;
    session.dice = [0; DICE];
    for p in session.participants.values_mut() {
        p.queued_next = false;
        p.preview.clear();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Expiry
// ---------------------------------------------------------------------------

/// Expires the session now. Private rooms end for good; public rooms are
/// emptied and reset to idle so the code keeps working.
///
/// # Errors
/// [`EngineError::SessionExpired`] if already expired.
pub fn expire(session: &mut Session, now: u64) -> Result<Outbound, EngineError> {
    if session.state == LifecycleState::Expired {
        return Err(EngineError::SessionExpired(session.id));
    }
    let mut out = Vec::new();
    expire_into(session, now, &mut out)?;
    Ok(out)
}

fn expire_into(session: &mut Session, now: u64, out: &mut Outbound) -> Result<(), EngineError> {
    let reset = session.kind == RoomKind::Public;
    if reset {
        if session.state != LifecycleState::Idle {
            reset_to_idle(session)?;
        }
        // Conduct outlives the reset; bans and mutes stick to the room code.
        session.participants.clear();
        session.winner = None;
    } else {
        session.transition(LifecycleState::Expired)?;
        session.turn = None;
        session.next_game_starts_at = None;
    }
    session.idle_since = None;
    session.expires_at = None;
    info!(session = %session.id, reset, at = now, "session expired");
    out.push((Recipient::All, GameEvent::SessionExpired { reset }));
    Ok(())
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

/// Drives the session to a fixpoint at `now`.
pub fn reconcile(session: &mut Session, now: u64, config: &EngineConfig) -> Result<Outbound, EngineError> {
    let mut out = Vec::new();
    reconcile_into(session, now, config, &mut out)?;
    Ok(out)
}

pub(crate) fn reconcile_into(
    session: &mut Session,
    now: u64,
    config: &EngineConfig,
    out: &mut Outbound,
) -> Result<(), EngineError> {
    for _ in 0..MAX_PASSES {
        if !reconcile_step(session, now, config, out)? {
            break;
        }
    }
    Ok(())
}

/// One pass. Returns whether anything changed.
fn reconcile_step(
    session: &mut Session,
    now: u64,
    config: &EngineConfig,
    out: &mut Outbound,
) -> Result<bool, EngineError> {
    if session.state == LifecycleState::Expired {
        return Ok(false);
    }

    let mut changed = false;
    let dormant_public =
        session.kind == RoomKind::Public && session.state == LifecycleState::Idle && session.participants.is_empty();
    if session.has_connected_human() || dormant_public {
        if session.expires_at.is_some() {
            session.idle_since = None;
            session.expires_at = None;
            changed = true;
        }
    } else {
        match session.expires_at {
            None => {
                let at = now + config.idle_window_ms();
                session.idle_since = Some(now);
                session.expires_at = Some(at);
                out.push((Recipient::All, GameEvent::SessionExpiring { expires_at: at }));
                changed = true;
            }
            Some(at) if now >= at => {
                expire_into(session, now, out)?;
                return Ok(true);
            }
            Some(_) => {}
        }
    }

    match session.state {
        LifecycleState::Idle => {
            if session.has_connected_player() {
                start_round(session, now, config, out)?;
                return Ok(true);
            }
        }
        LifecycleState::Active | LifecycleState::PostRoundQueue if !session.has_connected_player() => {
            reset_to_idle(session)?;
            return Ok(true);
        }
        LifecycleState::Active if session.turn.is_none() => {
            advance(session, now, config, out)?;
            return Ok(true);
        }
        LifecycleState::PostRoundQueue => {
            let due = session.next_game_starts_at.is_some_and(|at| now >= at);
            if due || all_queued(session) {
                start_round(session, now, config, out)?;
                return Ok(true);
            }
        }
        _ => {}
    }
    Ok(changed)
}

/// Scores ordered for display: highest first, seat breaks ties.
pub fn standings(session: &Session) -> Vec<(ParticipantId, u32)> {
    let mut rows: Vec<_> = session.by_seat().into_iter().map(|p| (p.seat, p.id, p.score)).collect();
    rows.sort_by(|a, b| match b.2.cmp(&a.2) {
        Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });
    rows.into_iter().map(|(_, id, score)| (id, score)).collect()
}
