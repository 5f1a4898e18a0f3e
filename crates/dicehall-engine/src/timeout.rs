//! Turn timeouts.

use dicehall_protocol::Recipient;
use tracing::info;

use crate::EngineError;
use crate::config::EngineConfig;
use crate::event::{GameEvent, Outbound, TurnEndReason};
use crate::scoring::score_selection;
use crate::session::{LifecycleState, Role, Session};
use crate::turn::{advance, end_turn};

/// Consecutive timeouts in one round that move a player to observer.
pub const DEMOTE_AFTER: u32 = 2;

/// Ends turn `turn_id` if it is still live and its deadline has passed.
///
/// A pending selection is committed; otherwise the turn scores nothing.
/// Fires from a timer that may race a regular turn end, so a missing,
/// superseded or not-yet-due turn yields an empty outbound rather than an
/// error.
pub fn handle_timeout(
    session: &mut Session,
    turn_id: u64,
    now: u64,
    config: &EngineConfig,
) -> Result<Outbound, EngineError> {
    let mut out = Vec::new();
    if session.state != LifecycleState::Active {
        return Ok(out);
    }
    let Some(turn) = session.turn.as_ref() else {
        return Ok(out);
    };
    if turn.turn_id != turn_id || now < turn.deadline {
        return Ok(out);
    }

    let pid = turn.participant_id;
    let rolled = turn.rolls_used > 0;
    let preview = &session.participant(pid)?.preview;
    let (points, reason) = if rolled && !preview.is_empty() {
        (score_selection(&session.dice, preview), TurnEndReason::AutoCommitted)
    } else {
        (0, TurnEndReason::TimedOut)
    };

    end_turn(session, points, reason, &mut out)?;

    let p = session.participant_mut(pid)?;
    p.consecutive_timeouts += 1;
    let strikes = p.consecutive_timeouts;
    if strikes >= DEMOTE_AFTER && p.role == Role::Player {
        p.role = Role::Observer;
        p.demoted = true;
        info!(session = %session.id, participant = %pid, strikes, "participant demoted to observer");
        out.push((
            Recipient::All,
            GameEvent::ParticipantDemoted {
                participant_id: pid,
                consecutive_timeouts: strikes,
            },
        ));
    }

    advance(session, now, config, &mut out)?;
    Ok(out)
}
