//! Bot turns.
//!
//! Bots play through [`apply_action`] like anyone else, so every move
//! passes the same sequence and phase checks a human's would.

use tracing::debug;

use crate::EngineError;
use crate::config::EngineConfig;
use crate::event::Outbound;
use crate::scoring::{best_selection, score_selection};
use crate::session::{Difficulty, Role, Session};
use crate::turn::{Action, TurnPhase, apply_action};

/// Points a bot is satisfied with before it stops re-rolling.
fn keep_threshold(difficulty: Difficulty) -> u32 {
    match difficulty {
        Difficulty::Easy => 150,
        Difficulty::Normal => 300,
        Difficulty::Hard => 450,
    }
}

/// Plays the active bot's whole turn.
///
/// # Errors
/// [`EngineError::NotBotTurn`] when the active seat is not a bot.
pub fn execute_bot_turn(session: &mut Session, now: u64, config: &EngineConfig) -> Result<Outbound, EngineError> {
    let turn = session.turn.as_ref().ok_or(EngineError::NoActiveTurn)?;
    let bot = turn.participant_id;
    if session.participant(bot)?.role != Role::Bot {
        return Err(EngineError::NotBotTurn);
    }

    let threshold = keep_threshold(session.config.difficulty);
    let mut out = Vec::new();
    loop {
        let Some(turn) = session.turn.as_ref() else {
            break;
        };
        let seq = turn.turn_seq;
        let action = match turn.phase {
            TurnPhase::AwaitingRoll => Action::Roll,
            phase => {
                let best = best_selection(&session.dice);
                let points = score_selection(&session.dice, &best);
                if session.participant(bot)?.preview != best {
                    Action::Select { dice: best }
                } else if phase == TurnPhase::AwaitingSelection
                    && points < threshold
                    && turn.rolls_used < session.config.max_rolls
                {
                    Action::Roll
                } else {
                    Action::Score
                }
            }
        };
        debug!(session = %session.id, bot = %bot, ?action, "bot move");

        let (result, events) = apply_action(session, bot, seq, action, now, config)?;
        out.extend(events);
        if result.turn_seq.is_none() {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::GameEvent;
    use crate::session::{LifecycleState, Participant, RoomKind};
    use crate::turn::start_turn;
    use dicehall_protocol::{ParticipantId, SessionId};

    fn session(first: Role) -> (Session, EngineConfig) {
        let config = EngineConfig::default();
        let mut s = Session::new(SessionId(1), "t", RoomKind::Private, config.game_config(None), 3, 0);
        s.participants.insert(
            ParticipantId(1),
            Participant::new(ParticipantId(1), 0, first, "first".into(), 0),
        );
        s.participants.insert(
            ParticipantId(2),
            Participant::new(ParticipantId(2), 1, Role::Player, "human".into(), 0),
        );
        s.state = LifecycleState::Active;
        s.round = 1;
        start_turn(&mut s, 0, &config).unwrap();
        (s, config)
    }

    #[test]
    fn test_execute_bot_turn_completes_turn() {
        let (mut s, config) = session(Role::Bot);
        let out = execute_bot_turn(&mut s, 1_200, &config).unwrap();

        let bot = &s.participants[&ParticipantId(1)];
        assert_eq!(bot.turns_taken, 1);
        assert_eq!(s.active_participant(), Some(ParticipantId(2)));
        assert!(out.iter().any(|(_, e)| matches!(e, GameEvent::TurnEnded { .. })));
    }

    #[test]
    fn test_execute_bot_turn_rejects_human_seat() {
        let (mut s, config) = session(Role::Player);
        assert_eq!(execute_bot_turn(&mut s, 0, &config), Err(EngineError::NotBotTurn));
    }

    #[test]
    fn test_keep_threshold_rises_with_difficulty() {
        assert!(keep_threshold(Difficulty::Easy) < keep_threshold(Difficulty::Normal));
        assert!(keep_threshold(Difficulty::Normal) < keep_threshold(Difficulty::Hard));
    }
}
