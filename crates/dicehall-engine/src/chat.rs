//! Room chat, block lists and conduct strikes.
//!
//! Content moderation runs before a message reaches
//! [`room_channel_message`]; this module only routes what was allowed and
//! applies the consequences of what was not.

use dicehall_protocol::{ChatChannel, ParticipantId, Recipient};
use tracing::{info, warn};

use crate::EngineError;
use crate::conduct::StrikeOutcome;
use crate::config::EngineConfig;
use crate::event::{GameEvent, Outbound, RemovalReason};
use crate::lifecycle::{reconcile_into, remove_into};
use crate::session::Session;

/// Routes an allowed chat message. Direct messages go to the recipient
/// and echo back to the sender.
///
/// # Errors
/// [`EngineError::NotParticipant`] for an unknown sender;
/// [`EngineError::InvalidRecipient`] for a direct message to oneself or to
/// someone not in the room.
pub fn room_channel_message(
    session: &Session,
    sender: ParticipantId,
    channel: ChatChannel,
    body: String,
    now: u64,
) -> Result<Outbound, EngineError> {
    session.participant(sender)?;
    let event = |body: String| GameEvent::RoomChannelMessage {
        from: sender,
        channel,
        body,
        sent_at: now,
    };
    match channel {
        ChatChannel::Public => Ok(vec![(Recipient::All, event(body))]),
        ChatChannel::Direct(to) => {
            if to == sender || !session.participants.contains_key(&to) {
                return Err(EngineError::InvalidRecipient(to));
            }
            Ok(vec![
                (Recipient::Participant(to), event(body.clone())),
                (Recipient::Participant(sender), event(body)),
            ])
        }
    }
}

/// Adds or removes `target` from `participant`'s block list. Returns
/// whether the list changed.
pub fn set_block(
    session: &mut Session,
    participant: ParticipantId,
    target: ParticipantId,
    blocked: bool,
) -> Result<bool, EngineError> {
    if target == participant || !session.participants.contains_key(&target) {
        return Err(EngineError::InvalidRecipient(target));
    }
    let p = session.participant_mut(participant)?;
    Ok(if blocked {
        p.blocks.insert(target)
    } else {
        p.blocks.remove(&target)
    })
}

/// Records a conduct strike. A ban also removes the participant.
pub fn record_conduct_strike(
    session: &mut Session,
    participant: ParticipantId,
    now: u64,
    config: &EngineConfig,
) -> Result<(StrikeOutcome, Outbound), EngineError> {
    let outcome = session.conduct.record_strike(participant, now, &config.conduct);
    let mut out = vec![(Recipient::All, conduct_updated(session, participant))];

    match outcome {
        StrikeOutcome::Recorded { strikes } => {
            info!(session = %session.id, participant = %participant, strikes, "conduct strike");
        }
        StrikeOutcome::Muted { until } => {
            warn!(session = %session.id, participant = %participant, until, "participant muted");
        }
        StrikeOutcome::Banned => {
            warn!(session = %session.id, participant = %participant, "participant banned");
            if session.participants.contains_key(&participant) {
                remove_into(session, participant, RemovalReason::Banned, &mut out)?;
                reconcile_into(session, now, config, &mut out)?;
            }
        }
    }
    Ok((outcome, out))
}

/// Clears strikes, mute and ban. Empty when there was nothing to clear.
pub fn clear_conduct(session: &mut Session, participant: ParticipantId) -> Outbound {
    if !session.conduct.clear(participant) {
        return Vec::new();
    }
    info!(session = %session.id, participant = %participant, "conduct cleared");
    vec![(Recipient::All, conduct_updated(session, participant))]
}

fn conduct_updated(session: &Session, participant: ParticipantId) -> GameEvent {
    let record = session.conduct.record(participant);
    GameEvent::ConductUpdated {
        participant_id: participant,
        strikes: record.map_or(0, |r| r.total),
        muted_until: record.and_then(|r| r.muted_until),
        banned: record.is_some_and(|r| r.banned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduct::ConductPolicy;
    use crate::session::{Participant, Role, RoomKind};
    use dicehall_protocol::SessionId;

    fn session() -> Session {
        let config = EngineConfig::default();
        let mut s = Session::new(SessionId(1), "c", RoomKind::Private, config.game_config(None), 0, 0);
        for (seat, id) in [1u64, 2].into_iter().enumerate() {
            s.participants.insert(
                ParticipantId(id),
                Participant::new(ParticipantId(id), seat as u32, Role::Player, format!("p{id}"), 0),
            );
        }
        s
    }

    #[test]
    fn test_public_message_goes_to_all() {
        let s = session();
        let out = room_channel_message(&s, ParticipantId(1), ChatChannel::Public, "hi".into(), 5).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, Recipient::All);
    }

    #[test]
    fn test_direct_message_reaches_recipient_and_sender() {
        let s = session();
        let out = room_channel_message(
            &s,
            ParticipantId(1),
            ChatChannel::Direct(ParticipantId(2)),
            "psst".into(),
            5,
        )
        .unwrap();
        let recipients: Vec<_> = out.iter().map(|(r, _)| r.clone()).collect();
        assert_eq!(
            recipients,
            [Recipient::Participant(ParticipantId(2)), Recipient::Participant(ParticipantId(1))]
        );
    }

    #[test]
    fn test_direct_message_to_stranger_rejected() {
        let s = session();
        let err = room_channel_message(
            &s,
            ParticipantId(1),
            ChatChannel::Direct(ParticipantId(9)),
            "x".into(),
            0,
        )
        .unwrap_err();
        assert_eq!(err, EngineError::InvalidRecipient(ParticipantId(9)));
    }

    #[test]
    fn test_set_block_toggles() {
        let mut s = session();
        assert!(set_block(&mut s, ParticipantId(1), ParticipantId(2), true).unwrap());
        assert!(!set_block(&mut s, ParticipantId(1), ParticipantId(2), true).unwrap());
        assert!(s.participants[&ParticipantId(1)].blocks.contains(&ParticipantId(2)));
        assert!(set_block(&mut s, ParticipantId(1), ParticipantId(2), false).unwrap());
        assert!(set_block(&mut s, ParticipantId(1), ParticipantId(1), true).is_err());
    }

    #[test]
    fn test_ban_removes_participant() {
        let mut s = session();
        let config = EngineConfig {
            conduct: ConductPolicy {
                auto_ban_after: Some(1),
                ..ConductPolicy::default()
            },
            ..EngineConfig::default()
        };
        let (outcome, out) = record_conduct_strike(&mut s, ParticipantId(2), 0, &config).unwrap();
        assert_eq!(outcome, StrikeOutcome::Banned);
        assert!(!s.participants.contains_key(&ParticipantId(2)));
        assert!(out.iter().any(|(_, e)| matches!(
            e,
            GameEvent::ParticipantRemoved {
                reason: RemovalReason::Banned,
                ..
            }
        )));
    }

    #[test]
    fn test_clear_conduct_emits_only_when_present() {
        let mut s = session();
        assert!(clear_conduct(&mut s, ParticipantId(1)).is_empty());
        record_conduct_strike(&mut s, ParticipantId(1), 0, &EngineConfig::default()).unwrap();
        assert_eq!(clear_conduct(&mut s, ParticipantId(1)).len(), 1);
    }
}
