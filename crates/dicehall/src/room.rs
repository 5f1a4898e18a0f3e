//! Session actor: an isolated Tokio task that owns one session.
//!
//! Each resident session runs in its own task and is reached only through
//! its mpsc channel, so requests, timers and broadcasts for one session are
//! serialized without locks. Every mutation goes through
//! [`SessionActor::apply`]:
//!
//! ```text
//!   engine op ─→ reconcile ─→ version+1, queue store write
//!                          ─→ broadcast to subscribers
//!                          ─→ re-derive timers from session state
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use dicehall_addon::FilterContext;
use dicehall_engine::{
    Action, EngineConfig, EngineError, GameEvent, JoinInfo, JoinOutcome, LifecycleState, Outbound,
    RemovalReason, Role, Session, SessionSnapshot, StrikeOutcome, TurnResult, add_bots, apply_action,
    clear_conduct, execute_bot_turn, expire, handle_timeout, heartbeat, join, leave, next_presence_check,
    queue_next, reconcile, record_conduct_strike, remove_participant, room_channel_message, set_block,
    sweep_presence,
};
use dicehall_protocol::{ChatChannel, ParticipantId, SessionId};
use dicehall_store::SessionStore;
use dicehall_timer::{DeadlineScheduler, Fired};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::DicehallError;
use crate::registry::SessionContext;

/// Something delivered to a subscribed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    Game(GameEvent),
    /// The session ended this subscription (removal, ban, expiry).
    Closed { reason: String },
}

/// Channel for delivering events to one connection.
pub(crate) type EventSender = mpsc::UnboundedSender<SessionEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TimerKind {
    TurnTimeout,
    BotMove,
    Restart,
    IdleExpiry,
    PresenceSweep,
}

type Reply<T> = oneshot::Sender<Result<T, DicehallError>>;

/// Commands sent to a session actor through its channel.
pub(crate) enum SessionCommand {
    Join {
        info: JoinInfo,
        reply: Reply<(JoinOutcome, SessionSnapshot)>,
    },
    Subscribe {
        participant: ParticipantId,
        sender: EventSender,
        reply: Reply<(u64, SessionSnapshot)>,
    },
    Unsubscribe {
        subscription: u64,
    },
    Heartbeat {
        participant: ParticipantId,
        reply: Reply<SessionSnapshot>,
    },
    Action {
        participant: ParticipantId,
        turn_seq: u64,
        action: Action,
        reply: Reply<TurnResult>,
    },
    QueueNext {
        participant: ParticipantId,
        reply: Reply<()>,
    },
    Chat {
        participant: ParticipantId,
        channel: ChatChannel,
        body: String,
        reply: Reply<()>,
    },
    SetBlock {
        participant: ParticipantId,
        target: ParticipantId,
        blocked: bool,
        reply: Reply<bool>,
    },
    AddBots {
        participant: ParticipantId,
        count: u32,
        reply: Reply<SessionSnapshot>,
    },
    Leave {
        participant: ParticipantId,
        reply: Reply<()>,
    },
    Remove {
        participant: ParticipantId,
        reply: Reply<()>,
    },
    ClearConduct {
        participant: ParticipantId,
        reply: Reply<bool>,
    },
    Expire {
        reply: Reply<()>,
    },
    /// `participant` restricts the snapshot to members.
    Snapshot {
        participant: Option<ParticipantId>,
        reply: Reply<SessionSnapshot>,
    },
    Shutdown,
}

/// Handle to a running session actor.
///
/// Cheap to clone; the registry holds one per resident session.
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    id: SessionId,
    sender: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    /// The actor has stopped (expired or shut down).
    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, DicehallError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| DicehallError::SessionUnavailable(self.id))?;
        response
            .await
            .map_err(|_| DicehallError::SessionUnavailable(self.id))?
    }

    pub(crate) async fn join(&self, info: JoinInfo) -> Result<(JoinOutcome, SessionSnapshot), DicehallError> {
        self.request(|reply| SessionCommand::Join { info, reply }).await
    }

    pub(crate) async fn subscribe(
        &self,
        participant: ParticipantId,
        sender: EventSender,
    ) -> Result<(u64, SessionSnapshot), DicehallError> {
        self.request(|reply| SessionCommand::Subscribe {
            participant,
            sender,
            reply,
        })
        .await
    }

    /// Fire-and-forget; a stopped actor has no subscribers left anyway.
    pub(crate) async fn unsubscribe(&self, subscription: u64) {
        let _ = self.sender.send(SessionCommand::Unsubscribe { subscription }).await;
    }

    pub(crate) async fn heartbeat(&self, participant: ParticipantId) -> Result<SessionSnapshot, DicehallError> {
        self.request(|reply| SessionCommand::Heartbeat { participant, reply })
            .await
    }

    pub(crate) async fn submit_action(
        &self,
        participant: ParticipantId,
        turn_seq: u64,
        action: Action,
    ) -> Result<TurnResult, DicehallError> {
        self.request(|reply| SessionCommand::Action {
            participant,
            turn_seq,
            action,
            reply,
        })
        .await
    }

    pub(crate) async fn queue_next(&self, participant: ParticipantId) -> Result<(), DicehallError> {
        self.request(|reply| SessionCommand::QueueNext { participant, reply })
            .await
    }

    pub(crate) async fn chat(
        &self,
        participant: ParticipantId,
        channel: ChatChannel,
        body: String,
    ) -> Result<(), DicehallError> {
        self.request(|reply| SessionCommand::Chat {
            participant,
            channel,
            body,
            reply,
        })
        .await
    }

    pub(crate) async fn set_block(
        &self,
        participant: ParticipantId,
        target: ParticipantId,
        blocked: bool,
    ) -> Result<bool, DicehallError> {
        self.request(|reply| SessionCommand::SetBlock {
            participant,
            target,
            blocked,
            reply,
        })
        .await
    }

    pub(crate) async fn add_bots(&self, participant: ParticipantId, count: u32) -> Result<SessionSnapshot, DicehallError> {
        self.request(|reply| SessionCommand::AddBots {
            participant,
            count,
            reply,
        })
        .await
    }

    pub(crate) async fn leave(&self, participant: ParticipantId) -> Result<(), DicehallError> {
        self.request(|reply| SessionCommand::Leave { participant, reply })
            .await
    }

    pub(crate) async fn remove(&self, participant: ParticipantId) -> Result<(), DicehallError> {
        self.request(|reply| SessionCommand::Remove { participant, reply })
            .await
    }

    pub(crate) async fn clear_conduct(&self, participant: ParticipantId) -> Result<bool, DicehallError> {
        self.request(|reply| SessionCommand::ClearConduct { participant, reply })
            .await
    }

    pub(crate) async fn expire(&self) -> Result<(), DicehallError> {
        self.request(|reply| SessionCommand::Expire { reply }).await
    }

    pub(crate) async fn snapshot(&self, participant: Option<ParticipantId>) -> Result<SessionSnapshot, DicehallError> {
        self.request(|reply| SessionCommand::Snapshot { participant, reply })
            .await
    }

    /// Tells the actor to stop after persisting nothing further.
    pub(crate) async fn shutdown(&self) {
        let _ = self.sender.send(SessionCommand::Shutdown).await;
    }
}

struct Subscriber {
    participant: ParticipantId,
    sender: EventSender,
}

/// The internal actor state. Runs inside a Tokio task.
struct SessionActor<S: SessionStore<Session>> {
    session: Session,
    ctx: Arc<SessionContext<S>>,
    timers: DeadlineScheduler<TimerKind>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscription: u64,
    receiver: mpsc::Receiver<SessionCommand>,
}

impl<S: SessionStore<Session>> SessionActor<S> {
    /// Runs the actor loop until shutdown or until a private session
    /// expires.
    async fn run(mut self) {
        let id = self.session.id;
        info!(session = %id, code = %self.session.code, state = %self.session.state, "session actor started");

        // A rehydrated session may have overdue deadlines.
        if let Err(e) = self.apply(|_, _, _| Ok(((), Vec::new()))) {
            warn!(session = %id, error = %e, "initial reconcile failed");
        }

        while self.session.state != LifecycleState::Expired {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle(cmd).await,
                },
                fired = self.timers.wait_next() => self.on_timer(fired),
            }
        }

        if self.session.state == LifecycleState::Expired {
            self.close_all("session_expired");
            self.ctx.sync.queue_delete(id);
        }
        info!(session = %id, "session actor stopped");
    }

    async fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join { info, reply } => {
                let result = self
                    .apply(|s, now, cfg| join(s, info, now, cfg))
                    .map(|outcome| (outcome, self.session.snapshot()));
                let _ = reply.send(result);
            }
            SessionCommand::Subscribe {
                participant,
                sender,
                reply,
            } => {
                let _ = reply.send(self.subscribe(participant, sender));
            }
            SessionCommand::Unsubscribe { subscription } => {
                if self.subscribers.remove(&subscription).is_some() {
                    debug!(session = %self.session.id, subscription, "unsubscribed");
                }
            }
            SessionCommand::Heartbeat { participant, reply } => {
                let result = self
                    .apply(|s, now, cfg| heartbeat(s, participant, now, cfg).map(|out| ((), out)))
                    .map(|()| self.session.snapshot());
                let _ = reply.send(result);
            }
            SessionCommand::Action {
                participant,
                turn_seq,
                action,
                reply,
            } => {
                let result = self.apply(|s, now, cfg| apply_action(s, participant, turn_seq, action, now, cfg));
                let _ = reply.send(result);
            }
            SessionCommand::QueueNext { participant, reply } => {
                let result = self.apply(|s, now, cfg| queue_next(s, participant, now, cfg).map(|out| ((), out)));
                let _ = reply.send(result);
            }
            SessionCommand::Chat {
                participant,
                channel,
                body,
                reply,
            } => {
                let result = self.chat(participant, channel, body).await;
                let _ = reply.send(result);
            }
            SessionCommand::SetBlock {
                participant,
                target,
                blocked,
                reply,
            } => {
                let result = self.apply(|s, _, _| {
                    set_block(s, participant, target, blocked).map(|changed| (changed, Vec::new()))
                });
                let _ = reply.send(result);
            }
            SessionCommand::AddBots {
                participant,
                count,
                reply,
            } => {
                let result = self
                    .apply(|s, now, cfg| {
                        s.participant(participant)?;
                        add_bots(s, count, now, cfg).map(|out| ((), out))
                    })
                    .map(|()| self.session.snapshot());
                let _ = reply.send(result);
            }
            SessionCommand::Leave { participant, reply } => {
                let result = self.apply(|s, now, cfg| leave(s, participant, now, cfg).map(|out| ((), out)));
                let _ = reply.send(result);
            }
            SessionCommand::Remove { participant, reply } => {
                let result = self.apply(|s, now, cfg| {
                    remove_participant(s, participant, RemovalReason::Removed, now, cfg).map(|out| ((), out))
                });
                let _ = reply.send(result);
            }
            SessionCommand::ClearConduct { participant, reply } => {
                let result = self.apply(|s, _, _| {
                    let out = clear_conduct(s, participant);
                    Ok((!out.is_empty(), out))
                });
                let _ = reply.send(result);
            }
            SessionCommand::Expire { reply } => {
                let result = self.apply(|s, now, _| expire(s, now).map(|out| ((), out)));
                let _ = reply.send(result);
            }
            SessionCommand::Snapshot { participant, reply } => {
                let result = match participant {
                    Some(p) => self
                        .session
                        .participant(p)
                        .map(|_| self.session.snapshot())
                        .map_err(DicehallError::from),
                    None => Ok(self.session.snapshot()),
                };
                let _ = reply.send(result);
            }
            // Handled by the run loop.
            SessionCommand::Shutdown => {}
        }
    }

    fn on_timer(&mut self, fired: Fired<TimerKind>) {
        let kind = fired.kind;
        let result = match kind {
            TimerKind::TurnTimeout => self.apply(|s, now, cfg| {
                let Some(turn_id) = s.turn.as_ref().map(|t| t.turn_id) else {
                    return Ok(((), Vec::new()));
                };
                handle_timeout(s, turn_id, now, cfg).map(|out| ((), out))
            }),
            TimerKind::BotMove => self.apply(|s, now, cfg| execute_bot_turn(s, now, cfg).map(|out| ((), out))),
            TimerKind::PresenceSweep => self.apply(|s, now, cfg| sweep_presence(s, now, cfg).map(|out| ((), out))),
            // Both are plain reconcile deadlines.
            TimerKind::Restart | TimerKind::IdleExpiry => self.apply(|_, _, _| Ok(((), Vec::new()))),
        };
        if let Err(e) = result {
            debug!(session = %self.session.id, ?kind, error = %e, "timer had no effect");
        }
    }

    fn subscribe(
        &mut self,
        participant: ParticipantId,
        sender: EventSender,
    ) -> Result<(u64, SessionSnapshot), DicehallError> {
        // Subscribing is a reconnect: it also counts as a heartbeat.
        self.apply(|s, now, cfg| heartbeat(s, participant, now, cfg).map(|out| ((), out)))?;

        self.next_subscription += 1;
        let subscription = self.next_subscription;
        self.subscribers.insert(subscription, Subscriber { participant, sender });
        debug!(
            session = %self.session.id,
            %participant,
            subscription,
            subscribers = self.subscribers.len(),
            "subscribed"
        );
        Ok((subscription, self.session.snapshot()))
    }

    /// Runs the filter chain, then routes the message. A rejection that
    /// carries a strike is recorded before the rejection is returned.
    async fn chat(
        &mut self,
        sender: ParticipantId,
        channel: ChatChannel,
        body: String,
    ) -> Result<(), DicehallError> {
        let ctx = self.filter_context(sender, channel, &body)?;
        let decision = self.ctx.filters.evaluate_chain(&ctx).await;

        if !decision.allowed {
            let filter = decision.rejected_by.unwrap_or_default();
            let reason = decision.reason.unwrap_or_default();
            debug!(session = %self.session.id, %sender, %filter, %reason, "chat rejected");
            if decision.strike {
                let outcome = self.apply(|s, now, cfg| record_conduct_strike(s, sender, now, cfg))?;
                if outcome == StrikeOutcome::Banned {
                    let revoked = self.ctx.tokens.revoke_participant(sender);
                    info!(session = %self.session.id, %sender, revoked, "banned participant's tokens revoked");
                }
            }
            return Err(DicehallError::PolicyRejected { filter, reason });
        }

        self.apply(|s, now, _| room_channel_message(s, sender, channel, body, now).map(|out| ((), out)))
    }

    fn filter_context(
        &self,
        sender: ParticipantId,
        channel: ChatChannel,
        body: &str,
    ) -> Result<FilterContext, DicehallError> {
        let s = &self.session;
        let now = self.ctx.clock.now_ms();
        let p = s.participant(sender)?;
        let recipient_blocks = match channel {
            ChatChannel::Direct(to) => s.participants.get(&to).map(|r| r.blocks.clone()).unwrap_or_default(),
            ChatChannel::Public => Default::default(),
        };
        Ok(FilterContext {
            session_id: s.id,
            sender,
            channel,
            body: body.to_string(),
            sender_is_observer: p.role == Role::Observer,
            sender_muted: s.conduct.is_muted(sender, now),
            sender_banned: s.conduct.is_banned(sender),
            sender_blocks: p.blocks.clone(),
            recipient_blocks,
        })
    }

    /// Runs `op` against the session, then reconciles, persists,
    /// broadcasts and re-derives timers. A failed op leaves the session as
    /// it was.
    fn apply<T>(
        &mut self,
        op: impl FnOnce(&mut Session, u64, &EngineConfig) -> Result<(T, Outbound), EngineError>,
    ) -> Result<T, DicehallError> {
        let now = self.ctx.clock.now_ms();
        let before = self.session.clone();

        let (value, mut out) = match op(&mut self.session, now, &self.ctx.engine) {
            Ok(done) => done,
            Err(e) => {
                self.session = before;
                self.sync_timers();
                return Err(e.into());
            }
        };
        match reconcile(&mut self.session, now, &self.ctx.engine) {
            Ok(more) => out.extend(more),
            Err(e) => warn!(session = %self.session.id, error = %e, "reconcile failed"),
        }

        if self.session != before {
            self.session.version = before.version + 1;
            self.ctx.sync.queue_write(self.session.clone());
        }
        self.dispatch(out);
        self.sync_timers();
        Ok(value)
    }

    /// Delivers events to matching subscribers, then ends subscriptions
    /// for participants who are gone.
    fn dispatch(&mut self, out: Outbound) {
        let mut gone = Vec::new();
        let mut reset = false;
        for (recipient, event) in out {
            match &event {
                GameEvent::ParticipantRemoved {
                    participant_id,
                    reason,
                } => gone.push((*participant_id, *reason)),
                GameEvent::SessionExpired { .. } => reset = true,
                _ => {}
            }
            for sub in self.subscribers.values() {
                if recipient.includes(sub.participant) {
                    let _ = sub.sender.send(SessionEvent::Game(event.clone()));
                }
            }
        }

        self.subscribers.retain(|_, sub| !sub.sender.is_closed());
        for (participant, reason) in gone {
            self.close_participant(participant, removal_reason(reason));
        }
        if reset {
            self.close_all("session_expired");
        }
    }

    fn close_participant(&mut self, participant: ParticipantId, reason: &str) {
        self.subscribers.retain(|_, sub| {
            if sub.participant != participant {
                return true;
            }
            let _ = sub.sender.send(SessionEvent::Closed {
                reason: reason.to_string(),
            });
            false
        });
    }

    fn close_all(&mut self, reason: &str) {
        for (_, sub) in self.subscribers.drain() {
            let _ = sub.sender.send(SessionEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// Re-derives every deadline from the session. Deadlines that no
    /// longer apply are cancelled; unchanged ones are left alone.
    fn sync_timers(&mut self) {
        let s = &self.session;
        if s.state == LifecycleState::Expired {
            self.timers.clear();
            return;
        }
        let clock = self.ctx.clock;
        let at = |ms: u64| clock.instant_at(ms);

        let turn = s.turn.as_ref().filter(|_| s.state == LifecycleState::Active);
        self.timers.sync(TimerKind::TurnTimeout, turn.map(|t| at(t.deadline)));

        let bot_turn = turn.is_some_and(|t| {
            s.participants
                .get(&t.participant_id)
                .is_some_and(|p| p.role == Role::Bot)
        });
        if !bot_turn {
            self.timers.cancel(TimerKind::BotMove);
        } else if !self.timers.is_scheduled(TimerKind::BotMove) {
            self.timers.schedule_jittered(TimerKind::BotMove, self.ctx.engine.bot_move_delay);
        }

        let restart = s
            .next_game_starts_at
            .filter(|_| s.state == LifecycleState::PostRoundQueue);
        self.timers.sync(TimerKind::Restart, restart.map(at));
        self.timers.sync(TimerKind::IdleExpiry, s.expires_at.map(at));
        self.timers.sync(
            TimerKind::PresenceSweep,
            next_presence_check(s, &self.ctx.engine).map(at),
        );
    }
}

fn removal_reason(reason: RemovalReason) -> &'static str {
    match reason {
        RemovalReason::Left => "left",
        RemovalReason::Removed => "removed",
        RemovalReason::Banned => "banned",
        RemovalReason::Expired => "session_expired",
    }
}

/// Spawns a session actor and returns a handle to communicate with it.
pub(crate) fn spawn_session<S: SessionStore<Session>>(session: Session, ctx: Arc<SessionContext<S>>) -> SessionHandle {
    let (tx, rx) = mpsc::channel(ctx.channel_size.max(1));
    let id = session.id;
    let actor = SessionActor {
        session,
        timers: DeadlineScheduler::new(ctx.timers.clone()),
        ctx,
        subscribers: HashMap::new(),
        next_subscription: 0,
        receiver: rx,
    };
    tokio::spawn(actor.run());
    SessionHandle { id, sender: tx }
}
