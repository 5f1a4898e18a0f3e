//! Session state and the engines that move it.
//!
//! Everything here is synchronous and deterministic: each operation takes
//! the session, the current time in epoch milliseconds and the engine
//! config, and returns the events to broadcast. The server crate owns the
//! clock, the timers and the actor that serializes calls per session.
//!
//! # Key types
//!
//! - [`Session`]: the persisted room record
//! - [`TurnState`]: the single live turn, if any
//! - [`GameEvent`]: what engines emit, paired with a [`Recipient`](dicehall_protocol::Recipient)
//! - [`EngineConfig`]: timeouts, round shape and conduct thresholds
//! - [`EngineError`]: every refusal, with a stable reason string

pub mod bot;
pub mod chat;
pub mod conduct;
mod config;
mod error;
mod event;
pub mod lifecycle;
pub mod scoring;
mod session;
pub mod timeout;
pub mod turn;

pub use bot::execute_bot_turn;
pub use chat::{clear_conduct, record_conduct_strike, room_channel_message, set_block};
pub use conduct::{ConductPolicy, ConductRecord, ConductState, StrikeOutcome};
pub use config::{EngineConfig, TurnTimeouts};
pub use error::EngineError;
pub use event::{GameEvent, Outbound, RemovalReason, TurnEndReason};
pub use lifecycle::{
    JoinInfo, JoinOutcome, add_bots, expire, heartbeat, join, leave, next_presence_check, queue_next,
    reconcile, remove_participant, standings, sweep_presence,
};
pub use session::{
    ConnectionStatus, DICE, Difficulty, GameConfig, LifecycleState, Participant, ParticipantView, Role,
    RoomKind, Session, SessionSnapshot,
};
pub use timeout::{DEMOTE_AFTER, handle_timeout};
pub use turn::{Action, ActionKind, TurnPhase, TurnResult, TurnState, apply_action, start_turn};
