//! # Dicehall
//!
//! Server-authoritative multiplayer dice sessions.
//!
//! Each session lives in its own actor task that owns the authoritative
//! state, runs the turn, timeout and bot engines, and fans events out to
//! subscribed connections. [`SessionService`] and [`AdminService`] are the
//! transport-independent surface; [`DicehallServer`] puts them behind a
//! WebSocket listener.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dicehall::prelude::*;
//!
//! # async fn run() -> Result<(), DicehallError> {
//! let server = DicehallServerBuilder::new()
//!     .config(ServerConfig::from_env())
//!     .build(Arc::new(MemoryStore::<Session>::new()))
//!     .await?;
//! server.run().await
//! # }
//! ```

mod admin;
pub mod clock;
pub mod config;
mod error;
mod handler;
mod registry;
pub mod requests;
mod room;
mod server;
mod service;

pub use admin::AdminService;
pub use clock::Clock;
pub use config::ServerConfig;
pub use error::DicehallError;
pub use requests::{ClientRequest, ServerReply};
pub use server::{DicehallServer, DicehallServerBuilder, Services};
pub use service::{JoinRequest, Joined, SessionService};

pub mod prelude {
    pub use crate::{
        AdminService, ClientRequest, Clock, DicehallError, DicehallServer, DicehallServerBuilder, JoinRequest,
        Joined, ServerConfig, ServerReply, Services, SessionService,
    };
    pub use dicehall_auth::{AdminRole, Identity, LegacyLookup, Principal, TokenPair};
    pub use dicehall_engine::{Action, Difficulty, GameEvent, Session, SessionSnapshot, TurnResult};
    pub use dicehall_protocol::{ChatChannel, ParticipantId, RoomRef, SessionId};
    pub use dicehall_store::{MemoryStore, SessionStore};
}
