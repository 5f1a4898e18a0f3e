//! Wire protocol for Dicehall.
//!
//! - **Types** ([`Envelope`], [`SystemMessage`], [`ParticipantId`], ...):
//!   the structures that travel on the wire.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those structures
//!   become bytes and back.
//! - **Framer** ([`Framer`]): per-connection sequence numbering.
//! - **Errors** ([`ProtocolError`]).
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Services (session, turn, auth)
//! ```
//!
//! The protocol layer knows nothing about connections or sessions; it only
//! serializes and deserializes frames.

mod codec;
mod error;
mod framer;
mod types;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::ProtocolError;
pub use framer::Framer;
pub use types::{
    ChatChannel, Envelope, ParticipantId, Payload, Recipient, RoomRef, SessionId,
    SystemMessage,
};

/// Protocol version clients must present in their handshake.
pub const PROTOCOL_VERSION: u32 = 1;
