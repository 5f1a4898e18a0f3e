//! Error types for the protocol layer.
//!
//! Each Dicehall crate owns its error enum. A `ProtocolError` always means
//! the bytes on the wire were the problem, never the session or the store.

/// Errors that can occur while framing or unframing messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (a Rust value could not become bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing fields, wrong
    /// types, or a truncated frame.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The frame parsed but violates protocol rules, e.g. a handshake
    /// with the wrong version or a game frame before the handshake.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
