//! Error types for the store layer.

use dicehall_protocol::SessionId;

/// Errors surfaced by a [`SessionStore`](crate::SessionStore) or by
/// [`StoreSync`](crate::StoreSync).
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The record does not exist and nothing suggests it ever did.
    #[error("session {0} not found")]
    NotFound(SessionId),

    /// Reads kept returning an older version (or nothing) after a known
    /// write, and the retry budget ran out.
    #[error(
        "session {id} still stale after {attempts} attempts \
         (expected version {expected}, found {found:?})"
    )]
    Stale {
        id: SessionId,
        expected: u64,
        found: Option<u64>,
        attempts: u32,
    },

    /// The backing store failed.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// `true` for failures that a later retry could resolve.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Stale { .. } | Self::Backend(_))
    }
}
