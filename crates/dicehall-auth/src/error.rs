//! Error types for the auth layer.

use crate::{AdminRole, TokenKind};

/// Errors from token verification, identity resolution and admin checks.
///
/// Every variant except [`Forbidden`](AuthError::Forbidden) is an
/// authentication failure: the caller should refresh or re-join. `Forbidden`
/// means the identity is fine but lacks the role, and refreshing will not
/// help.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("token revoked")]
    Revoked,

    /// Bad signature, bad encoding, missing claims.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// An access token was presented where a refresh token was expected,
    /// or the other way round.
    #[error("expected {expected} token, got {found}")]
    WrongKind { expected: TokenKind, found: TokenKind },

    /// No verifier accepted the identity assertion.
    #[error("identity rejected: {0}")]
    IdentityRejected(String),

    #[error("requires {required} role, have {}", actual.map_or("none".to_string(), |r| r.to_string()))]
    Forbidden {
        required: AdminRole,
        actual: Option<AdminRole>,
    },

    /// The change would leave the directory without an owner.
    #[error("cannot remove the last owner")]
    LastOwner,
}

impl AuthError {
    /// `true` for failures a token refresh or fresh sign-in can fix.
    pub fn is_authentication(&self) -> bool {
        !matches!(self, Self::Forbidden { .. } | Self::LastOwner)
    }
}
