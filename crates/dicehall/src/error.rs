//! Unified error type for the Dicehall server.

use dicehall_addon::FilterError;
use dicehall_auth::AuthError;
use dicehall_engine::EngineError;
use dicehall_protocol::{ProtocolError, SessionId};
use dicehall_store::StoreError;
use dicehall_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// Service calls return this type; [`code`](Self::code) and
/// [`reason`](Self::reason) are the only place errors are translated into
/// what a client sees.
#[derive(Debug, thiserror::Error)]
pub enum DicehallError {
    /// A transport-level error (connection, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Authentication or authorization failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The session store failed or stayed stale.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Filter registry management failed. Filter evaluation never does.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// A game rule rejected the request.
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("session {0} is full")]
    RoomFull(SessionId),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("session {0} has expired")]
    SessionExpired(SessionId),

    /// The caller's token is not bound to the session it addressed.
    #[error("not a participant of session {0}")]
    NotParticipant(SessionId),

    /// A policy filter rejected the request.
    #[error("rejected by {filter}: {reason}")]
    PolicyRejected { filter: String, reason: String },

    /// The session actor stopped while the request was in flight.
    #[error("session {0} is unavailable")]
    SessionUnavailable(SessionId),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// The connection has no verified principal yet.
    #[error("no verified token on this connection")]
    Unauthenticated,
}

impl DicehallError {
    /// HTTP-style status code for the client.
    pub fn code(&self) -> u16 {
        match self {
            Self::Protocol(_) | Self::BadRequest(_) => 400,
            Self::Auth(e) if e.is_authentication() => 401,
            Self::Unauthenticated => 401,
            Self::Auth(AuthError::LastOwner) => 409,
            Self::Auth(_) => 403,
            Self::NotParticipant(_) => 403,
            Self::SessionNotFound(_) | Self::Store(StoreError::NotFound(_)) => 404,
            Self::RoomFull(_) => 409,
            Self::SessionExpired(_) | Self::Store(StoreError::Stale { .. }) => 410,
            Self::PolicyRejected { .. } => 451,
            Self::Engine(e) => match e {
                EngineError::RoomFull { .. } | EngineError::TurnInProgress => 409,
                EngineError::SessionExpired(_) => 410,
                EngineError::Banned(_) | EngineError::NotParticipant(_) => 403,
                EngineError::StaleTurn { .. }
                | EngineError::NotYourTurn { .. }
                | EngineError::NoActiveTurn
                | EngineError::IllegalAction { .. }
                | EngineError::InvalidState { .. }
                | EngineError::CannotQueue(_) => 409,
                EngineError::InvalidSelection(_)
                | EngineError::InvalidRecipient(_)
                | EngineError::TooManyBots { .. } => 422,
                EngineError::InvalidTransition { .. } | EngineError::NotBotTurn => 500,
            },
            Self::SessionUnavailable(_) => 503,
            Self::Transport(_) | Self::Store(_) | Self::Filter(_) => 500,
        }
    }

    /// Stable machine-readable reason clients switch on.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Auth(e) if e.is_authentication() => "unauthenticated",
            Self::Unauthenticated => "unauthenticated",
            Self::Auth(AuthError::LastOwner) => "last_owner",
            Self::Auth(_) => "forbidden",
            Self::Protocol(_) => "invalid_message",
            Self::BadRequest(_) => "bad_request",
            Self::Store(StoreError::NotFound(_)) | Self::SessionNotFound(_) => "session_not_found",
            Self::Store(StoreError::Stale { .. }) => "session_expired",
            Self::Store(_) => "store_unavailable",
            Self::Engine(e) => e.reason(),
            Self::RoomFull(_) => "room_full",
            Self::SessionExpired(_) => "session_expired",
            Self::NotParticipant(_) => "not_participant",
            Self::PolicyRejected { .. } => "policy_rejected",
            Self::SessionUnavailable(_) => "session_unavailable",
            Self::Transport(_) | Self::Filter(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicehall_auth::AdminRole;
    use dicehall_protocol::ParticipantId;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let err: DicehallError = err.into();
        assert!(matches!(err, DicehallError::Transport(_)));
        assert!(err.to_string().contains("gone"));
        assert_eq!(err.code(), 500);
    }

    #[test]
    fn test_from_protocol_error() {
        let err: DicehallError = ProtocolError::InvalidMessage("bad".into()).into();
        assert!(matches!(err, DicehallError::Protocol(_)));
        assert_eq!(err.code(), 400);
    }

    #[test]
    fn test_code_authentication_is_401_forbidden_is_403() {
        let expired: DicehallError = AuthError::Expired.into();
        assert_eq!((expired.code(), expired.reason()), (401, "unauthenticated"));

        let forbidden: DicehallError = AuthError::Forbidden {
            required: AdminRole::Owner,
            actual: Some(AdminRole::Viewer),
        }
        .into();
        assert_eq!((forbidden.code(), forbidden.reason()), (403, "forbidden"));
    }

    #[test]
    fn test_code_stale_store_is_410() {
        let err: DicehallError = StoreError::Stale {
            id: SessionId(1),
            expected: 4,
            found: Some(3),
            attempts: 5,
        }
        .into();
        assert_eq!(err.code(), 410);
        assert_eq!(err.reason(), "session_expired");
    }

    #[test]
    fn test_code_engine_room_full_is_409() {
        let err: DicehallError = EngineError::RoomFull {
            session: SessionId(1),
            max_seats: 4,
        }
        .into();
        assert_eq!((err.code(), err.reason()), (409, "room_full"));
    }

    #[test]
    fn test_code_policy_rejection_is_451() {
        let err = DicehallError::PolicyRejected {
            filter: "chat-conduct".into(),
            reason: "conduct_violation".into(),
        };
        assert_eq!(err.code(), 451);
    }

    #[test]
    fn test_code_banned_is_403() {
        let err: DicehallError = EngineError::Banned(ParticipantId(3)).into();
        assert_eq!((err.code(), err.reason()), (403, "banned"));
    }
}
