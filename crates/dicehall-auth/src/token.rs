//! Access/refresh token pairs.
//!
//! Tokens are HS256 JWTs signed with the server secret. Access tokens are
//! short-lived and presented with every request; refresh tokens live longer
//! and can be exchanged exactly once for a new pair (the presented refresh
//! token is revoked on use).
//!
//! Revocation is tracked by `jti` in memory. Entries are dropped once the
//! token they name would have expired anyway.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dicehall_protocol::{ParticipantId, SessionId};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AuthError, Identity};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TokenConfig {
    /// HS256 signing secret.
    pub secret: String,
    /// `iss` claim written into and required from every token.
    pub issuer: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "dicehall-dev-secret-change-me".into(),
            issuer: "dicehall".into(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// Claims carried by every Dicehall token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Identity subject (external user id or guest id).
    pub sub: String,
    pub pid: ParticipantId,
    pub kind: TokenKind,
    pub jti: String,
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
    /// The session the holder joined, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<SessionId>,
}

/// A freshly issued pair. Expiry times are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: u64,
    pub refresh_expires_at: u64,
}

/// The verified holder of an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub participant_id: ParticipantId,
    pub session_id: Option<SessionId>,
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Self {
            subject: claims.sub,
            participant_id: claims.pid,
            session_id: claims.sid,
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn new_jti() -> String {
    format!("{:032x}", rand::rng().random::<u128>())
}

pub(crate) fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidSignature => AuthError::Malformed("invalid signature".into()),
        ErrorKind::InvalidIssuer => AuthError::Malformed("invalid issuer".into()),
        ErrorKind::InvalidAudience => AuthError::Malformed("invalid audience".into()),
        ErrorKind::InvalidToken | ErrorKind::Base64(_) => {
            AuthError::Malformed("invalid token format".into())
        }
        _ => AuthError::Malformed(err.to_string()),
    }
}

// ---------------------------------------------------------------------------
// TokenService
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Revocations {
    /// Revoked `jti` → its `exp`.
    revoked: HashMap<String, u64>,
    /// Live tokens per participant, so a ban can revoke all of them.
    issued: HashMap<ParticipantId, Vec<(String, u64)>>,
}

impl Revocations {
    fn prune(&mut self, now: u64) {
        self.revoked.retain(|_, exp| *exp >= now);
        self.issued.retain(|_, tokens| {
            tokens.retain(|(_, exp)| *exp >= now);
            !tokens.is_empty()
        });
    }
}

/// Issues, verifies, rotates and revokes token pairs.
pub struct TokenService {
    config: TokenConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    revocations: Mutex<Revocations>,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(config: TokenConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&config.issuer]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            config,
            revocations: Mutex::new(Revocations::default()),
        }
    }

    fn revocations(&self) -> MutexGuard<'_, Revocations> {
        self.revocations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a pair for `identity`, optionally bound to a session.
    pub fn issue_token_pair(
        &self,
        identity: &Identity,
        session: Option<SessionId>,
    ) -> Result<TokenPair, AuthError> {
        self.issue_token_pair_at(identity, session, unix_now())
    }

    /// [`issue_token_pair`](Self::issue_token_pair) with an explicit
    /// issue time in Unix seconds.
    pub fn issue_token_pair_at(
        &self,
        identity: &Identity,
        session: Option<SessionId>,
        now: u64,
    ) -> Result<TokenPair, AuthError> {
        let pid = identity.participant_id();
        let access_exp = now + self.config.access_ttl.as_secs();
        let refresh_exp = now + self.config.refresh_ttl.as_secs();

        let access = self.sign(identity, pid, TokenKind::Access, session, now, access_exp)?;
        let refresh = self.sign(identity, pid, TokenKind::Refresh, session, now, refresh_exp)?;

        let mut revocations = self.revocations();
        revocations.prune(unix_now());
        revocations
            .issued
            .entry(pid)
            .or_default()
            .extend([(access.1, access_exp), (refresh.1, refresh_exp)]);

        debug!(participant_id = %pid, ?session, "token pair issued");
        Ok(TokenPair {
            access_token: access.0,
            refresh_token: refresh.0,
            access_expires_at: access_exp,
            refresh_expires_at: refresh_exp,
        })
    }

    fn sign(
        &self,
        identity: &Identity,
        pid: ParticipantId,
        kind: TokenKind,
        sid: Option<SessionId>,
        iat: u64,
        exp: u64,
    ) -> Result<(String, String), AuthError> {
        let claims = Claims {
            sub: identity.subject.clone(),
            pid,
            kind,
            jti: new_jti(),
            iss: self.config.issuer.clone(),
            iat,
            exp,
            sid,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        Ok((token, claims.jti))
    }

    /// Decodes `token`, checks signature, expiry, kind and revocation.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims, AuthError> {
        let claims = self.decode_kind(token, expected)?;
        if self.revocations().revoked.contains_key(&claims.jti) {
            return Err(AuthError::Revoked);
        }
        Ok(claims)
    }

    /// Signature, expiry and kind; revocation is left to the caller.
    fn decode_kind(&self, token: &str, expected: TokenKind) -> Result<Claims, AuthError> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(map_jwt_error)?
            .claims;

        if claims.kind != expected {
            return Err(AuthError::WrongKind {
                expected,
                found: claims.kind,
            });
        }
        Ok(claims)
    }

    /// Verifies an access token and returns its holder.
    pub fn verify_access_token(&self, token: &str) -> Result<Principal, AuthError> {
        self.verify(token, TokenKind::Access).map(Principal::from)
    }

    /// Exchanges a refresh token for a new pair bound to the same session.
    ///
    /// The presented refresh token is revoked, so replaying it fails.
    pub fn refresh(&self, refresh_token: &str) -> Result<(Principal, TokenPair), AuthError> {
        let claims = self.decode_kind(refresh_token, TokenKind::Refresh)?;
        // Check and revoke under one lock so only one rotation can win.
        let already_revoked = self
            .revocations()
            .revoked
            .insert(claims.jti.clone(), claims.exp)
            .is_some();
        if already_revoked {
            return Err(AuthError::Revoked);
        }

        let identity = Identity::new(claims.sub.clone());
        let pair = self.issue_token_pair(&identity, claims.sid)?;
        debug!(participant_id = %claims.pid, "refresh token rotated");
        Ok((Principal::from(claims), pair))
    }

    /// Revokes `token` (either kind). Already-expired tokens are accepted
    /// and ignored.
    pub fn revoke(&self, token: &str) -> Result<(), AuthError> {
        let mut validation = self.validation.clone();
        validation.validate_exp = false;
        let claims = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(map_jwt_error)?
            .claims;
        if claims.exp >= unix_now() {
            self.revoke_claims(&claims);
        }
        Ok(())
    }

    fn revoke_claims(&self, claims: &Claims) {
        self.revocations()
            .revoked
            .insert(claims.jti.clone(), claims.exp);
    }

    /// Revokes every live token issued to `participant`. Returns how many.
    pub fn revoke_participant(&self, participant: ParticipantId) -> usize {
        let mut revocations = self.revocations();
        let tokens = revocations.issued.remove(&participant).unwrap_or_default();
        let count = tokens.len();
        revocations.revoked.extend(tokens);
        debug!(participant_id = %participant, count, "participant tokens revoked");
        count
    }
}
