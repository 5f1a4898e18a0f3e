//! External identity verification.
//!
//! Clients joining a room present an identity assertion issued by an
//! external provider. The [`IdentityResolver`] checks it with a primary
//! [`IdentityVerifier`] (a provider-signed JWT), falls back to a legacy
//! lookup for accounts that predate the provider, and caches successful
//! results for a short TTL so repeated joins do not re-verify.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dicehall_protocol::ParticipantId;
use futures_util::future::BoxFuture;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::AuthError;
use crate::token::{map_jwt_error, unix_now};

/// Who a client is, as established by an identity assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Unix seconds at which the assertion behind this identity lapses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            display_name: None,
            expires_at: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// A throwaway identity for clients that join without an assertion.
    pub fn guest() -> Self {
        Self::new(format!("guest:{:016x}", rand::rng().random::<u64>()))
    }

    pub fn is_guest(&self) -> bool {
        self.subject.starts_with("guest:")
    }

    /// Stable participant id derived from the subject.
    ///
    /// The same subject always maps to the same seat identity, across
    /// reconnects and server replicas.
    pub fn participant_id(&self) -> ParticipantId {
        let mut hasher = Sha256::new();
        hasher.update(b"dicehall-participant:");
        hasher.update(self.subject.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 8];
        id.copy_from_slice(&hash[..8]);
        ParticipantId(u64::from_be_bytes(id))
    }
}

/// Verifies an identity assertion.
///
/// Object-safe so verifiers can be stacked as `Arc<dyn IdentityVerifier>`.
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn verify<'a>(&'a self, assertion: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>>;
}

// ---------------------------------------------------------------------------
// JWT assertions from an external provider
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AssertionClaims {
    sub: String,
    #[serde(default)]
    name: Option<String>,
    exp: u64,
}

/// Accepts HS256 JWTs signed by the identity provider.
pub struct JwtAssertionVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAssertionVerifier {
    /// `issuer`, when given, must match the assertion's `iss` claim.
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation.validate_aud = false;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    fn verify_sync(&self, assertion: &str) -> Result<Identity, AuthError> {
        let claims = decode::<AssertionClaims>(assertion, &self.decoding, &self.validation)
            .map_err(map_jwt_error)?
            .claims;
        if claims.sub.is_empty() {
            return Err(AuthError::Malformed("missing required claim: sub".into()));
        }
        Ok(Identity {
            subject: claims.sub,
            display_name: claims.name,
            expires_at: Some(claims.exp),
        })
    }
}

impl IdentityVerifier for JwtAssertionVerifier {
    fn name(&self) -> &'static str {
        "jwt"
    }

    fn verify<'a>(&'a self, assertion: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>> {
        Box::pin(async move { self.verify_sync(assertion) })
    }
}

// ---------------------------------------------------------------------------
// Legacy lookup
// ---------------------------------------------------------------------------

/// Static table of legacy account keys.
#[derive(Debug, Default)]
pub struct LegacyLookup {
    accounts: HashMap<String, Identity>,
}

impl LegacyLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, key: impl Into<String>, identity: Identity) -> Self {
        self.accounts.insert(key.into(), identity);
        self
    }
}

impl IdentityVerifier for LegacyLookup {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn verify<'a>(&'a self, assertion: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>> {
        Box::pin(async move {
            self.accounts
                .get(assertion)
                .cloned()
                .ok_or_else(|| AuthError::IdentityRejected("unknown legacy account".into()))
        })
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

const MAX_CACHED: usize = 10_000;

type CacheKey = [u8; 32];

fn cache_key(assertion: &str) -> CacheKey {
    Sha256::digest(assertion.as_bytes()).into()
}

/// Primary verifier, optional fallback, TTL cache in front of both.
pub struct IdentityResolver {
    primary: Arc<dyn IdentityVerifier>,
    fallback: Option<Arc<dyn IdentityVerifier>>,
    ttl: Duration,
    cache: Mutex<HashMap<CacheKey, (Identity, Instant)>>,
}

impl IdentityResolver {
    pub fn new(primary: Arc<dyn IdentityVerifier>, ttl: Duration) -> Self {
        Self {
            primary,
            fallback: None,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn IdentityVerifier>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<CacheKey, (Identity, Instant)>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves `assertion` to an identity.
    ///
    /// # Errors
    /// The primary verifier's error when neither verifier accepts it.
    pub async fn resolve(&self, assertion: &str) -> Result<Identity, AuthError> {
        let key = cache_key(assertion);
        let now = Instant::now();
        if let Some((identity, expires)) = self.cache().get(&key) {
            if *expires > now {
                debug!(subject = %identity.subject, "identity cache hit");
                return Ok(identity.clone());
            }
        }

        let identity = match self.primary.verify(assertion).await {
            Ok(identity) => identity,
            Err(primary_err) => {
                let Some(fallback) = &self.fallback else {
                    return Err(primary_err);
                };
                match fallback.verify(assertion).await {
                    Ok(identity) => {
                        debug!(
                            verifier = fallback.name(),
                            subject = %identity.subject,
                            "identity resolved by fallback"
                        );
                        identity
                    }
                    Err(fallback_err) => {
                        warn!(
                            primary = self.primary.name(),
                            fallback = fallback.name(),
                            error = %primary_err,
                            fallback_error = %fallback_err,
                            "identity assertion rejected"
                        );
                        return Err(primary_err);
                    }
                }
            }
        };

        let mut cache = self.cache();
        if cache.len() >= MAX_CACHED {
            cache.retain(|_, (_, expires)| *expires > now);
            if cache.len() >= MAX_CACHED {
                cache.clear();
            }
        }
        cache.insert(key, (identity.clone(), Instant::now() + self.cache_ttl(&identity)));
        Ok(identity)
    }

    /// The configured TTL, cut short by the assertion's own expiry.
    fn cache_ttl(&self, identity: &Identity) -> Duration {
        match identity.expires_at {
            Some(exp) => self.ttl.min(Duration::from_secs(exp.saturating_sub(unix_now()))),
            None => self.ttl,
        }
    }

    /// Drops a cached result.
    pub fn invalidate(&self, assertion: &str) {
        self.cache().remove(&cache_key(assertion));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_stable_for_subject() {
        let a = Identity::new("user-1").participant_id();
        let b = Identity::new("user-1").with_display_name("Ana").participant_id();
        assert_eq!(a, b);
        assert_ne!(a, Identity::new("user-2").participant_id());
    }

    #[test]
    fn test_guest_identities_are_distinct() {
        let a = Identity::guest();
        let b = Identity::guest();
        assert!(a.is_guest());
        assert_ne!(a.subject, b.subject);
    }

    #[tokio::test]
    async fn test_legacy_lookup_unknown_key_rejected() {
        let legacy = LegacyLookup::new().with_account("k1", Identity::new("old-user"));
        assert_eq!(legacy.verify("k1").await.unwrap().subject, "old-user");
        assert!(matches!(
            legacy.verify("k2").await,
            Err(AuthError::IdentityRejected(_))
        ));
    }
}
