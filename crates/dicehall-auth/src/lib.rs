//! Authentication and authorization for Dicehall.
//!
//! 1. **Identity**: who a client is, from an external assertion
//!    ([`IdentityResolver`], [`IdentityVerifier`]).
//! 2. **Tokens**: the access/refresh pair the server issues on join and
//!    verifies on every request ([`TokenService`]).
//! 3. **Admin roles**: `viewer < operator < owner` ([`AdminDirectory`]).
//!
//! ```text
//! Services (above)  ← verify tokens per request, gate admin operations
//!     ↕
//! Auth (this crate)
//!     ↕
//! Protocol (below)  ← ParticipantId, SessionId
//! ```

mod admin;
mod error;
mod identity;
mod token;

pub use admin::{AdminDirectory, AdminRole};
pub use error::AuthError;
pub use identity::{Identity, IdentityResolver, IdentityVerifier, JwtAssertionVerifier, LegacyLookup};
pub use token::{Claims, Principal, TokenConfig, TokenKind, TokenPair, TokenService};
