//! Upgrade-time header validation.
//!
//! Runs while a connection is still `Connecting`, before any frame is
//! exchanged. Kept free of HTTP types so the rules can be tested directly.

use crate::TransportError;

/// Which upgrade requests the transport accepts.
#[derive(Debug, Clone, Default)]
pub struct HandshakePolicy {
    /// Subprotocol the client must offer in `Sec-WebSocket-Protocol`.
    /// `None` accepts requests with or without a subprotocol.
    pub subprotocol: Option<String>,

    /// Allowed `Origin` values. Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl HandshakePolicy {
    /// Checks the relevant request headers.
    ///
    /// Returns the subprotocol to echo back in the response, if any.
    pub fn check(
        &self,
        offered_protocols: Option<&str>,
        origin: Option<&str>,
    ) -> Result<Option<String>, TransportError> {
        if !self.allowed_origins.is_empty() {
            let origin = origin.ok_or_else(|| {
                TransportError::HandshakeRejected("missing Origin header".into())
            })?;
            if !self.allowed_origins.iter().any(|o| o == origin) {
                return Err(TransportError::HandshakeRejected(format!(
                    "origin {origin} not allowed"
                )));
            }
        }

        let Some(required) = &self.subprotocol else {
            return Ok(None);
        };

        let offered = offered_protocols.unwrap_or("");
        if offered.split(',').map(str::trim).any(|p| p == required) {
            Ok(Some(required.clone()))
        } else {
            Err(TransportError::HandshakeRejected(format!(
                "subprotocol {required} not offered"
            )))
        }
    }
}
