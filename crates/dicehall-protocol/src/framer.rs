//! Outbound frame numbering.

use std::time::Instant;

use crate::{Envelope, Payload, SystemMessage};

/// Stamps outbound envelopes for one connection.
///
/// Owns the connection's sequence counter and start instant so every frame
/// carries a monotonically increasing `seq` and a connection-relative
/// `timestamp`.
#[derive(Debug)]
pub struct Framer {
    next_seq: u64,
    started: Instant,
}

impl Framer {
    /// Starts numbering at zero from now.
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            started: Instant::now(),
        }
    }

    /// Milliseconds since this connection started.
    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Wraps `payload` in the next envelope.
    pub fn frame(&mut self, payload: Payload) -> Envelope {
        let seq = self.next_seq;
        self.next_seq += 1;
        Envelope {
            seq,
            timestamp: self.elapsed_ms(),
            payload,
        }
    }

    /// Shorthand for framing a system message.
    pub fn system(&mut self, msg: SystemMessage) -> Envelope {
        self.frame(Payload::System(msg))
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sequence_is_monotonic() {
        let mut framer = Framer::new();
        let a = framer.system(SystemMessage::Disconnect { reason: "x".into() });
        let b = framer.frame(Payload::Game(vec![]));
        let c = framer.frame(Payload::Game(vec![]));
        assert_eq!((a.seq, b.seq, c.seq), (0, 1, 2));
        assert!(c.timestamp >= a.timestamp);
    }
}
