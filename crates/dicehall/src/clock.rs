//! Wall-clock milliseconds anchored to Tokio time.
//!
//! Engines work in epoch milliseconds; actors schedule with
//! [`tokio::time::Instant`]. A [`Clock`] maps between the two from one
//! anchor, so a paused Tokio clock in tests also freezes session time.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_ms: u64,
}

impl Clock {
    /// Anchors at the current system time.
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        Self::starting_at(origin_ms)
    }

    /// Anchors "now" at `origin_ms`.
    pub fn starting_at(origin_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            origin_ms,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }

    /// The Tokio instant at which [`now_ms`](Self::now_ms) reaches `ms`.
    pub fn instant_at(&self, ms: u64) -> Instant {
        self.origin + Duration::from_millis(ms.saturating_sub(self.origin_ms))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_ms_follows_paused_time() {
        let clock = Clock::starting_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 1_250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_at_round_trips_with_now_ms() {
        let clock = Clock::starting_at(5_000);
        let at = clock.instant_at(35_000);
        tokio::time::sleep_until(at).await;
        assert_eq!(clock.now_ms(), 35_000);
        // Past times clamp to the anchor.
        assert!(clock.instant_at(10) <= Instant::now());
    }
}
