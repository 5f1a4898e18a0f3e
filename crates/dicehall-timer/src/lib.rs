//! Cancellable deadline scheduling for Dicehall session actors.
//!
//! Each session actor owns one [`DeadlineScheduler`] holding at most one
//! deadline per timer kind (turn timeout, restart delay, idle expiry, ...).
//! Scheduling a kind again replaces its deadline; cancelling removes it.
//! That keeps superseded timers from ever firing: a turn that ends early
//! simply reschedules or cancels its kind.
//!
//! # Integration
//!
//! The scheduler sits inside a session actor's `tokio::select!` loop:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         Some(cmd) = cmd_rx.recv() => { /* handle command */ }
//!         fired = timers.wait_next() => { /* handle fired.kind */ }
//!     }
//! }
//! ```
//!
//! With nothing scheduled, [`DeadlineScheduler::wait_next`] pends forever,
//! so the `select!` just keeps serving commands.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;
use tokio::time::{self, Instant};
use tracing::{trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    /// A deadline that fires later than this is logged as an overrun.
    pub late_warn_threshold: Duration,
    /// Random jitter (0–max) added by [`DeadlineScheduler::schedule_jittered`]
    /// so sessions created together do not wake together.
    pub max_jitter: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            late_warn_threshold: Duration::from_millis(250),
            max_jitter: Duration::from_millis(200),
        }
    }
}

/// A deadline that has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired<K> {
    /// Which timer fired.
    pub kind: K,
    /// When it was due.
    pub due: Instant,
    /// How late the wake-up was.
    pub late_by: Duration,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// One deadline per timer kind, fired earliest-first.
///
/// `K` is usually a small `Copy` enum. Ties between equal deadlines fire in
/// `K`'s `Ord` order.
#[derive(Debug)]
pub struct DeadlineScheduler<K> {
    config: TimerConfig,
    deadlines: BTreeMap<K, Instant>,
}

impl<K> DeadlineScheduler<K>
where
    K: Copy + Ord + Debug,
{
    /// Creates an empty scheduler.
    pub fn new(config: TimerConfig) -> Self {
        Self {
            config,
            deadlines: BTreeMap::new(),
        }
    }

    /// Schedules `kind` at `at`, replacing any existing deadline.
    ///
    /// Returns the replaced deadline, if any.
    pub fn schedule(&mut self, kind: K, at: Instant) -> Option<Instant> {
        let previous = self.deadlines.insert(kind, at);
        trace!(?kind, replaced = previous.is_some(), "deadline scheduled");
        previous
    }

    /// Schedules `kind` to fire `after` from now.
    pub fn schedule_in(&mut self, kind: K, after: Duration) -> Option<Instant> {
        self.schedule(kind, Instant::now() + after)
    }

    /// Like [`schedule_in`](Self::schedule_in) with random jitter added.
    pub fn schedule_jittered(&mut self, kind: K, after: Duration) -> Option<Instant> {
        let max = self.config.max_jitter.as_micros() as u64;
        let jitter = if max > 0 {
            Duration::from_micros(rand::rng().random_range(0..max))
        } else {
            Duration::ZERO
        };
        self.schedule_in(kind, after + jitter)
    }

    /// Keeps `kind` scheduled at `at` if it is `Some`, cancels it otherwise.
    ///
    /// Leaves an identical existing deadline untouched.
    pub fn sync(&mut self, kind: K, at: Option<Instant>) {
        match at {
            Some(at) if self.deadlines.get(&kind) == Some(&at) => {}
            Some(at) => {
                self.schedule(kind, at);
            }
            None => {
                self.cancel(kind);
            }
        }
    }

    /// Cancels `kind`. Returns `true` if a deadline was removed.
    pub fn cancel(&mut self, kind: K) -> bool {
        let removed = self.deadlines.remove(&kind).is_some();
        if removed {
            trace!(?kind, "deadline cancelled");
        }
        removed
    }

    /// Cancels everything.
    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    /// The current deadline for `kind`.
    pub fn deadline(&self, kind: K) -> Option<Instant> {
        self.deadlines.get(&kind).copied()
    }

    /// Whether `kind` is scheduled.
    pub fn is_scheduled(&self, kind: K) -> bool {
        self.deadlines.contains_key(&kind)
    }

    /// Number of scheduled deadlines.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    fn earliest(&self) -> Option<(K, Instant)> {
        self.deadlines
            .iter()
            .min_by_key(|(kind, at)| (**at, **kind))
            .map(|(kind, at)| (*kind, *at))
    }

    /// Waits for the earliest deadline and removes it.
    ///
    /// Cancel-safe: if the future is dropped before completing (another
    /// `select!` branch won), the deadline stays scheduled.
    pub async fn wait_next(&mut self) -> Fired<K> {
        let Some((kind, due)) = self.earliest() else {
            return std::future::pending().await;
        };

        time::sleep_until(due).await;

        self.deadlines.remove(&kind);
        let late_by = Instant::now().saturating_duration_since(due);
        if late_by > self.config.late_warn_threshold {
            warn!(
                ?kind,
                late_ms = late_by.as_secs_f64() * 1000.0,
                "deadline fired late"
            );
        } else {
            trace!(?kind, "deadline fired");
        }

        Fired { kind, due, late_by }
    }
}

impl<K: Copy + Ord + Debug> Default for DeadlineScheduler<K> {
    fn default() -> Self {
        Self::new(TimerConfig::default())
    }
}
