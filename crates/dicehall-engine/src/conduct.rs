//! Strike tracking, mutes and bans.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use dicehall_protocol::ParticipantId;
use serde::{Deserialize, Serialize};

/// Conduct thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductPolicy {
    /// Strikes inside `strike_window` that trigger a mute.
    pub strike_limit: u32,
    pub strike_window: Duration,
    pub mute_duration: Duration,
    /// Lifetime strikes that trigger a ban. `None` never bans automatically.
    pub auto_ban_after: Option<u32>,
}

impl Default for ConductPolicy {
    fn default() -> Self {
        Self {
            strike_limit: 3,
            strike_window: Duration::from_secs(600),
            mute_duration: Duration::from_secs(300),
            auto_ban_after: None,
        }
    }
}

impl ConductPolicy {
    pub fn validated(mut self) -> Self {
        self.strike_limit = self.strike_limit.max(1);
        self.strike_window = self.strike_window.max(Duration::from_secs(1));
        self.auto_ban_after = self.auto_ban_after.map(|n| n.max(self.strike_limit));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductRecord {
    /// Strike timestamps still inside the window, oldest first.
    pub recent: VecDeque<u64>,
    pub total: u32,
    pub muted_until: Option<u64>,
    pub banned: bool,
}

impl ConductRecord {
    pub fn is_muted(&self, now: u64) -> bool {
        self.muted_until.is_some_and(|until| now < until)
    }
}

/// What a strike led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrikeOutcome {
    Recorded { strikes: u32 },
    Muted { until: u64 },
    /// Supersedes any mute the same strike produced.
    Banned,
}

/// Per-participant conduct for one session. Survives the participant
/// leaving, so a rejoin does not wipe a mute or ban.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductState {
    records: BTreeMap<ParticipantId, ConductRecord>,
}

impl ConductState {
    pub fn record(&self, id: ParticipantId) -> Option<&ConductRecord> {
        self.records.get(&id)
    }

    /// Records a strike at `now`.
    ///
    /// The mute threshold is evaluated first, then the ban threshold; when
    /// both trip, the participant ends up banned with the mute on record.
    pub fn record_strike(&mut self, id: ParticipantId, now: u64, policy: &ConductPolicy) -> StrikeOutcome {
        let window_ms = policy.strike_window.as_millis() as u64;
        let record = self.records.entry(id).or_default();
        while record
            .recent
            .front()
            .is_some_and(|&at| now.saturating_sub(at) >= window_ms)
        {
            record.recent.pop_front();
        }
        record.recent.push_back(now);
        record.total += 1;

        let mut outcome = StrikeOutcome::Recorded {
            strikes: record.recent.len() as u32,
        };
        if record.recent.len() as u32 >= policy.strike_limit {
            let until = now + policy.mute_duration.as_millis() as u64;
            record.muted_until = Some(until);
            record.recent.clear();
            outcome = StrikeOutcome::Muted { until };
        }
        if policy.auto_ban_after.is_some_and(|limit| record.total >= limit) {
            record.banned = true;
            outcome = StrikeOutcome::Banned;
        }
        outcome
    }

    pub fn is_muted(&self, id: ParticipantId, now: u64) -> bool {
        self.records.get(&id).is_some_and(|r| r.is_muted(now))
    }

    pub fn is_banned(&self, id: ParticipantId) -> bool {
        self.records.get(&id).is_some_and(|r| r.banned)
    }

    /// Forgets every strike, mute and ban for `id`.
    pub fn clear(&mut self, id: ParticipantId) -> bool {
        self.records.remove(&id).is_some()
    }
}
