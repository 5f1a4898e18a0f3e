//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conduct::ConductPolicy;
use crate::session::{Difficulty, GameConfig};

/// Turn timeout per difficulty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnTimeouts {
    pub easy: Duration,
    pub normal: Duration,
    pub hard: Duration,
}

impl Default for TurnTimeouts {
    fn default() -> Self {
        Self {
            easy: Duration::from_secs(40),
            normal: Duration::from_secs(30),
            hard: Duration::from_secs(15),
        }
    }
}

impl TurnTimeouts {
    pub fn for_difficulty(&self, difficulty: Difficulty) -> Duration {
        match difficulty {
            Difficulty::Easy => self.easy,
            Difficulty::Normal => self.normal,
            Difficulty::Hard => self.hard,
        }
    }
}

/// Server-wide engine settings. Game settings are copied from here into
/// each new session's [`GameConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub timeouts: TurnTimeouts,
    pub default_difficulty: Difficulty,
    pub turns_per_round: u32,
    pub max_rolls: u32,
    pub max_seats: u32,
    /// Most bot seats a room may be created with.
    pub max_bots: u32,
    /// Winner-queue window between rounds.
    pub restart_delay: Duration,
    /// How long a room may go without a connected human.
    pub idle_window: Duration,
    /// Missing heartbeats for this long marks a participant disconnected.
    pub presence_timeout: Duration,
    /// Pause before a bot acts, so humans can follow along.
    pub bot_move_delay: Duration,
    pub conduct: ConductPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: TurnTimeouts::default(),
            default_difficulty: Difficulty::Normal,
            turns_per_round: 3,
            max_rolls: 3,
            max_seats: 4,
            max_bots: 3,
            restart_delay: Duration::from_secs(60),
            idle_window: Duration::from_secs(300),
            presence_timeout: Duration::from_secs(45),
            bot_move_delay: Duration::from_millis(1200),
            conduct: ConductPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Clamps every field into a workable range.
    pub fn validated(mut self) -> Self {
        let min_timeout = Duration::from_secs(1);
        self.timeouts.easy = self.timeouts.easy.max(min_timeout);
        self.timeouts.normal = self.timeouts.normal.max(min_timeout);
        self.timeouts.hard = self.timeouts.hard.max(min_timeout);
        self.turns_per_round = self.turns_per_round.clamp(1, 20);
        self.max_rolls = self.max_rolls.clamp(1, 5);
        self.max_seats = self.max_seats.clamp(1, 8);
        self.max_bots = self.max_bots.min(self.max_seats.saturating_sub(1));
        self.presence_timeout = self.presence_timeout.max(Duration::from_secs(1));
        self.conduct = self.conduct.validated();
        self
    }

    /// The snapshot frozen into a new session.
    pub fn game_config(&self, difficulty: Option<Difficulty>) -> GameConfig {
        let difficulty = difficulty.unwrap_or(self.default_difficulty);
        GameConfig {
            difficulty,
            turn_timeout_ms: self.timeouts.for_difficulty(difficulty).as_millis() as u64,
            turns_per_round: self.turns_per_round,
            max_rolls: self.max_rolls,
            max_seats: self.max_seats,
        }
    }

    pub(crate) fn restart_delay_ms(&self) -> u64 {
        self.restart_delay.as_millis() as u64
    }

    pub(crate) fn idle_window_ms(&self) -> u64 {
        self.idle_window.as_millis() as u64
    }

    pub(crate) fn presence_timeout_ms(&self) -> u64 {
        self.presence_timeout.as_millis() as u64
    }
}
