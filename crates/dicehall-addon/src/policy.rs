//! Per-filter policy: whether it runs, how long it may take, and what a
//! failure means.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What a filter failure (timeout or internal error) resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Fail open: the gated action proceeds.
    #[default]
    Noop,
    /// Fail closed: the gated action is rejected.
    Block,
}

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop => f.write_str("noop"),
            Self::Block => f.write_str("block"),
        }
    }
}

impl FromStr for OnError {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "noop" => Ok(Self::Noop),
            "block" => Ok(Self::Block),
            other => Err(format!("unknown on_error mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPolicy {
    pub enabled: bool,
    pub timeout: Duration,
    pub on_error: OnError,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_millis(250),
            on_error: OnError::Noop,
        }
    }
}

impl FilterPolicy {
    /// Clamps the timeout into 1ms–10s.
    pub fn validated(mut self) -> Self {
        self.timeout = self
            .timeout
            .clamp(Duration::from_millis(1), Duration::from_secs(10));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_fails_open() {
        let policy = FilterPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.on_error, OnError::Noop);
    }

    #[test]
    fn test_on_error_from_str() {
        assert_eq!("BLOCK".parse::<OnError>(), Ok(OnError::Block));
        assert_eq!(" noop ".parse::<OnError>(), Ok(OnError::Noop));
        assert!("maybe".parse::<OnError>().is_err());
    }

    #[test]
    fn test_validated_clamps_zero_timeout() {
        let policy = FilterPolicy {
            timeout: Duration::ZERO,
            ..FilterPolicy::default()
        }
        .validated();
        assert_eq!(policy.timeout, Duration::from_millis(1));
    }
}
