//! Server configuration.
//!
//! [`ServerConfig::default`] is what tests and embedders start from;
//! the binary reads overrides from `DICEHALL_*` environment variables with
//! [`ServerConfig::from_env`]. A variable that is set but does not parse is
//! logged and ignored.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use dicehall_addon::{AddonConfig, BLOCK_RELATIONSHIP, CHAT_CONDUCT, FilterPolicy, SENDER_RESTRICTION};
use dicehall_auth::{AdminRole, TokenConfig};
use dicehall_engine::EngineConfig;
use dicehall_store::SyncConfig;
use dicehall_timer::TimerConfig;
use dicehall_transport::HandshakePolicy;
use tracing::warn;

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub handshake: HandshakePolicy,
    pub tokens: TokenConfig,
    /// Secret for external identity assertions. `None` accepts only guests
    /// and accounts in the legacy lookup.
    pub identity_secret: Option<String>,
    pub identity_issuer: Option<String>,
    /// How long a resolved identity assertion is cached.
    pub claims_cache_ttl: Duration,
    pub engine: EngineConfig,
    pub addons: AddonConfig,
    pub store: SyncConfig,
    pub timers: TimerConfig,
    /// Room codes served as public rooms. Any other code creates a private
    /// room.
    pub public_rooms: Vec<String>,
    /// Seeded admin role records.
    pub admins: Vec<(String, AdminRole)>,
    /// A connection with no inbound frame for this long is dropped.
    pub receive_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Command queue depth per session actor.
    pub channel_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            handshake: HandshakePolicy::default(),
            tokens: TokenConfig::default(),
            identity_secret: None,
            identity_issuer: None,
            claims_cache_ttl: Duration::from_secs(300),
            engine: EngineConfig::default(),
            addons: AddonConfig::default(),
            store: SyncConfig::default(),
            timers: TimerConfig::default(),
            public_rooms: vec!["lobby".to_string()],
            admins: Vec::new(),
            receive_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(5),
            channel_size: 64,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `DICEHALL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `DICEHALL_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let vars = Vars(&lookup);
        let mut config = Self::default();

        vars.set("DICEHALL_BIND", &mut config.bind);
        if let Some(protocol) = vars.get("DICEHALL_SUBPROTOCOL") {
            config.handshake.subprotocol = Some(protocol);
        }
        if let Some(origins) = vars.get("DICEHALL_ALLOWED_ORIGINS") {
            config.handshake.allowed_origins = split_list(&origins);
        }

        vars.set("DICEHALL_TOKEN_SECRET", &mut config.tokens.secret);
        vars.set("DICEHALL_TOKEN_ISSUER", &mut config.tokens.issuer);
        vars.secs("DICEHALL_ACCESS_TTL_SECS", &mut config.tokens.access_ttl);
        vars.secs("DICEHALL_REFRESH_TTL_SECS", &mut config.tokens.refresh_ttl);
        vars.secs("DICEHALL_CLAIMS_CACHE_SECS", &mut config.claims_cache_ttl);
        config.identity_secret = vars.get("DICEHALL_IDENTITY_SECRET");
        config.identity_issuer = vars.get("DICEHALL_IDENTITY_ISSUER");

        let engine = &mut config.engine;
        vars.secs("DICEHALL_TIMEOUT_EASY_SECS", &mut engine.timeouts.easy);
        vars.secs("DICEHALL_TIMEOUT_NORMAL_SECS", &mut engine.timeouts.normal);
        vars.secs("DICEHALL_TIMEOUT_HARD_SECS", &mut engine.timeouts.hard);
        vars.secs("DICEHALL_IDLE_WINDOW_SECS", &mut engine.idle_window);
        vars.secs("DICEHALL_PRESENCE_TIMEOUT_SECS", &mut engine.presence_timeout);
        vars.secs("DICEHALL_RESTART_DELAY_SECS", &mut engine.restart_delay);
        vars.set("DICEHALL_MAX_SEATS", &mut engine.max_seats);
        vars.set("DICEHALL_MAX_BOTS", &mut engine.max_bots);
        vars.set("DICEHALL_TURNS_PER_ROUND", &mut engine.turns_per_round);
        vars.set("DICEHALL_MAX_ROLLS", &mut engine.max_rolls);
        vars.set("DICEHALL_CHAT_STRIKE_LIMIT", &mut engine.conduct.strike_limit);
        vars.secs("DICEHALL_CHAT_STRIKE_WINDOW_SECS", &mut engine.conduct.strike_window);
        vars.secs("DICEHALL_CHAT_MUTE_SECS", &mut engine.conduct.mute_duration);
        if let Some(limit) = vars.parsed::<u32>("DICEHALL_CHAT_AUTO_BAN") {
            engine.conduct.auto_ban_after = Some(limit);
        }
        config.engine = config.engine.validated();

        if let Some(rooms) = vars.get("DICEHALL_PUBLIC_ROOMS") {
            config.public_rooms = split_list(&rooms)
                .iter()
                .map(|code| normalize_code(code))
                .collect();
        }
        if let Some(admins) = vars.get("DICEHALL_ADMINS") {
            config.admins = parse_admins(&admins);
        }

        let addons = &mut config.addons;
        vars.filter_policy(CHAT_CONDUCT, &mut addons.chat_conduct);
        vars.filter_policy(SENDER_RESTRICTION, &mut addons.sender_restriction);
        vars.filter_policy(BLOCK_RELATIONSHIP, &mut addons.block_relationship);
        if let Some(words) = vars.get("DICEHALL_CHAT_DENY_LIST") {
            addons.deny_list = split_list(&words);
        }

        vars.set("DICEHALL_STORE_MAX_ATTEMPTS", &mut config.store.retry.max_attempts);
        vars.millis("DICEHALL_STORE_BASE_DELAY_MS", &mut config.store.retry.base_delay);
        vars.millis("DICEHALL_STORE_COALESCE_MS", &mut config.store.coalesce_window);
        config.store.retry.max_attempts = config.store.retry.max_attempts.max(1);

        vars.secs("DICEHALL_RECEIVE_TIMEOUT_SECS", &mut config.receive_timeout);
        config.receive_timeout = config.receive_timeout.max(Duration::from_secs(1));

        config
    }
}

/// Room codes are case-insensitive.
pub(crate) fn normalize_code(code: &str) -> String {
    code.trim().to_lowercase()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `alice=owner,bob=viewer`
fn parse_admins(raw: &str) -> Vec<(String, AdminRole)> {
    split_list(raw)
        .into_iter()
        .filter_map(|entry| {
            let Some((subject, role)) = entry.split_once('=') else {
                warn!(%entry, "ignoring admin entry without a role");
                return None;
            };
            match role.parse::<AdminRole>() {
                Ok(role) => Some((subject.trim().to_string(), role)),
                Err(e) => {
                    warn!(%entry, error = %e, "ignoring admin entry");
                    None
                }
            }
        })
        .collect()
}

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.get(key)?;
        match raw.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, value = %raw, error = %e, "invalid config value, using default");
                None
            }
        }
    }

    fn set<T>(&self, key: &str, target: &mut T)
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.parsed(key) {
            *target = value;
        }
    }

    fn secs(&self, key: &str, target: &mut Duration) {
        if let Some(secs) = self.parsed::<u64>(key) {
            *target = Duration::from_secs(secs);
        }
    }

    fn millis(&self, key: &str, target: &mut Duration) {
        if let Some(ms) = self.parsed::<u64>(key) {
            *target = Duration::from_millis(ms);
        }
    }

    /// `DICEHALL_ADDON_<ID>_ENABLED`, `_TIMEOUT_MS`, `_ON_ERROR`.
    fn filter_policy(&self, id: &str, policy: &mut FilterPolicy) {
        let prefix = format!("DICEHALL_ADDON_{}", id.to_uppercase().replace('-', "_"));
        self.set(&format!("{prefix}_ENABLED"), &mut policy.enabled);
        self.millis(&format!("{prefix}_TIMEOUT_MS"), &mut policy.timeout);
        self.set(&format!("{prefix}_ON_ERROR"), &mut policy.on_error);
        *policy = policy.clone().validated();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use dicehall_addon::OnError;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_from_lookup_empty_uses_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.bind, "127.0.0.1:8080");
        assert_eq!(config.engine.timeouts.normal, Duration::from_secs(30));
        assert_eq!(config.public_rooms, ["lobby"]);
    }

    #[test]
    fn test_from_lookup_reads_overrides() {
        let config = config_from(&[
            ("DICEHALL_BIND", "0.0.0.0:9000"),
            ("DICEHALL_TIMEOUT_NORMAL_SECS", "20"),
            ("DICEHALL_PUBLIC_ROOMS", "Lobby, Casual ,"),
            ("DICEHALL_CHAT_AUTO_BAN", "5"),
            ("DICEHALL_ADDON_CHAT_CONDUCT_ON_ERROR", "block"),
            ("DICEHALL_ADDON_BLOCK_RELATIONSHIP_ENABLED", "false"),
            ("DICEHALL_ADMINS", "alice=owner,bob=viewer"),
        ]);
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.engine.timeouts.normal, Duration::from_secs(20));
        assert_eq!(config.public_rooms, ["lobby", "casual"]);
        assert_eq!(config.engine.conduct.auto_ban_after, Some(5));
        assert_eq!(config.addons.chat_conduct.on_error, OnError::Block);
        assert!(!config.addons.block_relationship.enabled);
        assert_eq!(
            config.admins,
            [("alice".to_string(), AdminRole::Owner), ("bob".to_string(), AdminRole::Viewer)]
        );
    }

    #[test]
    fn test_from_lookup_invalid_value_keeps_default() {
        let config = config_from(&[
            ("DICEHALL_MAX_SEATS", "many"),
            ("DICEHALL_ADMINS", "carol=emperor"),
        ]);
        assert_eq!(config.engine.max_seats, EngineConfig::default().max_seats);
        assert!(config.admins.is_empty());
    }
}
