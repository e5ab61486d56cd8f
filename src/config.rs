use crate::game::RoundPlan;
use log::LevelFilter;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

// ── Constants ───────────────────────────────────────────────────────────────

/// Default TCP port for hosted whist sessions.
pub const DEFAULT_PORT: u16 = 17501;

/// Fewest players (host included) that can play a game.
pub const MIN_PLAYERS: usize = 3;

/// Most players a session will seat.
pub const DEFAULT_MAX_PLAYERS: usize = 4;

const DEFAULT_SESSION_NAME: &str = "Contract Whist";

// ── ConfigError ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{var}: {reason}")]
    OutOfRange { var: &'static str, reason: String },
}

// ── HostConfig ──────────────────────────────────────────────────────────────

/// Everything the host needs to know before it opens a session.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub session_name: String,
    pub bind_addr: IpAddr,
    pub tcp_port: u16,
    pub max_players: usize,
    /// Simulated players seated alongside the host in loopback mode.
    pub computer_players: usize,
    pub round_plan: RoundPlan,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub log_dir: PathBuf,
    pub log_level: LevelFilter,
    /// Snapshot of the game in flight, read back after a crash.
    pub recovery_file: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            session_name: DEFAULT_SESSION_NAME.to_string(),
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            tcp_port: DEFAULT_PORT,
            max_players: DEFAULT_MAX_PLAYERS,
            computer_players: 2,
            round_plan: RoundPlan::default(),
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(6),
            log_dir: PathBuf::from("logs"),
            log_level: LevelFilter::Info,
            recovery_file: PathBuf::from("whist-recovery.bin"),
        }
    }
}

impl HostConfig {
    /// Build a config from `WHIST_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("WHIST_SESSION_NAME") {
            config.session_name = name;
        }
        if let Some(v) = lookup("WHIST_BIND") {
            config.bind_addr = parse("WHIST_BIND", &v)?;
        }
        if let Some(v) = lookup("WHIST_PORT") {
            config.tcp_port = parse("WHIST_PORT", &v)?;
        }
        if let Some(v) = lookup("WHIST_MAX_PLAYERS") {
            config.max_players = parse("WHIST_MAX_PLAYERS", &v)?;
        }
        if let Some(v) = lookup("WHIST_COMPUTER_PLAYERS") {
            config.computer_players = parse("WHIST_COMPUTER_PLAYERS", &v)?;
        }
        if let Some(v) = lookup("WHIST_CARDS") {
            let (start, end) = v.split_once('-').ok_or_else(|| ConfigError::Invalid {
                var: "WHIST_CARDS",
                value: v.clone(),
            })?;
            config.round_plan.start_cards = parse("WHIST_CARDS", start.trim())?;
            config.round_plan.end_cards = parse("WHIST_CARDS", end.trim())?;
        }
        if let Some(v) = lookup("WHIST_BOUNCE") {
            config.round_plan.bounce = parse("WHIST_BOUNCE", &v)?;
        }
        if let Some(dir) = lookup("WHIST_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("WHIST_LOG") {
            config.log_level = parse("WHIST_LOG", &v)?;
        }
        if let Some(path) = lookup("WHIST_RECOVERY_FILE") {
            config.recovery_file = PathBuf::from(path);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_players < MIN_PLAYERS {
            return Err(ConfigError::OutOfRange {
                var: "WHIST_MAX_PLAYERS",
                reason: format!("must be at least {MIN_PLAYERS}"),
            });
        }
        if self.computer_players + 1 > self.max_players {
            return Err(ConfigError::OutOfRange {
                var: "WHIST_COMPUTER_PLAYERS",
                reason: format!("host plus {} exceeds {}", self.computer_players, self.max_players),
            });
        }
        let most_cards = self.round_plan.start_cards.max(self.round_plan.end_cards);
        if most_cards == 0 || most_cards * self.max_players > 52 {
            return Err(ConfigError::OutOfRange {
                var: "WHIST_CARDS",
                reason: format!("{most_cards} cards cannot be dealt to {} players", self.max_players),
            });
        }
        if self.round_plan.start_cards.min(self.round_plan.end_cards) == 0 {
            return Err(ConfigError::OutOfRange {
                var: "WHIST_CARDS",
                reason: "every round needs at least one card".into(),
            });
        }
        Ok(())
    }

    /// Players expected at the table in loopback (computer-assisted) mode.
    pub fn loopback_players(&self) -> usize {
        self.computer_players + 1
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = HostConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.tcp_port, DEFAULT_PORT);
        assert_eq!(config.max_players, DEFAULT_MAX_PLAYERS);
        assert_eq!(config.loopback_players(), 3);
        assert_eq!(config.log_level, LevelFilter::Info);
    }

    #[test]
    fn test_overrides_from_env() {
        let config = HostConfig::from_lookup(lookup_from(&[
            ("WHIST_PORT", "18000"),
            ("WHIST_MAX_PLAYERS", "4"),
            ("WHIST_CARDS", "7-1"),
            ("WHIST_BOUNCE", "true"),
            ("WHIST_LOG", "debug"),
            ("WHIST_RECOVERY_FILE", "/tmp/whist/game.bin"),
        ]))
        .unwrap();
        assert_eq!(config.tcp_port, 18000);
        assert_eq!(config.max_players, 4);
        assert_eq!(config.round_plan.start_cards, 7);
        assert_eq!(config.round_plan.end_cards, 1);
        assert!(config.round_plan.bounce);
        assert_eq!(config.log_level, LevelFilter::Debug);
        assert_eq!(config.recovery_file, PathBuf::from("/tmp/whist/game.bin"));
    }

    #[test]
    fn test_bad_port_is_rejected() {
        let err = HostConfig::from_lookup(lookup_from(&[("WHIST_PORT", "high")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WHIST_PORT", .. }));
    }

    #[test]
    fn test_too_many_cards_for_table() {
        let err = HostConfig::from_lookup(lookup_from(&[
            ("WHIST_MAX_PLAYERS", "6"),
            ("WHIST_CARDS", "13-1"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { var: "WHIST_CARDS", .. }));
    }

    #[test]
    fn test_max_players_below_minimum() {
        let err = HostConfig::from_lookup(lookup_from(&[("WHIST_MAX_PLAYERS", "2")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }
}
