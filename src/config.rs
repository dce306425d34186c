//! Runtime configuration
//!
//! Read from the environment (and a `.env` file when present).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Knobs of the matching core
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Heartbeat silence after which a waiting entry is treated as absent
    pub stale_after: Duration,
    /// Search window before a waiting user is given up on
    pub search_timeout: Duration,
    /// Delay between a session ending and its record being purged
    pub session_grace: Duration,
    /// Administrative timeout for sessions without activity
    pub session_idle_timeout: Duration,
    pub max_message_chars: usize,
    /// Bound on internal retries after a lost race
    pub max_match_attempts: usize,
    /// Default and maximum history page
    pub history_limit: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(120),
            search_timeout: Duration::from_secs(300),
            session_grace: Duration::from_secs(5),
            session_idle_timeout: Duration::from_secs(30 * 60),
            max_message_chars: 1000,
            max_match_attempts: 3,
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub sweep_interval: Duration,
    /// How often each socket is pinged; two unanswered pings drop it
    pub ping_interval: Duration,
    pub lobby: LobbyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.to_string(),
            sweep_interval: Duration::from_secs(15),
            ping_interval: Duration::from_secs(10),
            lobby: LobbyConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();
        let lobby = defaults.lobby;

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            sweep_interval: secs("SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            ping_interval: secs("PING_INTERVAL_SECS", defaults.ping_interval)?.max(Duration::from_secs(1)),
            lobby: LobbyConfig {
                stale_after: secs("STALE_AFTER_SECS", lobby.stale_after)?,
                search_timeout: secs("SEARCH_TIMEOUT_SECS", lobby.search_timeout)?,
                session_grace: secs("SESSION_GRACE_SECS", lobby.session_grace)?,
                session_idle_timeout: secs("SESSION_IDLE_TIMEOUT_SECS", lobby.session_idle_timeout)?,
                max_message_chars: parsed("MAX_MESSAGE_CHARS", lobby.max_message_chars)?,
                max_match_attempts: parsed("MAX_MATCH_ATTEMPTS", lobby.max_match_attempts)?.max(1),
                history_limit: parsed("HISTORY_LIMIT", lobby.history_limit)?,
            },
        })
    }
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(_) => Err(ConfigError::InvalidValue { key, value }),
        },
        Err(_) => Ok(default),
    }
}

fn secs(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parsed(key, default.as_secs()).map(Duration::from_secs)
}
