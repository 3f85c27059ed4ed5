//! Server configuration parsed from environment variables.
//!
//! Every knob has a default except `DATABASE_URL`, whose absence switches
//! the server to the in-memory message store.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_PRESENCE_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 2000;
pub const DEFAULT_CLIENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
    #[error("PRESENCE_TIMEOUT_SECS ({timeout}) must be >= HEARTBEAT_INTERVAL_SECS ({interval})")]
    TimeoutBelowInterval { timeout: u64, interval: u64 },
}

/// Chat behavior knobs shared with every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatConfig {
    pub heartbeat_interval: Duration,
    pub presence_timeout: Duration,
    pub max_message_len: usize,
    pub client_queue_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            presence_timeout: Duration::from_secs(DEFAULT_PRESENCE_TIMEOUT_SECS),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub cors_origin: Option<String>,
    pub static_dir: Option<PathBuf>,
    pub chat: ChatConfig,
}

impl ServerConfig {
    /// Build typed server config from environment variables.
    ///
    /// Optional:
    /// - `PORT`: default 5000
    /// - `DATABASE_URL`: in-memory store when absent
    /// - `CORS_ORIGIN`: any origin when absent
    /// - `STATIC_DIR`: no static files when absent
    /// - `HEARTBEAT_INTERVAL_SECS`: default 15
    /// - `PRESENCE_TIMEOUT_SECS`: default 45
    /// - `MAX_MESSAGE_LEN`: default 2000
    /// - `CLIENT_QUEUE_CAPACITY`: default 256
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable is present but unparseable, or
    /// if the heartbeat settings are inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env_parse_strict("PORT", DEFAULT_PORT)?;
        let interval = env_parse_strict("HEARTBEAT_INTERVAL_SECS", DEFAULT_HEARTBEAT_INTERVAL_SECS)?;
        let timeout = env_parse_strict("PRESENCE_TIMEOUT_SECS", DEFAULT_PRESENCE_TIMEOUT_SECS)?;
        let max_message_len = env_parse_strict("MAX_MESSAGE_LEN", DEFAULT_MAX_MESSAGE_LEN)?;
        let client_queue_capacity = env_parse_strict("CLIENT_QUEUE_CAPACITY", DEFAULT_CLIENT_QUEUE_CAPACITY)?;

        let chat = validate_chat(interval, timeout, max_message_len, client_queue_capacity)?;

        Ok(Self {
            port,
            database_url: env_non_empty("DATABASE_URL"),
            cors_origin: env_non_empty("CORS_ORIGIN"),
            static_dir: env_non_empty("STATIC_DIR").map(PathBuf::from),
            chat,
        })
    }
}

fn validate_chat(
    interval: u64,
    timeout: u64,
    max_message_len: usize,
    client_queue_capacity: usize,
) -> Result<ChatConfig, ConfigError> {
    if interval == 0 {
        return Err(ConfigError::Zero { var: "HEARTBEAT_INTERVAL_SECS" });
    }
    if max_message_len == 0 {
        return Err(ConfigError::Zero { var: "MAX_MESSAGE_LEN" });
    }
    if client_queue_capacity == 0 {
        return Err(ConfigError::Zero { var: "CLIENT_QUEUE_CAPACITY" });
    }
    if timeout < interval {
        return Err(ConfigError::TimeoutBelowInterval { timeout, interval });
    }
    Ok(ChatConfig {
        heartbeat_interval: Duration::from_secs(interval),
        presence_timeout: Duration::from_secs(timeout),
        max_message_len,
        client_queue_capacity,
    })
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an env var, falling back to `default` when unset. A set but
/// unparseable value is an error rather than a silent default.
pub(crate) fn env_parse_strict<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env_non_empty(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { var: key, value: raw }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
