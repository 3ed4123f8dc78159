//! Environment-backed runtime configuration for `parley-cli`.

use std::{env, error::Error, fmt, time::Duration};

use chat_core::{DEFAULT_TYPING_DEBOUNCE, DEFAULT_TYPING_TIMEOUT, RetryPolicy};
use chat_session::{DEFAULT_TIMELINE_MAX_ITEMS, SessionConfig};

const DEFAULT_RECONNECT_BASE_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;

/// Runtime configuration used by the console client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParleyConfig {
    /// Chat server base url. `None` runs against in-process loopback fakes.
    pub server_url: Option<String>,
    /// Local user id to sign in as on startup.
    pub user_id: Option<String>,
    /// Peer to open on startup.
    pub peer_user_id: Option<String>,
    pub typing_debounce_ms: u64,
    pub typing_timeout_ms: u64,
    pub timeline_max_items: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl ParleyConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let server_url = optional_trimmed_env("PARLEY_SERVER_URL", &mut lookup);
        let user_id = optional_trimmed_env("PARLEY_USER", &mut lookup);
        let peer_user_id = optional_trimmed_env("PARLEY_PEER", &mut lookup);

        let typing_debounce_ms = parse_u64_with_default(
            "PARLEY_TYPING_DEBOUNCE_MS",
            DEFAULT_TYPING_DEBOUNCE.as_millis() as u64,
            &mut lookup,
        )?;
        let typing_timeout_ms = parse_u64_with_default(
            "PARLEY_TYPING_TIMEOUT_MS",
            DEFAULT_TYPING_TIMEOUT.as_millis() as u64,
            &mut lookup,
        )?;
        let timeline_max_items = parse_usize_with_default(
            "PARLEY_TIMELINE_MAX_ITEMS",
            DEFAULT_TIMELINE_MAX_ITEMS,
            &mut lookup,
        )?;
        let reconnect_base_ms = parse_u64_with_default(
            "PARLEY_RECONNECT_BASE_MS",
            DEFAULT_RECONNECT_BASE_MS,
            &mut lookup,
        )?;
        let reconnect_max_ms = parse_u64_with_default(
            "PARLEY_RECONNECT_MAX_MS",
            DEFAULT_RECONNECT_MAX_MS,
            &mut lookup,
        )?;

        if timeline_max_items == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PARLEY_TIMELINE_MAX_ITEMS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if typing_timeout_ms <= typing_debounce_ms {
            return Err(ConfigError::InvalidValue {
                key: "PARLEY_TYPING_TIMEOUT_MS",
                value: typing_timeout_ms.to_string(),
                reason: format!("must be longer than the {typing_debounce_ms} ms debounce"),
            });
        }
        if reconnect_base_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PARLEY_RECONNECT_BASE_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            server_url,
            user_id,
            peer_user_id,
            typing_debounce_ms,
            typing_timeout_ms,
            timeline_max_items,
            reconnect_base_ms,
            reconnect_max_ms,
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            typing_debounce: Duration::from_millis(self.typing_debounce_ms),
            typing_timeout: Duration::from_millis(self.typing_timeout_ms),
            timeline_max_items: self.timeline_max_items,
            ..SessionConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.reconnect_base_ms, self.reconnect_max_ms)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_usize_with_default<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}
