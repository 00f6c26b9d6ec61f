//! # Client Configuration
//!
//! `ClientConfig` is layered the same way everywhere: built-in defaults, then an
//! optional JSON5 file, then `REALTIME_*` environment variables.
//!
//! | Field | Env variable | Default |
//! |---|---|---|
//! | `endpoint` | `REALTIME_ENDPOINT` | `localhost:6020` |
//! | `reconnectBaseDelayMs` | `REALTIME_RECONNECT_BASE_DELAY_MS` | 1000 |
//! | `reconnectMaxDelayMs` | `REALTIME_RECONNECT_MAX_DELAY_MS` | 30000 |
//! | `reconnectJitter` | `REALTIME_RECONNECT_JITTER` | 0.2 |
//! | `maxReconnectAttempts` | `REALTIME_MAX_RECONNECT_ATTEMPTS` | 5 |
//! | `rpcResponseTimeoutMs` | `REALTIME_RPC_RESPONSE_TIMEOUT_MS` | 20000 |
//! | `recordAckTimeoutMs` | `REALTIME_RECORD_ACK_TIMEOUT_MS` | 10000 |
//! | `loginTimeoutMs` | `REALTIME_LOGIN_TIMEOUT_MS` | 10000 |

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file {path}: {reason}")]
    ParseError { path: String, reason: String },

    #[error("Environment variable {var} has an invalid value '{value}'")]
    InvalidEnvVar { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// `host:port`, or a full `ws://` / `wss://` URL.
    pub endpoint: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Fraction (0..=1) by which a reconnect delay may be randomly shortened.
    pub reconnect_jitter: f64,
    /// Consecutive failed connection attempts before the state becomes `Error`.
    pub max_reconnect_attempts: u32,
    pub rpc_response_timeout_ms: u64,
    pub record_ack_timeout_ms: u64,
    pub login_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost:6020".to_string(),
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            reconnect_jitter: 0.2,
            max_reconnect_attempts: 5,
            rpc_response_timeout_ms: 20_000,
            record_ack_timeout_ms: 10_000,
            login_timeout_ms: 10_000,
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON5 file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        serde_json5::from_str::<ClientConfig>(&text).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        let config = base.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `REALTIME_*` environment variables.
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|var| std::env::var(var).ok())
    }

    /// Overrides fields from an arbitrary variable lookup.
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("REALTIME_ENDPOINT") {
            self.endpoint = endpoint;
        }
        env_override(&lookup, "REALTIME_RECONNECT_BASE_DELAY_MS", &mut self.reconnect_base_delay_ms)?;
        env_override(&lookup, "REALTIME_RECONNECT_MAX_DELAY_MS", &mut self.reconnect_max_delay_ms)?;
        env_override(&lookup, "REALTIME_RECONNECT_JITTER", &mut self.reconnect_jitter)?;
        env_override(&lookup, "REALTIME_MAX_RECONNECT_ATTEMPTS", &mut self.max_reconnect_attempts)?;
        env_override(&lookup, "REALTIME_RPC_RESPONSE_TIMEOUT_MS", &mut self.rpc_response_timeout_ms)?;
        env_override(&lookup, "REALTIME_RECORD_ACK_TIMEOUT_MS", &mut self.record_ack_timeout_ms)?;
        env_override(&lookup, "REALTIME_LOGIN_TIMEOUT_MS", &mut self.login_timeout_ms)?;
        Ok(self)
    }

    /// Rejects configurations the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint must not be empty".to_string()));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::Invalid("maxReconnectAttempts must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter) {
            return Err(ConfigError::Invalid("reconnectJitter must be within 0..=1".to_string()));
        }
        Ok(())
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn rpc_response_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_response_timeout_ms)
    }

    pub fn record_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.record_ack_timeout_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }
}

fn env_override<F, T>(lookup: &F, var: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(var) {
        *target = raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvVar {
            var: var.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

impl fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientConfig
    Endpoint: {},
    Reconnect: base {}ms, max {}ms, jitter {}, attempts {},
    Timeouts: rpc {}ms, record ack {}ms, login {}ms
",
            self.endpoint,
            self.reconnect_base_delay_ms,
            self.reconnect_max_delay_ms,
            self.reconnect_jitter,
            self.max_reconnect_attempts,
            self.rpc_response_timeout_ms,
            self.record_ack_timeout_ms,
            self.login_timeout_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_file_overrides_only_given_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{{\n  // comments are fine in JSON5\n  endpoint: '0.0.0.0:6020',\n  rpcResponseTimeoutMs: 500,\n}}"
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(config.endpoint, "0.0.0.0:6020");
        assert_eq!(config.rpc_response_timeout(), Duration::from_millis(500));
        assert_eq!(config.max_reconnect_attempts, ClientConfig::default().max_reconnect_attempts);
    }

    #[test]
    fn test_broken_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ endpoint: ").unwrap();
        assert!(matches!(
            ClientConfig::from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_env_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("REALTIME_ENDPOINT", "example.com:7000"),
            ("REALTIME_MAX_RECONNECT_ATTEMPTS", "9"),
        ]
        .into_iter()
        .collect();
        let config = ClientConfig::default()
            .apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.endpoint, "example.com:7000");
        assert_eq!(config.max_reconnect_attempts, 9);
        assert_eq!(config.login_timeout_ms, 10_000);
    }

    #[test]
    fn test_env_bad_number() {
        let result = ClientConfig::default().apply_env_from(|k| {
            (k == "REALTIME_LOGIN_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidEnvVar { .. })));
    }

    #[test]
    fn test_validate() {
        assert!(ClientConfig::default().validate().is_ok());
        let mut bad = ClientConfig::new(" ");
        assert!(bad.validate().is_err());
        bad.endpoint = "h:1".to_string();
        bad.max_reconnect_attempts = 0;
        assert!(bad.validate().is_err());
    }
}
