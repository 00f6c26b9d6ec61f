use anyhow::{Context, Result};
use clap::Parser;
use lib_realtime::configs::ClientConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Realtime demo publisher: serves records, events and the add-numbers RPC", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "PUBLISHER_ENDPOINT", help = "Server endpoint (host:port or ws:// URL).")]
    pub endpoint: Option<String>,

    #[clap(long, env = "PUBLISHER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "PUBLISHER_CLIENT_CONFIG_PATH", help = "Path to a JSON5 client configuration file (timeouts, reconnect policy).")]
    pub client_config_path: Option<PathBuf>,

    #[clap(long, env = "PUBLISHER_USERNAME", help = "Username sent with the login credentials.")]
    pub username: Option<String>,

    #[clap(long, env = "PUBLISHER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "PUBLISHER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "PUBLISHER_INTERVAL_MS", help = "Interval in milliseconds between record updates and event emits.")]
    pub publish_interval_ms: Option<u64>,

    #[clap(long, env = "PUBLISHER_RECORD_PATTERN", help = "Record pattern to provide data for.")]
    pub record_pattern: Option<String>,

    #[clap(long, env = "PUBLISHER_EVENT_PATTERN", help = "Event pattern to provide data for.")]
    pub event_pattern: Option<String>,

    #[clap(long, env = "PUBLISHER_REJECT_PROBABILITY", help = "Probability (0..=1) that add-numbers rejects a request.")]
    pub reject_probability: Option<f64>,

    #[clap(long, env = "PUBLISHER_SILENCE_PROBABILITY", help = "Probability (0..=1) that add-numbers never answers.")]
    pub silence_probability: Option<f64>,

    #[clap(long, env = "PUBLISHER_ACK_RECORD", help = "If set, write 'number' = 2 to this record with a write acknowledgement after login.")]
    pub ack_record: Option<String>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    pub fn merge(self, other: Config) -> Config {
        Config {
            endpoint: other.endpoint.or(self.endpoint),
            config_path: other.config_path.or(self.config_path),
            client_config_path: other.client_config_path.or(self.client_config_path),
            username: other.username.or(self.username),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            publish_interval_ms: other.publish_interval_ms.or(self.publish_interval_ms),
            record_pattern: other.record_pattern.or(self.record_pattern),
            event_pattern: other.event_pattern.or(self.event_pattern),
            reject_probability: other.reject_probability.or(self.reject_probability),
            silence_probability: other.silence_probability.or(self.silence_probability),
            ack_record: other.ack_record.or(self.ack_record),
        }
    }

    pub fn defaults() -> Config {
        Config {
            endpoint: Some("0.0.0.0:6020".to_string()),
            username: Some("Publisher".to_string()),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            publish_interval_ms: Some(5000),
            record_pattern: Some("record/.*".to_string()),
            event_pattern: Some("event/.*".to_string()),
            reject_probability: Some(0.0),
            silence_probability: Some(0.0),
            ..Default::default()
        }
    }

    /// Builds the client settings: the optional JSON5 file and `REALTIME_*`
    /// variables, then this config's endpoint on top.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut client = ClientConfig::load(self.client_config_path.as_deref())
            .context("Failed to load client configuration")?;
        if let Some(endpoint) = &self.endpoint {
            client.endpoint = endpoint.clone();
        }
        client.validate()?;
        Ok(client)
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Config>(&text) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

pub fn load_config() -> Config {
    // 1. Defaults
    let mut current_config = Config::defaults();

    // 2. Config file (publisher.conf unless overridden on the CLI / env)
    let cli_args = Config::parse();
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("publisher.conf"));
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    // 3. Environment variables and CLI arguments (clap handles both)
    current_config.merge(cli_args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_merge_prefers_some_values_from_other() {
        let file = Config {
            endpoint: Some("example.com:6020".to_string()),
            publish_interval_ms: Some(1000),
            ..Default::default()
        };
        let merged = Config::defaults().merge(file);
        assert_eq!(merged.endpoint.as_deref(), Some("example.com:6020"));
        assert_eq!(merged.publish_interval_ms, Some(1000));
        assert_eq!(merged.username.as_deref(), Some("Publisher"));
    }

    #[test]
    fn test_read_config_file_camel_case() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"recordPattern": "scores/.*", "rejectProbability": 0.25}}"#).unwrap();
        let config = read_config_file(file.path()).unwrap();
        assert_eq!(config.record_pattern.as_deref(), Some("scores/.*"));
        assert_eq!(config.reject_probability, Some(0.25));
    }

    #[test]
    fn test_unparsable_file_is_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(read_config_file(file.path()).is_none());
    }
}
