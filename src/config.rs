//! Client configuration
//!
//! Layered as: defaults, then an optional TOML file, then `RELAY_CHAT_*`
//! environment variables. Command-line flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "RELAY_CHAT_";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for these settings
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A value is out of range or unparsable
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Relay base URL
    pub server_url: String,
    /// Reachability check
    pub ping_path: String,
    /// Element fetch
    pub fetch_path: String,
    /// Exchange-key post
    pub exchange_key_path: String,
    /// Message post
    pub message_path: String,
    /// Timeout for the reachability check
    pub ping_timeout_secs: u64,
    /// Timeout for every other request
    pub request_timeout_secs: u64,
    /// Sleep between sync cycles
    pub poll_interval_secs: u64,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Identity key file
    pub identity_path: PathBuf,
    /// Entries kept in the event log
    pub event_log_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            ping_path: "/ping".to_string(),
            fetch_path: "/fetch".to_string(),
            exchange_key_path: "/exchange-key".to_string(),
            message_path: "/message".to_string(),
            ping_timeout_secs: 3,
            request_timeout_secs: 10,
            poll_interval_secs: 2,
            database_path: data_dir.join("client.db"),
            identity_path: data_dir.join("identity.key"),
            event_log_capacity: 200,
        }
    }
}

impl Settings {
    /// Defaults, then `file` if given, then the process environment
    pub fn load(file: Option<&Path>) -> ConfigResult<Self> {
        let mut settings = match file {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults overlaid with a TOML file
    pub fn from_toml_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults overlaid with TOML text; missing keys keep their defaults
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `RELAY_CHAT_*` overrides read through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(url) = var("SERVER_URL") {
            self.server_url = url;
        }
        if let Some(path) = var("DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(path) = var("IDENTITY_PATH") {
            self.identity_path = PathBuf::from(path);
        }
        if let Some(value) = var("PING_TIMEOUT_SECS") {
            self.ping_timeout_secs = parse_number("PING_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = var("REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_number("REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = var("POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_number("POLL_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = var("EVENT_LOG_CAPACITY") {
            self.event_log_capacity = parse_number("EVENT_LOG_CAPACITY", &value)?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "server_url must be http(s): {}",
                self.server_url
            )));
        }

        for (name, path) in [
            ("ping_path", &self.ping_path),
            ("fetch_path", &self.fetch_path),
            ("exchange_key_path", &self.exchange_key_path),
            ("message_path", &self.message_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!("{} must start with '/'", name)));
            }
        }

        if self.ping_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll_interval_secs must be > 0".to_string()));
        }
        if self.event_log_capacity == 0 {
            return Err(ConfigError::Invalid("event_log_capacity must be > 0".to_string()));
        }

        Ok(())
    }

    /// Absolute URL of a relay endpoint
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }

    /// Reachability check timeout
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// Request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Sleep between sync cycles
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relay-chat")
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}{}: {}", ENV_PREFIX, name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.url(&settings.ping_path), "http://127.0.0.1:8000/ping");
        assert_eq!(settings.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_toml_overlays_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            server_url = "https://relay.example.org/"
            poll_interval_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(settings.server_url, "https://relay.example.org/");
        assert_eq!(settings.poll_interval_secs, 5);
        assert_eq!(settings.fetch_path, "/fetch");
        assert_eq!(
            settings.url(&settings.message_path),
            "https://relay.example.org/message"
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RELAY_CHAT_SERVER_URL", "http://10.0.0.1:9000"),
            ("RELAY_CHAT_REQUEST_TIMEOUT_SECS", " 30 "),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.server_url, "http://10.0.0.1:9000");
        assert_eq!(settings.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_bad_env_number_is_rejected() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(|name| (name == "RELAY_CHAT_POLL_INTERVAL_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings {
            server_url: "relay.example.org".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());

        settings.server_url = "http://relay.example.org".to_string();
        settings.poll_interval_secs = 0;
        assert!(settings.validate().is_err());

        settings.poll_interval_secs = 1;
        settings.fetch_path = "fetch".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unknown_toml_type_is_error() {
        assert!(matches!(
            Settings::from_toml_str("poll_interval_secs = \"fast\""),
            Err(ConfigError::Toml(_))
        ));
    }
}
