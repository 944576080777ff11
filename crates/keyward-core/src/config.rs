//! Application configuration management.
//!
//! This module handles loading and saving the configuration, which holds the
//! auth API location, the last used login email, and the session timing
//! knobs (absolute lifetime, inactivity ceiling, check interval, timeouts).
//!
//! Configuration is stored at `~/.config/keyward/config.json`; the encrypted
//! vault lives under the platform data directory.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "keyward";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the auth API base URL
pub const API_URL_ENV: &str = "KEYWARD_API_URL";

const DEFAULT_API_BASE_URL: &str = "https://api.keyward.dev";

/// Absolute session ceiling: 24 hours.
const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Inactivity ceiling: 30 minutes.
const DEFAULT_MAX_INACTIVITY_SECS: u64 = 30 * 60;

const DEFAULT_VALIDITY_CHECK_INTERVAL_SECS: u64 = 60;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Refresh gets a shorter budget so waiters are released quickly.
const DEFAULT_REFRESH_TIMEOUT_SECS: u64 = 15;

/// Upper bound for every duration setting: ten years.
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Where the vault's data key is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyStoreKind {
    /// OS keychain, falling back to `File` when the keychain is unusable.
    #[default]
    Keychain,
    /// Passphrase-wrapped key file. Weaker than the keychain.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub last_email: Option<String>,
    pub session_ttl_secs: u64,
    pub max_inactivity_secs: u64,
    pub validity_check_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub refresh_timeout_secs: u64,
    pub key_store: KeyStoreKind,
    /// Overrides the platform data directory for the vault.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            last_email: None,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            max_inactivity_secs: DEFAULT_MAX_INACTIVITY_SECS,
            validity_check_interval_secs: DEFAULT_VALIDITY_CHECK_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            refresh_timeout_secs: DEFAULT_REFRESH_TIMEOUT_SECS,
            key_store: KeyStoreKind::default(),
            data_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Reject durations that are zero where that makes no sense, or too
    /// large to represent as a timestamp offset.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("session_ttl_secs", self.session_ttl_secs),
            ("max_inactivity_secs", self.max_inactivity_secs),
            ("validity_check_interval_secs", self.validity_check_interval_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("refresh_timeout_secs", self.refresh_timeout_secs),
        ];
        for (field, value) in durations {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            if value > MAX_DURATION_SECS {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} exceeds the maximum of {}", value, MAX_DURATION_SECS),
                });
            }
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
    }

    fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoPlatformDir("config"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the encrypted vault files.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir().ok_or(ConfigError::NoPlatformDir("data"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        bounded_delta(self.session_ttl_secs)
    }

    pub fn max_inactivity(&self) -> chrono::Duration {
        bounded_delta(self.max_inactivity_secs)
    }

    pub fn validity_check_interval(&self) -> Duration {
        Duration::from_secs(self.validity_check_interval_secs.clamp(1, MAX_DURATION_SECS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.clamp(1, MAX_DURATION_SECS))
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs.clamp(1, MAX_DURATION_SECS))
    }
}

/// Seconds as a `chrono::Duration`, clamped to `MAX_DURATION_SECS`.
fn bounded_delta(secs: u64) -> chrono::Duration {
    i64::try_from(secs.min(MAX_DURATION_SECS))
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url":"http://localhost:8080"}"#).unwrap();
        assert_eq!(config.api_base_url, "http://localhost:8080");
        assert_eq!(config.max_inactivity(), chrono::Duration::minutes(30));
        assert_eq!(config.key_store, KeyStoreKind::Keychain);
    }

    #[test]
    fn test_key_store_kind_is_lowercase() {
        let config: Config = serde_json::from_str(r#"{"key_store":"file"}"#).unwrap();
        assert_eq!(config.key_store, KeyStoreKind::File);
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let config = Config {
            data_dir: Some(PathBuf::from("/tmp/keyward-test")),
            ..Config::default()
        };
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/keyward-test"));
    }

    #[test]
    fn test_oversized_durations_are_clamped() {
        let config = Config {
            session_ttl_secs: u64::MAX / 2,
            max_inactivity_secs: u64::MAX,
            ..Config::default()
        };
        let ceiling = chrono::Duration::seconds(MAX_DURATION_SECS as i64);
        assert_eq!(config.session_ttl(), ceiling);
        assert_eq!(config.max_inactivity(), ceiling);
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let oversized = Config {
            session_ttl_secs: u64::MAX / 2,
            ..Config::default()
        };
        assert!(matches!(
            oversized.validate(),
            Err(ConfigError::Invalid { field: "session_ttl_secs", .. })
        ));

        let zero = Config {
            refresh_timeout_secs: 0,
            ..Config::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(ConfigError::Invalid { field: "refresh_timeout_secs", .. })
        ));

        assert!(Config::default().validate().is_ok());
    }
}
