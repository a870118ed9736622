//! Configuration for the offline core.
//!
//! Defaults are the fixed operating constants; a TOML file may override
//! them for a deployment. Nothing is read from the environment.

use crate::error::{OfflineError, Result};
use crate::sync::auth::Role;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const RETENTION_DAYS: i64 = 7;
/// Upper bound accepted for `retention_days`
pub const MAX_RETENTION_DAYS: i64 = 3650;
pub const MAX_QUEUE_ATTEMPTS: u32 = 5;
pub const BASE_BACKOFF_MS: u64 = 1_000;
pub const MAX_BACKOFF_MS: u64 = 5 * 60 * 1_000;
pub const REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const RECONNECT_SETTLE_MS: u64 = 2_000;
pub const RETRY_TICK_SECS: u64 = 15;

/// Build flavour; decides whether a missing crypto provider fails closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn current() -> Self {
        if cfg!(debug_assertions) {
            Self::Development
        } else {
            Self::Production
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::current()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Origin of the remote authority (e.g. "http://localhost:3065")
    pub api_base_url: String,
    /// Path prefix every resource lives under
    pub api_base_path: String,
    pub retention_days: i64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,
    /// Wait after connectivity returns before draining
    pub reconnect_settle_ms: u64,
    pub retry_tick_secs: u64,
    /// Roles allowed to persist bulk entity caches
    pub offline_roles: Vec<Role>,
    pub environment: Environment,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3065".to_string(),
            api_base_path: "/api".to_string(),
            retention_days: RETENTION_DAYS,
            max_attempts: MAX_QUEUE_ATTEMPTS,
            base_backoff_ms: BASE_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
            request_timeout_ms: REQUEST_TIMEOUT_MS,
            reconnect_settle_ms: RECONNECT_SETTLE_MS,
            retry_tick_secs: RETRY_TICK_SECS,
            offline_roles: vec![Role::SuperAdmin, Role::Admin, Role::Pastor],
            environment: Environment::current(),
        }
    }
}

impl OfflineConfig {
    /// Load overrides from a TOML file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OfflineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| OfflineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if url::Url::parse(&self.api_base_url).is_err() {
            return Err(OfflineError::Config(format!(
                "api_base_url is not a valid URL: {}",
                self.api_base_url
            )));
        }
        if !self.api_base_path.starts_with('/') {
            return Err(OfflineError::Config(
                "api_base_path must start with '/'".to_string(),
            ));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            return Err(OfflineError::Config(format!(
                "retention_days must be between 1 and {}",
                MAX_RETENTION_DAYS
            )));
        }
        if self.max_attempts == 0 {
            return Err(OfflineError::Config("max_attempts must be at least 1".to_string()));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(OfflineError::Config(
                "base_backoff_ms exceeds max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Default location for the cache database
    pub fn default_data_dir() -> PathBuf {
        directories::ProjectDirs::from("org", "flocksync", "flocksync")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".flocksync"))
    }

    pub fn allows_offline(&self, role: Role) -> bool {
        self.offline_roles.contains(&role)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_settle(&self) -> Duration {
        Duration::from_millis(self.reconnect_settle_ms)
    }

    pub fn retry_tick(&self) -> Duration {
        Duration::from_secs(self.retry_tick_secs.max(1))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_fixed_constants() {
        let config = OfflineConfig::default();
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_backoff_ms, 1_000);
        assert_eq!(config.max_backoff_ms, 300_000);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.allows_offline(Role::Pastor));
        assert!(!config.allows_offline(Role::Member));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = OfflineConfig::from_toml(
            r#"
            api_base_url = "https://igreja.example.org"
            offline_roles = ["superadmin", "missionary"]
            environment = "production"
            "#,
        )
        .unwrap();

        assert_eq!(config.api_base_url, "https://igreja.example.org");
        assert_eq!(config.api_base_path, "/api");
        assert_eq!(config.max_attempts, 5);
        assert!(config.allows_offline(Role::Missionary));
        assert!(!config.allows_offline(Role::Admin));
        assert!(config.environment.is_production());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(OfflineConfig::from_toml("api_base_url = \"not a url\"").is_err());
        assert!(OfflineConfig::from_toml("max_attempts = 0").is_err());
        assert!(OfflineConfig::from_toml("api_base_path = \"api\"").is_err());
    }

    #[test]
    fn test_retention_days_bounded() {
        assert!(OfflineConfig::from_toml("retention_days = 0").is_err());
        assert!(OfflineConfig::from_toml("retention_days = 99999999999").is_err());

        let config = OfflineConfig::from_toml("retention_days = 3650").unwrap();
        assert_eq!(config.retention(), chrono::Duration::days(3650));
    }
}
