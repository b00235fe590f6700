//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{
    DEFAULT_PAGE_SIZE, DEFAULT_POLL_INTERVAL_SECS, MAX_PAGE_SIZE, READ_KEY_PREFIX,
};
use crate::error::{ConfigError, SyncError, SyncResult};

/// Tunables for stores, cache decorators and the staleness poller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Default page size for loads that do not name one.
    pub page_size: u32,
    /// Interval between staleness polls.
    pub poll_interval: Duration,
    /// Maximum age of a cached read. `None` keeps entries until invalidated.
    pub entry_ttl: Option<Duration>,
    /// Prefix of read-classified cache keys.
    pub read_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            entry_ttl: None,
            read_prefix: READ_KEY_PREFIX.to_string(),
        }
    }
}

impl SyncConfig {
    /// Create SyncConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `RECSYNC_PAGE_SIZE`: Default page size (default: 25)
    /// - `RECSYNC_POLL_INTERVAL_SECS`: Staleness poll interval (default: 30)
    /// - `RECSYNC_CACHE_TTL_SECS`: Cached read lifetime, unset for no expiry
    pub fn from_env() -> Self {
        let page_size = std::env::var("RECSYNC_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);

        let poll_interval = Duration::from_secs(
            std::env::var("RECSYNC_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        );

        let entry_ttl = std::env::var("RECSYNC_CACHE_TTL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs);

        Self {
            page_size,
            poll_interval,
            entry_ttl,
            read_prefix: READ_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = Some(ttl);
        self
    }

    pub fn with_read_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.read_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(SyncError::Config(ConfigError::InvalidValue {
                field: "page_size".to_string(),
                value: self.page_size.to_string(),
                reason: format!("page_size must be between 1 and {}", MAX_PAGE_SIZE),
            }));
        }

        if self.poll_interval.is_zero() {
            return Err(SyncError::Config(ConfigError::InvalidValue {
                field: "poll_interval".to_string(),
                value: format!("{:?}", self.poll_interval),
                reason: "poll_interval must be positive".to_string(),
            }));
        }

        if matches!(self.entry_ttl, Some(ttl) if ttl.is_zero()) {
            return Err(SyncError::Config(ConfigError::InvalidValue {
                field: "entry_ttl".to_string(),
                value: "0s".to_string(),
                reason: "entry_ttl must be positive when set".to_string(),
            }));
        }

        if self.read_prefix.is_empty() {
            return Err(SyncError::Config(ConfigError::MissingRequired {
                field: "read_prefix".to_string(),
            }));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.read_prefix, "read:");
        assert_eq!(config.entry_ttl, None);
    }

    #[test]
    fn test_builders() {
        let config = SyncConfig::default()
            .with_page_size(50)
            .with_poll_interval(Duration::from_secs(5))
            .with_entry_ttl(Duration::from_secs(60))
            .with_read_prefix("q:");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.entry_ttl, Some(Duration::from_secs(60)));
        assert_eq!(config.read_prefix, "q:");
    }

    #[test]
    fn test_validate_rejects_zero_page_size() {
        let err = SyncConfig::default().with_page_size(0).validate().unwrap_err();
        assert!(matches!(
            err,
            SyncError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "page_size"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_interval_and_ttl() {
        assert!(SyncConfig::default()
            .with_poll_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(SyncConfig::default()
            .with_entry_ttl(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_validate_rejects_empty_prefix() {
        let err = SyncConfig::default().with_read_prefix("").validate().unwrap_err();
        assert!(matches!(err, SyncError::Config(ConfigError::MissingRequired { .. })));
    }

    #[test]
    fn test_config_from_env_is_valid() {
        let config = SyncConfig::from_env();
        assert_eq!(config.read_prefix, READ_KEY_PREFIX);
    }
}
