//! Manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Conditions manager configuration.
///
/// Every field has a default, so a partial JSON document is a valid config:
///
/// ```
/// use iovcond::ManagerConfig;
///
/// let config = ManagerConfig::from_json_str(r#"{ "cache_capacity": 128 }"#).unwrap();
/// assert_eq!(config.cache_capacity, 128);
/// assert_eq!(config.store_retries, ManagerConfig::default().store_retries);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of conditions held by the IOV cache across all keys.
    pub cache_capacity: usize,
    /// Maximum number of validity windows cached per key.
    pub max_entries_per_key: usize,
    /// Extra store attempts after a transient failure.
    pub store_retries: u32,
    /// Backoff before the first retry; doubled on each further retry.
    pub retry_backoff_ms: u64,
    /// Default deadline applied by `prepare`. `None` means unbounded.
    pub prepare_timeout_ms: Option<u64>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 65_536,
            max_entries_per_key: 8,
            store_retries: 2,
            retry_backoff_ms: 5,
            prepare_timeout_ms: None,
        }
    }
}

impl ManagerConfig {
    /// Parses and validates a JSON config.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` for malformed JSON or out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ValidationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ValidationError::InvalidConfig {
            field: "<document>".to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cache_capacity == 0 {
            return Err(ValidationError::InvalidConfig {
                field: "cache_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_entries_per_key == 0 {
            return Err(ValidationError::InvalidConfig {
                field: "max_entries_per_key".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn prepare_timeout(&self) -> Option<Duration> {
        self.prepare_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
