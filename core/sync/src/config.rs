//! Engine configuration file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use docmirror_common::{Error, Result};
use docmirror_remote::{HttpRemoteConfig, MAX_PAGE_SIZE};

use crate::circuit::CircuitConfig;
use crate::reconcile::ReconcileSettings;
use crate::retry::RetryConfig;
use crate::scheduler::SchedulerConfig;

/// Complete engine configuration.
///
/// Every field has a default, so `{}` is a valid file. The remote credential
/// is never part of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    pub remote: HttpRemoteConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub scheduler: SchedulerConfig,
}

impl MirrorConfig {
    /// Load and validate a JSON config file.
    ///
    /// # Errors
    /// - File cannot be read
    /// - File is not valid JSON for this structure
    /// - A value is out of range
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&raw)?;
        debug!("Loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Parse and validate a JSON config document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| Error::Serialization(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidInput(msg.to_string()));

        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be at least 1.0");
        }
        if self.retry.call_timeout_ms == 0 {
            return invalid("retry.call_timeout_ms must be positive");
        }
        if self.circuit.failure_threshold == 0 || self.circuit.half_open_max_calls == 0 {
            return invalid("circuit thresholds must be at least 1");
        }
        if self.scheduler.max_concurrent_syncs == 0 {
            return invalid("scheduler.max_concurrent_syncs must be at least 1");
        }
        if self.scheduler.tick_interval_ms == 0 {
            return invalid("scheduler.tick_interval_ms must be positive");
        }
        if self.scheduler.max_pages == 0 {
            return invalid("scheduler.max_pages must be at least 1");
        }
        if self.remote.page_size == 0 || self.remote.page_size > MAX_PAGE_SIZE {
            return Err(Error::InvalidInput(format!(
                "remote.page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        Ok(())
    }

    /// Settings of each reconciliation pass.
    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            page_size: self.remote.page_size,
            max_pages: self.scheduler.max_pages,
            schema_refresh: self.scheduler.schema_refresh(),
        }
    }
}
