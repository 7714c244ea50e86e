//! Hub configuration, loaded from RON.
//!
//! ```ron
//! (
//!     lock_ttl_secs: 90,
//!     reaper_interval_secs: 15,
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_LOCK_TTL_SECS, DEFAULT_REAPER_INTERVAL_SECS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Idle time after which a lock is reclaimed.
    pub lock_ttl_secs: u64,
    /// Reaper scan period.
    pub reaper_interval_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
        }
    }
}

impl HubConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        // A zero interval would make tokio's interval panic.
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }
}

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}
