//! Session configuration, loaded from RON.
//!
//! ```ron
//! (
//!     page_size: 100,
//!     buffer_rows: 10,
//!     viewport_height: 600.0,
//!     row_height: (min_height: 40, max_height: 200, line_height: 20, chars_per_line: 60),
//!     acquire_timeout_ms: 5000,
//!     heartbeat_interval_secs: 30,
//! )
//! ```
//!
//! Every field is optional; missing fields take the defaults from
//! [`crate::constants`].

use std::path::Path;
use std::time::Duration;

use rowsync_types::MAX_PAGE_SIZE;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ACQUIRE_TIMEOUT_MS, DEFAULT_BUFFER_ROWS, DEFAULT_HEARTBEAT_INTERVAL_SECS,
    DEFAULT_PAGE_SIZE, DEFAULT_VIEWPORT_HEIGHT,
};
use crate::height::RowHeightEstimator;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub page_size: u64,
    pub buffer_rows: usize,
    /// Initial viewport height in px, until the UI reports a resize.
    pub viewport_height: f64,
    pub row_height: RowHeightEstimator,
    pub acquire_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            buffer_rows: DEFAULT_BUFFER_ROWS,
            viewport_height: DEFAULT_VIEWPORT_HEIGHT,
            row_height: RowHeightEstimator::default(),
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

impl SessionConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Reject values the cache and window math cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "page_size must be in 1..={MAX_PAGE_SIZE}, got {}",
                self.page_size
            )));
        }
        let h = &self.row_height;
        if h.min_height == 0 {
            return Err(ConfigError::Invalid("row_height.min_height must be at least 1".into()));
        }
        if h.min_height > h.max_height {
            return Err(ConfigError::Invalid(format!(
                "row_height.min_height ({}) exceeds max_height ({})",
                h.min_height, h.max_height
            )));
        }
        if h.chars_per_line == 0 {
            return Err(ConfigError::Invalid("row_height.chars_per_line must be at least 1".into()));
        }
        if !self.viewport_height.is_finite() || self.viewport_height < 0.0 {
            return Err(ConfigError::Invalid("viewport_height must be a non-negative number".into()));
        }
        Ok(())
    }

    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
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
    #[error("invalid config: {0}")]
    Invalid(String),
}
