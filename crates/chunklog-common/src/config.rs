//! Configuration types for chunklog
//!
//! This module defines the knobs controlling chunk splitting and the
//! write-behind flush policy.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum chunk length (256 KiB)
pub const DEFAULT_MAX_CHUNK_LENGTH: u64 = 256 * 1024;

/// Default maximum number of lines per sub-chunk
pub const DEFAULT_MAX_SUB_CHUNK_LINES: u32 = 128;

/// Log engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Byte length at which a chunk is sealed (checked at sub-chunk boundaries)
    pub max_chunk_length: u64,
    /// Line count at which a sub-chunk is sealed; must be a power of two
    pub max_sub_chunk_lines: u32,
    /// Buffered chunks untouched for this long are flushed (seconds)
    pub flush_retention_secs: u64,
    /// Interval of the background flush ticker (seconds)
    pub flush_interval_secs: u64,
    /// Origin tag recorded on chunks created by this instance
    pub server_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chunk_length: DEFAULT_MAX_CHUNK_LENGTH,
            max_sub_chunk_lines: DEFAULT_MAX_SUB_CHUNK_LINES,
            flush_retention_secs: 10 * 60, // 10 minutes
            flush_interval_secs: 30,
            server_name: "chunklog".to_string(),
        }
    }
}

impl EngineConfig {
    /// Retention window before an idle buffered chunk is flushed
    #[must_use]
    pub const fn flush_retention(&self) -> Duration {
        Duration::from_secs(self.flush_retention_secs)
    }

    /// Background flush ticker interval
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Check the invariants the engine relies on
    pub fn validate(&self) -> Result<()> {
        if !self.max_sub_chunk_lines.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "max_sub_chunk_lines must be a power of two, got {}",
                self.max_sub_chunk_lines
            )));
        }
        if self.max_chunk_length == 0 {
            return Err(Error::Configuration(
                "max_chunk_length must be positive".to_string(),
            ));
        }
        if self.flush_interval_secs == 0 {
            return Err(Error::Configuration(
                "flush_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
