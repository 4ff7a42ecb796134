//! Engine configuration.
//!
//! `EngineConfig` holds the tunables of the transfer engine. Every field has a
//! default matching the firmware behavior, so an empty TOML file is valid.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksums::VerificationPolicy;
use crate::device::SECTOR_SIZE;
use crate::error::EngineError;

/// Default chunk: 8192 sectors (4 MiB).
pub const DEFAULT_CHUNK_SECTORS: u32 = 8192;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 150;
/// Unsplit outputs are synced every 2 GiB written.
pub const DEFAULT_FLUSH_INTERVAL: u64 = 1 << 31;
/// Cards at or below this capacity use 1 GiB parts instead of 2 GiB.
pub const SMALL_CARD_THRESHOLD: u64 = 8 << 30;
pub const LARGE_CARD_PART_SIZE: u64 = 1 << 31;
pub const SMALL_CARD_PART_SIZE: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sectors moved per read/write call.
    pub chunk_sectors: u32,

    /// Attempts per chunk before a read or write is fatal.
    pub retry_attempts: u32,

    /// Pause between attempts, in milliseconds.
    pub retry_backoff_ms: u64,

    /// Post-transfer verification policy.
    pub verification: VerificationPolicy,

    /// Bytes written to an unsplit output between syncs.
    pub flush_interval_bytes: u64,

    /// Fixed part size for split outputs. `None` picks by card capacity.
    pub part_size_bytes: Option<u64>,

    /// Card capacity at or below which the small part size is used.
    pub small_card_threshold_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_sectors: DEFAULT_CHUNK_SECTORS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            verification: VerificationPolicy::Sparse,
            flush_interval_bytes: DEFAULT_FLUSH_INTERVAL,
            part_size_bytes: None,
            small_card_threshold_bytes: SMALL_CARD_THRESHOLD,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = toml::from_str(text).map_err(|e| EngineError::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn from_toml_file(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::file(path, e))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunk_sectors == 0 {
            return Err(EngineError::Config {
                reason: "chunk_sectors must be greater than zero".to_string(),
            });
        }
        if self.retry_attempts == 0 {
            return Err(EngineError::Config {
                reason: "retry_attempts must be at least 1".to_string(),
            });
        }
        if self.flush_interval_bytes == 0 {
            return Err(EngineError::Config {
                reason: "flush_interval_bytes must be greater than zero".to_string(),
            });
        }
        // Restore expects every part but the last to hold whole chunks.
        let part_sizes = match self.part_size_bytes {
            Some(part) => vec![part],
            None => vec![SMALL_CARD_PART_SIZE, LARGE_CARD_PART_SIZE],
        };
        for part in part_sizes {
            if part == 0 || part % self.chunk_bytes() != 0 {
                return Err(EngineError::Config {
                    reason: format!(
                        "part size ({}) must be a non-zero multiple of the chunk size ({})",
                        part,
                        self.chunk_bytes()
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn chunk_bytes(&self) -> u64 {
        self.chunk_sectors as u64 * SECTOR_SIZE as u64
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Part size for a split backup onto a card of `card_capacity` bytes.
    pub fn part_size_for(&self, card_capacity: u64) -> u64 {
        match self.part_size_bytes {
            Some(size) => size,
            None if card_capacity <= self.small_card_threshold_bytes => SMALL_CARD_PART_SIZE,
            None => LARGE_CARD_PART_SIZE,
        }
    }
}
