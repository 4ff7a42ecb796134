//! Core data model for transfers.
//!
//! This module defines the main data structures for representing transfer operations:
//! - Region: a contiguous sector range on a device
//! - TransferJob: one region moving between a device and its backup file(s)
//! - Direction, JobState, Outcome: enums controlling and reporting behavior

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::SECTOR_SIZE;
use crate::error::EngineError;

/// A contiguous, named sector range. `lba_end` is inclusive, as in GPT entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub lba_start: u64,
    pub lba_end: u64,
}

impl Region {
    pub fn new(name: impl Into<String>, lba_start: u64, lba_end: u64) -> Result<Self, EngineError> {
        let name = name.into();
        if lba_start >= lba_end {
            return Err(EngineError::InvalidRegion {
                name,
                lba_start,
                lba_end,
            });
        }
        Ok(Region {
            name,
            lba_start,
            lba_end,
        })
    }

    /// Region covering `sectors` sectors from `lba_start`.
    pub fn with_len(name: impl Into<String>, lba_start: u64, sectors: u64) -> Result<Self, EngineError> {
        Self::new(name, lba_start, (lba_start + sectors).saturating_sub(1))
    }

    pub fn sectors(&self) -> u64 {
        self.lba_end - self.lba_start + 1
    }

    pub fn bytes(&self) -> u64 {
        self.sectors() * SECTOR_SIZE as u64
    }

    /// Same start, shortened to `sectors` sectors.
    pub fn truncated(&self, sectors: u64) -> Result<Self, EngineError> {
        Self::with_len(self.name.clone(), self.lba_start, sectors)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (0x{:08X} - 0x{:08X})",
            self.name, self.lba_start, self.lba_end
        )
    }
}

/// Which way data moves relative to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Device to file(s)
    Backup,
    /// File(s) to device
    Restore,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Backup => write!(f, "Backup"),
            Direction::Restore => write!(f, "Restore"),
        }
    }
}

/// The state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Created, not yet started
    Pending,
    /// Currently executing
    Running,
    /// Every region transferred
    Completed,
    /// Stopped by the cancel predicate
    Cancelled,
    /// Partial backup filled the destination; resumable
    Paused,
    /// Terminal error
    Failed,
}

impl JobState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

/// Result of a transfer that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Cancelled,
    /// Destination is full; move the finished parts off the card and run the
    /// same backup again to continue at `next_part`.
    Paused { next_part: u32 },
}

/// State of one region moving between a device and its backup file(s).
///
/// Created when an orchestrator step starts and mutated chunk by chunk by
/// the transfer engine.
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// Unique identifier for this job
    pub id: Uuid,

    /// Sector range being moved
    pub region: Region,

    /// Sectors in the region
    pub total_sectors: u64,

    /// Next sector to transfer
    pub current_lba: u64,

    /// Bytes written into the part currently open
    pub bytes_in_current_part: u64,

    /// Index of the part currently open (0 when unsplit)
    pub part_index: u32,

    pub direction: Direction,

    pub state: JobState,

    /// Retries performed across all chunks
    pub retries: u32,

    /// When job was created
    pub created_at: DateTime<Utc>,

    /// When job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl TransferJob {
    pub fn new(region: Region, direction: Direction) -> Self {
        TransferJob {
            id: Uuid::new_v4(),
            total_sectors: region.sectors(),
            current_lba: region.lba_start,
            region,
            bytes_in_current_part: 0,
            part_index: 0,
            direction,
            state: JobState::Pending,
            retries: 0,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Sectors already transferred.
    pub fn sectors_done(&self) -> u64 {
        self.current_lba - self.region.lba_start
    }

    /// `floor((current - start) * 100 / (end - start))`, capped at 100.
    pub fn percent(&self) -> u32 {
        let span = self.region.lba_end - self.region.lba_start;
        let pct = (self.sectors_done() as u128 * 100) / span as u128;
        pct.min(100) as u32
    }

    pub(crate) fn finish(&mut self, state: JobState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}
