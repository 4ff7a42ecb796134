//! Error types for the storage engine.
//!
//! `EngineError` is the single error type returned by every operation. Transient
//! device errors are retried inside the transfer engine and only surface here once
//! the retry budget is exhausted; everything else is reported immediately.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Direction of a failed sector operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOp::Read => write!(f, "read"),
            IoOp::Write => write!(f, "write"),
        }
    }
}

/// Errors that terminate a job (or, for `SizeMismatch`, ask the caller first).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Sector read or write failed on every attempt.
    #[error("failed to {op} sectors at LBA {lba:#010X} (tried {retry_count} times): {source}")]
    Io {
        op: IoOp,
        lba: u64,
        retry_count: u32,
        #[source]
        source: io::Error,
    },

    /// Backup image size does not match the target region (in sectors).
    #[error("size mismatch: expected {expected} sectors, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Destination cannot hold even one part of the image.
    #[error("not enough free space: {needed} bytes needed, {available} bytes available")]
    InsufficientSpace { needed: u64, available: u64 },

    /// Source and destination digests differ for the chunk starting at `lba`.
    #[error("verification failed at LBA {lba:#010X}")]
    VerificationFailed { lba: u64 },

    #[error("operation cancelled")]
    Cancelled,

    /// A partition plan or layout breaks a sizing rule.
    #[error("layout constraint violated: {reason}")]
    LayoutConstraintViolated { reason: String },

    /// The device is already held open by another job or writer.
    #[error("device {} is busy", path.display())]
    DeviceBusy { path: PathBuf },

    /// Region bounds are empty or inverted.
    #[error("invalid region {name}: {lba_start:#X}-{lba_end:#X}")]
    InvalidRegion {
        name: String,
        lba_start: u64,
        lba_end: u64,
    },

    /// Filesystem error on a backup file, part file or sidecar.
    #[error("file error on {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A part file other than the last one is not a whole number of chunks.
    #[error("split file {} is not a multiple of {alignment} bytes", path.display())]
    MisalignedPart { path: PathBuf, alignment: u64 },

    /// No single file or part files exist for a restore.
    #[error("restore source not found: {}", path.display())]
    MissingSource { path: PathBuf },

    #[error("invalid partition table: {reason}")]
    InvalidPartitionTable { reason: String },

    #[error("partition not found: {name}")]
    PartitionNotFound { name: String },

    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl EngineError {
    pub(crate) fn file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        EngineError::File {
            path: path.into(),
            source,
        }
    }

    /// True when the failure may have left a device partially written.
    ///
    /// Write failures always qualify. Restores report any failure as
    /// threatening at the orchestrator level.
    pub fn is_device_threatening(&self) -> bool {
        matches!(self, EngineError::Io { op: IoOp::Write, .. })
    }

    /// The LBA the error refers to, if any.
    pub fn lba(&self) -> Option<u64> {
        match self {
            EngineError::Io { lba, .. } | EngineError::VerificationFailed { lba } => Some(*lba),
            _ => None,
        }
    }

    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            EngineError::Io { source, .. } | EngineError::File { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}
