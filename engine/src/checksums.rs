//! Checksum verification of transferred data.
//!
//! This module provides:
//! - Verification policies (Off, Sparse, Full, FullWithHashExport)
//! - Per-chunk SHA-256 digests, compared on their first 128 bits
//! - The `.sha256sums` sidecar written by `FullWithHashExport`
//! - Part-level verification of a device range against a backup file

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{EngineError, IoOp};
use crate::progress::{Context, LogLevel};

/// How much of a finished transfer is read back and compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationPolicy {
    Off,
    /// One chunk in four, plus the final chunk of every part
    Sparse,
    Full,
    /// Full, and write every digest to a `.sha256sums` sidecar
    FullWithHashExport,
}

impl fmt::Display for VerificationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::Sparse => write!(f, "sparse"),
            Self::Full => write!(f, "full"),
            Self::FullWithHashExport => write!(f, "full-export"),
        }
    }
}

impl FromStr for VerificationPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" => Ok(Self::Off),
            "sparse" => Ok(Self::Sparse),
            "full" => Ok(Self::Full),
            "full-export" | "full_with_hash_export" | "export" => Ok(Self::FullWithHashExport),
            _ => Err(EngineError::Config {
                reason: format!(
                    "invalid verification policy '{}' (off, sparse, full or full-export)",
                    s
                ),
            }),
        }
    }
}

impl VerificationPolicy {
    /// Whether chunk `index` (0-based within a part) gets compared.
    pub fn should_verify(&self, index: u64, is_last: bool) -> bool {
        match self {
            Self::Off => false,
            Self::Sparse => index % SPARSE_INTERVAL == 0 || is_last,
            Self::Full | Self::FullWithHashExport => true,
        }
    }

    pub fn exports_hashes(&self) -> bool {
        matches!(self, Self::FullWithHashExport)
    }
}

/// Sparse verification compares one chunk in this many.
pub const SPARSE_INTERVAL: u64 = 4;

/// Bytes of the digest that are compared.
pub const COMPARED_DIGEST_BYTES: usize = 16;

pub type ChunkDigest = sha2::digest::Output<Sha256>;

pub fn chunk_digest(data: &[u8]) -> ChunkDigest {
    Sha256::digest(data)
}

/// Compare the first half of two digests.
pub fn digests_match(a: &ChunkDigest, b: &ChunkDigest) -> bool {
    a[..COMPARED_DIGEST_BYTES] == b[..COMPARED_DIGEST_BYTES]
}

/// `<file>.sha256sums`
pub fn sidecar_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".sha256sums");
    PathBuf::from(name)
}

/// Writer for the hash sidecar: a `# chunksize:` header, then one lowercase hex
/// digest per line in transfer order.
pub struct HashExport {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl HashExport {
    pub fn create(path: &Path, chunk_bytes: u64) -> Result<Self, EngineError> {
        let file = File::create(path).map_err(|e| EngineError::file(path, e))?;
        let mut export = HashExport {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        };
        export.write_line(&format!("# chunksize: {}", chunk_bytes))?;
        Ok(export)
    }

    pub fn push(&mut self, digest: &ChunkDigest) -> Result<(), EngineError> {
        self.write_line(&format!("{:x}", digest))
    }

    pub fn finish(mut self) -> Result<PathBuf, EngineError> {
        self.writer
            .flush()
            .map_err(|e| EngineError::file(&self.path, e))?;
        Ok(self.path)
    }

    fn write_line(&mut self, line: &str) -> Result<(), EngineError> {
        writeln!(self.writer, "{}", line).map_err(|e| EngineError::file(&self.path, e))
    }
}

/// Compare the backup file at `path` with the device range starting at `lba_start`.
///
/// The file length decides how many sectors are compared. The direction does not
/// matter: after a backup the device is the source, after a restore it is the
/// destination. Honors cancellation between chunks.
pub fn verify_part(
    device: &mut dyn BlockDevice,
    lba_start: u64,
    path: &Path,
    ctx: &Context<'_>,
) -> Result<(), EngineError> {
    let policy = ctx.config.verification;
    if policy == VerificationPolicy::Off {
        return Ok(());
    }

    let mut file = File::open(path).map_err(|e| EngineError::file(path, e))?;
    let total_sectors = file
        .metadata()
        .map_err(|e| EngineError::file(path, e))?
        .len()
        / SECTOR_SIZE as u64;
    if total_sectors == 0 {
        return Ok(());
    }

    let chunk_sectors = ctx.config.chunk_sectors as u64;
    let chunk_count = (total_sectors + chunk_sectors - 1) / chunk_sectors;
    let mut export = if policy.exports_hashes() {
        Some(HashExport::create(&sidecar_path(path), ctx.config.chunk_bytes())?)
    } else {
        None
    };

    debug!(
        "Verifying {} ({} sectors, {} chunks, policy {})",
        path.display(),
        total_sectors,
        chunk_count,
        policy
    );
    ctx.log(
        LogLevel::Info,
        &format!("Verifying {}...", file_label(path)),
    );

    let mut device_buf = vec![0u8; ctx.config.chunk_bytes() as usize];
    let mut file_buf = vec![0u8; ctx.config.chunk_bytes() as usize];
    let mut prev_pct = None;

    for index in 0..chunk_count {
        let offset = index * chunk_sectors;
        let count = chunk_sectors.min(total_sectors - offset);
        let bytes = count as usize * SECTOR_SIZE;
        let lba = lba_start + offset;
        let is_last = index + 1 == chunk_count;

        if policy.should_verify(index, is_last) {
            let file_chunk = &mut file_buf[..bytes];
            file.read_exact(file_chunk)
                .map_err(|e| EngineError::file(path, e))?;
            let device_chunk = &mut device_buf[..bytes];
            device
                .read_sectors(lba, count as u32, device_chunk)
                .map_err(|e| EngineError::Io {
                    op: IoOp::Read,
                    lba,
                    retry_count: 1,
                    source: e,
                })?;

            let device_digest = chunk_digest(device_chunk);
            let file_digest = chunk_digest(file_chunk);
            if !digests_match(&device_digest, &file_digest) {
                ctx.log(
                    LogLevel::Error,
                    &format!("Verification failed at LBA 0x{:08X}", lba),
                );
                return Err(EngineError::VerificationFailed { lba });
            }
            if let Some(export) = export.as_mut() {
                export.push(&device_digest)?;
            }
        } else {
            skip_bytes(&mut file, bytes as u64, path)?;
        }

        let pct = ((index + 1) * 100 / chunk_count) as u32;
        if prev_pct != Some(pct) {
            ctx.progress.on_progress(pct);
            prev_pct = Some(pct);
        }

        if ctx.is_cancelled() {
            ctx.log(LogLevel::Warn, "Verification was cancelled");
            return Err(EngineError::Cancelled);
        }
    }

    if let Some(export) = export {
        let written = export.finish()?;
        debug!("Wrote hash sidecar {}", written.display());
    }
    Ok(())
}

fn skip_bytes(file: &mut File, bytes: u64, path: &Path) -> Result<(), EngineError> {
    use std::io::{Seek, SeekFrom};
    file.seek(SeekFrom::Current(bytes as i64))
        .map(|_| ())
        .map_err(|e| EngineError::file(path, e))
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
