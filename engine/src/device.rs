//! Sector-addressed block devices.
//!
//! The engine only ever talks to storage through [`BlockDevice`]. Concrete
//! devices provided here:
//! - [`FileBlockDevice`]: an image file (or a device node opened as a file)
//! - [`MemoryBlockDevice`]: an in-memory device
//! - [`OffsetDevice`]: a window into another device, used for partition-based emuMMC
//!
//! A [`FileBlockDevice`] holds its path exclusively: opening the same image or
//! device node a second time fails with `DeviceBusy` until the first is dropped.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::EngineError;

/// Size of one sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sector read/write capability over an eMMC or SD physical partition.
pub trait BlockDevice {
    /// Read `count` sectors starting at `lba` into `buf` (`count * 512` bytes).
    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> io::Result<()>;

    /// Write `count` sectors starting at `lba` from `buf` (`count * 512` bytes).
    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()>;

    /// Total number of addressable sectors.
    fn sector_count(&self) -> u64;

    /// Force buffered writes to stable storage.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_sectors(lba, count, buf)
    }

    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()> {
        (**self).write_sectors(lba, count, buf)
    }

    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_sectors(lba, count, buf)
    }

    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()> {
        (**self).write_sectors(lba, count, buf)
    }

    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Validate an access against the device bounds and buffer length.
fn check_access(sectors: u64, lba: u64, count: u32, buf_len: usize) -> io::Result<()> {
    if buf_len != count as usize * SECTOR_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("buffer holds {} bytes, {} sectors requested", buf_len, count),
        ));
    }
    match lba.checked_add(count as u64) {
        Some(end) if end <= sectors => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "access of {} sectors at LBA {:#X} exceeds device size {:#X}",
                count, lba, sectors
            ),
        )),
    }
}

/// Block device backed by a regular file.
#[derive(Debug)]
pub struct FileBlockDevice {
    file: File,
    path: PathBuf,
    sectors: u64,
    _lease: DeviceLease,
}

impl FileBlockDevice {
    /// Open an existing image read/write. Trailing bytes past the last whole
    /// sector are ignored.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let lease = DeviceLease::acquire(path)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| EngineError::file(path, e))?;
        let len = file
            .metadata()
            .map_err(|e| EngineError::file(path, e))?
            .len();
        Ok(FileBlockDevice {
            file,
            path: path.to_path_buf(),
            sectors: len / SECTOR_SIZE as u64,
            _lease: lease,
        })
    }

    /// Create (or truncate) a zero-filled image of `sectors` sectors.
    pub fn create(path: &Path, sectors: u64) -> Result<Self, EngineError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| EngineError::file(path, e))?;
        // Claim the path before clearing it, so a device in use is never wiped.
        let lease = DeviceLease::acquire(path)?;
        file.set_len(0)
            .and_then(|_| file.set_len(sectors * SECTOR_SIZE as u64))
            .map_err(|e| EngineError::file(path, e))?;
        Ok(FileBlockDevice {
            file,
            path: path.to_path_buf(),
            sectors,
            _lease: lease,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> io::Result<()> {
        check_access(self.sectors, lba, count, buf.len())?;
        self.file.seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))?;
        self.file.read_exact(buf)
    }

    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()> {
        check_access(self.sectors, lba, count, buf.len())?;
        self.file.seek(SeekFrom::Start(lba * SECTOR_SIZE as u64))?;
        self.file.write_all(buf)
    }

    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// Block device held entirely in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlockDevice {
    data: Vec<u8>,
}

impl MemoryBlockDevice {
    pub fn new(sectors: u64) -> Self {
        MemoryBlockDevice {
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
        }
    }

    /// Wrap raw bytes; the length is truncated to whole sectors.
    pub fn from_bytes(mut data: Vec<u8>) -> Self {
        let whole = data.len() - data.len() % SECTOR_SIZE;
        data.truncate(whole);
        MemoryBlockDevice { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Borrow the bytes of one sector range.
    pub fn sectors(&self, lba: u64, count: u64) -> &[u8] {
        let start = lba as usize * SECTOR_SIZE;
        &self.data[start..start + count as usize * SECTOR_SIZE]
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> io::Result<()> {
        check_access(self.sector_count(), lba, count, buf.len())?;
        let start = lba as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()> {
        check_access(self.sector_count(), lba, count, buf.len())?;
        let start = lba as usize * SECTOR_SIZE;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }
}

/// A window of `sectors` sectors into `inner`, starting at `offset`.
///
/// LBA 0 of the window maps to `offset` on the inner device.
#[derive(Debug)]
pub struct OffsetDevice<D> {
    inner: D,
    offset: u64,
    sectors: u64,
}

impl<D: BlockDevice> OffsetDevice<D> {
    pub fn new(inner: D, offset: u64, sectors: u64) -> Result<Self, EngineError> {
        let mut window = OffsetDevice {
            inner,
            offset: 0,
            sectors: 0,
        };
        window.retarget(offset, sectors)?;
        Ok(window)
    }

    /// Move the window. The new range must lie inside the inner device.
    pub fn retarget(&mut self, offset: u64, sectors: u64) -> Result<(), EngineError> {
        match offset.checked_add(sectors) {
            Some(end) if end <= self.inner.sector_count() => {
                self.offset = offset;
                self.sectors = sectors;
                Ok(())
            }
            _ => Err(EngineError::InvalidRegion {
                name: "window".to_string(),
                lba_start: offset,
                lba_end: offset.saturating_add(sectors),
            }),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn inner_mut(&mut self) -> &mut D {
        &mut self.inner
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D: BlockDevice> BlockDevice for OffsetDevice<D> {
    fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> io::Result<()> {
        check_access(self.sectors, lba, count, buf.len())?;
        self.inner.read_sectors(self.offset + lba, count, buf)
    }

    fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()> {
        check_access(self.sectors, lba, count, buf.len())?;
        self.inner.write_sectors(self.offset + lba, count, buf)
    }

    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Canonical paths of every open [`FileBlockDevice`].
static OPEN_DEVICES: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

/// Exclusive hold on a device path, released on drop.
#[derive(Debug)]
struct DeviceLease {
    key: PathBuf,
}

impl DeviceLease {
    fn acquire(path: &Path) -> Result<Self, EngineError> {
        let key = path.canonicalize().map_err(|e| EngineError::file(path, e))?;
        let mut open = OPEN_DEVICES.lock().unwrap_or_else(PoisonError::into_inner);
        if !open.insert(key.clone()) {
            return Err(EngineError::DeviceBusy {
                path: path.to_path_buf(),
            });
        }
        Ok(DeviceLease { key })
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut open = OPEN_DEVICES.lock().unwrap_or_else(PoisonError::into_inner);
        open.remove(&self.key);
    }
}
