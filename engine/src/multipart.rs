//! Multi-part backup files.
//!
//! Large images are split across numbered part files when the destination
//! filesystem cannot hold them in one file (FAT32) or when the card has less free
//! space than the image (partial backup). The next part index is persisted to
//! `partial.idx` before each new part is opened, so an interrupted backup can
//! resume where it left off.
//!
//! On restore the parts are discovered by probing sequential names.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info};

use crate::device::SECTOR_SIZE;
use crate::error::EngineError;
use crate::transfer::{ChunkDestination, ChunkGate, ChunkSource};

/// Largest file a FAT32 volume can hold.
pub const FAT32_MAX_FILE_SIZE: u64 = 0xFFFF_FFFF;

/// Resume marker file name, inside the job's directory.
pub const RESUME_FILE_NAME: &str = "partial.idx";

/// Part size of file-based emuMMC images.
pub const EMUMMC_PART_SIZE: u64 = 0xFE00_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Fat32,
    ExFat,
}

/// What the destination filesystem reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationFs {
    pub kind: FsKind,
    pub free_bytes: u64,
    /// Raw card capacity, used to pick the part size.
    pub capacity_bytes: u64,
}

/// How part files are named relative to their base path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartNaming {
    /// `rawnand.bin.00`, `rawnand.bin.01`, ...
    Dotted,
    /// `00`, `01`, ... inside the base directory (file-based emuMMC)
    Bare,
}

/// Two-digit index below 10, plain decimal otherwise.
pub fn part_suffix(index: u32) -> String {
    if index < 10 {
        format!("0{}", index)
    } else {
        index.to_string()
    }
}

/// `base.NN` for dotted naming; `base/NN` for bare naming.
pub fn part_path(base: &Path, naming: PartNaming, index: u32) -> PathBuf {
    match naming {
        PartNaming::Dotted => {
            let mut name = base.as_os_str().to_owned();
            name.push(".");
            name.push(part_suffix(index));
            PathBuf::from(name)
        }
        PartNaming::Bare => base.join(part_suffix(index)),
    }
}

/// Split parameters decided before a backup starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPlan {
    pub part_bytes: u64,
    /// Parts needed for the whole image
    pub part_count: u32,
    /// Parts that fit the free space (plus parts finished in earlier runs)
    pub max_parts: u32,
    /// Free space is short; pause when `max_parts` is reached
    pub partial: bool,
    /// First part written by this run
    pub resume_from: u32,
}

impl SplitPlan {
    pub fn part_sectors(&self) -> u64 {
        self.part_bytes / SECTOR_SIZE as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    Single,
    Split(SplitPlan),
}

/// Decide between a single output file and split parts.
///
/// `resume` is the index stored in the job's resume marker, if any. It is honored
/// only for images that exceed the FAT32 file limit, and forces partial mode.
pub fn plan_output(
    total_sectors: u64,
    fs: &DestinationFs,
    part_bytes: u64,
    resume: Option<u32>,
) -> Result<OutputLayout, EngineError> {
    let total_bytes = total_sectors * SECTOR_SIZE as u64;
    let mut max_parts = (fs.free_bytes / part_bytes).min(u32::MAX as u64) as u32;
    let mut partial = total_bytes > fs.free_bytes;
    let insufficient = || EngineError::InsufficientSpace {
        needed: total_bytes,
        available: fs.free_bytes,
    };

    if partial && max_parts == 0 {
        return Err(insufficient());
    }

    let mut resume_from = 0;
    if let Some(index) = resume {
        if total_bytes > FAT32_MAX_FILE_SIZE {
            if max_parts == 0 {
                return Err(insufficient());
            }
            info!("Partial backup in progress, continuing at part {}", index);
            partial = true;
            resume_from = index;
            max_parts = max_parts.saturating_add(index);
        }
    }

    let too_big_for_fat = fs.kind != FsKind::ExFat && total_bytes > FAT32_MAX_FILE_SIZE;
    if !(too_big_for_fat || partial) {
        return Ok(OutputLayout::Single);
    }

    let part_count = ((total_bytes + part_bytes - 1) / part_bytes) as u32;
    if resume_from >= part_count {
        return Err(EngineError::SizeMismatch {
            expected: part_count as u64,
            actual: resume_from as u64,
        });
    }
    debug!(
        "Splitting {} bytes into {} parts of {} bytes (partial: {}, max parts: {})",
        total_bytes, part_count, part_bytes, partial, max_parts
    );
    Ok(OutputLayout::Split(SplitPlan {
        part_bytes,
        part_count,
        max_parts,
        partial,
        resume_from,
    }))
}

/// The persisted "next part index" of an interrupted multi-part backup.
#[derive(Debug, Clone)]
pub struct ResumeMarker {
    path: PathBuf,
}

impl ResumeMarker {
    pub fn in_dir(dir: &Path) -> Self {
        ResumeMarker {
            path: dir.join(RESUME_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read the stored index, if a marker is present.
    pub fn load(&self) -> Result<Option<u32>, EngineError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::file(&self.path, e)),
        };
        let index = file
            .read_u32::<LittleEndian>()
            .map_err(|e| EngineError::file(&self.path, e))?;
        Ok(Some(index))
    }

    /// Persist `next_part` (4 bytes, little-endian) and sync it to disk.
    pub fn store(&self, next_part: u32) -> Result<(), EngineError> {
        let mut file = File::create(&self.path).map_err(|e| EngineError::file(&self.path, e))?;
        file.write_u32::<LittleEndian>(next_part)
            .and_then(|_| file.sync_all())
            .map_err(|e| EngineError::file(&self.path, e))
    }

    pub fn clear(&self) -> Result<(), EngineError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::file(&self.path, e)),
        }
    }
}

/// A finished output file and the first LBA it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenPart {
    pub path: PathBuf,
    pub lba_start: u64,
    pub sectors: u64,
}

#[derive(Debug)]
struct Split {
    plan: SplitPlan,
    naming: PartNaming,
    marker: Option<ResumeMarker>,
}

/// Destination that writes a region into one file or a sequence of parts.
///
/// Files are opened lazily at the first chunk, so an image ending exactly on a
/// part boundary never leaves an empty trailing part.
#[derive(Debug)]
pub struct PartWriter {
    base: PathBuf,
    split: Option<Split>,
    file: Option<File>,
    current_path: PathBuf,
    part_index: u32,
    bytes_in_part: u64,
    part_start_lba: u64,
    parts: Vec<WrittenPart>,
}

impl PartWriter {
    /// Write everything to `path`.
    pub fn single(path: &Path) -> Self {
        PartWriter {
            base: path.to_path_buf(),
            split: None,
            file: None,
            current_path: path.to_path_buf(),
            part_index: 0,
            bytes_in_part: 0,
            part_start_lba: 0,
            parts: Vec::new(),
        }
    }

    /// Write parts named from `base`, starting at `plan.resume_from`.
    ///
    /// With a marker, the next index is persisted before every new part.
    pub fn split(
        base: &Path,
        naming: PartNaming,
        plan: SplitPlan,
        marker: Option<ResumeMarker>,
    ) -> Self {
        PartWriter {
            base: base.to_path_buf(),
            current_path: part_path(base, naming, plan.resume_from),
            split: Some(Split {
                plan,
                naming,
                marker,
            }),
            file: None,
            part_index: plan.resume_from,
            bytes_in_part: 0,
            part_start_lba: 0,
            parts: Vec::new(),
        }
    }

    /// Path of the first file this writer produces.
    pub fn first_path(&self) -> &Path {
        &self.current_path
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Parts closed so far in this run.
    pub fn completed_parts(&self) -> &[WrittenPart] {
        &self.parts
    }

    /// Close the open file and return every part written in this run.
    pub fn finish(mut self) -> Result<Vec<WrittenPart>, EngineError> {
        self.close_current()?;
        Ok(self.parts)
    }

    /// Drop the file being written. Parts closed earlier stay on disk so a
    /// partial backup can resume.
    pub fn discard(mut self) -> Result<(), EngineError> {
        if self.file.take().is_some() {
            debug!("Removing incomplete output {}", self.current_path.display());
            match fs::remove_file(&self.current_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::file(&self.current_path, e)),
            }
        }
        Ok(())
    }

    fn open_current(&mut self, lba: u64) -> Result<(), EngineError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.current_path)
            .map_err(|e| EngineError::file(&self.current_path, e))?;
        self.file = Some(file);
        self.bytes_in_part = 0;
        self.part_start_lba = lba;
        Ok(())
    }

    fn close_current(&mut self) -> Result<(), EngineError> {
        if let Some(file) = self.file.take() {
            file.sync_all()
                .map_err(|e| EngineError::file(&self.current_path, e))?;
            self.parts.push(WrittenPart {
                path: self.current_path.clone(),
                lba_start: self.part_start_lba,
                sectors: self.bytes_in_part / SECTOR_SIZE as u64,
            });
        }
        Ok(())
    }
}

impl ChunkDestination for PartWriter {
    fn begin_chunk(&mut self, lba: u64) -> Result<ChunkGate, EngineError> {
        let rollover = match &self.split {
            Some(split) => self.file.is_some() && self.bytes_in_part >= split.plan.part_bytes,
            None => false,
        };

        if rollover {
            self.close_current()?;
            let next = self.part_index + 1;
            if let Some(split) = &self.split {
                // The marker must never under-report progress.
                if let Some(marker) = &split.marker {
                    marker.store(next)?;
                }
                self.part_index = next;
                self.current_path = part_path(&self.base, split.naming, next);
                if split.plan.partial && next >= split.plan.max_parts {
                    info!("Destination full, pausing before part {}", next);
                    return Ok(ChunkGate::Pause { next_part: next });
                }
            }
            debug!("Opening part {}", self.current_path.display());
        }

        if self.file.is_none() {
            self.open_current(lba)?;
        }
        Ok(ChunkGate::Proceed)
    }

    fn write_chunk(&mut self, _lba: u64, _count: u32, buf: &[u8]) -> io::Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no part file open"))?;
        // Rewind on every attempt so a retried chunk never lands twice.
        file.seek(SeekFrom::Start(self.bytes_in_part))?;
        file.write_all(buf)?;
        self.bytes_in_part += buf.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.sync_data(),
            None => Ok(()),
        }
    }

    fn part_index(&self) -> u32 {
        self.part_index
    }

    fn bytes_in_part(&self) -> u64 {
        self.bytes_in_part
    }

    fn chunk_limit(&self) -> Option<u64> {
        self.split
            .as_ref()
            .map(|split| split.plan.part_bytes.saturating_sub(self.bytes_in_part) / SECTOR_SIZE as u64)
    }
}

/// Files found for a restore, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSource {
    pub files: Vec<(PathBuf, u64)>,
    pub split: bool,
}

impl RestoreSource {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|(_, len)| len).sum()
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_bytes() / SECTOR_SIZE as u64
    }

    /// First LBA of each file when the source is laid out from `lba_start`.
    pub fn part_offsets(&self, lba_start: u64) -> Vec<(PathBuf, u64)> {
        let mut lba = lba_start;
        self.files
            .iter()
            .map(|(path, len)| {
                let entry = (path.clone(), lba);
                lba += len / SECTOR_SIZE as u64;
                entry
            })
            .collect()
    }
}

/// Probe `base.00`, `base.01`, ... until a name is missing.
///
/// Every part except the last must be a multiple of `alignment` bytes.
pub fn discover_parts(
    base: &Path,
    naming: PartNaming,
    alignment: u64,
) -> Result<Vec<(PathBuf, u64)>, EngineError> {
    let mut found = Vec::new();
    let mut index = 0u32;
    loop {
        let path = part_path(base, naming, index);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => found.push((path, meta.len())),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(EngineError::file(&path, e)),
        }
        index += 1;
    }

    if let Some((_, head)) = found.split_last() {
        if let Some((path, _)) = head.iter().find(|(_, len)| len % alignment != 0) {
            return Err(EngineError::MisalignedPart {
                path: path.clone(),
                alignment,
            });
        }
    }
    debug!("Found {} part files for {}", found.len(), base.display());
    Ok(found)
}

/// Find the backup for `base`: the single file if present, otherwise its parts.
pub fn locate_restore_source(
    base: &Path,
    naming: PartNaming,
    alignment: u64,
) -> Result<RestoreSource, EngineError> {
    if naming == PartNaming::Dotted {
        if let Ok(meta) = fs::metadata(base) {
            if meta.is_file() {
                return Ok(RestoreSource {
                    files: vec![(base.to_path_buf(), meta.len())],
                    split: false,
                });
            }
        }
    }

    let files = discover_parts(base, naming, alignment)?;
    if files.is_empty() {
        return Err(EngineError::MissingSource {
            path: base.to_path_buf(),
        });
    }
    Ok(RestoreSource { files, split: true })
}

/// Source that reads a region back from one or more files as a single stream.
#[derive(Debug)]
pub struct PartReader {
    files: Vec<(PathBuf, u64)>,
    lba_start: u64,
    open: Option<(usize, File)>,
}

impl PartReader {
    /// `lba_start` is the device LBA the first byte of the first file maps to.
    pub fn new(source: &RestoreSource, lba_start: u64) -> Self {
        PartReader {
            files: source.files.clone(),
            lba_start,
            open: None,
        }
    }

    fn file_at(&mut self, index: usize) -> io::Result<&mut File> {
        let reopen = !matches!(&self.open, Some((open_index, _)) if *open_index == index);
        if reopen {
            let file = File::open(&self.files[index].0)?;
            self.open = Some((index, file));
        }
        match self.open.as_mut() {
            Some((_, file)) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "part file not open")),
        }
    }
}

impl ChunkSource for PartReader {
    fn read_chunk(&mut self, lba: u64, _count: u32, buf: &mut [u8]) -> io::Result<()> {
        let mut offset = lba
            .checked_sub(self.lba_start)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "LBA before source start"))?
            * SECTOR_SIZE as u64;
        let mut filled = 0usize;

        for index in 0..self.files.len() {
            if filled == buf.len() {
                break;
            }
            let len = self.files[index].1;
            if offset >= len {
                offset -= len;
                continue;
            }
            let take = ((len - offset) as usize).min(buf.len() - filled);
            let file = self.file_at(index)?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf[filled..filled + take])?;
            filled += take;
            offset = 0;
        }

        if filled < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "backup files end before the requested sectors",
            ));
        }
        Ok(())
    }
}
