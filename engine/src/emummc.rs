//! emuMMC creation and discovery.
//!
//! An emuMMC is a copy of the eMMC kept on the SD card, either as files under
//! `emuMMC/SDnn/eMMC/` or inside a dedicated SD partition. In the partition
//! variant BOOT0, BOOT1 and the GPP sit at `sector_start + 0x2000 * n`.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::{debug, info};

use crate::device::{BlockDevice, OffsetDevice, SECTOR_SIZE};
use crate::error::{EngineError, IoOp};
use crate::gpt::{GptHeader, GPT_SIGNATURE};
use crate::mbr::{Mbr, MBR_TYPE_EMUMMC, MBR_TYPE_GPT_PROTECTIVE, MBR_TYPE_LINUX};
use crate::model::{Direction, Outcome, Region, TransferJob};
use crate::multipart::{
    DestinationFs, PartNaming, PartWriter, SplitPlan, WrittenPart, EMUMMC_PART_SIZE,
};
use crate::progress::{Context, LogLevel};
use crate::storage::{MmcStorage, PhysicalPartition, EMUMMC_PART_STRIDE};
use crate::transfer::{transfer, ChunkDestination, DeviceEndpoint};

pub const EMUMMC_DIR: &str = "emuMMC";
pub const CONFIG_FILE_NAME: &str = "emummc.ini";
pub const FILE_BASED_MARKER: &str = "file_based";
pub const RAW_BASED_MARKER: &str = "raw_based";

/// Smallest partition considered when looking for an existing emuMMC (2 GiB).
pub const MIN_BACKUP_PARTITION_SECTORS: u64 = 0x40_0000;

/// Space left in front of the emuMMC inside its partition.
pub const PARTITION_RESERVED_SECTORS: u64 = 0x8000;

/// Space taken by BOOT0 and BOOT1 in front of the GPP.
pub const BOOT_AREA_SECTORS: u64 = 2 * EMUMMC_PART_STRIDE;

const MAX_FILE_SLOTS: u32 = 100;
const MBR_TYPE_UNUSABLE: u8 = 0xFF;

/// What [`find_emummc_partition`] is looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionLookup {
    /// An existing emuMMC to back up or restore
    Backup,
    /// A partition large enough to receive `needed_sectors`
    Restore { needed_sectors: u64 },
}

/// An emuMMC location on the SD card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmummcPartition {
    /// MBR entry index (1..=3)
    pub part_index: usize,
    /// Where BOOT0 starts
    pub sector_start: u64,
    /// GPP size for an existing emuMMC; usable partition size otherwise
    pub sector_count: u64,
}

fn sd_read(sd: &mut dyn BlockDevice, lba: u64, buf: &mut [u8]) -> Result<(), EngineError> {
    sd.read_sectors(lba, 1, buf).map_err(|e| EngineError::Io {
        op: IoOp::Read,
        lba,
        retry_count: 1,
        source: e,
    })
}

fn has_gpt_header(sd: &mut dyn BlockDevice, lba: u64) -> Result<bool, EngineError> {
    if lba >= sd.sector_count() {
        return Ok(false);
    }
    let mut sector = vec![0u8; SECTOR_SIZE];
    sd_read(sd, lba, &mut sector)?;
    Ok(&sector[..GPT_SIGNATURE.len()] == GPT_SIGNATURE)
}

/// Scan MBR entries 1 to 3 for an emuMMC partition.
///
/// In backup mode the entry must be type 0xE0, at least 2 GiB, and hold a GPT
/// at `start + 0xC001` (after the 16 MiB reserve) or at `start + 0x4001`. The
/// GPP size is taken from that GPT's backup header LBA.
///
/// In restore mode the first non-Linux, non-GPT entry with room for
/// `needed_sectors` plus the reserve is returned, with `sector_start` past the reserve.
pub fn find_emummc_partition(
    sd: &mut dyn BlockDevice,
    lookup: PartitionLookup,
) -> Result<Option<EmummcPartition>, EngineError> {
    let mbr = Mbr::read_from(sd)?;

    for (part_index, entry) in mbr.partitions.iter().enumerate().skip(1) {
        let start = entry.start_sct as u64;
        let size = entry.size_sct as u64;
        if start == 0 {
            continue;
        }

        match lookup {
            PartitionLookup::Backup => {
                if entry.part_type != MBR_TYPE_EMUMMC || size < MIN_BACKUP_PARTITION_SECTORS {
                    continue;
                }
                let reserved = start + PARTITION_RESERVED_SECTORS;
                let sector_start = if has_gpt_header(sd, reserved + BOOT_AREA_SECTORS + 1)? {
                    reserved
                } else if has_gpt_header(sd, start + BOOT_AREA_SECTORS + 1)? {
                    start
                } else {
                    continue;
                };

                let mut sector = vec![0u8; SECTOR_SIZE];
                sd_read(sd, sector_start + BOOT_AREA_SECTORS + 1, &mut sector)?;
                let header = GptHeader::parse(&sector)?;
                let gpp_sectors = header.alt_lba + 1;
                if size <= gpp_sectors {
                    debug!("emuMMC GPT in partition {} is larger than the partition", part_index);
                    return Ok(None);
                }
                debug!(
                    "Found emuMMC in partition {} at {:#X} ({} GPP sectors)",
                    part_index, sector_start, gpp_sectors
                );
                return Ok(Some(EmummcPartition {
                    part_index,
                    sector_start,
                    sector_count: gpp_sectors,
                }));
            }
            PartitionLookup::Restore { needed_sectors } => {
                let usable = !matches!(
                    entry.part_type,
                    MBR_TYPE_LINUX | MBR_TYPE_GPT_PROTECTIVE | MBR_TYPE_UNUSABLE
                );
                if usable && size >= needed_sectors + PARTITION_RESERVED_SECTORS {
                    return Ok(Some(EmummcPartition {
                        part_index,
                        sector_start: start + PARTITION_RESERVED_SECTORS,
                        sector_count: size - PARTITION_RESERVED_SECTORS,
                    }));
                }
            }
        }
    }
    Ok(None)
}

/// Contents of `emuMMC/emummc.ini`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmummcConfig {
    /// MBR entry of a partition-based emuMMC
    pub part_index: Option<usize>,
    pub sector_start: u64,
    /// Base folder, relative to the SD root
    pub path: Option<String>,
}

impl EmummcConfig {
    pub fn to_ini(&self) -> String {
        let enabled = match (self.part_index, &self.path) {
            (Some(index), _) if self.sector_start != 0 => index,
            (_, Some(_)) => 1,
            _ => 0,
        };
        let mut out = format!("[emummc]\nenabled={}\nsector=0x{:x}", enabled, self.sector_start);
        if let Some(path) = &self.path {
            out.push_str(&format!("\npath={}", path));
        }
        out.push_str("\nid=0x0000\nnintendo_path=");
        if let Some(path) = &self.path {
            out.push_str(path);
            out.push_str("/Nintendo");
        }
        out.push('\n');
        out
    }

    /// Replace `emuMMC/emummc.ini` under `sd_root`.
    pub fn write(&self, sd_root: &Path) -> Result<PathBuf, EngineError> {
        let dir = sd_root.join(EMUMMC_DIR);
        fs::create_dir_all(&dir).map_err(|e| EngineError::file(&dir, e))?;
        let path = dir.join(CONFIG_FILE_NAME);
        fs::write(&path, self.to_ini()).map_err(|e| EngineError::file(&path, e))?;
        Ok(path)
    }
}

/// Result of building an emuMMC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmummcReport {
    pub outcome: Outcome,
    /// The emuMMC's base folder
    pub path: PathBuf,
}

fn copy_partition(
    storage: &mut dyn MmcStorage,
    partition: PhysicalPartition,
    dest: &mut dyn ChunkDestination,
    ctx: &Context<'_>,
) -> Result<Outcome, EngineError> {
    let device = storage.partition(partition)?;
    let region = Region::with_len(partition.to_string(), 0, device.sector_count())?;
    ctx.log(LogLevel::Info, &format!("Copying {}...", region));
    let mut job = TransferJob::new(region, Direction::Backup);
    let mut source = DeviceEndpoint::new(device);
    transfer(&mut job, &mut source, dest, ctx)
}

fn free_file_slot(sd_root: &Path) -> Result<(String, PathBuf), EngineError> {
    (0..MAX_FILE_SLOTS)
        .map(|slot| {
            let relative = format!("{}/SD{:02}", EMUMMC_DIR, slot);
            let path = sd_root.join(&relative);
            (relative, path)
        })
        .find(|(_, path)| !path.exists())
        .ok_or_else(|| EngineError::Config {
            reason: format!("all {} file-based emuMMC slots are in use", MAX_FILE_SLOTS),
        })
}

/// Copy the eMMC into the first free `emuMMC/SDnn/` folder.
///
/// BOOT0 and BOOT1 become single files, the GPP is split into 0xFE000000-byte
/// parts named `00`, `01`, ... The `file_based` marker and `emummc.ini` are
/// written only after everything else succeeded.
pub fn create_file_emummc(
    storage: &mut dyn MmcStorage,
    sd_root: &Path,
    fs_info: &DestinationFs,
    ctx: &Context<'_>,
) -> Result<EmummcReport, EngineError> {
    let mut total_bytes = 0u64;
    for partition in [PhysicalPartition::Boot0, PhysicalPartition::Boot1, PhysicalPartition::Gpp] {
        total_bytes += storage.partition(partition)?.sector_count() * SECTOR_SIZE as u64;
    }
    if total_bytes > fs_info.free_bytes {
        ctx.log(LogLevel::Error, "Not enough free space for the emuMMC");
        return Err(EngineError::InsufficientSpace {
            needed: total_bytes,
            available: fs_info.free_bytes,
        });
    }

    let (relative, base) = free_file_slot(sd_root)?;
    let emmc_dir = base.join("eMMC");
    fs::create_dir_all(&emmc_dir).map_err(|e| EngineError::file(&emmc_dir, e))?;
    info!("Creating file-based emuMMC in {}", base.display());

    for partition in [PhysicalPartition::Boot0, PhysicalPartition::Boot1] {
        let mut writer = PartWriter::single(&emmc_dir.join(partition.to_string()));
        let outcome = finish_writer(copy_partition(storage, partition, &mut writer, ctx), writer)?;
        if outcome != Outcome::Success {
            return Ok(EmummcReport { outcome, path: base });
        }
    }

    let gpp_bytes = storage.partition(PhysicalPartition::Gpp)?.sector_count() * SECTOR_SIZE as u64;
    let part_count = ((gpp_bytes + EMUMMC_PART_SIZE - 1) / EMUMMC_PART_SIZE) as u32;
    let plan = SplitPlan {
        part_bytes: EMUMMC_PART_SIZE,
        part_count,
        max_parts: part_count,
        partial: false,
        resume_from: 0,
    };
    let mut writer = PartWriter::split(&emmc_dir, PartNaming::Bare, plan, None);
    let outcome = finish_writer(
        copy_partition(storage, PhysicalPartition::Gpp, &mut writer, ctx),
        writer,
    )?;
    if outcome != Outcome::Success {
        return Ok(EmummcReport { outcome, path: base });
    }

    let marker = base.join(FILE_BASED_MARKER);
    File::create(&marker).map_err(|e| EngineError::file(&marker, e))?;
    EmummcConfig {
        part_index: None,
        sector_start: 0,
        path: Some(relative),
    }
    .write(sd_root)?;

    ctx.log(LogLevel::Info, &format!("emuMMC created in {}", base.display()));
    Ok(EmummcReport {
        outcome: Outcome::Success,
        path: base,
    })
}

/// Close the writer after a copy; drop the unfinished file on error or cancel.
fn finish_writer(
    result: Result<Outcome, EngineError>,
    writer: PartWriter,
) -> Result<Outcome, EngineError> {
    match result {
        Ok(Outcome::Success) => {
            let parts: Vec<WrittenPart> = writer.finish()?;
            debug!("Wrote {} files", parts.len());
            Ok(Outcome::Success)
        }
        Ok(outcome) => {
            writer.discard()?;
            Ok(outcome)
        }
        Err(e) => {
            writer.discard()?;
            Err(e)
        }
    }
}

/// Copy the eMMC into SD partition `part_index`, starting at `sector_start`.
///
/// After the GPP is copied the partition is hidden by setting its MBR type to
/// 0xE0. `emuMMC/RAW<idx>/raw_based` records `sector_start`.
pub fn create_raw_emummc(
    storage: &mut dyn MmcStorage,
    sd: &mut dyn BlockDevice,
    part_index: usize,
    sector_start: u64,
    sd_root: &Path,
    ctx: &Context<'_>,
) -> Result<EmummcReport, EngineError> {
    if !(1..=3).contains(&part_index) {
        return Err(EngineError::Config {
            reason: format!("emuMMC partition index must be 1 to 3, got {}", part_index),
        });
    }
    let start_field = u32::try_from(sector_start).map_err(|_| EngineError::Config {
        reason: format!("emuMMC sector {:#X} does not fit 32 bits", sector_start),
    })?;

    let boot_sectors = storage.partition(PhysicalPartition::Boot0)?.sector_count();
    if boot_sectors > EMUMMC_PART_STRIDE {
        return Err(EngineError::LayoutConstraintViolated {
            reason: format!("boot partitions of {} sectors do not fit the emuMMC layout", boot_sectors),
        });
    }
    let gpp_sectors = storage.partition(PhysicalPartition::Gpp)?.sector_count();

    let entry = Mbr::read_from(sd)?.partitions[part_index];
    let part_start = entry.start_sct as u64;
    let part_end = part_start + entry.size_sct as u64;
    let needed_end = sector_start + BOOT_AREA_SECTORS + gpp_sectors;
    if sector_start < part_start || needed_end > part_end {
        return Err(EngineError::InsufficientSpace {
            needed: (BOOT_AREA_SECTORS + gpp_sectors) * SECTOR_SIZE as u64,
            available: part_end.saturating_sub(sector_start) * SECTOR_SIZE as u64,
        });
    }

    info!(
        "Creating raw emuMMC in partition {} at {:#X}",
        part_index, sector_start
    );
    for partition in [PhysicalPartition::Boot0, PhysicalPartition::Boot1, PhysicalPartition::Gpp] {
        let sectors = storage.partition(partition)?.sector_count();
        let offset = sector_start + EMUMMC_PART_STRIDE * partition.index();
        let mut window = OffsetDevice::new(&mut *sd, offset, sectors)?;
        let mut dest = DeviceEndpoint::new(&mut window);
        let outcome = copy_partition(storage, partition, &mut dest, ctx)?;
        if outcome != Outcome::Success {
            return Ok(EmummcReport {
                outcome,
                path: sd_root.join(format!("{}/RAW{}", EMUMMC_DIR, part_index)),
            });
        }
    }

    let mut mbr = Mbr::read_from(sd)?;
    mbr.partitions[part_index].part_type = MBR_TYPE_EMUMMC;
    mbr.write_to(sd)?;
    debug!("Partition {} hidden as type {:#04X}", part_index, MBR_TYPE_EMUMMC);

    let relative = format!("{}/RAW{}", EMUMMC_DIR, part_index);
    let base = sd_root.join(&relative);
    fs::create_dir_all(&base).map_err(|e| EngineError::file(&base, e))?;
    let marker = base.join(RAW_BASED_MARKER);
    let mut file = File::create(&marker).map_err(|e| EngineError::file(&marker, e))?;
    file.write_u32::<LittleEndian>(start_field)
        .and_then(|_| file.flush())
        .map_err(|e| EngineError::file(&marker, e))?;

    EmummcConfig {
        part_index: Some(part_index),
        sector_start,
        path: Some(relative),
    }
    .write(sd_root)?;

    ctx.log(LogLevel::Info, &format!("emuMMC created in partition {}", part_index));
    Ok(EmummcReport {
        outcome: Outcome::Success,
        path: base,
    })
}
