//! Writing partition tables to a device.
//!
//! [`LayoutTable`] is the bit-exact result of a [`PartitionPlan`]: the MBR, the
//! optional GPT, and the sector ranges to clear. [`write_layout`] puts it on the
//! device in a fixed order. [`fix_hybrid_mbr`] rebuilds the MBR of an existing
//! hybrid card from its GPT.

use tracing::{debug, info};

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{EngineError, IoOp};
use crate::gpt::{read_gpt, Gpt, GptEntry, GptHeader, Guid, GPT_ENTRY_SECTORS, GPT_MAX_ENTRIES};
use crate::mbr::{
    Mbr, MbrEntry, MBR_TYPE_EMUMMC, MBR_TYPE_FAT32_LBA, MBR_TYPE_GPT_PROTECTIVE, MBR_TYPE_LINUX,
};
use crate::planner::{AndroidScheme, PartitionPlan, LAYOUT_BASE_LBA, MIB_SECTORS};
use crate::progress::{Context, LogLevel};

/// Sectors cleared at the start of each new Linux or Android partition.
pub const PARTITION_CLEAR_SECTORS: u64 = 0x800;
/// Sectors held back at the end of the last partition.
pub const TAIL_RESERVE_SECTORS: u64 = 0x800;

/// Android partitions in front of user data, as (name, sectors).
const ANDROID_LEGACY_HEAD: &[(&str, u64)] = &[("vendor", 0x20_0000), ("APP", 0x40_0000)];
const ANDROID_DYNAMIC_HEAD: &[(&str, u64)] = &[("super", 0x60_0000)];
const ANDROID_COMMON: &[(&str, u64)] = &[
    ("LNX", 0x1_0000),
    ("SOS", 0x2_0000),
    ("DTB", 0x800),
    ("MDA", 0x8000),
    ("CAC", 0x15_E000),
    ("MSC", 0x1800),
];
/// Sum of every Android partition except UDA, in either scheme.
const ANDROID_RESERVED_SECTORS: u64 = 0x79_8000;

/// A sector range to overwrite with zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZeroRange {
    pub lba: u64,
    pub sectors: u64,
}

/// Everything [`write_layout`] puts on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutTable {
    pub device_sectors: u64,
    pub mbr: Mbr,
    pub gpt: Option<Gpt>,
    pub zero_ranges: Vec<ZeroRange>,
}

fn sector_u32(value: u64, what: &str) -> Result<u32, EngineError> {
    u32::try_from(value).map_err(|_| EngineError::LayoutConstraintViolated {
        reason: format!("{} ({:#X}) does not fit an MBR entry", what, value),
    })
}

fn random_u32() -> u32 {
    let bytes = Guid::random().0;
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl LayoutTable {
    pub(crate) fn from_plan(plan: &PartitionPlan, previous: Option<&Mbr>) -> Result<Self, EngineError> {
        let sec_cnt = plan.device_sectors();
        let hos_sct = plan.hos_mib() * MIB_SECTORS;
        let linux_sct = plan.linux_mib() * MIB_SECTORS;
        let android_sct = plan.android_mib() * MIB_SECTORS;
        let emu_sct = plan.emummc_mib() * MIB_SECTORS;

        let mut mbr = Mbr::default();
        if let Some(old) = previous {
            mbr.carry_bootstrap_metadata(old);
        }
        mbr.signature = random_u32();

        let mut zero_ranges = vec![ZeroRange {
            lba: 0,
            sectors: LAYOUT_BASE_LBA,
        }];

        let hos_size = if plan.hos_only() {
            hos_sct + plan.alignment_sectors()
        } else {
            hos_sct
        };
        mbr.partitions[0] = MbrEntry::new(
            MBR_TYPE_FAT32_LBA,
            LAYOUT_BASE_LBA as u32,
            sector_u32(hos_size, "data partition size")?,
        );

        let mut mbr_idx = 1;
        let linux_start = LAYOUT_BASE_LBA + hos_sct;
        if linux_sct > 0 {
            zero_ranges.push(ZeroRange {
                lba: linux_start,
                sectors: PARTITION_CLEAR_SECTORS,
            });
            if android_sct == 0 {
                mbr.partitions[mbr_idx] = MbrEntry::new(
                    MBR_TYPE_LINUX,
                    sector_u32(linux_start, "Linux start")?,
                    sector_u32(linux_sct, "Linux size")?,
                );
                mbr_idx += 1;
            }
        }

        let emu_start = LAYOUT_BASE_LBA + hos_sct + linux_sct + android_sct;
        if emu_sct > 0 {
            if plan.emummc_double() {
                let half = emu_sct / 2;
                mbr.partitions[mbr_idx] = MbrEntry::new(
                    MBR_TYPE_EMUMMC,
                    sector_u32(emu_start, "emuMMC start")?,
                    sector_u32(half, "emuMMC size")?,
                );
                mbr_idx += 1;
                mbr.partitions[mbr_idx] = MbrEntry::new(
                    MBR_TYPE_EMUMMC,
                    sector_u32(emu_start + half, "emuMMC 2 start")?,
                    sector_u32(half - TAIL_RESERVE_SECTORS, "emuMMC 2 size")?,
                );
            } else {
                mbr.partitions[mbr_idx] = MbrEntry::new(
                    MBR_TYPE_EMUMMC,
                    sector_u32(emu_start, "emuMMC start")?,
                    sector_u32(emu_sct - TAIL_RESERVE_SECTORS, "emuMMC size")?,
                );
            }
            mbr_idx += 1;
        }

        let gpt = if plan.needs_gpt() {
            mbr.partitions[mbr_idx] = MbrEntry::new(
                MBR_TYPE_GPT_PROTECTIVE,
                1,
                sector_u32(sec_cnt - 1, "device size")?,
            );
            Some(build_gpt(plan, &mbr, &mut zero_ranges))
        } else {
            None
        };

        Ok(LayoutTable {
            device_sectors: sec_cnt,
            mbr,
            gpt,
            zero_ranges,
        })
    }
}

fn build_gpt(plan: &PartitionPlan, mbr: &Mbr, zero_ranges: &mut Vec<ZeroRange>) -> Gpt {
    let sec_cnt = plan.device_sectors();
    let mut disk_guid = Guid::random();
    disk_guid.0[10..].copy_from_slice(b"NYXGPT");

    let mut entries = Vec::with_capacity(GPT_MAX_ENTRIES as usize);

    let hos = &mbr.partitions[0];
    let mut hos_entry = GptEntry::new(
        "hos_data",
        Guid::BASIC_DATA,
        hos.start_sct as u64,
        hos.start_sct as u64 + hos.size_sct as u64 - 1,
    );
    // Clear the Windows-specific attribute bits carried in the instance GUID.
    hos_entry.part_guid.0[7] = 0;
    entries.push(hos_entry);

    let mut cur = LAYOUT_BASE_LBA + plan.hos_mib() * MIB_SECTORS;
    let linux_sct = plan.linux_mib() * MIB_SECTORS;
    if linux_sct > 0 {
        entries.push(GptEntry::new("l4t", Guid::LINUX_DATA, cur, cur + linux_sct - 1));
        cur += linux_sct;
    }

    let head = match plan.android_scheme() {
        AndroidScheme::Legacy => ANDROID_LEGACY_HEAD,
        AndroidScheme::Dynamic => ANDROID_DYNAMIC_HEAD,
    };
    for &(name, sectors) in head.iter().chain(ANDROID_COMMON) {
        entries.push(GptEntry::new(name, Guid::LINUX_DATA, cur, cur + sectors - 1));
        let clear = if name == "MDA" { sectors } else { PARTITION_CLEAR_SECTORS };
        zero_ranges.push(ZeroRange {
            lba: cur,
            sectors: clear,
        });
        cur += sectors;
    }

    let mut user_sct = plan.android_mib() * MIB_SECTORS - ANDROID_RESERVED_SECTORS;
    if plan.emummc_mib() == 0 {
        user_sct -= TAIL_RESERVE_SECTORS;
    }
    entries.push(GptEntry::new("UDA", Guid::LINUX_DATA, cur, cur + user_sct - 1));
    zero_ranges.push(ZeroRange {
        lba: cur,
        sectors: PARTITION_CLEAR_SECTORS,
    });
    cur += user_sct;

    let emu_sct = plan.emummc_mib() * MIB_SECTORS;
    if emu_sct > 0 {
        if plan.emummc_double() {
            let half = emu_sct / 2;
            entries.push(GptEntry::new("emummc", Guid::EMUMMC, cur, cur + half - 1));
            cur += half;
            entries.push(GptEntry::new(
                "emummc2",
                Guid::EMUMMC,
                cur,
                cur + half - TAIL_RESERVE_SECTORS - 1,
            ));
        } else {
            entries.push(GptEntry::new(
                "emummc",
                Guid::EMUMMC,
                cur,
                cur + emu_sct - TAIL_RESERVE_SECTORS - 1,
            ));
        }
    }

    entries.resize(GPT_MAX_ENTRIES as usize, GptEntry::default());
    let mut gpt = Gpt {
        header: GptHeader::primary(sec_cnt, disk_guid),
        entries,
    };
    gpt.seal();
    gpt
}

fn write_range(device: &mut dyn BlockDevice, lba: u64, data: &[u8]) -> Result<(), EngineError> {
    let count = (data.len() / SECTOR_SIZE) as u32;
    device
        .write_sectors(lba, count, data)
        .map_err(|e| EngineError::Io {
            op: IoOp::Write,
            lba,
            retry_count: 1,
            source: e,
        })
}

fn zero_range(device: &mut dyn BlockDevice, range: ZeroRange, chunk_sectors: u64) -> Result<(), EngineError> {
    let zeros = vec![0u8; (chunk_sectors.min(range.sectors) as usize) * SECTOR_SIZE];
    let mut lba = range.lba;
    let end = range.lba + range.sectors;
    while lba < end {
        let count = chunk_sectors.min(end - lba);
        write_range(device, lba, &zeros[..count as usize * SECTOR_SIZE])?;
        lba += count;
    }
    Ok(())
}

/// Write `table` to `device`.
///
/// Order: clear ranges, MBR, primary GPT (header and entries), backup entries,
/// backup header. The device size must match the one the table was built for.
pub fn write_layout(
    device: &mut dyn BlockDevice,
    table: &LayoutTable,
    ctx: &Context<'_>,
) -> Result<(), EngineError> {
    if device.sector_count() != table.device_sectors {
        return Err(EngineError::LayoutConstraintViolated {
            reason: format!(
                "layout built for {} sectors, device has {}",
                table.device_sectors,
                device.sector_count()
            ),
        });
    }

    ctx.log(LogLevel::Info, "Clearing partition table area...");
    let chunk = ctx.config.chunk_sectors as u64;
    for range in &table.zero_ranges {
        debug!("Zeroing {} sectors at {:#X}", range.sectors, range.lba);
        zero_range(device, *range, chunk)?;
    }

    ctx.log(LogLevel::Info, "Writing MBR...");
    table.mbr.write_to(device)?;

    if let Some(gpt) = &table.gpt {
        ctx.log(LogLevel::Info, "Writing GPT...");
        let entries = gpt.entries_bytes();
        let mut primary = gpt.header.to_sector();
        primary.extend_from_slice(&entries);
        write_range(device, gpt.header.my_lba, &primary)?;

        let backup = gpt.header.to_backup(table.device_sectors);
        write_range(device, backup.part_ent_lba, &entries)?;
        write_range(device, backup.my_lba, &backup.to_sector())?;
    }

    device.flush().map_err(|e| EngineError::Io {
        op: IoOp::Write,
        lba: 0,
        retry_count: 1,
        source: e,
    })?;
    info!("Partition layout written ({} sectors)", table.device_sectors);
    Ok(())
}

/// Build the layout for `plan` against the MBR currently on `device` and write it.
pub fn apply_plan(
    device: &mut dyn BlockDevice,
    plan: &PartitionPlan,
    ctx: &Context<'_>,
) -> Result<LayoutTable, EngineError> {
    let previous = Mbr::read_from(device).ok();
    let table = plan.layout(previous.as_ref())?;
    write_layout(device, &table, ctx)?;
    ctx.log(LogLevel::Info, &format!("Partitioned card: {}", plan));
    Ok(table)
}

/// Rebuild the MBR of a hybrid GPT card so it points at the data partition and
/// up to two emuMMC partitions, followed by the protective entry.
///
/// Returns whether the MBR was rewritten; it is left alone when entries 1 to 3
/// already match.
pub fn fix_hybrid_mbr(device: &mut dyn BlockDevice, ctx: &Context<'_>) -> Result<bool, EngineError> {
    let current = Mbr::read_from(device)?;
    let gpt = read_gpt(device)?;
    let mut fixed = current.clone();

    let data = gpt
        .find("hos_data")
        .or_else(|| gpt.partitions().find(|(i, _)| *i == 0).map(|(_, e)| e));
    if let Some(entry) = data {
        fixed.partitions[0] = MbrEntry::new(
            MBR_TYPE_FAT32_LBA,
            table_u32(entry.lba_start)?,
            table_u32(entry.sectors())?,
        );
    }

    let mut mbr_idx = 1;
    for (_, entry) in gpt.partitions() {
        if entry.name == "emummc" || entry.name == "emummc2" {
            fixed.partitions[mbr_idx] = MbrEntry::new(
                MBR_TYPE_EMUMMC,
                table_u32(entry.lba_start)?,
                table_u32(entry.sectors())?,
            );
            mbr_idx += 1;
        }
        if mbr_idx >= 3 {
            break;
        }
    }
    fixed.partitions[mbr_idx] = MbrEntry::new(
        MBR_TYPE_GPT_PROTECTIVE,
        1,
        table_u32(device.sector_count() - 1)?,
    );

    let changed = (1..4).any(|i| !current.partitions[i].same_extent(&fixed.partitions[i]));
    if !changed {
        ctx.log(LogLevel::Info, "The hybrid MBR needs no change");
        return Ok(false);
    }

    fixed.write_to(device)?;
    device.flush().map_err(|e| EngineError::Io {
        op: IoOp::Write,
        lba: 0,
        retry_count: 1,
        source: e,
    })?;
    ctx.log(LogLevel::Info, "Hybrid MBR rebuilt from the GPT");
    Ok(true)
}

fn table_u32(value: u64) -> Result<u32, EngineError> {
    u32::try_from(value).map_err(|_| EngineError::InvalidPartitionTable {
        reason: format!("{:#X} does not fit an MBR entry", value),
    })
}

/// Number of sectors from the end of the device the backup GPT occupies.
pub fn backup_gpt_sectors() -> u64 {
    GPT_ENTRY_SECTORS + 1
}
