//! eMMC storage as the orchestrator sees it: three physical partitions.
//!
//! [`Emmc`] wraps one block device per physical partition. [`RawEmummc`] presents
//! the same view on top of an emuMMC partition of the SD card, where the three
//! physical partitions sit at fixed offsets from the partition start.

use std::fmt;

use crate::device::{BlockDevice, OffsetDevice};
use crate::error::EngineError;

/// Distance between the emuMMC copies of BOOT0, BOOT1 and the GPP.
pub const EMUMMC_PART_STRIDE: u64 = 0x2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalPartition {
    Boot0,
    Boot1,
    Gpp,
}

impl PhysicalPartition {
    pub fn index(&self) -> u64 {
        match self {
            PhysicalPartition::Boot0 => 0,
            PhysicalPartition::Boot1 => 1,
            PhysicalPartition::Gpp => 2,
        }
    }
}

impl fmt::Display for PhysicalPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysicalPartition::Boot0 => write!(f, "BOOT0"),
            PhysicalPartition::Boot1 => write!(f, "BOOT1"),
            PhysicalPartition::Gpp => write!(f, "GPP"),
        }
    }
}

/// Sectors in one boot partition for a given `boot_mult` (128 KiB units).
pub fn boot_partition_sectors(boot_mult: u32) -> u64 {
    (boot_mult as u64) << 8
}

/// Access to the physical partitions of an eMMC (or something laid out like one).
pub trait MmcStorage {
    /// Select `partition` and return it as a block device.
    fn partition(&mut self, partition: PhysicalPartition) -> Result<&mut dyn BlockDevice, EngineError>;

    /// Card serial number; names the backup directory.
    fn serial(&self) -> u32;

    /// Boot partition size in 128 KiB units.
    fn boot_mult(&self) -> u32;

    /// True when the partitions live inside an emuMMC partition on the SD card.
    fn is_raw_emummc(&self) -> bool {
        false
    }
}

/// A real eMMC, one device per physical partition.
#[derive(Debug)]
pub struct Emmc<D> {
    pub boot0: D,
    pub boot1: D,
    pub gpp: D,
    serial: u32,
    boot_mult: u32,
}

impl<D: BlockDevice> Emmc<D> {
    pub fn new(boot0: D, boot1: D, gpp: D, serial: u32, boot_mult: u32) -> Self {
        Emmc {
            boot0,
            boot1,
            gpp,
            serial,
            boot_mult,
        }
    }
}

impl<D: BlockDevice> MmcStorage for Emmc<D> {
    fn partition(&mut self, partition: PhysicalPartition) -> Result<&mut dyn BlockDevice, EngineError> {
        Ok(match partition {
            PhysicalPartition::Boot0 => &mut self.boot0,
            PhysicalPartition::Boot1 => &mut self.boot1,
            PhysicalPartition::Gpp => &mut self.gpp,
        })
    }

    fn serial(&self) -> u32 {
        self.serial
    }

    fn boot_mult(&self) -> u32 {
        self.boot_mult
    }
}

/// An emuMMC partition on the SD card, addressed like an eMMC.
///
/// Physical partition `n` starts at `sector_start + 0x2000 * n`.
#[derive(Debug)]
pub struct RawEmummc<D> {
    window: OffsetDevice<D>,
    sector_start: u64,
    gpp_sectors: u64,
    serial: u32,
    boot_mult: u32,
}

impl<D: BlockDevice> RawEmummc<D> {
    pub fn new(
        sd: D,
        sector_start: u64,
        gpp_sectors: u64,
        serial: u32,
        boot_mult: u32,
    ) -> Result<Self, EngineError> {
        let window = OffsetDevice::new(sd, sector_start, boot_partition_sectors(boot_mult))?;
        Ok(RawEmummc {
            window,
            sector_start,
            gpp_sectors,
            serial,
            boot_mult,
        })
    }

    pub fn sector_start(&self) -> u64 {
        self.sector_start
    }

    pub fn into_inner(self) -> D {
        self.window.into_inner()
    }
}

impl<D: BlockDevice> MmcStorage for RawEmummc<D> {
    fn partition(&mut self, partition: PhysicalPartition) -> Result<&mut dyn BlockDevice, EngineError> {
        let sectors = match partition {
            PhysicalPartition::Gpp => self.gpp_sectors,
            _ => boot_partition_sectors(self.boot_mult),
        };
        let offset = self.sector_start + EMUMMC_PART_STRIDE * partition.index();
        self.window.retarget(offset, sectors)?;
        Ok(&mut self.window)
    }

    fn serial(&self) -> u32 {
        self.serial
    }

    fn boot_mult(&self) -> u32 {
        self.boot_mult
    }

    fn is_raw_emummc(&self) -> bool {
        true
    }
}
