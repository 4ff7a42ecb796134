//! Master Boot Record parsing and serialization.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{EngineError, IoOp};

pub const MBR_TYPE_FAT32_LBA: u8 = 0x0C;
pub const MBR_TYPE_LINUX: u8 = 0x83;
pub const MBR_TYPE_EMUMMC: u8 = 0xE0;
pub const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xEE;

pub const BOOT_SIGNATURE: u16 = 0xAA55;

const BOOTSTRAP_LEN: usize = 440;
const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;

/// Tool metadata kept in the bootstrap area across repartitioning.
pub const BOOTSTRAP_METADATA_OFFSET: usize = 0x80;
pub const BOOTSTRAP_METADATA_LEN: usize = 304;

/// One of the four primary partition entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbrEntry {
    pub status: u8,
    pub chs_start: [u8; 3],
    pub part_type: u8,
    pub chs_end: [u8; 3],
    pub start_sct: u32,
    pub size_sct: u32,
}

impl MbrEntry {
    /// Entry with zeroed CHS fields, which is all LBA-only readers look at.
    pub fn new(part_type: u8, start_sct: u32, size_sct: u32) -> Self {
        MbrEntry {
            part_type,
            start_sct,
            size_sct,
            ..Default::default()
        }
    }

    fn parse(data: &[u8]) -> Self {
        let mut c = Cursor::new(&data[8..16]);
        // The slice is exactly 8 bytes; these reads cannot fail.
        let start_sct = c.read_u32::<LittleEndian>().unwrap_or(0);
        let size_sct = c.read_u32::<LittleEndian>().unwrap_or(0);
        MbrEntry {
            status: data[0],
            chs_start: [data[1], data[2], data[3]],
            part_type: data[4],
            chs_end: [data[5], data[6], data[7]],
            start_sct,
            size_sct,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.status);
        out.extend_from_slice(&self.chs_start);
        out.push(self.part_type);
        out.extend_from_slice(&self.chs_end);
        out.extend_from_slice(&self.start_sct.to_le_bytes());
        out.extend_from_slice(&self.size_sct.to_le_bytes());
    }

    pub fn is_empty(&self) -> bool {
        self.part_type == 0 && self.start_sct == 0 && self.size_sct == 0
    }

    /// Type, start and size are equal; status and CHS are ignored.
    pub fn same_extent(&self, other: &MbrEntry) -> bool {
        self.part_type == other.part_type
            && self.start_sct == other.start_sct
            && self.size_sct == other.size_sct
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mbr {
    pub bootstrap: Vec<u8>,
    /// Disk signature
    pub signature: u32,
    pub copy_protected: u16,
    pub partitions: [MbrEntry; 4],
    pub boot_signature: u16,
}

impl Default for Mbr {
    fn default() -> Self {
        Mbr {
            bootstrap: vec![0u8; BOOTSTRAP_LEN],
            signature: 0,
            copy_protected: 0,
            partitions: [MbrEntry::default(); 4],
            boot_signature: BOOT_SIGNATURE,
        }
    }
}

impl Mbr {
    pub fn parse(data: &[u8]) -> Result<Self, EngineError> {
        if data.len() < SECTOR_SIZE {
            return Err(EngineError::InvalidPartitionTable {
                reason: format!("MBR needs {} bytes, got {}", SECTOR_SIZE, data.len()),
            });
        }

        let mut c = Cursor::new(&data[BOOTSTRAP_LEN..PARTITION_TABLE_OFFSET]);
        let signature = c.read_u32::<LittleEndian>().map_err(table_error)?;
        let copy_protected = c.read_u16::<LittleEndian>().map_err(table_error)?;

        let mut partitions = [MbrEntry::default(); 4];
        for (i, entry) in partitions.iter_mut().enumerate() {
            let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
            *entry = MbrEntry::parse(&data[offset..offset + PARTITION_ENTRY_SIZE]);
        }

        let boot_signature = Cursor::new(&data[510..512])
            .read_u16::<LittleEndian>()
            .map_err(table_error)?;

        Ok(Mbr {
            bootstrap: data[..BOOTSTRAP_LEN].to_vec(),
            signature,
            copy_protected,
            partitions,
            boot_signature,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SECTOR_SIZE);
        out.extend_from_slice(&self.bootstrap);
        out.resize(BOOTSTRAP_LEN, 0);
        out.extend_from_slice(&self.signature.to_le_bytes());
        out.extend_from_slice(&self.copy_protected.to_le_bytes());
        for entry in &self.partitions {
            entry.write_to(&mut out);
        }
        out.extend_from_slice(&self.boot_signature.to_le_bytes());
        out
    }

    pub fn read_from(device: &mut dyn BlockDevice) -> Result<Self, EngineError> {
        let mut buf = vec![0u8; SECTOR_SIZE];
        device
            .read_sectors(0, 1, &mut buf)
            .map_err(|e| EngineError::Io {
                op: IoOp::Read,
                lba: 0,
                retry_count: 1,
                source: e,
            })?;
        Self::parse(&buf)
    }

    pub fn write_to(&self, device: &mut dyn BlockDevice) -> Result<(), EngineError> {
        device
            .write_sectors(0, 1, &self.to_bytes())
            .map_err(|e| EngineError::Io {
                op: IoOp::Write,
                lba: 0,
                retry_count: 1,
                source: e,
            })
    }

    pub fn has_boot_signature(&self) -> bool {
        self.boot_signature == BOOT_SIGNATURE
    }

    /// Copy the metadata area of `old`'s bootstrap, if it holds any.
    pub fn carry_bootstrap_metadata(&mut self, old: &Mbr) {
        let range = BOOTSTRAP_METADATA_OFFSET..BOOTSTRAP_METADATA_OFFSET + BOOTSTRAP_METADATA_LEN;
        let marker = &old.bootstrap[BOOTSTRAP_METADATA_OFFSET..BOOTSTRAP_METADATA_OFFSET + 4];
        if marker.iter().any(|&b| b != 0) {
            self.bootstrap[range.clone()].copy_from_slice(&old.bootstrap[range]);
        }
    }
}

fn table_error(e: std::io::Error) -> EngineError {
    EngineError::InvalidPartitionTable {
        reason: e.to_string(),
    }
}
