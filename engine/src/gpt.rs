//! GUID Partition Table parsing and serialization.
//!
//! Sector size is assumed to be 512 bytes. Only the 128-entry, 128-byte entry
//! layout is supported, which is what every table on this platform uses.

use std::fmt;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use uuid::Uuid;

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{EngineError, IoOp};
use crate::model::Region;

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;
pub const GPT_HEADER_SIZE: u32 = 92;
pub const GPT_ENTRY_SIZE: usize = 128;
pub const GPT_MAX_ENTRIES: u32 = 128;
/// Sectors taken by the 128-entry array.
pub const GPT_ENTRY_SECTORS: u64 = (GPT_MAX_ENTRIES as u64 * GPT_ENTRY_SIZE as u64) / SECTOR_SIZE as u64;
/// First LBA after the MBR, the header and the entry array.
pub const GPT_FIRST_USABLE_LBA: u64 = 2 + GPT_ENTRY_SECTORS;

const NAME_UNITS: usize = 36;

/// A 128-bit GUID in on-disk byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// Microsoft basic data, used for the FAT data partition.
    pub const BASIC_DATA: Guid = Guid([
        0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7,
    ]);

    /// Linux filesystem data, used for Linux and Android partitions.
    pub const LINUX_DATA: Guid = Guid([
        0xAF, 0x3D, 0xC6, 0x0F, 0x83, 0x84, 0x72, 0x47, 0x8E, 0x79, 0x3D, 0x69, 0xD8, 0x47, 0x7D, 0xE4,
    ]);

    /// Partition-based emuMMC.
    pub const EMUMMC: Guid = Guid([
        0x00, 0x7E, 0xCA, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, b'e', b'm', b'u', b'M', b'M', b'C',
    ]);

    pub fn random() -> Self {
        Guid(Uuid::new_v4().into_bytes())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for Guid {
    /// Mixed-endian textual form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.0;
        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            d[3], d[2], d[1], d[0], d[5], d[4], d[7], d[6], d[8], d[9], d[10], d[11], d[12], d[13], d[14], d[15]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub crc32: u32,
    pub my_lba: u64,
    pub alt_lba: u64,
    pub first_use_lba: u64,
    pub last_use_lba: u64,
    pub disk_guid: Guid,
    pub part_ent_lba: u64,
    pub num_part_ents: u32,
    pub part_ent_size: u32,
    pub part_ents_crc32: u32,
}

impl GptHeader {
    /// Primary header for a device of `sector_count` sectors, CRCs unset.
    pub fn primary(sector_count: u64, disk_guid: Guid) -> Self {
        GptHeader {
            revision: GPT_REVISION,
            header_size: GPT_HEADER_SIZE,
            crc32: 0,
            my_lba: 1,
            alt_lba: sector_count - 1,
            first_use_lba: GPT_FIRST_USABLE_LBA,
            last_use_lba: sector_count - 0x800 - 1,
            disk_guid,
            part_ent_lba: 2,
            num_part_ents: GPT_MAX_ENTRIES,
            part_ent_size: GPT_ENTRY_SIZE as u32,
            part_ents_crc32: 0,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, EngineError> {
        if data.len() < GPT_HEADER_SIZE as usize || &data[..8] != GPT_SIGNATURE {
            return Err(EngineError::InvalidPartitionTable {
                reason: "no EFI PART signature".to_string(),
            });
        }
        let mut c = Cursor::new(&data[8..GPT_HEADER_SIZE as usize]);
        let revision = c.read_u32::<LittleEndian>().map_err(table_error)?;
        let header_size = c.read_u32::<LittleEndian>().map_err(table_error)?;
        let crc32 = c.read_u32::<LittleEndian>().map_err(table_error)?;
        let _reserved = c.read_u32::<LittleEndian>().map_err(table_error)?;
        let my_lba = c.read_u64::<LittleEndian>().map_err(table_error)?;
        let alt_lba = c.read_u64::<LittleEndian>().map_err(table_error)?;
        let first_use_lba = c.read_u64::<LittleEndian>().map_err(table_error)?;
        let last_use_lba = c.read_u64::<LittleEndian>().map_err(table_error)?;
        let mut guid = [0u8; 16];
        std::io::Read::read_exact(&mut c, &mut guid).map_err(table_error)?;
        let part_ent_lba = c.read_u64::<LittleEndian>().map_err(table_error)?;
        let num_part_ents = c.read_u32::<LittleEndian>().map_err(table_error)?;
        let part_ent_size = c.read_u32::<LittleEndian>().map_err(table_error)?;
        let part_ents_crc32 = c.read_u32::<LittleEndian>().map_err(table_error)?;

        Ok(GptHeader {
            revision,
            header_size,
            crc32,
            my_lba,
            alt_lba,
            first_use_lba,
            last_use_lba,
            disk_guid: Guid(guid),
            part_ent_lba,
            num_part_ents,
            part_ent_size,
            part_ents_crc32,
        })
    }

    /// The header padded to a full sector.
    pub fn to_sector(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SECTOR_SIZE);
        out.extend_from_slice(GPT_SIGNATURE);
        out.extend_from_slice(&self.revision.to_le_bytes());
        out.extend_from_slice(&self.header_size.to_le_bytes());
        out.extend_from_slice(&self.crc32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.my_lba.to_le_bytes());
        out.extend_from_slice(&self.alt_lba.to_le_bytes());
        out.extend_from_slice(&self.first_use_lba.to_le_bytes());
        out.extend_from_slice(&self.last_use_lba.to_le_bytes());
        out.extend_from_slice(&self.disk_guid.0);
        out.extend_from_slice(&self.part_ent_lba.to_le_bytes());
        out.extend_from_slice(&self.num_part_ents.to_le_bytes());
        out.extend_from_slice(&self.part_ent_size.to_le_bytes());
        out.extend_from_slice(&self.part_ents_crc32.to_le_bytes());
        out.resize(SECTOR_SIZE, 0);
        out
    }

    /// CRC32 over `header_size` bytes with the CRC field zeroed.
    pub fn compute_crc(&self) -> u32 {
        let mut zeroed = self.clone();
        zeroed.crc32 = 0;
        let len = (self.header_size as usize).min(SECTOR_SIZE);
        crc32fast::hash(&zeroed.to_sector()[..len])
    }

    pub fn seal(&mut self) {
        self.crc32 = self.compute_crc();
    }

    pub fn crc_valid(&self) -> bool {
        self.crc32 == self.compute_crc()
    }

    /// The backup copy stored at the end of the device, sealed.
    pub fn to_backup(&self, sector_count: u64) -> Self {
        let mut backup = self.clone();
        backup.my_lba = sector_count - 1;
        backup.alt_lba = 1;
        backup.part_ent_lba = sector_count - 1 - GPT_ENTRY_SECTORS;
        backup.seal();
        backup
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: Guid,
    pub part_guid: Guid,
    pub lba_start: u64,
    /// Inclusive
    pub lba_end: u64,
    pub attrs: u64,
    pub name: String,
}

impl GptEntry {
    pub fn new(name: &str, type_guid: Guid, lba_start: u64, lba_end: u64) -> Self {
        GptEntry {
            type_guid,
            part_guid: Guid::random(),
            lba_start,
            lba_end,
            attrs: 0,
            name: name.to_string(),
        }
    }

    fn parse(data: &[u8]) -> Result<Self, EngineError> {
        let mut type_guid = [0u8; 16];
        let mut part_guid = [0u8; 16];
        type_guid.copy_from_slice(&data[..16]);
        part_guid.copy_from_slice(&data[16..32]);
        let mut c = Cursor::new(&data[32..56]);
        let lba_start = c.read_u64::<LittleEndian>().map_err(table_error)?;
        let lba_end = c.read_u64::<LittleEndian>().map_err(table_error)?;
        let attrs = c.read_u64::<LittleEndian>().map_err(table_error)?;

        let units: Vec<u16> = data[56..GPT_ENTRY_SIZE]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();

        Ok(GptEntry {
            type_guid: Guid(type_guid),
            part_guid: Guid(part_guid),
            lba_start,
            lba_end,
            attrs,
            name: String::from_utf16_lossy(&units),
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&self.type_guid.0);
        out.extend_from_slice(&self.part_guid.0);
        out.extend_from_slice(&self.lba_start.to_le_bytes());
        out.extend_from_slice(&self.lba_end.to_le_bytes());
        out.extend_from_slice(&self.attrs.to_le_bytes());
        for unit in self.name.encode_utf16().take(NAME_UNITS) {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.resize(start + GPT_ENTRY_SIZE, 0);
    }

    pub fn is_empty(&self) -> bool {
        self.type_guid.is_zero()
    }

    /// Inclusive length; zero for an entry whose end precedes its start.
    pub fn sectors(&self) -> u64 {
        self.lba_end
            .checked_sub(self.lba_start)
            .map_or(0, |span| span + 1)
    }

    pub fn region(&self) -> Result<Region, EngineError> {
        Region::new(self.name.clone(), self.lba_start, self.lba_end)
    }
}

/// A header plus its full entry array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpt {
    pub header: GptHeader,
    /// Always `num_part_ents` long; unused slots are empty entries.
    pub entries: Vec<GptEntry>,
}

impl Gpt {
    /// Serialized entry array.
    pub fn entries_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * GPT_ENTRY_SIZE);
        for entry in &self.entries {
            entry.write_to(&mut out);
        }
        out
    }

    /// Recompute both CRCs: entries first, then the header.
    pub fn seal(&mut self) {
        self.header.part_ents_crc32 = crc32fast::hash(&self.entries_bytes());
        self.header.seal();
    }

    /// Entries that hold a partition, skipping ones starting before `first_use_lba`.
    pub fn partitions(&self) -> impl Iterator<Item = (usize, &GptEntry)> {
        let first = self.header.first_use_lba;
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| !e.is_empty() && e.lba_start >= first)
    }

    pub fn find(&self, name: &str) -> Option<&GptEntry> {
        self.partitions().map(|(_, e)| e).find(|e| e.name == name)
    }

    /// Every partition as a named region, in table order.
    pub fn regions(&self) -> Result<Vec<Region>, EngineError> {
        self.partitions().map(|(_, e)| e.region()).collect()
    }
}

/// Read the primary GPT (header at LBA 1, entries following it).
pub fn read_gpt(device: &mut dyn BlockDevice) -> Result<Gpt, EngineError> {
    let mut sector = vec![0u8; SECTOR_SIZE];
    read(device, 1, &mut sector)?;
    let header = GptHeader::parse(&sector)?;
    if header.num_part_ents > GPT_MAX_ENTRIES {
        return Err(EngineError::InvalidPartitionTable {
            reason: format!("{} partition entries (max {})", header.num_part_ents, GPT_MAX_ENTRIES),
        });
    }
    if header.part_ent_size as usize != GPT_ENTRY_SIZE {
        return Err(EngineError::InvalidPartitionTable {
            reason: format!("unsupported entry size {}", header.part_ent_size),
        });
    }

    let bytes = header.num_part_ents as usize * GPT_ENTRY_SIZE;
    let sectors = (bytes + SECTOR_SIZE - 1) / SECTOR_SIZE;
    let mut array = vec![0u8; sectors * SECTOR_SIZE];
    if sectors > 0 {
        read(device, header.part_ent_lba, &mut array)?;
    }
    let entries = array[..bytes]
        .chunks_exact(GPT_ENTRY_SIZE)
        .map(GptEntry::parse)
        .collect::<Result<Vec<_>, _>>()?;

    if let Some((index, entry)) = entries
        .iter()
        .enumerate()
        .find(|(_, e)| !e.is_empty() && e.lba_end < e.lba_start)
    {
        return Err(EngineError::InvalidPartitionTable {
            reason: format!(
                "entry {} ({}) ends at LBA {:#X} before it starts at {:#X}",
                index, entry.name, entry.lba_end, entry.lba_start
            ),
        });
    }

    Ok(Gpt { header, entries })
}

fn read(device: &mut dyn BlockDevice, lba: u64, buf: &mut [u8]) -> Result<(), EngineError> {
    let count = (buf.len() / SECTOR_SIZE) as u32;
    device
        .read_sectors(lba, count, buf)
        .map_err(|e| EngineError::Io {
            op: IoOp::Read,
            lba,
            retry_count: 1,
            source: e,
        })
}

fn table_error(e: std::io::Error) -> EngineError {
    EngineError::InvalidPartitionTable {
        reason: e.to_string(),
    }
}
