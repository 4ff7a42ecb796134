//! # nxbackup engine - raw storage backup library
//!
//! A headless engine for backing up, restoring and repartitioning eMMC and SD
//! storage. Designed as the foundation for multiple front ends (CLI, automation).
//!
//! ## Overview
//!
//! The engine copies whole physical partitions between a block device and
//! files on removable storage, and computes the MBR/GPT layouts that place an
//! emuMMC next to Linux and Android partitions. It features:
//! - Chunked transfers with retries, progress on change and cooperative cancel
//! - Multi-part output for FAT32 and partial backups, with resume markers
//! - Sparse or full SHA-256 verification, with optional hash export
//! - An immutable partition planner and a layout writer for MBR and GPT
//! - File-based and partition-based emuMMC creation
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//! use engine::{
//!     create_job, plan_job, run_job, BackupSelection, Context, DestinationFs, Destination,
//!     Direction, Emmc, EngineConfig, FileBlockDevice, FsKind, NoProgress,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut emmc = Emmc::new(
//!     FileBlockDevice::open("boot0.img".as_ref())?,
//!     FileBlockDevice::open("boot1.img".as_ref())?,
//!     FileBlockDevice::open("gpp.img".as_ref())?,
//!     0x1234_5678,
//!     32,
//! );
//! let dest = Destination {
//!     root: PathBuf::from("/mnt/sd"),
//!     fs: DestinationFs { kind: FsKind::Fat32, free_bytes: 64 << 30, capacity_bytes: 128 << 30 },
//! };
//!
//! let selection = BackupSelection { boot: true, raw: true, ..Default::default() };
//! let mut job = create_job(Direction::Backup, selection)?;
//! plan_job(&mut job, &mut emmc)?;
//!
//! let config = EngineConfig::default();
//! let ctx = Context::new(&config, &NoProgress);
//! let outcome = run_job(&mut job, &mut emmc, &dest, &ctx)?;
//! println!("{:?}: {} regions", outcome, job.reports.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **device**: Block device capability, file/memory/offset devices
//! - **storage**: eMMC physical partitions, raw emuMMC view
//! - **transfer**: Chunked transfer engine
//! - **multipart**: Split output, resume marker, restore part discovery
//! - **checksums**: Verification policies and the verifier
//! - **job**: Backup/restore orchestration (create, plan, run)
//! - **mbr** / **gpt**: Partition table formats
//! - **planner**: Partition layout planner
//! - **layout**: Layout writer and hybrid MBR repair
//! - **emummc**: emuMMC builders and discovery

pub mod checksums;
pub mod config;
pub mod device;
pub mod emummc;
pub mod error;
pub mod gpt;
pub mod job;
pub mod layout;
pub mod mbr;
pub mod model;
pub mod multipart;
pub mod planner;
pub mod progress;
pub mod storage;
pub mod transfer;

// Re-export main types and functions
pub use checksums::{verify_part, VerificationPolicy};
pub use config::EngineConfig;
pub use device::{BlockDevice, FileBlockDevice, MemoryBlockDevice, OffsetDevice, SECTOR_SIZE};
pub use emummc::{
    create_file_emummc, create_raw_emummc, find_emummc_partition, EmummcPartition, EmummcReport,
    PartitionLookup,
};
pub use error::{EngineError, IoOp};
pub use job::{
    backup_dir, create_job, plan_job, run_job, BackupJob, BackupSelection, Destination,
    RegionOutcome, RegionReport,
};
pub use layout::{apply_plan, fix_hybrid_mbr, write_layout, LayoutTable};
pub use model::{Direction, JobState, Outcome, Region, TransferJob};
pub use multipart::{DestinationFs, FsKind};
pub use planner::{AndroidScheme, PartitionPlan, ReferenceDevice, SliderChange, TargetMedium};
pub use progress::{Context, LogLevel, NoProgress, ProgressSink, Prompt};
pub use storage::{Emmc, MmcStorage, PhysicalPartition, RawEmummc};
pub use transfer::transfer;
