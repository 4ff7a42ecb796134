//! Job orchestration module.
//!
//! This module provides the backup/restore lifecycle:
//! - Creating a job from a region selection
//! - Planning a job (turning the selection into regions of the storage)
//! - Running a job (transfer, then optional verification, region by region)
//!
//! Backups are written under `backup/<serial>/` on the destination; restores
//! read from `backup/<serial>/restore/`. Partition-level files go into a
//! `partitions/` subdirectory.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checksums::{verify_part, VerificationPolicy};
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::EngineError;
use crate::gpt::read_gpt;
use crate::model::{Direction, JobState, Outcome, Region, TransferJob};
use crate::multipart::{
    locate_restore_source, part_path, plan_output, DestinationFs, OutputLayout, PartNaming,
    PartReader, PartWriter, ResumeMarker, FAT32_MAX_FILE_SIZE,
};
use crate::progress::{Context, LogLevel, Prompt};
use crate::storage::{boot_partition_sectors, MmcStorage, PhysicalPartition};
use crate::transfer::{transfer, DeviceEndpoint};

/// Name of the GPT partition selected by [`BackupSelection::user`].
pub const USER_PARTITION: &str = "USER";

/// File name of a full GPP backup.
pub const RAW_IMAGE_NAME: &str = "rawnand.bin";

const PARTITIONS_DIR: &str = "partitions";
const RESTORE_DIR: &str = "restore";

/// Which parts of the storage a job covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupSelection {
    /// BOOT0 and BOOT1
    pub boot: bool,
    /// Every GPT partition except USER
    pub system: bool,
    /// The USER GPT partition
    pub user: bool,
    /// The whole GPP as one image
    pub raw: bool,
}

impl BackupSelection {
    pub fn is_empty(&self) -> bool {
        !(self.boot || self.system || self.user || self.raw)
    }
}

/// One region of the storage and where its backup lives, relative to the job directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRegion {
    pub region: Region,
    pub partition: PhysicalPartition,
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOutcome {
    Transferred(Outcome),
    /// The output existed and the caller declined to overwrite it
    SkippedExisting,
    /// Restore only: no backup file for this region
    SkippedMissingSource,
}

/// What happened to one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionReport {
    pub name: String,
    pub outcome: RegionOutcome,
    pub retries: u32,
    /// Files written (backup) or read (restore)
    pub files: Vec<PathBuf>,
}

impl RegionReport {
    fn skipped(name: &str, outcome: RegionOutcome) -> Self {
        RegionReport {
            name: name.to_string(),
            outcome,
            retries: 0,
            files: Vec::new(),
        }
    }
}

/// A backup or restore over one or more regions.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub id: Uuid,
    pub direction: Direction,
    pub selection: BackupSelection,
    /// Filled by [`plan_job`]
    pub regions: Vec<PlannedRegion>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// One entry per region processed, in order
    pub reports: Vec<RegionReport>,
}

impl BackupJob {
    fn finish(&mut self, state: JobState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

/// The removable storage backups are written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Mount point of the destination filesystem
    pub root: PathBuf,
    pub fs: DestinationFs,
}

/// `root/backup/<serial>`, with the serial as eight uppercase hex digits.
pub fn backup_dir(root: &Path, serial: u32) -> PathBuf {
    root.join("backup").join(format!("{:08X}", serial))
}

/// Create a new job in `Pending` state.
///
/// # Errors
/// Returns `EngineError::Config` if nothing is selected.
pub fn create_job(direction: Direction, selection: BackupSelection) -> Result<BackupJob, EngineError> {
    if selection.is_empty() {
        return Err(EngineError::Config {
            reason: "nothing selected".to_string(),
        });
    }

    Ok(BackupJob {
        id: Uuid::new_v4(),
        direction,
        selection,
        regions: Vec::new(),
        state: JobState::Pending,
        created_at: Utc::now(),
        finished_at: None,
        reports: Vec::new(),
    })
}

/// Resolve the selection into regions of `storage`.
///
/// Boot partitions come from the card geometry, system and user partitions
/// from the GPT on the GPP.
pub fn plan_job(job: &mut BackupJob, storage: &mut dyn MmcStorage) -> Result<(), EngineError> {
    if job.state != JobState::Pending {
        return Err(EngineError::Config {
            reason: format!("job must be Pending to plan; current state: {:?}", job.state),
        });
    }

    let mut regions = Vec::new();
    let selection = job.selection;

    if selection.boot {
        let sectors = boot_partition_sectors(storage.boot_mult());
        for partition in [PhysicalPartition::Boot0, PhysicalPartition::Boot1] {
            let name = partition.to_string();
            regions.push(PlannedRegion {
                region: Region::with_len(name.clone(), 0, sectors)?,
                partition,
                relative_path: PathBuf::from(name),
            });
        }
    }

    if selection.system || selection.user {
        let gpt = read_gpt(storage.partition(PhysicalPartition::Gpp)?)?;
        for (_, entry) in gpt.partitions() {
            let is_user = entry.name == USER_PARTITION;
            if (is_user && selection.user) || (!is_user && selection.system) {
                regions.push(PlannedRegion {
                    region: entry.region()?,
                    partition: PhysicalPartition::Gpp,
                    relative_path: Path::new(PARTITIONS_DIR).join(&entry.name),
                });
            }
        }
        if selection.user && gpt.find(USER_PARTITION).is_none() {
            return Err(EngineError::PartitionNotFound {
                name: USER_PARTITION.to_string(),
            });
        }
    }

    if selection.raw {
        let sectors = storage.partition(PhysicalPartition::Gpp)?.sector_count();
        regions.push(PlannedRegion {
            region: Region::with_len(RAW_IMAGE_NAME, 0, sectors)?,
            partition: PhysicalPartition::Gpp,
            relative_path: PathBuf::from(RAW_IMAGE_NAME),
        });
    }

    debug!("Planned {} regions for job {}", regions.len(), job.id);
    job.regions = regions;
    Ok(())
}

/// Run a planned job region by region.
///
/// Regions stop at the first error, cancel or pause. The returned outcome is
/// that of the last region processed.
///
/// # Errors
/// Returns the first region error. For restores, `MissingSource` is returned
/// only if no region had a backup to restore from.
pub fn run_job(
    job: &mut BackupJob,
    storage: &mut dyn MmcStorage,
    dest: &Destination,
    ctx: &Context<'_>,
) -> Result<Outcome, EngineError> {
    if job.state != JobState::Pending {
        return Err(EngineError::Config {
            reason: format!("job must be Pending to run; current state: {:?}", job.state),
        });
    }
    if job.regions.is_empty() {
        return Err(EngineError::Config {
            reason: "job has no regions; plan it first".to_string(),
        });
    }

    job.state = JobState::Running;
    let job_dir = backup_dir(&dest.root, storage.serial());
    let base_dir = match job.direction {
        Direction::Backup => job_dir.clone(),
        Direction::Restore => job_dir.join(RESTORE_DIR),
    };

    if job.direction == Direction::Backup {
        // Restore folders are prepared alongside every backup.
        for dir in [
            job_dir.join(PARTITIONS_DIR),
            job_dir.join(RESTORE_DIR).join(PARTITIONS_DIR),
        ] {
            if let Err(e) = fs::create_dir_all(&dir) {
                job.finish(JobState::Failed);
                return Err(EngineError::file(dir, e));
            }
        }
    }

    let is_raw = storage.is_raw_emummc();
    let mut fs_state = dest.fs;
    let total = job.regions.len();
    let regions = job.regions.clone();
    info!(
        "{} job {} on {:08X}: {} regions under {}",
        job.direction,
        job.id,
        storage.serial(),
        total,
        base_dir.display()
    );

    for (index, planned) in regions.iter().enumerate() {
        ctx.progress.on_region_started(index, total, &planned.region);
        ctx.log(
            LogLevel::Info,
            &format!("{} ({}/{}) {}...", job.direction, index + 1, total, planned.region),
        );

        let result = storage.partition(planned.partition).and_then(|device| match job.direction {
            Direction::Backup => backup_region(device, planned, &base_dir, &mut fs_state, is_raw, ctx),
            Direction::Restore => restore_region(device, planned, &base_dir, is_raw, ctx),
        });

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                if job.direction == Direction::Restore {
                    ctx.log(
                        LogLevel::Error,
                        "The device may be in an inconsistent state! Retry the restore before rebooting.",
                    );
                }
                job.finish(JobState::Failed);
                return Err(e);
            }
        };

        if let RegionOutcome::Transferred(outcome) = report.outcome {
            ctx.progress.on_region_completed(&planned.region, outcome);
            let stop_state = match outcome {
                Outcome::Success => None,
                Outcome::Cancelled => Some(JobState::Cancelled),
                Outcome::Paused { .. } => Some(JobState::Paused),
            };
            job.reports.push(report);
            if let Some(state) = stop_state {
                job.finish(state);
                return Ok(outcome);
            }
        } else {
            job.reports.push(report);
        }
    }

    let restored_any = job
        .reports
        .iter()
        .any(|r| matches!(r.outcome, RegionOutcome::Transferred(_)));
    if job.direction == Direction::Restore && !restored_any {
        job.finish(JobState::Failed);
        return Err(EngineError::MissingSource { path: base_dir });
    }

    job.finish(JobState::Completed);
    info!("Job {} finished", job.id);
    Ok(Outcome::Success)
}

fn create_parent(path: &Path) -> Result<PathBuf, EngineError> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&parent).map_err(|e| EngineError::file(&parent, e))?;
    Ok(parent)
}

fn verifies(ctx: &Context<'_>, is_raw: bool) -> bool {
    ctx.config.verification != VerificationPolicy::Off && !is_raw
}

fn backup_region(
    device: &mut dyn BlockDevice,
    planned: &PlannedRegion,
    base_dir: &Path,
    fs_state: &mut DestinationFs,
    is_raw: bool,
    ctx: &Context<'_>,
) -> Result<RegionReport, EngineError> {
    let region = &planned.region;
    let output = base_dir.join(&planned.relative_path);
    let marker = ResumeMarker::in_dir(&create_parent(&output)?);

    let resume = marker.load()?;
    let resuming = resume.is_some() && region.bytes() > FAT32_MAX_FILE_SIZE;
    let exists = output.exists() || part_path(&output, PartNaming::Dotted, 0).exists();
    if exists && !resuming && !ctx.progress.confirm(&Prompt::Overwrite { path: &output }) {
        ctx.log(
            LogLevel::Warn,
            &format!("{} already exists, skipping {}", output.display(), region.name),
        );
        return Ok(RegionReport::skipped(&region.name, RegionOutcome::SkippedExisting));
    }

    let part_bytes = ctx.config.part_size_for(fs_state.capacity_bytes);
    let layout = plan_output(region.sectors(), fs_state, part_bytes, resume)?;

    let mut job = TransferJob::new(region.clone(), Direction::Backup);
    let split = matches!(layout, OutputLayout::Split(_));
    let mut writer = match layout {
        OutputLayout::Single => PartWriter::single(&output),
        OutputLayout::Split(plan) => {
            job.current_lba += plan.resume_from as u64 * plan.part_sectors();
            job.part_index = plan.resume_from;
            PartWriter::split(&output, PartNaming::Dotted, plan, Some(marker.clone()))
        }
    };

    let result = {
        let mut source = DeviceEndpoint::new(&mut *device);
        transfer(&mut job, &mut source, &mut writer, ctx)
    };
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Err(cleanup) = writer.discard() {
                warn!("Could not remove partial output: {}", cleanup);
            }
            return Err(e);
        }
    };

    let parts = match outcome {
        Outcome::Cancelled => {
            writer.discard()?;
            return Ok(RegionReport {
                name: region.name.clone(),
                outcome: RegionOutcome::Transferred(outcome),
                retries: job.retries,
                files: Vec::new(),
            });
        }
        Outcome::Paused { next_part } => {
            let parts = writer.finish()?;
            ctx.log(
                LogLevel::Warn,
                &format!(
                    "Partial backup: move the finished parts off the card and run the backup again to continue at part {}",
                    next_part
                ),
            );
            parts
        }
        Outcome::Success => {
            let parts = writer.finish()?;
            if split {
                marker.clear()?;
            }
            parts
        }
    };

    let written: u64 = parts.iter().map(|p| p.sectors * SECTOR_SIZE as u64).sum();
    fs_state.free_bytes = fs_state.free_bytes.saturating_sub(written);

    if verifies(ctx, is_raw) {
        for part in &parts {
            verify_part(device, part.lba_start, &part.path, ctx)?;
        }
    }

    ctx.log(
        LogLevel::Info,
        &format!("Finished {} ({} retries)", region.name, job.retries),
    );
    Ok(RegionReport {
        name: region.name.clone(),
        outcome: RegionOutcome::Transferred(outcome),
        retries: job.retries,
        files: parts.into_iter().map(|p| p.path).collect(),
    })
}

fn restore_region(
    device: &mut dyn BlockDevice,
    planned: &PlannedRegion,
    base_dir: &Path,
    is_raw: bool,
    ctx: &Context<'_>,
) -> Result<RegionReport, EngineError> {
    let base = base_dir.join(&planned.relative_path);
    let source = match locate_restore_source(&base, PartNaming::Dotted, ctx.config.chunk_bytes()) {
        Ok(source) => source,
        Err(EngineError::MissingSource { path }) => {
            ctx.log(
                LogLevel::Warn,
                &format!("{} not found, skipping", path.display()),
            );
            return Ok(RegionReport::skipped(
                &planned.region.name,
                RegionOutcome::SkippedMissingSource,
            ));
        }
        Err(e) => return Err(e),
    };

    if source.total_bytes() % SECTOR_SIZE as u64 != 0 {
        let (path, _) = source.files.last().cloned().unwrap_or((base.clone(), 0));
        return Err(EngineError::MisalignedPart {
            path,
            alignment: SECTOR_SIZE as u64,
        });
    }

    let expected = planned.region.sectors();
    let actual = source.total_sectors();
    let mut region = planned.region.clone();
    if actual > expected {
        ctx.log(
            LogLevel::Error,
            &format!("{} is larger than {} and cannot be restored", base.display(), region.name),
        );
        return Err(EngineError::SizeMismatch { expected, actual });
    }
    if actual < expected {
        let prompt = Prompt::SizeMismatch {
            path: &base,
            expected_sectors: expected,
            actual_sectors: actual,
        };
        if actual == 0 || !ctx.progress.confirm(&prompt) {
            return Err(EngineError::SizeMismatch { expected, actual });
        }
        ctx.log(
            LogLevel::Warn,
            &format!("Restoring only {} of {} sectors of {}", actual, expected, region.name),
        );
        region = region.truncated(actual)?;
    }

    let mut job = TransferJob::new(region.clone(), Direction::Restore);
    let mut reader = PartReader::new(&source, region.lba_start);
    let outcome = {
        let mut target = DeviceEndpoint::new(&mut *device);
        transfer(&mut job, &mut reader, &mut target, ctx)?
    };

    if verifies(ctx, is_raw) {
        for (path, lba) in source.part_offsets(region.lba_start) {
            verify_part(device, lba, &path, ctx)?;
        }
    }

    ctx.log(
        LogLevel::Info,
        &format!("Restored {} ({} retries)", region.name, job.retries),
    );
    Ok(RegionReport {
        name: region.name.clone(),
        outcome: RegionOutcome::Transferred(outcome),
        retries: job.retries,
        files: source.files.into_iter().map(|(path, _)| path).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::device::MemoryBlockDevice;
    use crate::gpt::{Gpt, GptEntry, GptHeader, Guid, GPT_MAX_ENTRIES};
    use crate::multipart::FsKind;
    use crate::progress::testing::RecordingSink;
    use crate::storage::Emmc;
    use std::io;

    const SERIAL: u32 = 0x1A2B_3C4D;
    const GPP_SECTORS: u64 = 4096;

    fn config() -> EngineConfig {
        EngineConfig {
            chunk_sectors: 64,
            retry_backoff_ms: 0,
            verification: VerificationPolicy::Full,
            ..Default::default()
        }
    }

    fn destination(root: &Path, free_bytes: u64) -> Destination {
        Destination {
            root: root.to_path_buf(),
            fs: DestinationFs {
                kind: FsKind::ExFat,
                free_bytes,
                capacity_bytes: 32 << 30,
            },
        }
    }

    fn patterned(sectors: u64, seed: u8) -> MemoryBlockDevice {
        let mut dev = MemoryBlockDevice::new(sectors);
        for (i, b) in dev.as_bytes_mut().iter_mut().enumerate() {
            *b = (i / SECTOR_SIZE) as u8 ^ seed;
        }
        dev
    }

    fn write_test_gpt(dev: &mut MemoryBlockDevice) {
        let mut entries = vec![GptEntry::default(); GPT_MAX_ENTRIES as usize];
        entries[0] = GptEntry::new("PRODINFO", Guid::BASIC_DATA, 34, 545);
        entries[1] = GptEntry::new("SYSTEM", Guid::BASIC_DATA, 546, 1545);
        entries[2] = GptEntry::new(USER_PARTITION, Guid::BASIC_DATA, 1546, 4000);
        let mut gpt = Gpt {
            header: GptHeader::primary(GPP_SECTORS, Guid::random()),
            entries,
        };
        gpt.seal();
        dev.write_sectors(1, 1, &gpt.header.to_sector()).expect("header");
        dev.write_sectors(2, 32, &gpt.entries_bytes()).expect("entries");
    }

    fn sample_emmc() -> Emmc<MemoryBlockDevice> {
        let mut gpp = patterned(GPP_SECTORS, 0x5A);
        write_test_gpt(&mut gpp);
        Emmc::new(patterned(256, 0x01), patterned(256, 0x02), gpp, SERIAL, 1)
    }

    fn blank_emmc() -> Emmc<MemoryBlockDevice> {
        Emmc::new(
            MemoryBlockDevice::new(256),
            MemoryBlockDevice::new(256),
            MemoryBlockDevice::new(GPP_SECTORS),
            SERIAL,
            1,
        )
    }

    fn selection(boot: bool, system: bool, user: bool, raw: bool) -> BackupSelection {
        BackupSelection {
            boot,
            system,
            user,
            raw,
        }
    }

    /// Move everything the backup produced into the restore folder.
    fn stage_for_restore(job_dir: &Path, names: &[&str]) {
        for name in names {
            let from = job_dir.join(name);
            let to = job_dir.join(RESTORE_DIR).join(name);
            fs::create_dir_all(to.parent().expect("parent")).expect("mkdir");
            fs::rename(&from, &to).expect("move backup into restore dir");
        }
    }

    #[test]
    fn test_create_job_requires_selection() {
        assert!(matches!(
            create_job(Direction::Backup, BackupSelection::default()),
            Err(EngineError::Config { .. })
        ));
        let job = create_job(Direction::Backup, selection(true, false, false, false)).expect("job");
        assert_eq!(job.state, JobState::Pending);
        assert!(job.regions.is_empty());
    }

    #[test]
    fn test_plan_boot_and_raw() {
        let mut emmc = sample_emmc();
        let mut job = create_job(Direction::Backup, selection(true, false, false, true)).expect("job");
        plan_job(&mut job, &mut emmc).expect("plan");

        let names: Vec<_> = job.regions.iter().map(|r| r.region.name.as_str()).collect();
        assert_eq!(names, ["BOOT0", "BOOT1", RAW_IMAGE_NAME]);
        assert_eq!(job.regions[0].region.lba_end, 255);
        assert_eq!(job.regions[1].partition, PhysicalPartition::Boot1);
        assert_eq!(job.regions[2].region.sectors(), GPP_SECTORS);
    }

    #[test]
    fn test_plan_splits_system_and_user() {
        let mut emmc = sample_emmc();
        let mut job = create_job(Direction::Backup, selection(false, true, false, false)).expect("job");
        plan_job(&mut job, &mut emmc).expect("plan");
        let names: Vec<_> = job.regions.iter().map(|r| r.region.name.clone()).collect();
        assert_eq!(names, ["PRODINFO", "SYSTEM"]);
        assert_eq!(job.regions[1].relative_path, Path::new("partitions/SYSTEM"));

        let mut job = create_job(Direction::Backup, selection(false, false, true, false)).expect("job");
        plan_job(&mut job, &mut emmc).expect("plan");
        assert_eq!(job.regions.len(), 1);
        assert_eq!(job.regions[0].region.lba_start, 1546);
        assert_eq!(job.regions[0].region.lba_end, 4000);
    }

    #[test]
    fn test_backup_and_restore_roundtrip() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dest = destination(temp_dir.path(), 1 << 30);
        let config = config();
        let sink = RecordingSink::permissive();
        let ctx = Context::new(&config, &sink);

        let mut source = sample_emmc();
        let sel = selection(true, false, true, true);
        let mut job = create_job(Direction::Backup, sel).expect("job");
        plan_job(&mut job, &mut source).expect("plan");
        assert_eq!(run_job(&mut job, &mut source, &dest, &ctx).expect("backup"), Outcome::Success);
        assert_eq!(job.state, JobState::Completed);
        assert!(job.finished_at.is_some());

        let job_dir = backup_dir(temp_dir.path(), SERIAL);
        assert!(job_dir.ends_with("backup/1A2B3C4D"));
        assert_eq!(
            fs::metadata(job_dir.join(RAW_IMAGE_NAME)).expect("raw").len(),
            GPP_SECTORS * SECTOR_SIZE as u64
        );
        assert!(job_dir.join("restore").join("partitions").is_dir());

        stage_for_restore(&job_dir, &["BOOT0", "BOOT1", "partitions/USER", RAW_IMAGE_NAME]);

        let mut target = blank_emmc();
        let mut job = create_job(Direction::Restore, sel).expect("job");
        plan_job(&mut job, &mut source).expect("plan");
        assert_eq!(run_job(&mut job, &mut target, &dest, &ctx).expect("restore"), Outcome::Success);

        assert_eq!(target.boot0.as_bytes(), source.boot0.as_bytes());
        assert_eq!(target.boot1.as_bytes(), source.boot1.as_bytes());
        assert_eq!(target.gpp.as_bytes(), source.gpp.as_bytes());
        assert!(sink.has_log("Restored USER"));
    }

    #[test]
    fn test_declined_overwrite_skips_region() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dest = destination(temp_dir.path(), 1 << 30);
        let config = config();
        let sink = RecordingSink::default();
        let ctx = Context::new(&config, &sink);

        let job_dir = backup_dir(temp_dir.path(), SERIAL);
        fs::create_dir_all(&job_dir).expect("mkdir");
        fs::write(job_dir.join("BOOT0"), b"keep me").expect("write");

        let mut emmc = sample_emmc();
        let mut job = create_job(Direction::Backup, selection(true, false, false, false)).expect("job");
        plan_job(&mut job, &mut emmc).expect("plan");
        run_job(&mut job, &mut emmc, &dest, &ctx).expect("run");

        assert_eq!(job.reports[0].outcome, RegionOutcome::SkippedExisting);
        assert_eq!(fs::read(job_dir.join("BOOT0")).expect("read"), b"keep me");
        assert!(matches!(job.reports[1].outcome, RegionOutcome::Transferred(Outcome::Success)));
        assert_eq!(sink.prompts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_partial_backup_pauses_and_keeps_marker() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        // 2 MiB image, 512 KiB parts, room for two of them.
        let dest = destination(temp_dir.path(), 1 << 20);
        let config = EngineConfig {
            part_size_bytes: Some(512 << 10),
            ..config()
        };
        let sink = RecordingSink::permissive();
        let ctx = Context::new(&config, &sink);

        let mut emmc = sample_emmc();
        let mut job = create_job(Direction::Backup, selection(false, false, false, true)).expect("job");
        plan_job(&mut job, &mut emmc).expect("plan");
        let outcome = run_job(&mut job, &mut emmc, &dest, &ctx).expect("run");

        assert_eq!(outcome, Outcome::Paused { next_part: 2 });
        assert_eq!(job.state, JobState::Paused);
        let job_dir = backup_dir(temp_dir.path(), SERIAL);
        assert!(job_dir.join("rawnand.bin.00").is_file());
        assert!(job_dir.join("rawnand.bin.01").is_file());
        assert!(!job_dir.join("rawnand.bin.02").exists());
        assert_eq!(ResumeMarker::in_dir(&job_dir).load().expect("marker"), Some(2));
    }

    #[test]
    fn test_restore_without_any_source_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dest = destination(temp_dir.path(), 1 << 30);
        let config = config();
        let sink = RecordingSink::permissive();
        let ctx = Context::new(&config, &sink);

        let mut emmc = blank_emmc();
        let mut job = create_job(Direction::Restore, selection(true, false, false, false)).expect("job");
        plan_job(&mut job, &mut emmc).expect("plan");
        assert!(matches!(
            run_job(&mut job, &mut emmc, &dest, &ctx),
            Err(EngineError::MissingSource { .. })
        ));
        assert_eq!(job.state, JobState::Failed);
        assert!(sink.has_log("not found, skipping"));
    }

    #[test]
    fn test_restore_size_checks() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dest = destination(temp_dir.path(), 1 << 30);
        let config = config();
        let restore_dir = backup_dir(temp_dir.path(), SERIAL).join(RESTORE_DIR);
        fs::create_dir_all(&restore_dir).expect("mkdir");

        // Larger than BOOT0: never restorable.
        fs::write(restore_dir.join("BOOT0"), vec![1u8; 257 * SECTOR_SIZE]).expect("write");
        let sink = RecordingSink::permissive();
        let ctx = Context::new(&config, &sink);
        let mut emmc = blank_emmc();
        let mut job = create_job(Direction::Restore, selection(true, false, false, false)).expect("job");
        plan_job(&mut job, &mut emmc).expect("plan");
        assert!(matches!(
            run_job(&mut job, &mut emmc, &dest, &ctx),
            Err(EngineError::SizeMismatch { expected: 256, actual: 257 })
        ));
        assert!(sink.has_log("inconsistent state"));

        // Smaller: restored only when the caller accepts.
        fs::write(restore_dir.join("BOOT0"), vec![1u8; 128 * SECTOR_SIZE]).expect("write");
        let declining = RecordingSink::default();
        let ctx = Context::new(&config, &declining);
        let mut job = create_job(Direction::Restore, selection(true, false, false, false)).expect("job");
        plan_job(&mut job, &mut emmc).expect("plan");
        assert!(matches!(
            run_job(&mut job, &mut emmc, &dest, &ctx),
            Err(EngineError::SizeMismatch { expected: 256, actual: 128 })
        ));

        let ctx = Context::new(&config, &sink);
        let mut job = create_job(Direction::Restore, selection(true, false, false, false)).expect("job");
        plan_job(&mut job, &mut emmc).expect("plan");
        run_job(&mut job, &mut emmc, &dest, &ctx).expect("truncated restore");
        assert!(emmc.boot0.sectors(0, 128).iter().all(|&b| b == 1));
        assert!(emmc.boot0.sectors(128, 128).iter().all(|&b| b == 0));
    }

    struct FailingReads {
        inner: MemoryBlockDevice,
        fail_from: u64,
    }

    impl BlockDevice for FailingReads {
        fn read_sectors(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> io::Result<()> {
            if lba + count as u64 > self.fail_from {
                return Err(io::Error::new(io::ErrorKind::Other, "bad block"));
            }
            self.inner.read_sectors(lba, count, buf)
        }

        fn write_sectors(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()> {
            self.inner.write_sectors(lba, count, buf)
        }

        fn sector_count(&self) -> u64 {
            self.inner.sector_count()
        }
    }

    #[test]
    fn test_backup_error_removes_output() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dest = destination(temp_dir.path(), 1 << 30);
        let config = config();
        let sink = RecordingSink::permissive();
        let ctx = Context::new(&config, &sink);

        let failing = |sectors| FailingReads {
            inner: MemoryBlockDevice::new(sectors),
            fail_from: 200,
        };
        let mut emmc = Emmc::new(failing(256), failing(256), failing(GPP_SECTORS), SERIAL, 1);
        let mut job = create_job(Direction::Backup, selection(true, false, false, false)).expect("job");
        plan_job(&mut job, &mut emmc).expect("plan");

        let err = run_job(&mut job, &mut emmc, &dest, &ctx).expect_err("read failure");
        assert_eq!(err.lba(), Some(192));
        assert_eq!(job.state, JobState::Failed);
        assert!(!backup_dir(temp_dir.path(), SERIAL).join("BOOT0").exists());
        assert!(job.reports.is_empty());
    }

    #[test]
    fn test_run_requires_planned_pending_job() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let dest = destination(temp_dir.path(), 1 << 30);
        let config = config();
        let sink = RecordingSink::permissive();
        let ctx = Context::new(&config, &sink);
        let mut emmc = sample_emmc();

        let mut job = create_job(Direction::Backup, selection(true, false, false, false)).expect("job");
        assert!(matches!(
            run_job(&mut job, &mut emmc, &dest, &ctx),
            Err(EngineError::Config { .. })
        ));

        plan_job(&mut job, &mut emmc).expect("plan");
        run_job(&mut job, &mut emmc, &dest, &ctx).expect("run");
        assert!(run_job(&mut job, &mut emmc, &dest, &ctx).is_err());
    }
}
