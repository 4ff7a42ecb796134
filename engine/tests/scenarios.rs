//! End-to-end scenarios through the public engine API.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use engine::emummc::{create_raw_emummc, find_emummc_partition, PartitionLookup};
use engine::gpt::{GptHeader, Guid};
use engine::mbr::{Mbr, MbrEntry, MBR_TYPE_EMUMMC, MBR_TYPE_FAT32_LBA};
use engine::multipart::{
    locate_restore_source, PartNaming, PartReader, PartWriter, ResumeMarker, SplitPlan,
};
use engine::transfer::{ChunkDestination, DeviceEndpoint};
use engine::{
    backup_dir, create_job, plan_job, run_job, transfer, BackupSelection, BlockDevice, Context,
    Destination, DestinationFs, Direction, Emmc, EngineConfig, EngineError, FileBlockDevice,
    FsKind, IoOp, JobState, LogLevel, MemoryBlockDevice, Outcome, ProgressSink, Prompt,
    RawEmummc, Region, TransferJob, VerificationPolicy, SECTOR_SIZE,
};
use proptest::prelude::*;

#[derive(Default)]
struct Recorder {
    percents: Mutex<Vec<u32>>,
    logs: Mutex<Vec<String>>,
}

impl ProgressSink for Recorder {
    fn on_progress(&self, percent: u32) {
        self.percents.lock().unwrap().push(percent);
    }

    fn on_log(&self, _level: LogLevel, message: &str) {
        self.logs.lock().unwrap().push(message.to_string());
    }

    fn confirm(&self, _prompt: &Prompt<'_>) -> bool {
        true
    }
}

fn test_config(chunk_sectors: u32) -> EngineConfig {
    EngineConfig {
        chunk_sectors,
        retry_backoff_ms: 0,
        verification: VerificationPolicy::Full,
        ..Default::default()
    }
}

fn patterned(sectors: u64, seed: u8) -> MemoryBlockDevice {
    let mut dev = MemoryBlockDevice::new(sectors);
    for (i, b) in dev.as_bytes_mut().iter_mut().enumerate() {
        *b = ((i * 7 + i / SECTOR_SIZE) as u8) ^ seed;
    }
    dev
}

fn exfat(root: &Path, free_bytes: u64) -> Destination {
    Destination {
        root: root.to_path_buf(),
        fs: DestinationFs {
            kind: FsKind::ExFat,
            free_bytes,
            capacity_bytes: 32 << 30,
        },
    }
}

fn raw_only() -> BackupSelection {
    BackupSelection {
        raw: true,
        ..Default::default()
    }
}

#[test]
fn test_backup_then_restore_4mib_region() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let dest = exfat(temp_dir.path(), 1 << 30);
    let config = test_config(256);
    let sink = Recorder::default();
    let ctx = Context::new(&config, &sink);

    let mut source = Emmc::new(patterned(64, 1), patterned(64, 2), patterned(8192, 3), 0xA5A5_0001, 1);
    let mut job = create_job(Direction::Backup, raw_only()).expect("job");
    plan_job(&mut job, &mut source).expect("plan");
    assert_eq!(run_job(&mut job, &mut source, &dest, &ctx).expect("backup"), Outcome::Success);

    let job_dir = backup_dir(temp_dir.path(), 0xA5A5_0001);
    fs::rename(job_dir.join("rawnand.bin"), job_dir.join("restore/rawnand.bin")).expect("stage");

    let mut target = Emmc::new(
        MemoryBlockDevice::new(64),
        MemoryBlockDevice::new(64),
        MemoryBlockDevice::new(8192),
        0xA5A5_0001,
        1,
    );
    let mut job = create_job(Direction::Restore, raw_only()).expect("job");
    plan_job(&mut job, &mut target).expect("plan");
    assert_eq!(run_job(&mut job, &mut target, &dest, &ctx).expect("restore"), Outcome::Success);
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(target.gpp.as_bytes(), source.gpp.as_bytes());
    assert_eq!(sink.percents.lock().unwrap().last(), Some(&100));
}

#[test]
fn test_insufficient_space_detected_before_writing() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let images = temp_dir.path().join("images");
    fs::create_dir_all(&images).expect("mkdir");
    let gpp_sectors = (3u64 << 30) / SECTOR_SIZE as u64;
    let mut emmc = Emmc::new(
        FileBlockDevice::create(&images.join("boot0.img"), 64).expect("boot0"),
        FileBlockDevice::create(&images.join("boot1.img"), 64).expect("boot1"),
        FileBlockDevice::create(&images.join("gpp.img"), gpp_sectors).expect("gpp"),
        0x0BAD_CAFE,
        1,
    );

    let root = temp_dir.path().join("sd");
    let dest = Destination {
        root: root.clone(),
        fs: DestinationFs {
            kind: FsKind::Fat32,
            free_bytes: 1 << 30,
            capacity_bytes: 32 << 30,
        },
    };
    let config = EngineConfig {
        verification: VerificationPolicy::Sparse,
        ..test_config(8192)
    };
    let sink = Recorder::default();
    let ctx = Context::new(&config, &sink);

    let mut job = create_job(Direction::Backup, raw_only()).expect("job");
    plan_job(&mut job, &mut emmc).expect("plan");
    let err = run_job(&mut job, &mut emmc, &dest, &ctx).expect_err("no room");
    assert!(matches!(
        err,
        EngineError::InsufficientSpace {
            needed,
            available: 0x4000_0000,
        } if needed == 3 << 30
    ));
    assert_eq!(job.state, JobState::Failed);

    let job_dir = backup_dir(&root, 0x0BAD_CAFE);
    assert!(!job_dir.join("rawnand.bin").exists());
    assert!(!job_dir.join("rawnand.bin.00").exists());
    assert!(sink.percents.lock().unwrap().is_empty());
}

/// Device whose writes into one chunk fail a fixed number of times.
struct FlakyChunk {
    inner: MemoryBlockDevice,
    bad_lba: u64,
    failures_left: u32,
}

impl ChunkDestination for FlakyChunk {
    fn write_chunk(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()> {
        if lba == self.bad_lba && self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "injected write fault"));
        }
        self.inner.write_sectors(lba, count, buf)
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_chunk_five_write_fault_recovers_on_second_retry() {
    let config = test_config(64);
    let sink = Recorder::default();
    let ctx = Context::new(&config, &sink);

    let mut source_dev = patterned(640, 9);
    let mut dest = FlakyChunk {
        inner: MemoryBlockDevice::new(640),
        bad_lba: 4 * 64,
        failures_left: 2,
    };

    let region = Region::new("chunks", 0, 639).expect("region");
    let mut job = TransferJob::new(region, Direction::Restore);
    let outcome = {
        let mut source = DeviceEndpoint::new(&mut source_dev);
        transfer(&mut job, &mut source, &mut dest, &ctx).expect("transfer")
    };

    assert_eq!(outcome, Outcome::Success);
    assert_eq!(job.retries, 2);
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(dest.inner.as_bytes(), source_dev.as_bytes());
    assert_eq!(
        sink.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.contains("retrying"))
            .count(),
        2
    );
}

#[test]
fn test_write_fault_past_retry_budget_is_fatal() {
    let config = test_config(64);
    let sink = Recorder::default();
    let ctx = Context::new(&config, &sink);

    let mut source_dev = patterned(640, 9);
    let mut dest = FlakyChunk {
        inner: MemoryBlockDevice::new(640),
        bad_lba: 4 * 64,
        failures_left: 3,
    };
    let mut job = TransferJob::new(Region::new("chunks", 0, 639).expect("region"), Direction::Restore);
    let err = {
        let mut source = DeviceEndpoint::new(&mut source_dev);
        transfer(&mut job, &mut source, &mut dest, &ctx).expect_err("fatal")
    };
    assert!(matches!(
        err,
        EngineError::Io {
            op: IoOp::Write,
            lba: 256,
            retry_count: 3,
            ..
        }
    ));
    assert!(err.is_device_threatening());
    assert_eq!(job.state, JobState::Failed);
}

/// One backup pass the way the orchestrator runs it for split images.
fn split_backup(
    device: &mut MemoryBlockDevice,
    base: &Path,
    plan: SplitPlan,
    ctx: &Context<'_>,
) -> Outcome {
    let marker = ResumeMarker::in_dir(base.parent().expect("parent"));
    let region = Region::with_len("rawnand.bin", 0, device.sector_count()).expect("region");
    let mut job = TransferJob::new(region, Direction::Backup);
    job.current_lba += plan.resume_from as u64 * plan.part_sectors();
    let mut writer = PartWriter::split(base, PartNaming::Dotted, plan, Some(marker.clone()));
    let outcome = {
        let mut source = DeviceEndpoint::new(device);
        transfer(&mut job, &mut source, &mut writer, ctx).expect("transfer")
    };
    writer.finish().expect("finish");
    if outcome == Outcome::Success {
        marker.clear().expect("clear");
    }
    outcome
}

fn read_parts(base: &Path) -> Vec<u8> {
    let source = locate_restore_source(base, PartNaming::Dotted, 1).expect("parts");
    source
        .files
        .iter()
        .flat_map(|(path, _)| fs::read(path).expect("part"))
        .collect()
}

#[test]
fn test_interrupted_split_backup_resumes_at_next_part() {
    let config = test_config(32);
    let sink = Recorder::default();
    let ctx = Context::new(&config, &sink);
    let mut device = patterned(4096, 0x42);
    let part_bytes = 256 * 1024;
    let part_count = 8;

    let whole_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let whole = whole_dir.path().join("rawnand.bin");
    let full_plan = SplitPlan {
        part_bytes,
        part_count,
        max_parts: part_count,
        partial: false,
        resume_from: 0,
    };
    assert_eq!(split_backup(&mut device, &whole, full_plan, &ctx), Outcome::Success);

    let resumed_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let resumed = resumed_dir.path().join("rawnand.bin");
    let first = SplitPlan {
        max_parts: 3,
        partial: true,
        ..full_plan
    };
    assert_eq!(
        split_backup(&mut device, &resumed, first, &ctx),
        Outcome::Paused { next_part: 3 }
    );
    let marker = ResumeMarker::in_dir(resumed_dir.path());
    assert_eq!(marker.load().expect("marker"), Some(3));
    assert!(!resumed_dir.path().join("rawnand.bin.03").exists());

    let second = SplitPlan {
        max_parts: part_count,
        partial: true,
        resume_from: 3,
        ..full_plan
    };
    assert_eq!(split_backup(&mut device, &resumed, second, &ctx), Outcome::Success);
    assert!(!marker.exists());

    assert_eq!(read_parts(&resumed), read_parts(&whole));
    assert_eq!(read_parts(&resumed), device.as_bytes());
}

#[test]
fn test_resumed_split_backup_with_uneven_chunks_keeps_parts_exact() {
    let part_bytes = 256 * 1024;
    let part_count = 8;
    // None of these divide a 512-sector part.
    for chunk_sectors in [24u32, 7, 100, 700] {
        let config = test_config(chunk_sectors);
        let sink = Recorder::default();
        let ctx = Context::new(&config, &sink);
        let mut device = patterned(4096, chunk_sectors as u8);

        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = dir.path().join("rawnand.bin");
        let first = SplitPlan {
            part_bytes,
            part_count,
            max_parts: 3,
            partial: true,
            resume_from: 0,
        };
        assert_eq!(
            split_backup(&mut device, &base, first, &ctx),
            Outcome::Paused { next_part: 3 }
        );
        let second = SplitPlan {
            max_parts: part_count,
            resume_from: 3,
            ..first
        };
        assert_eq!(split_backup(&mut device, &base, second, &ctx), Outcome::Success);

        let source = locate_restore_source(&base, PartNaming::Dotted, part_bytes).expect("parts");
        assert_eq!(source.files.len(), part_count as usize);
        for (path, len) in &source.files {
            assert_eq!(*len, part_bytes, "chunk {}: {}", chunk_sectors, path.display());
        }
        assert_eq!(read_parts(&base), device.as_bytes(), "chunk {}", chunk_sectors);
    }
}

#[test]
fn test_raw_emummc_created_found_and_backed_up() {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let sd_root = temp_dir.path().join("sd");
    fs::create_dir_all(&sd_root).expect("mkdir");
    let config = test_config(256);
    let sink = Recorder::default();
    let ctx = Context::new(&config, &sink);

    let mut gpp = patterned(0x1000, 0x77);
    let mut header = GptHeader::primary(0x1000, Guid::random());
    header.seal();
    gpp.write_sectors(1, 1, &header.to_sector()).expect("gpt");
    let mut emmc = Emmc::new(patterned(0x2000, 0x11), patterned(0x2000, 0x22), gpp, 0x5151_0001, 32);

    let mut sd = FileBlockDevice::create(&temp_dir.path().join("sd.img"), 0x50_0000).expect("sd");
    let mut mbr = Mbr::default();
    mbr.partitions[0] = MbrEntry::new(MBR_TYPE_FAT32_LBA, 0x800, 0x7800);
    mbr.partitions[1] = MbrEntry::new(MBR_TYPE_FAT32_LBA, 0x8000, 0x4F_8000);
    mbr.write_to(&mut sd).expect("mbr");

    let sector_start = 0x8000 + 0x8000;
    let report = create_raw_emummc(&mut emmc, &mut sd, 1, sector_start, &sd_root, &ctx).expect("create");
    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(
        Mbr::read_from(&mut sd).expect("mbr").partitions[1].part_type,
        MBR_TYPE_EMUMMC
    );

    let found = find_emummc_partition(&mut sd, PartitionLookup::Backup)
        .expect("scan")
        .expect("emuMMC");
    assert_eq!(found.part_index, 1);
    assert_eq!(found.sector_start, sector_start);
    assert_eq!(found.sector_count, 0x1000);

    let mut raw = RawEmummc::new(sd, found.sector_start, found.sector_count, 0x5151_0001, 32).expect("raw");
    let dest = exfat(&sd_root, 1 << 30);
    let mut job = create_job(
        Direction::Backup,
        BackupSelection {
            boot: true,
            raw: true,
            ..Default::default()
        },
    )
    .expect("job");
    plan_job(&mut job, &mut raw).expect("plan");
    assert_eq!(run_job(&mut job, &mut raw, &dest, &ctx).expect("backup"), Outcome::Success);

    let job_dir = backup_dir(&sd_root, 0x5151_0001);
    assert_eq!(fs::read(job_dir.join("BOOT0")).expect("boot0"), emmc.boot0.as_bytes());
    assert_eq!(fs::read(job_dir.join("BOOT1")).expect("boot1"), emmc.boot1.as_bytes());
    assert_eq!(fs::read(job_dir.join("rawnand.bin")).expect("gpp"), emmc.gpp.as_bytes());
    // Verification is skipped for raw emuMMC sources.
    assert!(!sink.logs.lock().unwrap().iter().any(|l| l.starts_with("Verifying")));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn split_then_reassemble_matches_device(
        sectors in 2u64..600,
        chunks_per_part in 1u64..6,
        seed in any::<u8>(),
    ) {
        let config = test_config(16);
        let sink = Recorder::default();
        let ctx = Context::new(&config, &sink);
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = temp_dir.path().join("image.bin");

        let mut device = patterned(sectors, seed);
        let part_bytes = chunks_per_part * config.chunk_bytes();
        let total_bytes = sectors * SECTOR_SIZE as u64;
        let part_count = ((total_bytes + part_bytes - 1) / part_bytes) as u32;
        let plan = SplitPlan {
            part_bytes,
            part_count,
            max_parts: part_count,
            partial: false,
            resume_from: 0,
        };

        let region = Region::with_len("image", 0, sectors).expect("region");
        let mut job = TransferJob::new(region.clone(), Direction::Backup);
        let mut writer = PartWriter::split(&base, PartNaming::Dotted, plan, None);
        {
            let mut source = DeviceEndpoint::new(&mut device);
            transfer(&mut job, &mut source, &mut writer, &ctx).expect("backup");
        }
        let parts = writer.finish().expect("finish");
        prop_assert_eq!(parts.len() as u32, part_count);

        let source = locate_restore_source(&base, PartNaming::Dotted, config.chunk_bytes()).expect("parts");
        prop_assert_eq!(source.total_bytes(), total_bytes);

        let mut restored = MemoryBlockDevice::new(sectors);
        let mut job = TransferJob::new(region, Direction::Restore);
        let mut reader = PartReader::new(&source, 0);
        {
            let mut target = DeviceEndpoint::new(&mut restored);
            transfer(&mut job, &mut reader, &mut target, &ctx).expect("restore");
        }
        prop_assert_eq!(restored.as_bytes(), device.as_bytes());
    }
}
