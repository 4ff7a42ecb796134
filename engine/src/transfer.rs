//! Chunked transfer engine.
//!
//! [`transfer`] moves one region between a [`ChunkSource`] and a
//! [`ChunkDestination`] in fixed-size chunks, retrying failed reads and writes,
//! reporting progress on change and polling the cancel predicate between chunks.

use std::io;
use std::thread;

use tracing::debug;

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::error::{EngineError, IoOp};
use crate::model::{Direction, JobState, Outcome, TransferJob};
use crate::progress::{Context, LogLevel};

/// Where chunks are read from.
pub trait ChunkSource {
    /// Fill `buf` with `count` sectors starting at `lba`.
    fn read_chunk(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> io::Result<()>;
}

/// Whether the destination can take the next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkGate {
    Proceed,
    /// The destination is full; stop before part `next_part`.
    Pause { next_part: u32 },
}

/// Where chunks are written to.
pub trait ChunkDestination {
    /// Called once before each chunk, outside the retry loop. File destinations
    /// open and roll over parts here.
    fn begin_chunk(&mut self, _lba: u64) -> Result<ChunkGate, EngineError> {
        Ok(ChunkGate::Proceed)
    }

    /// Write one chunk. Must be safe to call again with the same data after a failure.
    fn write_chunk(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()>;

    fn sync(&mut self) -> io::Result<()>;

    /// Index of the part currently being written.
    fn part_index(&self) -> u32 {
        0
    }

    /// Bytes written into the current part.
    fn bytes_in_part(&self) -> u64 {
        0
    }

    /// Sectors the current part can still take, if it is bounded. Queried after
    /// `begin_chunk`; chunks are shortened so they never cross a part boundary.
    fn chunk_limit(&self) -> Option<u64> {
        None
    }
}

/// A block device used directly as a transfer endpoint.
pub struct DeviceEndpoint<'a> {
    device: &'a mut dyn BlockDevice,
}

impl<'a> DeviceEndpoint<'a> {
    pub fn new(device: &'a mut dyn BlockDevice) -> Self {
        DeviceEndpoint { device }
    }
}

impl ChunkSource for DeviceEndpoint<'_> {
    fn read_chunk(&mut self, lba: u64, count: u32, buf: &mut [u8]) -> io::Result<()> {
        self.device.read_sectors(lba, count, buf)
    }
}

impl ChunkDestination for DeviceEndpoint<'_> {
    fn write_chunk(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()> {
        self.device.write_sectors(lba, count, buf)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.device.flush()
    }
}

/// Move `job.region` from `source` to `dest`, starting at `job.current_lba`.
///
/// The job must be `Pending`. It ends `Completed`, `Cancelled`, `Paused` or
/// `Failed`, with `current_lba` pointing at the first sector not transferred.
/// Cancellation is honored for backups only; a restore always runs to the end
/// so the device is never left half-written on purpose.
pub fn transfer(
    job: &mut TransferJob,
    source: &mut dyn ChunkSource,
    dest: &mut dyn ChunkDestination,
    ctx: &Context<'_>,
) -> Result<Outcome, EngineError> {
    if job.state != JobState::Pending {
        return Err(EngineError::InvalidRegion {
            name: format!("{} (job is {:?}, expected Pending)", job.region.name, job.state),
            lba_start: job.region.lba_start,
            lba_end: job.region.lba_end,
        });
    }

    job.state = JobState::Running;
    debug!(
        "{} of {} starting at LBA {:#X} ({} sectors)",
        job.direction,
        job.region,
        job.current_lba,
        job.total_sectors - job.sectors_done()
    );

    match run_chunks(job, source, dest, ctx) {
        Ok(outcome) => {
            let state = match outcome {
                Outcome::Success => JobState::Completed,
                Outcome::Cancelled => JobState::Cancelled,
                Outcome::Paused { .. } => JobState::Paused,
            };
            job.finish(state);
            Ok(outcome)
        }
        Err(e) => {
            job.finish(JobState::Failed);
            Err(e)
        }
    }
}

fn run_chunks(
    job: &mut TransferJob,
    source: &mut dyn ChunkSource,
    dest: &mut dyn ChunkDestination,
    ctx: &Context<'_>,
) -> Result<Outcome, EngineError> {
    let config = ctx.config;
    let chunk_sectors = config.chunk_sectors as u64;
    let mut buf = vec![0u8; config.chunk_bytes() as usize];
    let mut prev_pct = None;
    let mut since_sync = 0u64;
    let mut part = dest.part_index();

    while job.current_lba <= job.region.lba_end {
        let pct = job.percent();
        if prev_pct != Some(pct) {
            ctx.progress.on_progress(pct);
            prev_pct = Some(pct);
        }

        let lba = job.current_lba;
        if let ChunkGate::Pause { next_part } = dest.begin_chunk(lba)? {
            job.part_index = next_part;
            return Ok(Outcome::Paused { next_part });
        }

        let mut count = chunk_sectors.min(job.region.lba_end - lba + 1);
        if let Some(limit) = dest.chunk_limit() {
            count = count.min(limit.max(1));
        }
        let count = count as u32;
        if dest.part_index() != part {
            part = dest.part_index();
            job.part_index = part;
            since_sync = 0;
        }

        let data = &mut buf[..count as usize * SECTOR_SIZE];
        job.retries += with_retries(ctx, IoOp::Read, lba, || {
            source.read_chunk(lba, count, &mut data[..])
        })?;
        let data = &buf[..count as usize * SECTOR_SIZE];
        job.retries += with_retries(ctx, IoOp::Write, lba, || dest.write_chunk(lba, count, data))?;

        since_sync += data.len() as u64;
        if since_sync >= config.flush_interval_bytes {
            dest.sync().map_err(|e| EngineError::Io {
                op: IoOp::Write,
                lba,
                retry_count: 1,
                source: e,
            })?;
            since_sync = 0;
        }

        job.current_lba += count as u64;
        job.bytes_in_current_part = dest.bytes_in_part();

        if job.direction == Direction::Backup && ctx.is_cancelled() {
            ctx.log(LogLevel::Warn, "Transfer was cancelled");
            return Ok(Outcome::Cancelled);
        }
    }

    dest.sync().map_err(|e| EngineError::Io {
        op: IoOp::Write,
        lba: job.region.lba_end,
        retry_count: 1,
        source: e,
    })?;
    if prev_pct != Some(100) {
        ctx.progress.on_progress(100);
    }
    Ok(Outcome::Success)
}

/// Run `attempt` up to `retry_attempts` times, sleeping the backoff between tries.
///
/// Returns the number of retries it took.
fn with_retries<F>(ctx: &Context<'_>, op: IoOp, lba: u64, mut attempt: F) -> Result<u32, EngineError>
where
    F: FnMut() -> io::Result<()>,
{
    let attempts = ctx.config.retry_attempts.max(1);
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt() {
            Ok(()) => return Ok(tries - 1),
            Err(e) if tries >= attempts => {
                ctx.log(
                    LogLevel::Error,
                    &format!("Failed to {} sector {:#010X} after {} tries", op, lba, tries),
                );
                return Err(EngineError::Io {
                    op,
                    lba,
                    retry_count: tries,
                    source: e,
                });
            }
            Err(e) => {
                debug!("{} error at LBA {:#010X} (try {}): {}", op, lba, tries, e);
                ctx.log(
                    LogLevel::Warn,
                    &format!("Sector {} failed at {:#010X}, retrying...", op, lba),
                );
                thread::sleep(ctx.config.retry_backoff());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::device::MemoryBlockDevice;
    use crate::model::Region;
    use crate::progress::testing::RecordingSink;
    use crate::progress::NoProgress;
    use std::cell::Cell;

    fn config() -> EngineConfig {
        EngineConfig {
            chunk_sectors: 8,
            retry_backoff_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn patterned(sectors: u64) -> MemoryBlockDevice {
        let mut dev = MemoryBlockDevice::new(sectors);
        for (i, b) in dev.as_bytes_mut().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        dev
    }

    /// Fails the first `failures` writes at `fail_lba`.
    struct FlakyWrites {
        inner: MemoryBlockDevice,
        fail_lba: u64,
        failures: u32,
        syncs: u32,
    }

    impl ChunkDestination for FlakyWrites {
        fn write_chunk(&mut self, lba: u64, count: u32, buf: &[u8]) -> io::Result<()> {
            if lba == self.fail_lba && self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::TimedOut, "injected"));
            }
            self.inner.write_sectors(lba, count, buf)
        }

        fn sync(&mut self) -> io::Result<()> {
            self.syncs += 1;
            Ok(())
        }
    }

    #[test]
    fn test_copies_region_with_partial_last_chunk() {
        let config = config();
        let sink = RecordingSink::default();
        let ctx = Context::new(&config, &sink);
        let mut src = patterned(64);
        let mut dst = MemoryBlockDevice::new(64);

        let mut job = TransferJob::new(Region::new("GPP", 3, 41).expect("region"), Direction::Restore);
        let outcome = transfer(
            &mut job,
            &mut DeviceEndpoint::new(&mut src),
            &mut DeviceEndpoint::new(&mut dst),
            &ctx,
        )
        .expect("transfer");

        assert_eq!(outcome, Outcome::Success);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.current_lba, 42);
        assert_eq!(dst.sectors(3, 39), src.sectors(3, 39));
        assert!(dst.sectors(42, 1).iter().all(|&b| b == 0));

        let percents = sink.percents();
        assert_eq!(percents.first(), Some(&0));
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_write_failure_recovered_on_retry() {
        let config = config();
        let ctx = Context::new(&config, &NoProgress);
        let mut src = patterned(64);
        let mut dest = FlakyWrites {
            inner: MemoryBlockDevice::new(64),
            fail_lba: 40,
            failures: 2,
            syncs: 0,
        };

        let mut job = TransferJob::new(Region::new("USER", 0, 63).expect("region"), Direction::Backup);
        let outcome = transfer(&mut job, &mut DeviceEndpoint::new(&mut src), &mut dest, &ctx)
            .expect("transfer");
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(job.retries, 2);
        assert_eq!(dest.inner.as_bytes(), src.as_bytes());
    }

    #[test]
    fn test_exhausted_retries_fail_with_write_error() {
        let config = config();
        let ctx = Context::new(&config, &NoProgress);
        let mut src = patterned(32);
        let mut dest = FlakyWrites {
            inner: MemoryBlockDevice::new(32),
            fail_lba: 16,
            failures: 3,
            syncs: 0,
        };

        let mut job = TransferJob::new(Region::new("USER", 0, 31).expect("region"), Direction::Restore);
        let err = transfer(&mut job, &mut DeviceEndpoint::new(&mut src), &mut dest, &ctx)
            .expect_err("should fail");
        assert!(matches!(
            err,
            EngineError::Io { op: IoOp::Write, lba: 16, retry_count: 3, .. }
        ));
        assert!(err.is_device_threatening());
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.current_lba, 16);
    }

    #[test]
    fn test_backup_honors_cancel_restore_ignores_it() {
        let config = config();
        let cancel = || true;
        let ctx = Context::new(&config, &NoProgress).with_cancel(&cancel);

        let mut src = patterned(32);
        let mut dst = MemoryBlockDevice::new(32);
        let mut job = TransferJob::new(Region::new("BOOT0", 0, 31).expect("region"), Direction::Backup);
        let outcome = transfer(
            &mut job,
            &mut DeviceEndpoint::new(&mut src),
            &mut DeviceEndpoint::new(&mut dst),
            &ctx,
        )
        .expect("transfer");
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.current_lba, 8);

        let mut job = TransferJob::new(Region::new("BOOT0", 0, 31).expect("region"), Direction::Restore);
        let outcome = transfer(
            &mut job,
            &mut DeviceEndpoint::new(&mut src),
            &mut DeviceEndpoint::new(&mut dst),
            &ctx,
        )
        .expect("transfer");
        assert_eq!(outcome, Outcome::Success);
    }

    #[test]
    fn test_flush_interval_syncs_destination() {
        let config = EngineConfig {
            flush_interval_bytes: 16 * SECTOR_SIZE as u64,
            ..config()
        };
        let ctx = Context::new(&config, &NoProgress);
        let mut src = patterned(64);
        let mut dest = FlakyWrites {
            inner: MemoryBlockDevice::new(64),
            fail_lba: u64::MAX,
            failures: 0,
            syncs: 0,
        };
        let mut job = TransferJob::new(Region::new("GPP", 0, 63).expect("region"), Direction::Backup);
        transfer(&mut job, &mut DeviceEndpoint::new(&mut src), &mut dest, &ctx).expect("transfer");
        // Four interval syncs plus the final one.
        assert_eq!(dest.syncs, 5);
    }

    #[test]
    fn test_job_must_be_pending() {
        let config = config();
        let ctx = Context::new(&config, &NoProgress);
        let mut src = patterned(8);
        let mut dst = MemoryBlockDevice::new(8);
        let mut job = TransferJob::new(Region::new("BOOT1", 0, 7).expect("region"), Direction::Backup);
        job.state = JobState::Completed;
        assert!(transfer(
            &mut job,
            &mut DeviceEndpoint::new(&mut src),
            &mut DeviceEndpoint::new(&mut dst),
            &ctx
        )
        .is_err());
    }

    #[test]
    fn test_retry_helper_counts_retries() {
        let config = config();
        let ctx = Context::new(&config, &NoProgress);
        let calls = Cell::new(0);
        let retries = with_retries(&ctx, IoOp::Read, 0, || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(io::Error::new(io::ErrorKind::Other, "flaky"))
            } else {
                Ok(())
            }
        })
        .expect("third try succeeds");
        assert_eq!(retries, 2);
    }
}
