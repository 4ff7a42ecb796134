//! nxbackup - Command-line interface for the backup engine.
//!
//! Drives eMMC backups, restores, SD partitioning and emuMMC creation against
//! device nodes or image files, with progress reporting to stderr.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use engine::emummc::{BOOT_AREA_SECTORS, PARTITION_RESERVED_SECTORS};
use engine::job::RegionOutcome;
use engine::mbr::Mbr;
use engine::{
    apply_plan, create_file_emummc, create_job, create_raw_emummc, find_emummc_partition,
    fix_hybrid_mbr, plan_job, run_job, AndroidScheme, BackupJob, BackupSelection, BlockDevice,
    Context, Destination, DestinationFs, Direction, Emmc, EngineConfig, FileBlockDevice, FsKind,
    LogLevel, MmcStorage, Outcome, PartitionLookup, PartitionPlan, PhysicalPartition,
    ProgressSink, Prompt, RawEmummc, ReferenceDevice, Region, SliderChange, TargetMedium,
    VerificationPolicy,
};

const LOG_ENV_VAR: &str = "NXBACKUP_LOG";
const MIB: u64 = 1 << 20;

static CANCELLED: AtomicBool = AtomicBool::new(false);

/// nxbackup - eMMC and SD card backup tool
#[derive(Parser, Debug)]
#[command(name = "nxbackup")]
#[command(version)]
#[command(about = "Back up, restore and partition eMMC and SD card storage")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Engine settings (TOML)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Verification policy: off, sparse, full or full-export
    #[arg(long, value_name = "POLICY", global = true)]
    verify: Option<String>,

    /// Overwrite existing backups without asking
    #[arg(long, global = true)]
    overwrite: bool,

    /// Restore backups that are smaller than the target region
    #[arg(long, global = true)]
    allow_truncated: bool,

    /// Enable verbose output
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up eMMC partitions to <dest>/backup/<serial>/
    Backup {
        #[command(flatten)]
        storage: StorageArgs,
        #[command(flatten)]
        dest: DestArgs,
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Restore from <dest>/backup/<serial>/restore/
    Restore {
        #[command(flatten)]
        storage: StorageArgs,
        #[command(flatten)]
        dest: DestArgs,
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Partition an SD card or eMMC for HOS, emuMMC, Linux and Android
    Partition(PartitionArgs),
    /// Repair the hybrid MBR of a GPT partitioned card
    FixMbr {
        /// Card device or image
        #[arg(long, value_name = "PATH")]
        device: PathBuf,
    },
    /// Create or locate an emuMMC
    #[command(subcommand)]
    Emummc(EmummcCommand),
}

#[derive(Subcommand, Debug)]
enum EmummcCommand {
    /// Copy the eMMC into files under <sd-root>/emuMMC/SDnn
    File {
        #[command(flatten)]
        storage: StorageArgs,
        #[command(flatten)]
        dest: DestArgs,
    },
    /// Copy the eMMC into an SD card partition and hide it
    Raw {
        #[command(flatten)]
        storage: StorageArgs,
        /// SD card device or image
        #[arg(long, value_name = "PATH")]
        sd: PathBuf,
        /// MBR entry (1-3); the first large enough entry when omitted
        #[arg(long, value_name = "INDEX")]
        part_index: Option<usize>,
        /// Mounted SD filesystem receiving emuMMC/emummc.ini
        #[arg(long, value_name = "PATH")]
        sd_root: PathBuf,
    },
    /// Look for an existing partition-based emuMMC
    Find {
        /// SD card device or image
        #[arg(long, value_name = "PATH")]
        sd: PathBuf,
    },
}

/// Where the eMMC partitions are read from or written to.
#[derive(ClapArgs, Debug, Clone)]
struct StorageArgs {
    /// BOOT0 device or image
    #[arg(long, value_name = "PATH", requires_all = ["boot1", "gpp"])]
    boot0: Option<PathBuf>,

    /// BOOT1 device or image
    #[arg(long, value_name = "PATH")]
    boot1: Option<PathBuf>,

    /// GPP (user area) device or image
    #[arg(long, value_name = "PATH")]
    gpp: Option<PathBuf>,

    /// Use the partition-based emuMMC on this SD card instead of an eMMC
    #[arg(long, value_name = "PATH", conflicts_with_all = ["boot0", "boot1", "gpp"])]
    emummc_sd: Option<PathBuf>,

    /// eMMC serial number (hex)
    #[arg(long, value_name = "HEX", value_parser = parse_hex_u32)]
    serial: u32,

    /// Boot partition size in 128 KiB units
    #[arg(long, value_name = "N", default_value_t = 32)]
    boot_mult: u32,
}

/// The removable storage holding the backup folder.
#[derive(ClapArgs, Debug, Clone)]
struct DestArgs {
    /// Mount point of the destination filesystem
    #[arg(long, value_name = "PATH")]
    dest: PathBuf,

    /// Destination filesystem: fat32 or exfat
    #[arg(long = "fs", value_name = "KIND", default_value = "fat32")]
    fs_kind: String,

    /// Free space on the destination in MiB (defaults to the capacity)
    #[arg(long, value_name = "MIB")]
    free_mib: Option<u64>,

    /// Destination capacity in MiB
    #[arg(long, value_name = "MIB", default_value_t = 64 * 1024)]
    capacity_mib: u64,
}

#[derive(ClapArgs, Debug, Clone, Copy)]
struct SelectionArgs {
    /// BOOT0 and BOOT1
    #[arg(long)]
    boot: bool,
    /// Every GPP partition except USER
    #[arg(long)]
    system: bool,
    /// The USER partition
    #[arg(long)]
    user: bool,
    /// The whole GPP as rawnand.bin
    #[arg(long)]
    raw: bool,
}

#[derive(ClapArgs, Debug, Clone)]
struct PartitionArgs {
    /// Card device or image
    #[arg(long, value_name = "PATH")]
    device: PathBuf,

    /// What is being partitioned: sd or emmc
    #[arg(long, value_name = "MEDIUM", default_value = "sd")]
    medium: String,

    /// eMMC size the full emuMMC is modeled on: 32 or 64
    #[arg(long, value_name = "GB", default_value = "32")]
    reference: String,

    /// emuMMC slider position (0-20)
    #[arg(long, value_name = "N", default_value_t = 0)]
    emummc: u32,

    /// Linux partition size in MiB
    #[arg(long, value_name = "MIB", default_value_t = 0)]
    linux_mib: u64,

    /// Android user data size in MiB
    #[arg(long, value_name = "MIB", default_value_t = 0)]
    android_mib: u64,

    /// Android layout: legacy or dynamic
    #[arg(long, value_name = "SCHEME", default_value = "legacy")]
    android_scheme: String,

    /// Print the plan without writing anything
    #[arg(long)]
    dry_run: bool,
}

fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid serial '{}': {}", s, e))
}

/// CLI implementation of ProgressSink for displaying transfer progress
struct CliProgress {
    verbose: bool,
    overwrite: bool,
    allow_truncated: bool,
    start_time: Instant,
    last_progress_update: Mutex<Option<Instant>>,
}

impl CliProgress {
    fn new(args: &Args) -> Self {
        CliProgress {
            verbose: args.verbose,
            overwrite: args.overwrite,
            allow_truncated: args.allow_truncated,
            start_time: Instant::now(),
            last_progress_update: Mutex::new(None),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn print_summary(&self, job: &BackupJob, outcome: Outcome) {
        eprintln!();
        match outcome {
            Outcome::Success => eprintln!("{} complete!", job.direction),
            Outcome::Cancelled => eprintln!("{} cancelled.", job.direction),
            Outcome::Paused { next_part } => eprintln!(
                "{} paused before part {}. Move the finished parts off the card and run it again.",
                job.direction, next_part
            ),
        }

        let mut bytes = 0;
        for (report, planned) in job.reports.iter().zip(&job.regions) {
            let status = match report.outcome {
                RegionOutcome::Transferred(Outcome::Success) => {
                    bytes += planned.region.bytes();
                    "Done"
                }
                RegionOutcome::Transferred(Outcome::Cancelled) => "Cancelled",
                RegionOutcome::Transferred(Outcome::Paused { .. }) => "Partial",
                RegionOutcome::SkippedExisting => "Skipped (exists)",
                RegionOutcome::SkippedMissingSource => "Skipped (no backup)",
            };
            if report.retries > 0 {
                eprintln!("  {}: {} ({} retries)", report.name, status, report.retries);
            } else {
                eprintln!("  {}: {}", report.name, status);
            }
            if self.verbose {
                for file in &report.files {
                    eprintln!("      {}", file.display());
                }
            }
        }

        eprintln!("Bytes transferred: {}", Self::format_bytes(bytes));
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
        if let Some(finished) = job.finished_at {
            eprintln!(
                "Finished: {}",
                finished.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
}

impl ProgressSink for CliProgress {
    fn on_region_started(&self, index: usize, total: usize, region: &Region) {
        eprintln!(
            "[{}/{}] {} ({})",
            index + 1,
            total,
            region.name,
            Self::format_bytes(region.bytes())
        );
        if let Ok(mut last) = self.last_progress_update.lock() {
            *last = None;
        }
    }

    fn on_progress(&self, percent: u32) {
        // Throttle progress updates to avoid spam (max once per 200ms)
        if let Ok(mut last) = self.last_progress_update.lock() {
            if percent < 100 && last.map_or(false, |t| t.elapsed().as_millis() < 200) {
                return;
            }
            *last = Some(Instant::now());
        }
        eprint!("\rProgress: {}", Self::print_progress_bar(percent));
        let _ = std::io::Write::flush(&mut std::io::stderr());
        if percent >= 100 {
            eprintln!();
        }
    }

    fn on_log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info if self.verbose => eprintln!("{}", message),
            LogLevel::Info => {}
            LogLevel::Warn => eprintln!("Warning: {}", message),
            LogLevel::Error => eprintln!("Error: {}", message),
        }
    }

    fn on_region_completed(&self, region: &Region, outcome: Outcome) {
        if self.verbose {
            eprintln!("{}: {:?}", region.name, outcome);
        }
    }

    fn confirm(&self, prompt: &Prompt<'_>) -> bool {
        match prompt {
            Prompt::Overwrite { path } => {
                if !self.overwrite {
                    eprintln!("{} exists; pass --overwrite to replace it", path.display());
                }
                self.overwrite
            }
            Prompt::SizeMismatch {
                path,
                expected_sectors,
                actual_sectors,
            } => {
                if !self.allow_truncated {
                    eprintln!(
                        "{} holds {} of {} sectors; pass --allow-truncated to restore it anyway",
                        path.display(),
                        actual_sectors,
                        expected_sectors
                    );
                }
                self.allow_truncated
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    match EnvFilter::builder().with_env_var(LOG_ENV_VAR).try_from_env() {
        Ok(filter) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
        Err(_) => {
            let level = if verbose {
                tracing::Level::DEBUG
            } else {
                tracing::Level::WARN
            };
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

/// Parse and validate command-line arguments, then run the command
fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    if let Err(e) = ctrlc::set_handler(|| {
        eprintln!("\nCancelling after the current chunk...");
        CANCELLED.store(true, Ordering::SeqCst);
    }) {
        tracing::warn!("Failed to install Ctrl-C handler: {}", e);
    }

    let exit_code = match run_cli(&args, &CANCELLED) {
        Ok(()) => 0,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

fn load_config(args: &Args) -> Result<EngineConfig, String> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_toml_file(path)
            .map_err(|e| format!("Failed to load {}: {}", path.display(), e))?,
        None => EngineConfig::default(),
    };
    if let Some(policy) = &args.verify {
        config.verification = policy.parse::<VerificationPolicy>().map_err(|e| e.to_string())?;
    }
    Ok(config)
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args, cancel: &AtomicBool) -> Result<(), String> {
    let config = load_config(args)?;
    let progress = CliProgress::new(args);
    let is_cancelled = || cancel.load(Ordering::SeqCst);
    let ctx = Context::new(&config, &progress).with_cancel(&is_cancelled);

    match &args.command {
        Command::Backup {
            storage,
            dest,
            selection,
        } => run_backup_job(Direction::Backup, storage, dest, *selection, &progress, &ctx),
        Command::Restore {
            storage,
            dest,
            selection,
        } => run_backup_job(Direction::Restore, storage, dest, *selection, &progress, &ctx),
        Command::Partition(partition) => run_partition(partition, &ctx),
        Command::FixMbr { device } => {
            let mut device = open_device(device)?;
            let changed = fix_hybrid_mbr(&mut device, &ctx).map_err(|e| format!("MBR repair failed: {}", e))?;
            if changed {
                eprintln!("Hybrid MBR rewritten.");
            } else {
                eprintln!("Hybrid MBR already matches the GPT.");
            }
            Ok(())
        }
        Command::Emummc(command) => run_emummc(command, &ctx),
    }
}

fn open_device(path: &Path) -> Result<FileBlockDevice, String> {
    FileBlockDevice::open(path).map_err(|e| format!("Cannot open {}: {}", path.display(), e))
}

fn open_storage(args: &StorageArgs) -> Result<Box<dyn MmcStorage>, String> {
    if let Some(sd_path) = &args.emummc_sd {
        let mut sd = open_device(sd_path)?;
        let found = find_emummc_partition(&mut sd, PartitionLookup::Backup)
            .map_err(|e| format!("Failed to scan {}: {}", sd_path.display(), e))?
            .ok_or_else(|| format!("No emuMMC partition found on {}", sd_path.display()))?;
        eprintln!(
            "Using emuMMC in partition {} at sector {:#X}",
            found.part_index, found.sector_start
        );
        let raw = RawEmummc::new(sd, found.sector_start, found.sector_count, args.serial, args.boot_mult)
            .map_err(|e| format!("Invalid emuMMC location: {}", e))?;
        return Ok(Box::new(raw));
    }

    match (&args.boot0, &args.boot1, &args.gpp) {
        (Some(boot0), Some(boot1), Some(gpp)) => Ok(Box::new(Emmc::new(
            open_device(boot0)?,
            open_device(boot1)?,
            open_device(gpp)?,
            args.serial,
            args.boot_mult,
        ))),
        _ => Err("Pass --boot0, --boot1 and --gpp, or --emummc-sd".to_string()),
    }
}

fn destination(args: &DestArgs) -> Result<Destination, String> {
    let kind = match args.fs_kind.to_lowercase().as_str() {
        "fat32" | "fat" => FsKind::Fat32,
        "exfat" => FsKind::ExFat,
        _ => {
            return Err(format!(
                "Invalid filesystem '{}'. Must be 'fat32' or 'exfat'",
                args.fs_kind
            ))
        }
    };
    if !args.dest.is_dir() {
        return Err(format!("Destination does not exist: {}", args.dest.display()));
    }
    Ok(Destination {
        root: args.dest.clone(),
        fs: DestinationFs {
            kind,
            free_bytes: args.free_mib.unwrap_or(args.capacity_mib) * MIB,
            capacity_bytes: args.capacity_mib * MIB,
        },
    })
}

fn run_backup_job(
    direction: Direction,
    storage_args: &StorageArgs,
    dest_args: &DestArgs,
    selection: SelectionArgs,
    progress: &CliProgress,
    ctx: &Context<'_>,
) -> Result<(), String> {
    let dest = destination(dest_args)?;
    let mut storage = open_storage(storage_args)?;

    let selection = BackupSelection {
        boot: selection.boot,
        system: selection.system,
        user: selection.user,
        raw: selection.raw,
    };
    let mut job = create_job(direction, selection).map_err(|e| format!("Job creation failed: {}", e))?;
    plan_job(&mut job, storage.as_mut()).map_err(|e| format!("Job planning failed: {}", e))?;

    eprintln!("Preparing {}...", direction);
    eprintln!("  Serial: {:08X}", storage.serial());
    eprintln!("  Destination: {}", dest.root.display());
    eprintln!(
        "  Regions: {}",
        job.regions
            .iter()
            .map(|p| p.region.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    eprintln!();

    let outcome = run_job(&mut job, storage.as_mut(), &dest, ctx)
        .map_err(|e| format!("Job execution failed: {}", e))?;
    progress.print_summary(&job, outcome);

    match outcome {
        Outcome::Cancelled => Err("Cancelled".to_string()),
        _ => Ok(()),
    }
}

fn take_slider(change: SliderChange, what: &str) -> Result<PartitionPlan, String> {
    match change {
        SliderChange::Accepted(plan) => Ok(plan),
        SliderChange::Adjusted { plan, value } => {
            eprintln!("{} adjusted to {}", what, value);
            Ok(plan)
        }
        SliderChange::Rejected { value } => {
            Err(format!("{} does not fit this card (stays at {})", what, value))
        }
    }
}

fn run_partition(args: &PartitionArgs, ctx: &Context<'_>) -> Result<(), String> {
    let medium = match args.medium.to_lowercase().as_str() {
        "sd" => TargetMedium::SdCard,
        "emmc" => TargetMedium::Emmc,
        _ => return Err(format!("Invalid medium '{}'. Must be 'sd' or 'emmc'", args.medium)),
    };
    let reference = args
        .reference
        .parse::<ReferenceDevice>()
        .map_err(|e| e.to_string())?;
    let scheme = args
        .android_scheme
        .parse::<AndroidScheme>()
        .map_err(|e| e.to_string())?;

    let mut device = open_device(&args.device)?;
    let mut plan = PartitionPlan::new(device.sector_count(), medium, reference)
        .map_err(|e| format!("Cannot partition {}: {}", args.device.display(), e))?
        .with_android_scheme(scheme);
    if args.emummc > 0 {
        plan = take_slider(plan.set_emummc_slider(args.emummc), "emuMMC size")?;
    }
    if args.linux_mib > 0 {
        plan = take_slider(plan.set_linux_size(args.linux_mib), "Linux size")?;
    }
    if args.android_mib > 0 {
        plan = take_slider(plan.set_android_user_size(args.android_mib), "Android size")?;
    }
    plan.validate().map_err(|e| format!("Invalid layout: {}", e))?;

    eprintln!("Layout: {}", plan);
    if args.dry_run {
        return Ok(());
    }

    let table = apply_plan(&mut device, &plan, ctx).map_err(|e| format!("Partitioning failed: {}", e))?;
    let scheme = if table.gpt.is_some() { "hybrid MBR/GPT" } else { "MBR" };
    eprintln!("Wrote {} layout to {}", scheme, args.device.display());
    Ok(())
}

fn run_emummc(command: &EmummcCommand, ctx: &Context<'_>) -> Result<(), String> {
    match command {
        EmummcCommand::File { storage, dest } => {
            let dest = destination(dest)?;
            let mut storage = open_storage(storage)?;
            let report = create_file_emummc(storage.as_mut(), &dest.root, &dest.fs, ctx)
                .map_err(|e| format!("emuMMC creation failed: {}", e))?;
            eprintln!("emuMMC {:?} in {}", report.outcome, report.path.display());
            Ok(())
        }
        EmummcCommand::Raw {
            storage,
            sd,
            part_index,
            sd_root,
        } => {
            let mut storage = open_storage(storage)?;
            let mut card = open_device(sd)?;
            let gpp_sectors = storage
                .partition(PhysicalPartition::Gpp)
                .map_err(|e| e.to_string())?
                .sector_count();

            let (index, sector_start) = match part_index {
                Some(index) => {
                    let mbr = Mbr::read_from(&mut card).map_err(|e| e.to_string())?;
                    let entry = mbr
                        .partitions
                        .get(*index)
                        .ok_or_else(|| format!("Partition index {} is out of range", index))?;
                    (*index, entry.start_sct as u64 + PARTITION_RESERVED_SECTORS)
                }
                None => {
                    let lookup = PartitionLookup::Restore {
                        needed_sectors: BOOT_AREA_SECTORS + gpp_sectors,
                    };
                    let found = find_emummc_partition(&mut card, lookup)
                        .map_err(|e| e.to_string())?
                        .ok_or_else(|| format!("No partition on {} can hold the emuMMC", sd.display()))?;
                    (found.part_index, found.sector_start)
                }
            };

            let report = create_raw_emummc(storage.as_mut(), &mut card, index, sector_start, sd_root, ctx)
                .map_err(|e| format!("emuMMC creation failed: {}", e))?;
            eprintln!(
                "emuMMC {:?} in partition {} at sector {:#X}",
                report.outcome, index, sector_start
            );
            Ok(())
        }
        EmummcCommand::Find { sd } => {
            let mut card = open_device(sd)?;
            match find_emummc_partition(&mut card, PartitionLookup::Backup).map_err(|e| e.to_string())? {
                Some(found) => println!(
                    "partition={} sector=0x{:x} gpp_sectors={}",
                    found.part_index, found.sector_start, found.sector_count
                ),
                None => println!("No emuMMC partition found"),
            }
            Ok(())
        }
    }
}
