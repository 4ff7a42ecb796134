//! Progress reporting and the per-operation context.
//!
//! The engine never talks to a UI directly. Every long-running operation takes a
//! [`Context`] carrying the configuration, a [`ProgressSink`] and a cancel predicate.

use std::path::Path;

use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::model::{Outcome, Region};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// A question the engine needs the caller to answer before continuing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt<'a> {
    /// The backup output already exists.
    Overwrite { path: &'a Path },
    /// The backup on disk is smaller than the target region; restore anyway?
    SizeMismatch {
        path: &'a Path,
        expected_sectors: u64,
        actual_sectors: u64,
    },
}

/// Receiver for progress, log lines and confirmations.
///
/// All methods are called synchronously from the engine, between chunks.
pub trait ProgressSink: Send {
    /// Called when a region starts (`index` of `total`).
    fn on_region_started(&self, _index: usize, _total: usize, _region: &Region) {}

    /// Percentage of the current transfer or verification pass. Only emitted on change.
    fn on_progress(&self, percent: u32);

    /// Human-readable status line.
    fn on_log(&self, level: LogLevel, message: &str);

    /// Called when a region finished without error.
    fn on_region_completed(&self, _region: &Region, _outcome: Outcome) {}

    /// Answer a confirmation prompt. Returning false declines.
    fn confirm(&self, prompt: &Prompt<'_>) -> bool;
}

/// Sink that discards everything and declines every prompt.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _percent: u32) {}

    fn on_log(&self, _level: LogLevel, _message: &str) {}

    fn confirm(&self, _prompt: &Prompt<'_>) -> bool {
        false
    }
}

fn never_cancel() -> bool {
    false
}

static NEVER_CANCEL: fn() -> bool = never_cancel;

/// Everything an operation needs besides its devices.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    pub config: &'a EngineConfig,
    pub progress: &'a dyn ProgressSink,
    cancel: &'a dyn Fn() -> bool,
}

impl<'a> Context<'a> {
    pub fn new(config: &'a EngineConfig, progress: &'a dyn ProgressSink) -> Self {
        Context {
            config,
            progress,
            cancel: &NEVER_CANCEL,
        }
    }

    /// Attach a cancel predicate, polled once per chunk.
    pub fn with_cancel(mut self, cancel: &'a dyn Fn() -> bool) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        (self.cancel)()
    }

    /// Send a line to the sink and mirror it to `tracing`.
    pub(crate) fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        self.progress.on_log(level, message);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sink recording every call, with fixed prompt answers.
    #[derive(Default)]
    pub struct RecordingSink {
        pub percents: Mutex<Vec<u32>>,
        pub logs: Mutex<Vec<(LogLevel, String)>>,
        pub prompts: Mutex<Vec<String>>,
        pub allow_overwrite: bool,
        pub allow_truncated: bool,
    }

    impl RecordingSink {
        pub fn permissive() -> Self {
            RecordingSink {
                allow_overwrite: true,
                allow_truncated: true,
                ..Default::default()
            }
        }

        pub fn percents(&self) -> Vec<u32> {
            self.percents.lock().unwrap().clone()
        }

        pub fn has_log(&self, needle: &str) -> bool {
            self.logs.lock().unwrap().iter().any(|(_, m)| m.contains(needle))
        }
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, percent: u32) {
            self.percents.lock().unwrap().push(percent);
        }

        fn on_log(&self, level: LogLevel, message: &str) {
            self.logs.lock().unwrap().push((level, message.to_string()));
        }

        fn confirm(&self, prompt: &Prompt<'_>) -> bool {
            self.prompts.lock().unwrap().push(format!("{:?}", prompt));
            match prompt {
                Prompt::Overwrite { .. } => self.allow_overwrite,
                Prompt::SizeMismatch { .. } => self.allow_truncated,
            }
        }
    }
}
