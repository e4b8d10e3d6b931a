//! Persistence worker: durable append-only logging of samples.
//!
//! Drains the persistence channel and appends each sample to the active
//! log file (the persistence target) as one CSV record, then flushes and
//! hardware-syncs the write. Sync success is the authoritative durability
//! signal; every failure short of that is classified, logged and counted
//! without ever stopping the worker — a lost record costs one sample, not
//! the session.
//!
//! The target rotates at the start of every sampling session and once more
//! when an authoritative clock first becomes available, so file names
//! produced after clock correction carry real timestamps.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::sample::{Sample, LOG_HEADER};
use crate::sensors::ClockSource;

/// Commands accepted by the persistence worker. Rotation flows through the
/// same channel as samples so all records of one session land in the target
/// opened for that session, in production order.
#[derive(Debug, Clone)]
pub enum LogCommand {
    /// Open a fresh persistence target named from the current clock
    Rotate,

    /// Append one sample to the active target
    Append(Sample),
}

/// Counters for the persistence worker. Every non-fatal failure lands in
/// exactly one of these; nothing is silently swallowed.
#[derive(Debug, Clone, Default)]
pub struct PersistenceStats {
    /// Records written and confirmed durable (write + flush + sync all ok)
    pub records_written: u64,

    /// Samples dropped because no target could be opened
    pub open_failures: u64,

    /// Samples lost to a failed or short write
    pub write_failures: u64,

    /// Serious sync errors (possible data loss after an apparent write)
    pub sync_failures: u64,

    /// Completed target rotations
    pub rotations: u64,
}

/// How a flush/sync errno is treated, following the storage driver's
/// classification: `EINVAL` is benign noise from an already-synced buffer,
/// `EIO`/`EBADF` mean the write may not have reached the medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncSeverity {
    Benign,
    Uncertain,
    Serious,
}

const EIO: i32 = 5;
const EBADF: i32 = 9;
const EINVAL: i32 = 22;

fn classify_sync_error(err: &std::io::Error) -> SyncSeverity {
    match err.raw_os_error() {
        Some(EINVAL) => SyncSeverity::Benign,
        Some(EIO) | Some(EBADF) => SyncSeverity::Serious,
        _ => SyncSeverity::Uncertain,
    }
}

/// The currently active log file.
#[derive(Debug)]
pub struct PersistenceTarget {
    path: PathBuf,
    file: File,
}

impl PersistenceTarget {
    /// Create or re-open the file in append mode and write the header
    /// record. Files are never truncated.
    fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{}", LOG_HEADER)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Drains the persistence channel and maintains the durability contract.
pub struct PersistenceWorker {
    rx: mpsc::Receiver<LogCommand>,
    data_dir: PathBuf,
    clock: Arc<dyn ClockSource>,

    /// Exclusive write lock over the active target. There is exactly one
    /// writer in this design; the lock makes the invariant explicit and
    /// lets tests observe it.
    target: Arc<Mutex<Option<PersistenceTarget>>>,

    /// Monotonic counter naming targets created before any clock sync
    boot_rotations: u32,

    stats: PersistenceStats,
}

impl PersistenceWorker {
    pub fn new(
        rx: mpsc::Receiver<LogCommand>,
        data_dir: impl Into<PathBuf>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            rx,
            data_dir: data_dir.into(),
            clock,
            target: Arc::new(Mutex::new(None)),
            boot_rotations: 0,
            stats: PersistenceStats::default(),
        }
    }

    /// Handle on the target lock, shared with tests that assert the
    /// exclusive-append invariant.
    pub fn target_handle(&self) -> Arc<Mutex<Option<PersistenceTarget>>> {
        self.target.clone()
    }

    /// Drain commands until the channel closes; returns the final counters.
    pub async fn run(mut self) -> PersistenceStats {
        info!(data_dir = %self.data_dir.display(), "Persistence worker started");

        while let Some(command) = self.rx.recv().await {
            match command {
                LogCommand::Rotate => self.rotate(),
                LogCommand::Append(sample) => self.append(&sample),
            }
        }

        info!(
            records_written = self.stats.records_written,
            open_failures = self.stats.open_failures,
            write_failures = self.stats.write_failures,
            sync_failures = self.stats.sync_failures,
            rotations = self.stats.rotations,
            "Persistence channel closed, worker stopping"
        );
        self.stats
    }

    /// Derive the next target name from the clock. Before an authoritative
    /// time sync the name is a monotonic boot placeholder so uncorrected
    /// timestamps are never mistaken for real ones.
    fn next_target_path(&mut self) -> PathBuf {
        let name = if self.clock.is_authoritative() {
            self.clock.now().format("%y-%m-%d-%H%M%S.csv").to_string()
        } else {
            self.boot_rotations += 1;
            format!("boot-{}.csv", self.boot_rotations)
        };
        self.data_dir.join(name)
    }

    fn rotate(&mut self) {
        let path = self.next_target_path();

        match PersistenceTarget::open(path.clone()) {
            Ok(new_target) => {
                self.stats.rotations += 1;
                info!(path = %path.display(), "Rotated persistence target");
                let mut guard = self.target.lock().expect("target lock poisoned");
                *guard = Some(new_target);
            }
            Err(e) => {
                self.stats.open_failures += 1;
                error!(path = %path.display(), error = %e,
                    "Failed to open persistence target");
                let mut guard = self.target.lock().expect("target lock poisoned");
                *guard = None;
            }
        }
    }

    fn append(&mut self, sample: &Sample) {
        let mut guard = self.target.lock().expect("target lock poisoned");

        if guard.is_none() {
            // A sample arrived before any rotation; open a target so the
            // record is not lost.
            drop(guard);
            debug!("Append before rotation, opening target implicitly");
            self.rotate();
            guard = self.target.lock().expect("target lock poisoned");
        }

        let Some(target) = guard.as_mut() else {
            self.stats.open_failures += 1;
            warn!(
                sequence = sample.sequence,
                "No persistence target available, sample dropped"
            );
            return;
        };

        let line = sample.to_log_line();
        if let Err(e) = writeln!(target.file, "{}", line) {
            self.stats.write_failures += 1;
            error!(
                sequence = sample.sequence,
                path = %target.path.display(),
                error = %e,
                "Write failed, sample lost"
            );
            return;
        }

        // Flush failure is not fatal; the sync below is the real signal.
        if let Err(e) = target.file.flush() {
            match classify_sync_error(&e) {
                SyncSeverity::Benign => {
                    debug!(path = %target.path.display(), error = %e, "Flush reported benign error")
                }
                SyncSeverity::Uncertain => {
                    warn!(path = %target.path.display(), error = %e, "Flush failed, verifying with sync")
                }
                SyncSeverity::Serious => {
                    warn!(path = %target.path.display(), error = %e,
                        "Flush failed with serious error, verifying with sync")
                }
            }
        }

        // Hardware sync is the authoritative durability signal.
        match target.file.sync_all() {
            Ok(()) => {
                self.stats.records_written += 1;
            }
            Err(e) => match classify_sync_error(&e) {
                SyncSeverity::Benign => {
                    debug!(path = %target.path.display(), error = %e, "Sync reported benign error");
                    self.stats.records_written += 1;
                }
                SyncSeverity::Uncertain => {
                    self.stats.sync_failures += 1;
                    warn!(
                        sequence = sample.sequence,
                        path = %target.path.display(),
                        error = %e,
                        "Sync failed, durability uncertain"
                    );
                }
                SyncSeverity::Serious => {
                    self.stats.sync_failures += 1;
                    error!(
                        sequence = sample.sequence,
                        path = %target.path.display(),
                        error = %e,
                        "Sync I/O error, data may not be written"
                    );
                }
            },
        }
    }
}
