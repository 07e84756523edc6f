//! Atomic state writer
//!
//! A single pending-snapshot slot (the newest write supersedes older ones)
//! drained by a background thread every `batch_interval`. Writes go to a
//! temp file, fsync, then an atomic rename, with the previous live file
//! copied into a rotated backup directory first. A crash between the temp
//! write and the rename can never corrupt the live snapshot.

use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::snapshot::TradingSnapshot;

pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_BACKUPS: usize = 10;

const BACKUP_PREFIX: &str = "state_backup_";

#[derive(Debug, Default)]
pub struct WriterStats {
    pub queued: AtomicU64,
    pub written: AtomicU64,
    pub failed: AtomicU64,
}

struct Shared {
    pending: Mutex<Option<TradingSnapshot>>,
    stop: AtomicBool,
    // Serializes the actual file write between the background thread and
    // synchronous flush callers.
    write_lock: Mutex<()>,
    stats: WriterStats,
    state_file: PathBuf,
    backup_dir: PathBuf,
    max_backups: usize,
}

pub struct AtomicStateWriter {
    shared: Arc<Shared>,
    batch_interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AtomicStateWriter {
    pub fn new(
        state_file: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        batch_interval: Duration,
        max_backups: usize,
    ) -> Result<Self> {
        let state_file = state_file.into();
        let backup_dir = backup_dir.into();
        if let Some(parent) = state_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating state dir {}", parent.display()))?;
        }
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("creating backup dir {}", backup_dir.display()))?;

        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            stop: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            stats: WriterStats::default(),
            state_file,
            backup_dir,
            max_backups,
        });

        let writer = Self {
            shared: shared.clone(),
            batch_interval,
            handle: Mutex::new(None),
        };
        writer.spawn_thread();
        info!(
            interval_s = batch_interval.as_secs(),
            max_backups, "atomic state writer started"
        );
        Ok(writer)
    }

    /// Replace the pending snapshot (non-blocking). The background thread
    /// picks it up once the batch interval has elapsed.
    pub fn queue_write(&self, snapshot: TradingSnapshot) {
        *self.shared.pending.lock() = Some(snapshot);
        self.shared.stats.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the pending slot synchronously. Returns `Ok(true)` when a
    /// snapshot was written, `Ok(false)` when nothing was pending.
    pub fn flush(&self) -> Result<bool> {
        let Some(snapshot) = self.shared.pending.lock().take() else {
            return Ok(false);
        };
        match Self::perform_atomic_write(&self.shared, &snapshot) {
            Ok(()) => Ok(true),
            Err(e) => {
                // Keep the snapshot for the next interval rather than lose it.
                let mut pending = self.shared.pending.lock();
                if pending.is_none() {
                    *pending = Some(snapshot);
                }
                Err(e)
            }
        }
    }

    /// Flush, then stop and join the background thread.
    pub fn stop(&self) {
        if let Err(e) = self.flush() {
            error!("flush during writer stop failed: {e:#}");
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        info!(
            queued = self.shared.stats.queued.load(Ordering::Relaxed),
            written = self.shared.stats.written.load(Ordering::Relaxed),
            failed = self.shared.stats.failed.load(Ordering::Relaxed),
            "atomic state writer stopped"
        );
    }

    pub fn pending_writes(&self) -> usize {
        usize::from(self.shared.pending.lock().is_some())
    }

    pub fn failed_writes(&self) -> u64 {
        self.shared.stats.failed.load(Ordering::Relaxed)
    }

    pub fn successful_writes(&self) -> u64 {
        self.shared.stats.written.load(Ordering::Relaxed)
    }

    /// Load the live snapshot, falling back through backups newest to
    /// oldest on checksum or parse failure. `None` means nothing usable
    /// exists and the caller starts fresh.
    pub fn load_with_validation(&self) -> Option<TradingSnapshot> {
        let _guard = self.shared.write_lock.lock();
        Self::load_from(&self.shared.state_file, &self.shared.backup_dir)
    }

    /// Same recovery order without a writer instance (used by recovery
    /// tooling and tests).
    pub fn load_from(state_file: &Path, backup_dir: &Path) -> Option<TradingSnapshot> {
        match fs::read_to_string(state_file) {
            Ok(data) => match TradingSnapshot::from_signed_json(&data) {
                Ok(snapshot) => {
                    info!(file = %state_file.display(), "state snapshot loaded");
                    return Some(snapshot);
                }
                Err(e) => {
                    warn!(file = %state_file.display(), "live snapshot invalid: {e}, trying backups");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = %state_file.display(), "no state file");
            }
            Err(e) => {
                warn!(file = %state_file.display(), "cannot read state file: {e}, trying backups");
            }
        }

        for backup in Self::backups_newest_first(backup_dir) {
            match fs::read_to_string(&backup)
                .map_err(anyhow::Error::from)
                .and_then(|data| TradingSnapshot::from_signed_json(&data).map_err(Into::into))
            {
                Ok(snapshot) => {
                    warn!(backup = %backup.display(), "state recovered from backup");
                    return Some(snapshot);
                }
                Err(e) => {
                    warn!(backup = %backup.display(), "backup unusable: {e:#}");
                }
            }
        }
        None
    }

    fn spawn_thread(&self) {
        let shared = self.shared.clone();
        let interval = self.batch_interval;
        let handle = std::thread::Builder::new()
            .name("state-writer".to_string())
            .spawn(move || Self::writer_loop(shared, interval))
            .expect("spawn state writer thread");
        *self.handle.lock() = Some(handle);
    }

    fn writer_loop(shared: Arc<Shared>, interval: Duration) {
        let mut last_write = std::time::Instant::now();
        loop {
            if shared.stop.load(Ordering::SeqCst) {
                break;
            }

            // Rapid mutations coalesce in the slot until the interval is up.
            let due = if last_write.elapsed() >= interval {
                shared.pending.lock().take()
            } else {
                None
            };

            if let Some(snapshot) = due {
                last_write = std::time::Instant::now();
                if let Err(e) = Self::perform_atomic_write(&shared, &snapshot) {
                    error!("atomic state write failed: {e:#}");
                    let mut pending = shared.pending.lock();
                    if pending.is_none() {
                        *pending = Some(snapshot);
                    }
                }
            } else {
                // Small sleep to avoid spinning between batch windows.
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    fn perform_atomic_write(shared: &Shared, snapshot: &TradingSnapshot) -> Result<()> {
        let _guard = shared.write_lock.lock();

        let signed = snapshot
            .to_signed_json(Utc::now())
            .context("serializing state snapshot")?;

        let tmp_file = shared.state_file.with_extension("tmp");
        {
            let mut file = File::create(&tmp_file)
                .with_context(|| format!("creating {}", tmp_file.display()))?;
            file.write_all(signed.as_bytes())?;
            file.sync_all().context("fsync of temp state file")?;
        }

        // Backup the previous live file before it is replaced.
        if shared.state_file.exists() {
            let backup = Self::next_backup_path(&shared.backup_dir);
            if let Err(e) = fs::copy(&shared.state_file, &backup) {
                warn!(backup = %backup.display(), "backup copy failed: {e}");
            } else {
                debug!(backup = %backup.display(), "backup created");
            }
        }

        if let Err(e) = fs::rename(&tmp_file, &shared.state_file) {
            let _ = fs::remove_file(&tmp_file);
            shared.stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(anyhow::Error::from(e)
                .context(format!("renaming into {}", shared.state_file.display())));
        }

        shared.stats.written.fetch_add(1, Ordering::Relaxed);
        debug!(bytes = signed.len(), "atomic state write completed");

        Self::prune_backups(&shared.backup_dir, shared.max_backups);
        Ok(())
    }

    fn next_backup_path(backup_dir: &Path) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let base = backup_dir.join(format!("{BACKUP_PREFIX}{stamp}.json"));
        if !base.exists() {
            return base;
        }
        // Several writes inside one second: disambiguate with a counter.
        for n in 1..1000 {
            let candidate = backup_dir.join(format!("{BACKUP_PREFIX}{stamp}_{n:03}.json"));
            if !candidate.exists() {
                return candidate;
            }
        }
        base
    }

    fn backups_newest_first(backup_dir: &Path) -> Vec<PathBuf> {
        let mut backups: Vec<PathBuf> = fs::read_dir(backup_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .map(|n| n.starts_with(BACKUP_PREFIX) && n.ends_with(".json"))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .unwrap_or_default();
        // Timestamped names sort chronologically.
        backups.sort();
        backups.reverse();
        backups
    }

    fn prune_backups(backup_dir: &Path, max_backups: usize) {
        let backups = Self::backups_newest_first(backup_dir);
        for stale in backups.iter().skip(max_backups) {
            if let Err(e) = fs::remove_file(stale) {
                warn!(file = %stale.display(), "failed to delete old backup: {e}");
            } else {
                debug!(file = %stale.display(), "old backup deleted");
            }
        }
    }
}

impl Drop for AtomicStateWriter {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
