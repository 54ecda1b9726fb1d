//! Per-destination commit lock
//!
//! The lock is an exclusive advisory OS lock on a file inside the
//! destination table directory. The OS drops it when the holder exits, so a
//! crashed writer cannot wedge a destination. Two handles to the same path
//! contend even inside one process, which serializes threaded writers too.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{CommitFailure, PondError, PondResult};

/// Interval between lock attempts when a timeout is configured
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Held exclusive lock on a destination; released on drop
#[derive(Debug)]
pub struct CommitLock {
    file: Option<File>,
    path: PathBuf,
    table: String,
}

impl CommitLock {
    /// Acquire the lock at `path`, waiting at most `timeout`.
    ///
    /// `None` blocks until the lock is free. A timeout surfaces as a
    /// retryable [`CommitFailure::LockTimeout`].
    pub fn acquire(path: &Path, table: &str, timeout: Option<Duration>) -> PondResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PondError::resource(parent, e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                PondError::commit(
                    table,
                    CommitFailure::Lock,
                    format!("Failed to open lock file {}: {}", path.display(), e),
                )
            })?;

        let started = Instant::now();
        match timeout {
            None => file.lock().map_err(|e| {
                PondError::commit(table, CommitFailure::Lock, format!("Lock error: {}", e))
            })?,
            Some(timeout) => loop {
                match file.try_lock() {
                    Ok(()) => break,
                    Err(TryLockError::WouldBlock) => {
                        if started.elapsed() >= timeout {
                            return Err(PondError::commit(
                                table,
                                CommitFailure::LockTimeout,
                                format!(
                                    "{} still locked by another writer after {:?}",
                                    path.display(),
                                    timeout
                                ),
                            ));
                        }
                        thread::sleep(POLL_INTERVAL);
                    }
                    Err(TryLockError::Error(e)) => {
                        return Err(PondError::commit(
                            table,
                            CommitFailure::Lock,
                            format!("Lock error: {}", e),
                        ));
                    }
                }
            },
        }

        debug!(
            table,
            waited_ms = started.elapsed().as_millis() as u64,
            "Acquired commit lock"
        );

        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            table: table.to_string(),
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock now, reporting unlock failures.
    pub fn release(mut self) -> PondResult<()> {
        match self.file.take() {
            Some(file) => file.unlock().map_err(|e| {
                PondError::commit(
                    &self.table,
                    CommitFailure::Lock,
                    format!("Unlock error: {}", e),
                )
            }),
            None => Ok(()),
        }
    }
}

impl Drop for CommitLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take()
            && let Err(e) = file.unlock()
        {
            // closing the handle below still drops the lock
            warn!(table = %self.table, "Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}
