//! Commit coordinator
//!
//! Publishes one writer's staged rows into the shared destination:
//!
//! ```text
//! Staged -> Locking -> Merging -> Committed -> ReleasingLock -> CleaningUp -> Done
//!              |          |
//!              +----------+--> Failed
//! ```
//!
//! The merged table is built next to the staging store and swapped in with
//! a single rename while the destination lock is held, so readers see either
//! the previous table or the new one. The lock is released on every path
//! out of `Merging`.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connector::Connector;
use crate::error::{CommitFailure, PondError, PondResult};
use crate::pond::{CommitLock, PondLayout, TableRef};

/// Lifecycle of a stream writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    /// Accepting rows into the staging store
    Staged,
    Locking,
    Merging,
    /// The merged table replaced the live one
    Committed,
    ReleasingLock,
    CleaningUp,
    /// Committed and cleaned up
    Done,
    /// The commit failed; the destination is unchanged and staging is kept
    Failed,
    /// Discarded before commit; staging removed
    Aborted,
}

impl CommitState {
    /// Whether the writer can no longer change state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommitState::Done | CommitState::Failed | CommitState::Aborted
        )
    }
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommitState::Staged => "staged",
            CommitState::Locking => "locking",
            CommitState::Merging => "merging",
            CommitState::Committed => "committed",
            CommitState::ReleasingLock => "releasing lock",
            CommitState::CleaningUp => "cleaning up",
            CommitState::Done => "done",
            CommitState::Failed => "failed",
            CommitState::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of a successful commit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitReport {
    pub sink_id: String,
    pub table: TableRef,
    /// Distinct rows held by the staging store at commit time
    pub rows_staged: u64,
    /// Rows in the destination after the replace
    pub rows_in_destination: u64,
    pub destination: PathBuf,
    pub committed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Runs the commit sequence for one writer
pub struct CommitCoordinator<'a> {
    writer_id: &'a str,
    table: &'a TableRef,
    layout: &'a PondLayout,
    lock_timeout: Option<Duration>,
}

impl<'a> CommitCoordinator<'a> {
    pub fn new(
        writer_id: &'a str,
        table: &'a TableRef,
        layout: &'a PondLayout,
        lock_timeout: Option<Duration>,
    ) -> Self {
        Self {
            writer_id,
            table,
            layout,
            lock_timeout,
        }
    }

    /// Commit the connector's staged rows, driving `state` through the
    /// commit sequence.
    ///
    /// On success the staging store is closed and the writer directory
    /// removed. On failure `state` ends as [`CommitState::Failed`], the
    /// destination is untouched and the writer directory is left for
    /// inspection.
    pub fn run<C: Connector>(
        &self,
        connector: &mut C,
        state: &mut CommitState,
    ) -> PondResult<CommitReport> {
        let started = Instant::now();
        let table = self.table.qualified_name();

        let rows_staged = match connector.staged_row_count() {
            Ok(rows) => rows,
            Err(e) => {
                self.advance(state, CommitState::Failed);
                return Err(e);
            }
        };

        self.advance(state, CommitState::Locking);
        let lock = match CommitLock::acquire(&self.layout.lock_file(self.table), &table, self.lock_timeout)
        {
            Ok(lock) => lock,
            Err(e) => {
                warn!(table = %table, sink_id = self.writer_id, "Commit lock not acquired: {}", e);
                self.advance(state, CommitState::Failed);
                return Err(e);
            }
        };

        self.advance(state, CommitState::Merging);
        let merged = self.merge_and_publish(connector);
        if merged.is_ok() {
            self.advance(state, CommitState::Committed);
            self.advance(state, CommitState::ReleasingLock);
        }

        let released = lock.release();
        let rows_in_destination = match merged {
            Ok(rows) => rows,
            Err(e) => {
                if let Err(release_err) = released {
                    warn!(table = %table, "{}", release_err);
                }
                warn!(
                    table = %table,
                    sink_id = self.writer_id,
                    staging = %self.layout.writer_dir(self.writer_id).display(),
                    "Commit failed, destination unchanged: {}",
                    e
                );
                self.advance(state, CommitState::Failed);
                return Err(e);
            }
        };
        if let Err(e) = released {
            // the handle is closed either way, which drops the OS lock
            warn!(table = %table, "{}", e);
        }

        self.advance(state, CommitState::CleaningUp);
        if let Err(e) = connector.close() {
            warn!(table = %table, "{}", e);
        }
        remove_writer_dir(&self.layout.writer_dir(self.writer_id));
        self.advance(state, CommitState::Done);

        let report = CommitReport {
            sink_id: self.writer_id.to_string(),
            table: self.table.clone(),
            rows_staged,
            rows_in_destination,
            destination: self.layout.data_file(self.table),
            committed_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            table = %table,
            sink_id = self.writer_id,
            rows_staged,
            rows_in_destination,
            duration_ms = report.duration_ms,
            "Committed"
        );

        Ok(report)
    }

    /// Build the merged table and swap it over the live one
    fn merge_and_publish<C: Connector>(&self, connector: &mut C) -> PondResult<u64> {
        let data_file = self.layout.data_file(self.table);
        let merge_file = self.layout.merge_file(self.writer_id, self.table);

        let live = data_file.is_file().then_some(data_file.as_path());
        let rows = connector.merge_into(live, &merge_file)?;

        publish(&self.table.qualified_name(), &merge_file, &data_file)?;
        Ok(rows)
    }

    fn advance(&self, state: &mut CommitState, next: CommitState) {
        debug!(
            table = %self.table,
            sink_id = self.writer_id,
            from = %state,
            to = %next,
            "Commit state"
        );
        *state = next;
    }
}

/// Atomically replace `data_file` with `merge_file`.
///
/// Both live under the pond root, so the rename never crosses filesystems.
pub(crate) fn publish(table: &str, merge_file: &Path, data_file: &Path) -> PondResult<()> {
    if let Some(dir) = data_file.parent() {
        fs::create_dir_all(dir).map_err(|e| PondError::resource(dir, e))?;
    }

    fs::rename(merge_file, data_file).map_err(|e| {
        PondError::commit(
            table,
            CommitFailure::Replace,
            format!(
                "Failed to move {} to {}: {}",
                merge_file.display(),
                data_file.display(),
                e
            ),
        )
    })?;

    if let Some(dir) = data_file.parent()
        && let Err(e) = File::open(dir).and_then(|d| d.sync_all())
    {
        debug!("Could not sync {}: {}", dir.display(), e);
    }

    Ok(())
}

/// Best-effort removal of a writer's private directory
pub(crate) fn remove_writer_dir(dir: &Path) {
    if !dir.exists() {
        return;
    }
    match fs::remove_dir_all(dir) {
        Ok(()) => debug!("Removed {}", dir.display()),
        Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
    }
}
