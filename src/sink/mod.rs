//! Stream writers
//!
//! A [`DuckPondSink`] stages the rows of one stream in its own DuckDB file
//! and publishes them to the shared destination on commit. Writers never see
//! each other's staging data; the only shared resources are the destination
//! file and its lock.

pub mod commit;

pub use commit::{CommitCoordinator, CommitReport, CommitState};

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PondConfig;
use crate::connector::Connector;
use crate::error::{PondError, PondResult};
use crate::pond::{PondLayout, TableRef};
use crate::schema::{Row, StreamSchema};
use crate::staging::StagingStore;

/// Unique identity of a stream writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SinkId(Uuid);

impl SinkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SinkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accepts rows for one destination and commits them
pub trait Sink {
    /// Stage a batch of rows, returning how many were accepted
    fn process_batch(&mut self, rows: &[Row]) -> PondResult<usize>;

    /// Publish staged rows to the destination
    fn commit(&mut self) -> PondResult<CommitReport>;

    /// Current lifecycle state
    fn state(&self) -> CommitState;
}

/// Stream writer staging into DuckDB and committing to a Parquet table
pub struct DuckPondSink {
    id: SinkId,
    stream: String,
    table: TableRef,
    layout: PondLayout,
    lock_timeout: Option<Duration>,
    staging: StagingStore,
    state: CommitState,
    rows_received: u64,
}

impl DuckPondSink {
    /// Create a writer for `stream` targeting `table`.
    ///
    /// The schema is translated before anything is created on disk, so a
    /// schema error leaves no staging files behind.
    pub fn new(
        stream: &str,
        table: TableRef,
        schema: &StreamSchema,
        layout: PondLayout,
        lock_timeout: Option<Duration>,
    ) -> PondResult<Self> {
        let id = SinkId::new();
        let mut staging = StagingStore::new(layout.staging_db(&id.to_string()));

        let columns = staging.table_columns(&table, schema)?;

        if let Err(e) = staging.create_staging_table(&table, &columns) {
            commit::remove_writer_dir(&layout.writer_dir(&id.to_string()));
            return Err(e);
        }

        info!(
            stream,
            table = %table,
            sink_id = %id,
            columns = columns.len(),
            "Created stream writer"
        );

        Ok(Self {
            id,
            stream: stream.to_string(),
            table,
            layout,
            lock_timeout,
            staging,
            state: CommitState::Staged,
            rows_received: 0,
        })
    }

    /// Create a writer whose destination and lock timeout come from `config`
    pub fn from_config(stream: &str, schema: &StreamSchema, config: &PondConfig) -> PondResult<Self> {
        let table = TableRef::for_stream(stream, config.default_namespace())?;
        Self::new(
            stream,
            table,
            schema,
            PondLayout::new(&config.pond_root_dir),
            config.lock_timeout(),
        )
    }

    pub fn id(&self) -> SinkId {
        self.id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Rows accepted since the writer was created
    pub fn rows_received(&self) -> u64 {
        self.rows_received
    }

    /// Private directory holding the staging store
    pub fn staging_dir(&self) -> PathBuf {
        self.layout.writer_dir(&self.id.to_string())
    }

    /// Staged rows, mainly for inspection
    pub fn staging(&self) -> &StagingStore {
        &self.staging
    }

    /// Discard the writer without touching the destination.
    pub fn abort(mut self) {
        self.discard();
    }

    fn discard(&mut self) {
        if self.state != CommitState::Staged {
            return;
        }
        if let Err(e) = self.staging.close() {
            warn!(table = %self.table, "{}", e);
        }
        commit::remove_writer_dir(&self.staging_dir());
        self.state = CommitState::Aborted;
        debug!(table = %self.table, sink_id = %self.id, "Discarded stream writer");
    }

    fn ensure_staged(&self) -> PondResult<()> {
        match self.state {
            CommitState::Staged => Ok(()),
            state => Err(PondError::WriterClosed {
                table: self.table.qualified_name(),
                state: state.to_string(),
            }),
        }
    }
}

impl Sink for DuckPondSink {
    /// A rejected row aborts the writer; rows staged before it are dropped
    /// along with the staging store.
    fn process_batch(&mut self, rows: &[Row]) -> PondResult<usize> {
        self.ensure_staged()?;

        match self.staging.insert(rows) {
            Ok(count) => {
                self.rows_received += count as u64;
                Ok(count)
            }
            Err(e) => {
                warn!(table = %self.table, sink_id = %self.id, "Aborting writer: {}", e);
                self.discard();
                Err(e)
            }
        }
    }

    fn commit(&mut self) -> PondResult<CommitReport> {
        self.ensure_staged()?;

        let id = self.id.to_string();
        CommitCoordinator::new(&id, &self.table, &self.layout, self.lock_timeout)
            .run(&mut self.staging, &mut self.state)
    }

    fn state(&self) -> CommitState {
        self.state
    }
}

impl Drop for DuckPondSink {
    fn drop(&mut self) {
        self.discard();
    }
}
