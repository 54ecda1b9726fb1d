//! Routes per-stream events to stream writers
//!
//! One [`DuckPondSink`] is open per stream at a time. A writer is committed
//! and replaced when it reaches the configured batch size, when the stream
//! announces a different schema, and when the stream ends.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::PondConfig;
use crate::error::{PondError, PondResult};
use crate::pond::{DestinationStore, PondLayout};
use crate::schema::{Row, StreamSchema};
use crate::sink::{CommitReport, DuckPondSink, Sink};

/// Event supplied by the upstream extractor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Schema {
        stream: String,
        schema: Value,
        #[serde(default)]
        key_properties: Vec<String>,
    },
    Record {
        stream: String,
        record: Row,
    },
    EndOfStream {
        stream: String,
    },
}

/// Multi-stream router over one pond
pub struct Target {
    config: PondConfig,
    schemas: HashMap<String, StreamSchema>,
    sinks: HashMap<String, DuckPondSink>,
    reports: Vec<CommitReport>,
}

impl Target {
    pub fn new(config: PondConfig) -> Self {
        Self {
            config,
            schemas: HashMap::new(),
            sinks: HashMap::new(),
            reports: Vec::new(),
        }
    }

    pub fn config(&self) -> &PondConfig {
        &self.config
    }

    /// Read access to the committed tables of this pond
    pub fn destination(&self) -> DestinationStore {
        DestinationStore::new(PondLayout::new(&self.config.pond_root_dir))
    }

    /// Reports of every commit made so far
    pub fn reports(&self) -> &[CommitReport] {
        &self.reports
    }

    /// Streams with an open writer
    pub fn open_streams(&self) -> Vec<&str> {
        let mut streams: Vec<&str> = self.sinks.keys().map(String::as_str).collect();
        streams.sort_unstable();
        streams
    }

    pub fn process(&mut self, event: StreamEvent) -> PondResult<()> {
        match event {
            StreamEvent::Schema {
                stream,
                schema,
                key_properties,
            } => self.handle_schema(&stream, &schema, &key_properties),
            StreamEvent::Record { stream, record } => self.handle_record(&stream, record),
            StreamEvent::EndOfStream { stream } => self.end_stream(&stream).map(|_| ()),
        }
    }

    /// Register the schema of a stream.
    ///
    /// Repeating the current schema is a no-op. A different schema commits
    /// the open writer before a new one is created for the new shape.
    pub fn handle_schema(
        &mut self,
        stream: &str,
        schema: &Value,
        key_properties: &[String],
    ) -> PondResult<()> {
        let parsed = StreamSchema::from_json_schema(stream, schema, key_properties)?;

        if self.schemas.get(stream) == Some(&parsed) {
            debug!(stream, "Schema unchanged");
            return Ok(());
        }

        if self.sinks.contains_key(stream) {
            info!(stream, "Schema changed, committing open writer");
            self.commit_stream(stream)?;
        }

        let sink = DuckPondSink::from_config(stream, &parsed, &self.config)?;
        self.schemas.insert(stream.to_string(), parsed);
        self.sinks.insert(stream.to_string(), sink);
        Ok(())
    }

    /// Stage one record, committing the writer once the batch is full.
    pub fn handle_record(&mut self, stream: &str, record: Row) -> PondResult<()> {
        if !self.sinks.contains_key(stream) {
            let schema = self.schemas.get(stream).ok_or_else(|| {
                PondError::schema(stream, "record received before the stream's schema")
            })?;
            let sink = DuckPondSink::from_config(stream, schema, &self.config)?;
            self.sinks.insert(stream.to_string(), sink);
        }

        let Some(sink) = self.sinks.get_mut(stream) else {
            return Ok(());
        };
        if let Err(e) = sink.process_batch(std::slice::from_ref(&record)) {
            self.sinks.remove(stream);
            return Err(e);
        }

        if sink.rows_received() >= self.config.batch_size_rows as u64 {
            debug!(stream, rows = sink.rows_received(), "Batch full");
            self.commit_stream(stream)?;
        }
        Ok(())
    }

    /// Commit the stream's open writer, if any.
    pub fn end_stream(&mut self, stream: &str) -> PondResult<Option<CommitReport>> {
        if !self.sinks.contains_key(stream) {
            return Ok(None);
        }
        self.commit_stream(stream).map(Some)
    }

    /// Commit every open writer and return all commit reports.
    ///
    /// Every writer is attempted; the first failure is returned after the
    /// rest have been committed. Reports of the commits that succeeded stay
    /// available from [`Target::reports`].
    pub fn finish(&mut self) -> PondResult<Vec<CommitReport>> {
        let mut streams: Vec<String> = self.sinks.keys().cloned().collect();
        streams.sort();

        let mut first_error = None;
        for stream in streams {
            if let Err(e) = self.commit_stream(&stream) {
                warn!(stream = %stream, "{}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(self.reports.clone()),
        }
    }

    fn commit_stream(&mut self, stream: &str) -> PondResult<CommitReport> {
        let Some(mut sink) = self.sinks.remove(stream) else {
            return Err(PondError::schema(stream, "no open writer"));
        };
        let report = sink.commit()?;
        self.reports.push(report.clone());
        Ok(report)
    }
}
