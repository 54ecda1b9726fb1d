//! DuckPond - concurrent stream writers over a shared Parquet pond
//!
//! Provides:
//! - Schema translation from JSON schema to DuckDB staging tables
//! - Private per-writer staging stores
//! - Lock-serialized merge-upsert commits with atomic replace
//! - Deterministic destination layout under a pond root
//! - Multi-stream routing with batch draining

pub mod config;
pub mod connector;
pub mod error;
pub mod pond;
pub mod schema;
pub mod sink;
pub mod sql;
pub mod staging;
pub mod target;

// Re-export commonly used types
pub use config::PondConfig;
pub use connector::Connector;
pub use error::{CommitFailure, PondError, PondResult};
pub use pond::{DestinationStore, PondLayout, QueryResult, TableRef};
pub use schema::{ColumnDefinition, ColumnType, Row, StreamSchema};
pub use sink::{CommitReport, CommitState, DuckPondSink, Sink, SinkId};
pub use staging::StagingStore;
pub use target::{StreamEvent, Target};
