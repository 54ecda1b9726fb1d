//! Error taxonomy for the pond writer
//!
//! Writer failures fall into schema problems found while building the
//! staging table, rows that cannot be written into it, commit failures and
//! filesystem failures. Commit failures always leave the destination
//! untouched.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which step of the commit sequence failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitFailure {
    /// Another writer held the destination lock past the configured timeout
    LockTimeout,
    /// The lock file could not be opened or locked
    Lock,
    /// Building the merged table failed
    Merge,
    /// Publishing the merged table over the live one failed
    Replace,
}

impl std::fmt::Display for CommitFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitFailure::LockTimeout => write!(f, "lock timeout"),
            CommitFailure::Lock => write!(f, "lock"),
            CommitFailure::Merge => write!(f, "merge"),
            CommitFailure::Replace => write!(f, "replace"),
        }
    }
}

/// Error type for pond operations
#[derive(Debug, thiserror::Error)]
pub enum PondError {
    /// Malformed or empty schema, or a staging table set up twice
    #[error("Schema error for '{table}': {message}")]
    Schema { table: String, message: String },

    /// A row could not be conformed to its staging table
    #[error("Write error for '{table}': {message}")]
    Write { table: String, message: String },

    /// Lock acquisition, merge or atomic replace failed
    #[error("Commit error for '{table}' ({kind}): {message}")]
    Commit {
        table: String,
        kind: CommitFailure,
        message: String,
    },

    /// Filesystem failure creating or removing pond paths
    #[error("Resource error at {}: {message}", path.display())]
    Resource { path: PathBuf, message: String },

    /// The writer already left the staged state (committed, failed or aborted)
    #[error("Writer for '{table}' is {state}; no further rows or commits accepted")]
    WriterClosed { table: String, state: String },

    /// Configuration could not be parsed or serialized
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for pond operations
pub type PondResult<T> = Result<T, PondError>;

impl PondError {
    pub(crate) fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        PondError::Schema {
            table: table.into(),
            message: message.into(),
        }
    }

    pub(crate) fn write(table: impl Into<String>, message: impl Into<String>) -> Self {
        PondError::Write {
            table: table.into(),
            message: message.into(),
        }
    }

    pub(crate) fn commit(
        table: impl Into<String>,
        kind: CommitFailure,
        message: impl Into<String>,
    ) -> Self {
        PondError::Commit {
            table: table.into(),
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn resource(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        PondError::Resource {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Whether restarting the stream writer from scratch may succeed.
    ///
    /// Commit failures never change the destination, so a fresh writer can
    /// replay the stream. Schema and write errors will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PondError::Commit { .. })
    }

    /// The commit step that failed, if this is a commit error
    pub fn commit_failure(&self) -> Option<CommitFailure> {
        match self {
            PondError::Commit { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
