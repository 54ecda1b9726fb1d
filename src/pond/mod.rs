//! The pond: shared destination store and its on-disk layout
//!
//! ```text
//! <root>/
//!   raw/<namespace>/<table>/data.parquet     committed table
//!   raw/<namespace>/<table>/_commit.lock     per-destination lock
//!   tmp/<writer-id>/staging.duckdb           private staging store
//!   tmp/<writer-id>/merge/<table>.parquet    merge output before publish
//! ```
//!
//! Paths are a pure function of the root and the table reference, so two
//! writers (or two runs) aiming at the same table always meet at the same
//! lock file.

pub mod lock;
mod query;

pub use lock::CommitLock;
pub use query::{QueryResult, QueryRow};
pub(crate) use query::query_json;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PondError, PondResult};
use crate::sql::quote_path;

/// File holding a committed table
pub const DATA_FILENAME: &str = "data.parquet";

/// Lock file inside each table directory
pub const LOCK_FILENAME: &str = "_commit.lock";

/// Staging database inside each writer directory
pub const STAGING_DB_FILENAME: &str = "staging.duckdb";

/// Destination table identity: optional namespace plus table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub namespace: Option<String>,
    pub name: String,
}

impl TableRef {
    /// Build a table reference, conforming both parts.
    pub fn new(namespace: Option<&str>, name: &str) -> PondResult<Self> {
        let table = conform_name(name);
        if table.is_empty() {
            return Err(PondError::schema(name, "table name is empty"));
        }

        let namespace = match namespace.map(conform_name) {
            Some(ns) if ns.is_empty() => {
                return Err(PondError::schema(name, "namespace is empty"));
            }
            other => other,
        };

        Ok(Self {
            namespace,
            name: table,
        })
    }

    /// Resolve the destination of a stream.
    ///
    /// `public-users` becomes table `users`; its namespace is the default
    /// namespace when one is configured, otherwise the part before the table
    /// (`public`) for stream names with two or three parts.
    pub fn for_stream(stream: &str, default_namespace: Option<&str>) -> PondResult<Self> {
        let parts: Vec<&str> = stream.split('-').collect();
        let table = parts.last().copied().unwrap_or(stream);

        let namespace = match default_namespace {
            Some(ns) => Some(ns),
            None if (2..=3).contains(&parts.len()) => Some(parts[parts.len() - 2]),
            None => None,
        };

        Self::new(namespace, table)
    }

    /// Qualified name used in logs and errors
    pub fn qualified_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// Lower-case `name`, replace characters outside `[a-z0-9_]` with `_`
/// and prefix a leading digit with `_`.
///
/// # Examples
///
/// ```
/// use target_duckpond::pond::conform_name;
///
/// assert_eq!(conform_name("Order Items"), "order_items");
/// assert_eq!(conform_name("2024sales"), "_2024sales");
/// ```
pub fn conform_name(name: &str) -> String {
    let conformed: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();

    match conformed.chars().next() {
        Some(c) if c.is_ascii_digit() => format!("_{}", conformed),
        _ => conformed,
    }
}

/// Resolves every pond path from the root directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PondLayout {
    root: PathBuf,
}

impl PondLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root of all committed tables
    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    /// Root of all writer staging areas
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Directory of one destination table
    pub fn table_dir(&self, table: &TableRef) -> PathBuf {
        let mut dir = self.raw_dir();
        if let Some(ns) = &table.namespace {
            dir.push(ns);
        }
        dir.push(&table.name);
        dir
    }

    /// Committed Parquet file of a table
    pub fn data_file(&self, table: &TableRef) -> PathBuf {
        self.table_dir(table).join(DATA_FILENAME)
    }

    /// Lock file serializing commits to a table
    pub fn lock_file(&self, table: &TableRef) -> PathBuf {
        self.table_dir(table).join(LOCK_FILENAME)
    }

    /// Private directory of one writer
    pub fn writer_dir(&self, writer_id: &str) -> PathBuf {
        self.tmp_dir().join(writer_id)
    }

    /// Staging database of one writer
    pub fn staging_db(&self, writer_id: &str) -> PathBuf {
        self.writer_dir(writer_id).join(STAGING_DB_FILENAME)
    }

    /// Merge output written before the atomic replace
    pub fn merge_file(&self, writer_id: &str, table: &TableRef) -> PathBuf {
        self.writer_dir(writer_id)
            .join("merge")
            .join(format!("{}.parquet", table.name))
    }
}

/// Read access to committed tables
#[derive(Debug, Clone)]
pub struct DestinationStore {
    layout: PondLayout,
}

impl DestinationStore {
    pub fn new(layout: PondLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &PondLayout {
        &self.layout
    }

    /// Whether the table has been committed at least once
    pub fn exists(&self, table: &TableRef) -> bool {
        self.layout.data_file(table).is_file()
    }

    /// Read every committed row of a table; empty when never committed.
    pub fn read_table(&self, table: &TableRef) -> PondResult<QueryResult> {
        let data_file = self.layout.data_file(table);
        if !data_file.is_file() {
            return Ok(QueryResult::empty());
        }

        let conn = duckdb::Connection::open_in_memory()
            .map_err(|e| PondError::resource(&data_file, format!("Failed to open DuckDB: {}", e)))?;

        query_json(
            &conn,
            &format!("SELECT * FROM read_parquet({})", quote_path(&data_file)),
        )
        .map_err(|e| PondError::resource(&data_file, format!("Failed to read table: {}", e)))
    }

    /// Number of committed rows in a table
    pub fn row_count(&self, table: &TableRef) -> PondResult<usize> {
        Ok(self.read_table(table)?.row_count())
    }
}
