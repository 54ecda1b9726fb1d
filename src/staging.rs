//! DuckDB staging store
//!
//! Each stream writer stages its rows in a private DuckDB file under
//! `tmp/<writer-id>/`. Nothing outside the writer reads or writes it, so no
//! coordination is needed until the commit.
//!
//! Rows whose sequence-backed key was omitted go to a companion table
//! without a key constraint. Their sequence values are provisional: the
//! merge renumbers them past every explicit key, staged or committed, while
//! the destination lock is held.

use std::fs::File;
use std::path::{Path, PathBuf};

use duckdb::types::Value as DbValue;
use serde_json::Value;
use tracing::debug;

use crate::connector::Connector;
use crate::error::{CommitFailure, PondError, PondResult};
use crate::pond::{QueryResult, TableRef, query_json};
use crate::schema::{ColumnDefinition, ColumnType, Row, primary_key_names};
use crate::sql::{
    copy_to_parquet_sql, create_generated_table_sql, create_sequences_sql, create_table_sql,
    generated_insert_sql, generated_table_name, insert_sql, key_ceiling_sql, merge_select_sql,
    quote_identifier, quote_path, sequence_columns, staged_rows_sql,
};

/// Bounds of the floats that convert to `i64` without saturating
const I64_FLOAT_MIN: f64 = -9_223_372_036_854_775_808.0;
const I64_FLOAT_END: f64 = 9_223_372_036_854_775_808.0;

/// Table created inside the staging store
#[derive(Debug)]
struct StagedTable {
    table: TableRef,
    columns: Vec<ColumnDefinition>,
    insert_sql: String,
    /// Set when a key column is sequence-backed
    generated_insert_sql: Option<String>,
}

/// Private, file-backed staging database of one writer
pub struct StagingStore {
    /// Path to the DuckDB file
    db_path: PathBuf,
    /// Opened by `create_staging_table`
    connection: Option<duckdb::Connection>,
    staged: Option<StagedTable>,
}

impl StagingStore {
    /// Create a staging store backed by `db_path`.
    ///
    /// Nothing touches the filesystem until the staging table is created.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            connection: None,
            staged: None,
        }
    }

    /// Get the database file path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Columns of the staging table, empty before it is created
    pub fn columns(&self) -> &[ColumnDefinition] {
        self.staged
            .as_ref()
            .map(|s| s.columns.as_slice())
            .unwrap_or(&[])
    }

    /// Every staged row, ordered by key.
    ///
    /// Generated keys are shown renumbered past the staged explicit keys,
    /// as they would land in an empty destination.
    pub fn scan(&self) -> PondResult<QueryResult> {
        let (conn, staged) = self.open_table()?;
        let scan_error = |e: duckdb::Error| {
            PondError::resource(&self.db_path, format!("Scan failed: {}", e))
        };

        let bases = key_bases(conn, staged, None).map_err(scan_error)?;
        let rows = staged_rows_sql(&staged.table.name, &staged.columns, &bases);
        let keys: Vec<String> = primary_key_names(&staged.columns)
            .into_iter()
            .map(quote_identifier)
            .collect();

        let sql = if keys.is_empty() {
            format!("{} ORDER BY rowid", rows)
        } else {
            format!("SELECT * FROM ({}) AS staged ORDER BY {}", rows, keys.join(", "))
        };
        query_json(conn, &sql).map_err(scan_error)
    }

    fn open_table(&self) -> PondResult<(&duckdb::Connection, &StagedTable)> {
        match (&self.connection, &self.staged) {
            (Some(conn), Some(staged)) => Ok((conn, staged)),
            (None, Some(staged)) => Err(PondError::WriterClosed {
                table: staged.table.qualified_name(),
                state: "closed".to_string(),
            }),
            _ => Err(PondError::resource(
                &self.db_path,
                "staging table has not been created",
            )),
        }
    }
}

/// Columns of a Parquet file
fn parquet_columns(conn: &duckdb::Connection, file: &Path) -> duckdb::Result<Vec<String>> {
    let described = query_json(
        conn,
        &format!("DESCRIBE SELECT * FROM read_parquet({})", quote_path(file)),
    )?;

    Ok(described
        .rows
        .iter()
        .filter_map(|row| row.get("column_name").and_then(Value::as_str))
        .map(str::to_string)
        .collect())
}

/// Renumbering base of each sequence column: its largest explicit key
/// across the staged rows and `live`, never below zero.
fn key_bases(
    conn: &duckdb::Connection,
    staged: &StagedTable,
    live: Option<&Path>,
) -> duckdb::Result<Vec<i64>> {
    let sequences = sequence_columns(&staged.columns);
    if sequences.is_empty() {
        return Ok(Vec::new());
    }

    let live_columns = match live {
        Some(file) => parquet_columns(conn, file)?,
        None => Vec::new(),
    };

    sequences
        .iter()
        .map(|(column, flag)| {
            let live = live.filter(|_| live_columns.contains(&column.name));
            let ceiling = conn.query_row(
                &key_ceiling_sql(&staged.table.name, &column.name, flag, live),
                [],
                |row| row.get::<_, Option<i64>>(0),
            )?;
            Ok::<_, duckdb::Error>(ceiling.unwrap_or(0).max(0))
        })
        .collect()
}

/// Name of a JSON value's type, for error messages
fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Convert one field of a row into a bound parameter.
fn bind_value(
    table: &str,
    column: &ColumnDefinition,
    value: Option<&Value>,
) -> PondResult<DbValue> {
    let value = match value {
        None | Some(Value::Null) if column.is_defaultable() => return Ok(DbValue::Null),
        None => {
            return Err(PondError::write(
                table,
                format!("missing value for required field '{}'", column.name),
            ));
        }
        Some(Value::Null) => {
            return Err(PondError::write(
                table,
                format!("null value for non-nullable field '{}'", column.name),
            ));
        }
        Some(value) => value,
    };

    let mismatch = || {
        PondError::write(
            table,
            format!(
                "field '{}' expects {} but got {}",
                column.name,
                column.column_type,
                json_type_name(value)
            ),
        )
    };

    match (column.column_type, value) {
        (ColumnType::Integer, Value::Number(n)) => {
            let out_of_range = || {
                PondError::write(
                    table,
                    format!(
                        "field '{}' value {} is out of range for {}",
                        column.name, n, column.column_type
                    ),
                )
            };
            match n.as_i64() {
                Some(i) => Ok(DbValue::BigInt(i)),
                None if n.is_u64() => Err(out_of_range()),
                None => match n.as_f64() {
                    Some(f) if f.fract() != 0.0 => Err(mismatch()),
                    Some(f) if (I64_FLOAT_MIN..I64_FLOAT_END).contains(&f) => {
                        Ok(DbValue::BigInt(f as i64))
                    }
                    _ => Err(out_of_range()),
                },
            }
        }
        (ColumnType::Number, Value::Number(n)) => n.as_f64().map(DbValue::Double).ok_or_else(mismatch),
        (ColumnType::Boolean, Value::Bool(b)) => Ok(DbValue::Boolean(*b)),
        (
            ColumnType::String | ColumnType::Timestamp | ColumnType::Date | ColumnType::Time,
            Value::String(s),
        ) => Ok(DbValue::Text(s.clone())),
        (ColumnType::Json, value) => Ok(DbValue::Text(value.to_string())),
        _ => Err(mismatch()),
    }
}

impl Connector for StagingStore {
    fn create_staging_table(
        &mut self,
        table: &TableRef,
        columns: &[ColumnDefinition],
    ) -> PondResult<()> {
        if self.staged.is_some() {
            return Err(PondError::schema(
                table.qualified_name(),
                "staging table already created",
            ));
        }

        if let Some(dir) = self.db_path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| PondError::resource(dir, e))?;
        }

        let conn = duckdb::Connection::open(&self.db_path).map_err(|e| {
            PondError::resource(&self.db_path, format!("Failed to open DuckDB: {}", e))
        })?;

        let has_sequences = columns.iter().any(|c| c.sequence.is_some());
        let mut ddl = format!(
            "{}{}",
            create_sequences_sql(columns),
            create_table_sql(&table.name, columns)
        );
        if has_sequences {
            ddl.push('\n');
            ddl.push_str(&create_generated_table_sql(&table.name, columns));
        }

        debug!(table = %table, "Creating staging table:\n{}", ddl);
        conn.execute_batch(&ddl).map_err(|e| {
            PondError::schema(
                table.qualified_name(),
                format!("Failed to create staging table: {}", e),
            )
        })?;

        self.connection = Some(conn);
        self.staged = Some(StagedTable {
            table: table.clone(),
            columns: columns.to_vec(),
            insert_sql: insert_sql(&table.name, columns),
            generated_insert_sql: has_sequences
                .then(|| generated_insert_sql(&table.name, columns)),
        });

        Ok(())
    }

    fn insert(&mut self, rows: &[Row]) -> PondResult<usize> {
        let (conn, staged) = self.open_table()?;
        let table = staged.table.qualified_name();
        let sequences = sequence_columns(&staged.columns);

        for row in rows {
            let mut values = staged
                .columns
                .iter()
                .map(|column| bind_value(&table, column, row.get(&column.name)))
                .collect::<PondResult<Vec<_>>>()?;

            let generated: Vec<bool> = sequences
                .iter()
                .map(|(column, _)| row.get(&column.name).is_none_or(Value::is_null))
                .collect();

            let sql = match &staged.generated_insert_sql {
                Some(sql) if generated.contains(&true) => {
                    values.extend(generated.into_iter().map(DbValue::Boolean));
                    sql
                }
                _ => &staged.insert_sql,
            };

            let mut stmt = conn.prepare_cached(sql).map_err(|e| {
                PondError::write(&table, format!("Failed to prepare insert: {}", e))
            })?;
            stmt.execute(duckdb::params_from_iter(values))
                .map_err(|e| PondError::write(&table, format!("Insert failed: {}", e)))?;
        }

        Ok(rows.len())
    }

    fn staged_row_count(&self) -> PondResult<u64> {
        let (conn, staged) = self.open_table()?;

        let mut sql = format!(
            "SELECT count(*) FROM {}",
            quote_identifier(&staged.table.name)
        );
        if staged.generated_insert_sql.is_some() {
            sql = format!(
                "SELECT ({}) + (SELECT count(*) FROM {})",
                sql,
                quote_identifier(&generated_table_name(&staged.table.name))
            );
        }

        conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map(|count| count as u64)
            .map_err(|e| PondError::resource(&self.db_path, format!("Count failed: {}", e)))
    }

    fn merge_into(&mut self, live: Option<&Path>, output: &Path) -> PondResult<u64> {
        let (conn, staged) = self.open_table()?;
        let table = staged.table.qualified_name();
        let merge_error = |e: &dyn std::fmt::Display| {
            PondError::commit(&table, CommitFailure::Merge, e.to_string())
        };

        if let Some(dir) = output.parent() {
            std::fs::create_dir_all(dir).map_err(|e| PondError::resource(dir, e))?;
        }

        let bases = key_bases(conn, staged, live).map_err(|e| merge_error(&e))?;
        let rows = staged_rows_sql(&staged.table.name, &staged.columns, &bases);
        let keys = primary_key_names(&staged.columns);
        let query = merge_select_sql(&rows, &keys, live);
        conn.execute_batch(&copy_to_parquet_sql(&query, output))
            .map_err(|e| merge_error(&e))?;

        let rows = conn
            .query_row(
                &format!("SELECT count(*) FROM read_parquet({})", quote_path(output)),
                [],
                |row| row.get::<_, i64>(0),
            )
            .map_err(|e| merge_error(&e))?;

        // the rename that publishes this file must never expose a torn write
        File::open(output)
            .and_then(|f| f.sync_all())
            .map_err(|e| merge_error(&e))?;

        Ok(rows as u64)
    }

    fn close(&mut self) -> PondResult<()> {
        match self.connection.take() {
            Some(conn) => conn.close().map_err(|(_, e)| {
                PondError::resource(&self.db_path, format!("Failed to close DuckDB: {}", e))
            }),
            None => Ok(()),
        }
    }
}
