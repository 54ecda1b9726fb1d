//! Query results as JSON rows

use chrono::{DateTime, NaiveDate, NaiveTime};
use duckdb::types::{TimeUnit, ValueRef};
use serde::{Deserialize, Serialize};

/// Query result row as a JSON value
pub type QueryRow = serde_json::Value;

/// Query result set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Rows of data
    pub rows: Vec<QueryRow>,
}

impl QueryResult {
    /// Create a new query result
    pub fn new(columns: Vec<String>, rows: Vec<QueryRow>) -> Self {
        Self { columns, rows }
    }

    /// Create an empty result
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Get the number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Find the first row whose `column` equals `value`
    pub fn find(&self, column: &str, value: &serde_json::Value) -> Option<&QueryRow> {
        self.rows.iter().find(|row| row.get(column) == Some(value))
    }
}

/// Run `sql` and collect every row as a JSON object
pub(crate) fn query_json(conn: &duckdb::Connection, sql: &str) -> duckdb::Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;

    // In DuckDB 1.4+, we need to execute the query first, then get columns
    let mut result_rows = stmt.query([])?;

    let column_count = result_rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
    let columns: Vec<String> = (0..column_count)
        .map(|i| {
            result_rows
                .as_ref()
                .and_then(|r| r.column_name(i).ok())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("col{}", i))
        })
        .collect();

    let mut rows = Vec::new();
    while let Some(row) = result_rows.next()? {
        let mut map = serde_json::Map::new();
        for (i, name) in columns.iter().enumerate() {
            let value = match row.get_ref(i) {
                Ok(value_ref) => value_ref_to_json(value_ref),
                Err(_) => serde_json::Value::Null,
            };
            map.insert(name.clone(), value);
        }
        rows.push(serde_json::Value::Object(map));
    }

    Ok(QueryResult::new(columns, rows))
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

/// Convert a DuckDB ValueRef to a JSON value
fn value_ref_to_json(value: ValueRef) -> serde_json::Value {
    use serde_json::Value;

    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::Number(i.into()),
        ValueRef::SmallInt(i) => Value::Number(i.into()),
        ValueRef::Int(i) => Value::Number(i.into()),
        ValueRef::BigInt(i) => Value::Number(i.into()),
        // i128 may not fit in a JSON number
        ValueRef::HugeInt(i) => Value::String(i.to_string()),
        ValueRef::UTinyInt(i) => Value::Number(i.into()),
        ValueRef::USmallInt(i) => Value::Number(i.into()),
        ValueRef::UInt(i) => Value::Number(i.into()),
        ValueRef::UBigInt(i) => Value::Number(i.into()),
        ValueRef::Float(f) => serde_json::Number::from_f64(f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Decimal(d) => Value::String(d.to_string()),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
        ValueRef::Timestamp(unit, v) => DateTime::from_timestamp_micros(to_micros(unit, v))
            .map(|ts| Value::String(ts.to_rfc3339()))
            .unwrap_or(Value::Null),
        ValueRef::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days as i64)))
            .map(|date| Value::String(date.to_string()))
            .unwrap_or(Value::Null),
        ValueRef::Time64(unit, v) => {
            let micros = to_micros(unit, v);
            NaiveTime::from_num_seconds_from_midnight_opt(
                (micros / 1_000_000) as u32,
                ((micros % 1_000_000) * 1_000) as u32,
            )
            .map(|time| Value::String(time.to_string()))
            .unwrap_or(Value::Null)
        }
        other => Value::String(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_json_scalars() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        let result = query_json(
            &conn,
            "SELECT 1::BIGINT AS n, 'x' AS s, TRUE AS b, NULL::VARCHAR AS z, 1.5::DOUBLE AS d, \
             DATE '2024-03-01' AS day",
        )
        .unwrap();

        assert_eq!(result.columns, vec!["n", "s", "b", "z", "d", "day"]);
        assert_eq!(result.row_count(), 1);
        assert_eq!(
            result.rows[0],
            json!({"n": 1, "s": "x", "b": true, "z": null, "d": 1.5, "day": "2024-03-01"})
        );
    }

    #[test]
    fn test_find_row() {
        let result = QueryResult::new(
            vec!["id".to_string()],
            vec![json!({"id": 1}), json!({"id": 2})],
        );
        assert_eq!(result.find("id", &json!(2)), Some(&json!({"id": 2})));
        assert!(result.find("id", &json!(3)).is_none());
        assert!(QueryResult::empty().is_empty());
    }
}
