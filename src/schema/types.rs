//! Native column types and the JSON schema type mapping

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Native column type of a staging/destination column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Number,
    Boolean,
    String,
    Timestamp,
    Date,
    Time,
    /// Objects, arrays and untyped values, stored as serialized JSON text
    Json,
}

impl ColumnType {
    /// DuckDB type name used in DDL and casts
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "BIGINT",
            ColumnType::Number => "DOUBLE",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::String => "VARCHAR",
            ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::Date => "DATE",
            ColumnType::Time => "TIME",
            ColumnType::Json => "VARCHAR",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, ColumnType::Integer)
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sql_type())
    }
}

/// Column type and nullability read from one JSON schema fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub column_type: ColumnType,
    /// The fragment explicitly admits `null`
    pub allows_null: bool,
    /// The fragment names a concrete type (as opposed to an empty schema)
    pub explicit: bool,
}

impl TypeDescriptor {
    /// Read a JSON schema fragment such as `{"type": ["string", "null"]}`.
    pub fn from_json_schema(descriptor: &Value) -> Self {
        if let Some(branches) = descriptor.get("anyOf").and_then(Value::as_array) {
            let mut allows_null = false;
            let mut chosen = None;
            for branch in branches {
                let parsed = Self::from_json_schema(branch);
                allows_null |= parsed.allows_null;
                if chosen.is_none() && parsed.explicit {
                    chosen = Some(parsed);
                }
            }
            return match chosen {
                Some(parsed) => Self {
                    allows_null,
                    ..parsed
                },
                None => Self {
                    column_type: ColumnType::Json,
                    allows_null: true,
                    explicit: false,
                },
            };
        }

        let type_names: Vec<&str> = match descriptor.get("type") {
            Some(Value::String(name)) => vec![name.as_str()],
            Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };

        let allows_null = type_names.contains(&"null");
        let concrete: Vec<&str> = type_names.into_iter().filter(|t| *t != "null").collect();

        if concrete.is_empty() {
            return Self {
                column_type: ColumnType::Json,
                allows_null: true,
                explicit: false,
            };
        }

        let json_type = if concrete.len() > 1 && concrete.contains(&"string") {
            "string"
        } else {
            concrete[0]
        };
        let format = descriptor.get("format").and_then(Value::as_str);

        Self {
            column_type: map_json_type(json_type, format),
            allows_null,
            explicit: true,
        }
    }
}

/// Map a JSON schema type (and string format) to a column type.
fn map_json_type(json_type: &str, format: Option<&str>) -> ColumnType {
    match json_type {
        "integer" => ColumnType::Integer,
        "number" => ColumnType::Number,
        "boolean" => ColumnType::Boolean,
        "string" => match format {
            Some("date-time") => ColumnType::Timestamp,
            Some("date") => ColumnType::Date,
            Some("time") => ColumnType::Time,
            _ => ColumnType::String,
        },
        _ => ColumnType::Json, // objects, arrays, anything else
    }
}
