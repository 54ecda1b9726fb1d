//! Stream schemas and their column definitions
//!
//! A [`StreamSchema`] is discovered at runtime from the upstream JSON schema
//! message. It is translated into a list of [`ColumnDefinition`]s which in
//! turn drive the staging DDL and the insert statement.

mod types;

pub use types::{ColumnType, TypeDescriptor};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PondError, PondResult};
use crate::sql::conform_identifier;

/// A single row, keyed by field name
pub type Row = serde_json::Map<String, Value>;

/// A field of a stream schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Field name as it appears in records
    pub name: String,
    /// JSON schema fragment describing the field
    pub descriptor: Value,
}

/// Schema of one stream: ordered fields plus key properties
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSchema {
    /// Fields in upstream order
    pub fields: Vec<SchemaField>,
    /// Names of primary-key fields (may be empty)
    pub key_properties: Vec<String>,
    /// Fields listed as `required` by the JSON schema
    #[serde(default)]
    pub required: Vec<String>,
}

impl StreamSchema {
    /// Build a stream schema from a JSON schema document.
    ///
    /// The document must carry a `properties` object; an absent or
    /// non-object `properties` is a schema error for `stream`.
    pub fn from_json_schema(
        stream: &str,
        schema: &Value,
        key_properties: &[String],
    ) -> PondResult<Self> {
        let properties = schema
            .get("properties")
            .and_then(Value::as_object)
            .ok_or_else(|| {
                PondError::schema(
                    stream,
                    format!("schema does not define properties: {}", schema),
                )
            })?;

        let fields = properties
            .iter()
            .map(|(name, descriptor)| SchemaField {
                name: name.clone(),
                descriptor: descriptor.clone(),
            })
            .collect();

        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            fields,
            key_properties: key_properties.to_vec(),
            required,
        })
    }

    /// Check structural invariants: at least one field, keys are fields
    pub fn validate(&self, table: &str) -> PondResult<()> {
        if self.fields.is_empty() {
            return Err(PondError::schema(
                table,
                "schema must define at least one property",
            ));
        }

        for key in &self.key_properties {
            if self.field(key).is_none() {
                return Err(PondError::schema(
                    table,
                    format!("key property '{}' is not a schema field", key),
                ));
            }
        }

        Ok(())
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether `name` is a key property
    pub fn is_key(&self, name: &str) -> bool {
        self.key_properties.iter().any(|k| k == name)
    }

    /// Whether `name` is listed as required
    pub fn is_required(&self, name: &str) -> bool {
        self.required.iter().any(|r| r == name)
    }
}

/// Sequence backing an integer primary key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSpec {
    /// Sequence name, restricted to `[A-Za-z0-9_]`
    pub name: String,
    /// First value handed out
    pub start: i64,
}

impl SequenceSpec {
    /// Sequence for `field` of `table`, scoped by namespace
    pub fn for_key(namespace: Option<&str>, table: &str, field: &str) -> Self {
        let name = match namespace {
            Some(ns) => format!("{}_{}_{}_pk_seq", ns, table, field),
            None => format!("{}_{}_pk_seq", table, field),
        };
        Self {
            name: conform_identifier(&name),
            start: 1,
        }
    }
}

/// A native column derived from a schema field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub nullable: bool,
    /// Generator used as the column default
    pub sequence: Option<SequenceSpec>,
}

impl ColumnDefinition {
    /// Whether a missing value can be filled without error
    pub fn is_defaultable(&self) -> bool {
        self.sequence.is_some() || self.nullable
    }
}

/// Names of the primary-key columns, in column order
pub fn primary_key_names(columns: &[ColumnDefinition]) -> Vec<&str> {
    columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.as_str())
        .collect()
}
