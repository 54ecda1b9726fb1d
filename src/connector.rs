//! Connector abstraction: type mapping, DDL, inserts and engine-side merge
//!
//! A connector owns one writer's staging store. The commit protocol in
//! [`crate::sink::commit`] only talks to this trait, so another engine can
//! stage and merge rows without touching the locking and publish steps.

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;

use crate::error::PondResult;
use crate::pond::TableRef;
use crate::schema::{ColumnDefinition, Row, SequenceSpec, StreamSchema, TypeDescriptor};

/// DDL and staging operations of a destination engine
pub trait Connector {
    /// Map a JSON schema fragment to a native column type
    fn to_column_type(&self, descriptor: &Value) -> TypeDescriptor {
        TypeDescriptor::from_json_schema(descriptor)
    }

    /// Translate a stream schema into column definitions.
    ///
    /// Integer primary keys get a sequence-backed default because the
    /// engine has no auto-increment integer type. Sequence names are unique
    /// within the table even when conforming maps two fields to one name.
    /// Fails with a schema error when the schema has no fields or names an
    /// unknown key.
    fn table_columns(
        &self,
        table: &TableRef,
        schema: &StreamSchema,
    ) -> PondResult<Vec<ColumnDefinition>> {
        schema.validate(&table.qualified_name())?;

        let mut sequence_names = HashSet::new();
        let columns = schema
            .fields
            .iter()
            .enumerate()
            .map(|(index, field)| {
                let descriptor = self.to_column_type(&field.descriptor);
                let primary_key = schema.is_key(&field.name);
                let sequence = (primary_key && descriptor.column_type.is_integer()).then(|| {
                    let mut spec =
                        SequenceSpec::for_key(table.namespace.as_deref(), &table.name, &field.name);
                    let base = spec.name.clone();
                    let mut suffix = index;
                    while !sequence_names.insert(spec.name.clone()) {
                        spec.name = format!("{}_{}", base, suffix);
                        suffix += 1;
                    }
                    spec
                });
                let required = schema.is_required(&field.name)
                    && descriptor.explicit
                    && !descriptor.allows_null;

                ColumnDefinition {
                    name: field.name.clone(),
                    column_type: descriptor.column_type,
                    primary_key,
                    nullable: !primary_key && !required,
                    sequence,
                }
            })
            .collect();

        Ok(columns)
    }

    /// Create the staging table; callable once per connector
    fn create_staging_table(
        &mut self,
        table: &TableRef,
        columns: &[ColumnDefinition],
    ) -> PondResult<()>;

    /// Insert conformed rows into the staging table
    fn insert(&mut self, rows: &[Row]) -> PondResult<usize>;

    /// Rows currently held by the staging table
    fn staged_row_count(&self) -> PondResult<u64>;

    /// Write the staged rows upserted into `live` (when present) to
    /// `output`, returning the row count of the merged table.
    fn merge_into(&mut self, live: Option<&Path>, output: &Path) -> PondResult<u64>;

    /// Release the staging store
    fn close(&mut self) -> PondResult<()>;
}
