//! SQL text builders for the staging and merge statements
//!
//! Column names come straight from upstream schemas and may be reserved
//! words or contain arbitrary characters, so every identifier is emitted
//! double-quoted. Sequence names are conformed to `[A-Za-z0-9_]` instead
//! because DuckDB resolves them from a string literal.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

use crate::schema::ColumnDefinition;

static NON_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("valid identifier regex"));

/// Quote an identifier, doubling embedded quotes.
///
/// # Examples
///
/// ```
/// use target_duckpond::sql::quote_identifier;
///
/// assert_eq!(quote_identifier("select"), "\"select\"");
/// assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
/// ```
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a filesystem path as a string literal.
pub fn quote_path(path: &Path) -> String {
    quote_literal(&path.to_string_lossy())
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`.
pub fn conform_identifier(name: &str) -> String {
    NON_IDENTIFIER.replace_all(name, "_").into_owned()
}

/// `CREATE SEQUENCE` statements for every sequence-backed column
pub fn create_sequences_sql(columns: &[ColumnDefinition]) -> String {
    columns
        .iter()
        .filter_map(|c| c.sequence.as_ref())
        .map(|seq| format!("CREATE SEQUENCE {} START WITH {};\n", seq.name, seq.start))
        .collect()
}

/// `CREATE TABLE` statement for the given columns
pub fn create_table_sql(table: &str, columns: &[ColumnDefinition]) -> String {
    let mut definitions: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_identifier(&c.name), c.column_type.sql_type());
            if let Some(seq) = &c.sequence {
                def.push_str(&format!(" DEFAULT nextval({})", quote_literal(&seq.name)));
            }
            if !c.nullable && c.sequence.is_none() {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();

    let keys: Vec<String> = columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| quote_identifier(&c.name))
        .collect();
    if !keys.is_empty() {
        definitions.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }

    format!(
        "CREATE TABLE {} (\n    {}\n);",
        quote_identifier(table),
        definitions.join(",\n    ")
    )
}

/// Parameterized insert statement for rows whose keys are all explicit.
///
/// Tables with a primary key replace rows whose key is already staged.
pub fn insert_sql(table: &str, columns: &[ColumnDefinition]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_identifier(&c.name)).collect();
    let values: Vec<String> = columns
        .iter()
        .map(|c| format!("CAST(? AS {})", c.column_type.sql_type()))
        .collect();

    let verb = if columns.iter().any(|c| c.primary_key) {
        "INSERT OR REPLACE INTO"
    } else {
        "INSERT INTO"
    };

    format!(
        "{} {} ({}) VALUES ({})",
        verb,
        quote_identifier(table),
        names.join(", "),
        values.join(", ")
    )
}

/// Companion table holding rows whose key came from a sequence
pub fn generated_table_name(table: &str) -> String {
    format!("{}__generated", table)
}

/// Flag column marking that the `index`-th sequence column was generated
pub fn generated_flag(index: usize) -> String {
    format!("__generated_{}", index)
}

/// Sequence-backed columns paired with their flag column, in column order
pub fn sequence_columns(columns: &[ColumnDefinition]) -> Vec<(&ColumnDefinition, String)> {
    columns
        .iter()
        .filter(|c| c.sequence.is_some())
        .enumerate()
        .map(|(i, c)| (c, generated_flag(i)))
        .collect()
}

/// `CREATE TABLE` for the generated-rows table: the staged columns without
/// a key constraint, plus one flag per sequence column.
pub fn create_generated_table_sql(table: &str, columns: &[ColumnDefinition]) -> String {
    let mut definitions: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_identifier(&c.name), c.column_type.sql_type());
            if !c.nullable {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();

    for (_, flag) in sequence_columns(columns) {
        definitions.push(format!("{} BOOLEAN NOT NULL", quote_identifier(&flag)));
    }

    format!(
        "CREATE TABLE {} (\n    {}\n);",
        quote_identifier(&generated_table_name(table)),
        definitions.join(",\n    ")
    )
}

/// Insert into the generated-rows table.
///
/// Sequence columns take `nextval` when bound to `NULL`. One flag per
/// sequence column is bound after the column values.
pub fn generated_insert_sql(table: &str, columns: &[ColumnDefinition]) -> String {
    let sequences = sequence_columns(columns);

    let mut names: Vec<String> = columns.iter().map(|c| quote_identifier(&c.name)).collect();
    let mut values: Vec<String> = columns
        .iter()
        .map(|c| {
            let cast = format!("CAST(? AS {})", c.column_type.sql_type());
            match &c.sequence {
                Some(seq) => format!("COALESCE({}, nextval({}))", cast, quote_literal(&seq.name)),
                None => cast,
            }
        })
        .collect();

    for (_, flag) in &sequences {
        names.push(quote_identifier(flag));
        values.push("CAST(? AS BOOLEAN)".to_string());
    }

    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(&generated_table_name(table)),
        names.join(", "),
        values.join(", ")
    )
}

/// Largest explicit value of a sequence column across the staged rows and,
/// when given, the live table.
pub fn key_ceiling_sql(table: &str, column: &str, flag: &str, live: Option<&Path>) -> String {
    let key = quote_identifier(column);
    let mut sources = vec![
        format!("SELECT {} AS k FROM {}", key, quote_identifier(table)),
        format!(
            "SELECT {} FROM {} WHERE NOT {}",
            key,
            quote_identifier(&generated_table_name(table)),
            quote_identifier(flag)
        ),
    ];
    if let Some(live) = live {
        sources.push(format!("SELECT {} FROM read_parquet({})", key, quote_path(live)));
    }

    format!("SELECT max(k) FROM ({})", sources.join(" UNION ALL "))
}

/// Every staged row with generated keys renumbered.
///
/// The `i`-th sequence column hands out `bases[i] + 1, bases[i] + 2, ...`
/// in the order its sequence issued the provisional values.
pub fn staged_rows_sql(table: &str, columns: &[ColumnDefinition], bases: &[i64]) -> String {
    let explicit = format!("SELECT * FROM {}", quote_identifier(table));
    let sequences = sequence_columns(columns);
    if sequences.is_empty() {
        return explicit;
    }

    let projections: Vec<String> = columns
        .iter()
        .map(|c| {
            let name = quote_identifier(&c.name);
            match sequences.iter().position(|(seq, _)| seq.name == c.name) {
                Some(i) => {
                    let flag = quote_identifier(&sequences[i].1);
                    format!(
                        "CASE WHEN {flag} THEN {base} + row_number() OVER (PARTITION BY {flag} ORDER BY {name}) ELSE {name} END AS {name}",
                        flag = flag,
                        base = bases.get(i).copied().unwrap_or(0),
                        name = name
                    )
                }
                None => name,
            }
        })
        .collect();

    format!(
        "{} UNION ALL BY NAME SELECT {} FROM {}",
        explicit,
        projections.join(", "),
        quote_identifier(&generated_table_name(table))
    )
}

/// Query producing the merged table: staged rows, then every live row
/// whose key was not staged. Without keys the merge is an append.
pub fn merge_select_sql(staged: &str, keys: &[&str], live: Option<&Path>) -> String {
    let Some(live) = live else {
        return staged.to_string();
    };

    let live_scan = format!("SELECT * FROM read_parquet({}) AS live", quote_path(live));
    if keys.is_empty() {
        return format!(
            "WITH staged AS ({}) SELECT * FROM staged UNION ALL BY NAME {}",
            staged, live_scan
        );
    }

    let matches: Vec<String> = keys
        .iter()
        .map(|k| {
            let key = quote_identifier(k);
            format!("s.{} IS NOT DISTINCT FROM live.{}", key, key)
        })
        .collect();

    format!(
        "WITH staged AS ({}) SELECT * FROM staged UNION ALL BY NAME {} WHERE NOT EXISTS (SELECT 1 FROM staged AS s WHERE {})",
        staged,
        live_scan,
        matches.join(" AND ")
    )
}

/// `COPY (...) TO` statement writing `query` as a Parquet file
pub fn copy_to_parquet_sql(query: &str, output: &Path) -> String {
    format!("COPY ({}) TO {} (FORMAT PARQUET)", query, quote_path(output))
}
