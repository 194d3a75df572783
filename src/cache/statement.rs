//! Parameterized statements sent to the storage backend.
//!
//! Placeholders follow the storage proxy convention: `'?'` binds a string
//! column, bare `?` binds a numeric one. Column names only ever come from a
//! [`TableSchema`], never from the request.

use super::schema::TableSchema;
use crate::backend::Statement;
use crate::types::HintKey;
use std::collections::BTreeMap;

fn placeholder(is_string: bool) -> &'static str {
    if is_string {
        "'?'"
    } else {
        "?"
    }
}

/// `select <all fields> from <table> where <key> in (...)`.
pub fn select_rows(schema: &TableSchema, keys: &[HintKey]) -> Statement {
    let key_placeholder = placeholder(schema.key_is_string());
    let placeholders = vec![key_placeholder; keys.len()].join(",");

    Statement {
        sql: format!(
            "select {} from {} where {} in ({})",
            schema.select_clause(),
            schema.table(),
            schema.key_column(),
            placeholders
        ),
        params: keys.iter().map(HintKey::to_text).collect(),
    }
}

/// Insert-or-update of one row. `values` must already be validated against
/// the schema and must not contain the key column.
pub fn upsert_row(
    schema: &TableSchema,
    key: &HintKey,
    values: &BTreeMap<String, String>,
) -> Statement {
    let mut columns = Vec::with_capacity(values.len() + 1);
    let mut placeholders = Vec::with_capacity(values.len() + 1);
    let mut assignments = Vec::with_capacity(values.len());

    columns.push(schema.key_column());
    placeholders.push(placeholder(schema.key_is_string()));

    for name in values.keys() {
        let ph = placeholder(schema.is_string_field(name));
        columns.push(name.as_str());
        placeholders.push(ph);
        assignments.push(format!("{}={}", name, ph));
    }

    // Insert binds the key then every value; the update clause binds the
    // values again.
    let mut params = Vec::with_capacity(values.len() * 2 + 1);
    params.push(key.to_text());
    params.extend(values.values().cloned());
    params.extend(values.values().cloned());

    Statement {
        sql: format!(
            "insert into {} ({}) values ({}) ON DUPLICATE KEY UPDATE {}",
            schema.table(),
            columns.join(","),
            placeholders.join(","),
            assignments.join(",")
        ),
        params,
    }
}

/// `delete from <table> where <key> = ?`.
pub fn delete_row(schema: &TableSchema, key: &HintKey) -> Statement {
    Statement {
        sql: format!(
            "delete from {} where {} = {}",
            schema.table(),
            schema.key_column(),
            placeholder(schema.key_is_string())
        ),
        params: vec![key.to_text()],
    }
}
