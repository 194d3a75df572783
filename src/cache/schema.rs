//! Table schema metadata and its lazily populated cache.

use crate::backend::{call_with_retry, Rows, StorageBackend};
use crate::error::{Error, Result};
use crate::types::{string_hint, HintKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Column type, as far as the cache cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Float,
    Text,
}

impl FieldType {
    /// Infer a column type from its SQL type name (`bigint(20)`,
    /// `varchar(64)`, `double`, ...). Anything not numeric is text.
    pub fn from_sql(sql_type: &str) -> Self {
        let sql_type = sql_type.trim().to_ascii_lowercase();
        if sql_type.contains("int") {
            FieldType::Integer
        } else if ["float", "double", "decimal", "numeric", "real"]
            .iter()
            .any(|t| sql_type.starts_with(t))
        {
            FieldType::Float
        } else {
            FieldType::Text
        }
    }

    pub fn is_string(self) -> bool {
        self == FieldType::Text
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
}

/// Immutable description of a cached table.
///
/// A schema is replaced, never mutated, when its table is invalidated.
/// In-flight fetches compare schema identity (`Arc::ptr_eq`) to detect that.
#[derive(Debug)]
pub struct TableSchema {
    table: String,
    key_column: String,
    key_index: usize,
    key_is_string: bool,
    fields: Vec<Field>,
    index: HashMap<String, usize>,
    select_clause: String,
}

impl TableSchema {
    /// Build a schema from `describe` rows and the table's split column.
    pub fn from_description(table: &str, split_column: &str, description: &Rows) -> Result<Self> {
        let mut fields = Vec::with_capacity(description.len());
        let mut index = HashMap::with_capacity(description.len());

        for row in description {
            let name = match row.first() {
                Some(name) if !name.is_empty() => name.clone(),
                _ => continue,
            };
            let field_type = FieldType::from_sql(row.get(1).map(String::as_str).unwrap_or(""));
            index.insert(name.clone(), fields.len());
            fields.push(Field { name, field_type });
        }

        let key_index = *index.get(split_column).ok_or_else(|| {
            Error::TableNotFound(format!(
                "{}: split column {} is not a column of the table",
                table, split_column
            ))
        })?;
        let key_is_string = fields[key_index].field_type.is_string();

        let select_clause = fields
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(",");

        Ok(Self {
            table: table.to_string(),
            key_column: split_column.to_string(),
            key_index,
            key_is_string,
            fields,
            index,
            select_clause,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Name of the split column that keys the table's rows.
    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    /// Physical index of the key column.
    pub fn key_index(&self) -> usize {
        self.key_index
    }

    pub fn key_is_string(&self) -> bool {
        self.key_is_string
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Comma separated list of every column, for `select` statements.
    pub fn select_clause(&self) -> &str {
        &self.select_clause
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn is_string_field(&self, name: &str) -> bool {
        self.field_index(name)
            .map(|i| self.fields[i].field_type.is_string())
            .unwrap_or(false)
    }

    /// Physical indexes of the named fields. An empty list selects every
    /// field. Unknown names are rejected.
    pub fn field_indexes(&self, names: &[String]) -> Result<Vec<usize>> {
        if names.is_empty() {
            return Ok((0..self.fields.len()).collect());
        }

        names
            .iter()
            .map(|name| {
                self.field_index(name).ok_or_else(|| {
                    Error::InvalidRequest(format!("unknown field {} in table {}", name, self.table))
                })
            })
            .collect()
    }

    /// Bring a caller supplied key to the type of the key column.
    pub fn normalize_key(&self, key: &HintKey) -> Result<HintKey> {
        match (self.key_is_string, key) {
            (true, HintKey::Str(_)) | (false, HintKey::Int(_)) => Ok(key.clone()),
            (true, HintKey::Int(v)) => Ok(HintKey::Str(v.to_string())),
            (false, HintKey::Str(s)) => s.trim().parse::<i64>().map(HintKey::Int).map_err(|_| {
                Error::InvalidRequest(format!(
                    "key {} is not an integer, table {} is keyed by {}",
                    s, self.table, self.key_column
                ))
            }),
        }
    }

    /// Hint id of a key already normalized with [`normalize_key`](Self::normalize_key).
    pub fn hint_of(&self, key: &HintKey) -> i64 {
        match key {
            HintKey::Int(v) => *v,
            HintKey::Str(s) => string_hint(s),
        }
    }

    /// Key of a row returned by the backend, from its key column value.
    pub fn key_of_value(&self, value: &str) -> Option<HintKey> {
        if self.key_is_string {
            Some(HintKey::Str(value.to_string()))
        } else {
            value.trim().parse::<i64>().ok().map(HintKey::Int)
        }
    }
}

/// Published schemas, keyed by table name.
#[derive(Debug, Default)]
pub struct SchemaMap {
    schemas: HashMap<String, Arc<TableSchema>>,
}

impl SchemaMap {
    pub fn get(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.schemas.get(table).cloned()
    }

    /// Publish a freshly loaded schema unless another caller already did;
    /// returns whichever schema is now current.
    pub fn publish(&mut self, schema: TableSchema) -> Arc<TableSchema> {
        self.schemas
            .entry(schema.table.clone())
            .or_insert_with(|| Arc::new(schema))
            .clone()
    }

    pub fn remove(&mut self, table: &str) -> Option<Arc<TableSchema>> {
        self.schemas.remove(table)
    }

    /// Whether `schema` is still the published instance for its table.
    pub fn is_current(&self, schema: &Arc<TableSchema>) -> bool {
        self.schemas
            .get(schema.table())
            .map(|current| Arc::ptr_eq(current, schema))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// Loads table schemas from the metadata service.
pub struct SchemaLoader {
    backend: Arc<dyn StorageBackend>,
    timeout: Duration,
}

impl SchemaLoader {
    pub fn new(backend: Arc<dyn StorageBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    /// Describe the table (retried once) and look up its split column.
    pub async fn load(&self, table: &str) -> Result<TableSchema> {
        let description = call_with_retry("describe", table, self.timeout, || {
            self.backend.describe_table(table)
        })
        .await
        .map_err(|e| {
            error!(table, error = %e, "Failed to load table schema");
            Error::TableNotFound(table.to_string())
        })?;

        if description.is_empty() {
            debug!(table, "Metadata service returned no columns");
            return Err(Error::TableNotFound(table.to_string()));
        }

        let split_column = call_with_retry("split_info", table, self.timeout, || {
            self.backend.split_hint_column(table)
        })
        .await
        .map_err(|e| {
            error!(table, error = %e, "Failed to load split column");
            Error::TableNotFound(table.to_string())
        })?
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            error!(table, "Table is misconfigured: empty split hint column");
            Error::TableNotFound(table.to_string())
        })?;

        let schema = TableSchema::from_description(table, &split_column, &description)
            .inspect_err(|e| error!(table, error = %e, "Table is misconfigured"))?;

        info!(
            table,
            key_column = schema.key_column(),
            fields = schema.fields().len(),
            "Table schema loaded"
        );
        Ok(schema)
    }
}

impl std::fmt::Debug for SchemaLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaLoader")
            .field("timeout", &self.timeout)
            .finish()
    }
}
