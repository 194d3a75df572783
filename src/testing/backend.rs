//! In-memory storage backend.

use crate::backend::{BackendResult, RowQuery, RowWrite, Rows, StorageBackend};
use crate::error::BackendError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Default)]
struct MockTable {
    /// `(name, sql type)` in column order.
    columns: Vec<(String, String)>,
    split: Option<String>,
    /// Rows keyed by the text of their split column value.
    rows: BTreeMap<String, Vec<String>>,
}

impl MockTable {
    fn key_index(&self) -> Option<usize> {
        let split = self.split.as_deref()?;
        self.columns.iter().position(|(name, _)| name == split)
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|(n, _)| n == name)
    }
}

/// [`StorageBackend`] over in-memory tables, with call counting, scripted
/// failures and an optional gate holding queries back.
///
/// Writes are applied by reading the column list of the generated
/// statement, which is enough to observe write-through behaviour.
#[derive(Debug, Default)]
pub struct MockBackend {
    tables: Mutex<HashMap<String, MockTable>>,
    describe_calls: AtomicUsize,
    query_calls: AtomicUsize,
    write_calls: AtomicUsize,
    queries: Mutex<Vec<RowQuery>>,
    writes: Mutex<Vec<RowWrite>>,
    describe_failures: Mutex<VecDeque<BackendError>>,
    query_failures: Mutex<VecDeque<BackendError>>,
    write_failures: Mutex<VecDeque<BackendError>>,
    query_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `users` table keyed by integer `uid` and a `sessions` table keyed
    /// by string `token`.
    pub fn users() -> Self {
        Self::new()
            .with_table(
                "users",
                &[("uid", "bigint(20)"), ("name", "varchar(64)"), ("score", "int(11)")],
                Some("uid"),
            )
            .with_row("users", &["1", "alice", "10"])
            .with_row("users", &["2", "bob", "20"])
            .with_row("users", &["3", "carol", "30"])
            .with_table(
                "sessions",
                &[("token", "varchar(32)"), ("uid", "bigint(20)")],
                Some("token"),
            )
            .with_row("sessions", &["abc", "1"])
            .with_row("sessions", &["def", "2"])
    }

    pub fn with_table(self, name: &str, columns: &[(&str, &str)], split: Option<&str>) -> Self {
        self.tables.lock().insert(
            name.to_string(),
            MockTable {
                columns: columns
                    .iter()
                    .map(|(n, t)| (n.to_string(), t.to_string()))
                    .collect(),
                split: split.map(str::to_string),
                rows: BTreeMap::new(),
            },
        );
        self
    }

    pub fn with_row(self, table: &str, values: &[&str]) -> Self {
        {
            let mut tables = self.tables.lock();
            if let Some(t) = tables.get_mut(table) {
                if let Some(key) = t.key_index().and_then(|i| values.get(i)) {
                    let row = values.iter().map(|v| v.to_string()).collect();
                    t.rows.insert(key.to_string(), row);
                }
            }
        }
        self
    }

    /// Stored row by key text.
    pub fn row(&self, table: &str, key: &str) -> Option<Vec<String>> {
        self.tables.lock().get(table)?.rows.get(key).cloned()
    }

    pub fn fail_describes(&self, errors: impl IntoIterator<Item = BackendError>) {
        self.describe_failures.lock().extend(errors);
    }

    pub fn fail_queries(&self, errors: impl IntoIterator<Item = BackendError>) {
        self.query_failures.lock().extend(errors);
    }

    pub fn fail_writes(&self, errors: impl IntoIterator<Item = BackendError>) {
        self.write_failures.lock().extend(errors);
    }

    /// Hold every query until a permit is added to the returned semaphore.
    pub fn gate_queries(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.query_gate.lock() = Some(gate.clone());
        gate
    }

    pub fn describe_count(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<RowQuery> {
        self.queries.lock().clone()
    }

    pub fn writes(&self) -> Vec<RowWrite> {
        self.writes.lock().clone()
    }
}

fn apply_write(table: &mut MockTable, write: &RowWrite) {
    let key = write.key.to_text();
    let sql = &write.statement.sql;

    if sql.starts_with("delete") {
        table.rows.remove(&key);
        return;
    }

    let columns: Vec<&str> = match (sql.find('('), sql.find(')')) {
        (Some(start), Some(end)) if start < end => sql[start + 1..end].split(',').collect(),
        _ => return,
    };

    let width = table.columns.len();
    let mut row = table
        .rows
        .get(&key)
        .cloned()
        .unwrap_or_else(|| vec![String::new(); width]);
    for (column, value) in columns.iter().zip(&write.statement.params) {
        if let Some(i) = table.column_index(column.trim()) {
            row[i] = value.clone();
        }
    }
    table.rows.insert(key, row);
}

#[async_trait]
impl StorageBackend for MockBackend {
    async fn describe_table(&self, table: &str) -> BackendResult<Rows> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.describe_failures.lock().pop_front() {
            return Err(e);
        }

        Ok(self
            .tables
            .lock()
            .get(table)
            .map(|t| {
                t.columns
                    .iter()
                    .map(|(name, ty)| vec![name.clone(), ty.clone(), "NO".to_string()])
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn split_hint_column(&self, table: &str) -> BackendResult<Option<String>> {
        Ok(self.tables.lock().get(table).and_then(|t| t.split.clone()))
    }

    async fn query(&self, query: &RowQuery) -> BackendResult<Rows> {
        let gate = self.query_gate.lock().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().push(query.clone());
        if let Some(e) = self.query_failures.lock().pop_front() {
            return Err(e);
        }

        let tables = self.tables.lock();
        let table = tables.get(&query.table).ok_or_else(|| BackendError::Reported {
            code: 100_146,
            message: format!("table {} doesn't exist", query.table),
            raiser: "mock".to_string(),
        })?;

        Ok(query
            .keys
            .iter()
            .filter_map(|key| table.rows.get(&key.to_text()).cloned())
            .collect())
    }

    async fn write(&self, write: &RowWrite) -> BackendResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.writes.lock().push(write.clone());
        if let Some(e) = self.write_failures.lock().pop_front() {
            return Err(e);
        }

        if let Some(table) = self.tables.lock().get_mut(&write.table) {
            apply_write(table, write);
        }
        Ok(())
    }
}
