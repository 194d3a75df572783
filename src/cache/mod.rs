//! Read-through, write-through table cache.

pub mod schema;
pub mod statement;
pub mod storage;

use crate::backend::{call_with_retry, RowQuery, RowWrite, StorageBackend};
use crate::cluster::{ClusterNotifier, PeerConnector};
use crate::config::TableCacheConfig;
use crate::error::{Error, RemoteError, Result};
use crate::metrics::FetchMetrics;
use crate::network::{
    CacheReply, CacheRequest, ClientConfig, Message, MessageHandler, NetworkServer, TcpConnector,
};
use crate::types::{CacheKey, CacheStatus, HintKey, ResponseKeyShape, RowMap};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use schema::{SchemaLoader, SchemaMap, TableSchema};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use storage::{CachedRow, RowCache};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Schemas and rows, guarded together so that a table invalidation removes
/// both atomically.
#[derive(Debug)]
struct CacheState {
    schemas: SchemaMap,
    rows: RowCache,
}

/// A requested key in its caller form, its normalized form and its hint.
struct RequestedKey {
    caller: HintKey,
    normalized: HintKey,
    hint: i64,
}

/// The table cache of one node.
///
/// Reads are served from the row cache and fall through to the storage
/// backend for missing rows. Writes go to the backend, then evict the row
/// locally and queue its invalidation for every peer.
pub struct TableCache {
    state: RwLock<CacheState>,

    backend: Arc<dyn StorageBackend>,

    loader: SchemaLoader,

    notifier: ClusterNotifier,

    metrics: FetchMetrics,

    config: TableCacheConfig,

    /// Network server shutdown signal sender, once serving.
    server_shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl TableCache {
    /// Create a cache whose peers are reached over TCP, and start the
    /// cluster notifier.
    pub async fn new(config: TableCacheConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let connector = Arc::new(TcpConnector::new(ClientConfig::from(&config.cluster)));
        Self::with_connector(config, backend, connector).await
    }

    /// Create a cache with a custom peer connector and start the cluster
    /// notifier.
    pub async fn with_connector(
        config: TableCacheConfig,
        backend: Arc<dyn StorageBackend>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self> {
        let capacity = config.effective_capacity();
        info!(
            addr = %config.listen_addr,
            capacity,
            "Starting table cache"
        );

        let notifier = ClusterNotifier::new(
            config.listen_addr.port(),
            config.cluster.clone(),
            connector,
        );
        notifier.start();

        Ok(Self {
            state: RwLock::new(CacheState {
                schemas: SchemaMap::default(),
                rows: RowCache::new(capacity),
            }),
            loader: SchemaLoader::new(backend.clone(), config.backend_timeout),
            backend,
            notifier,
            metrics: FetchMetrics::new(),
            config,
            server_shutdown_tx: Mutex::new(None),
        })
    }

    /// Start answering requests on the configured listen address. Returns
    /// the bound address.
    pub async fn serve(self: &Arc<Self>) -> Result<SocketAddr> {
        let handler = CacheRequestHandler::new(self.clone());
        let (server, shutdown_tx) =
            NetworkServer::bind(self.config.listen_addr, Arc::new(handler)).await?;
        let addr = server.local_addr();

        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "Network server error");
            }
        });

        *self.server_shutdown_tx.lock() = Some(shutdown_tx);
        Ok(addr)
    }

    /// Fetch rows by key.
    ///
    /// `fields` selects the returned columns, in order; an empty list selects
    /// every column. Keys missing from the result were not found.
    pub async fn fetch(
        &self,
        table: &str,
        keys: &[HintKey],
        fields: &[String],
        shape: ResponseKeyShape,
    ) -> Result<RowMap> {
        let schema = self.resolve_schema(table).await?;
        let projection = schema.field_indexes(fields)?;
        if keys.is_empty() {
            return Err(Error::InvalidRequest(format!("no key given for table {}", table)));
        }

        let requested = keys
            .iter()
            .map(|key| {
                let normalized = schema.normalize_key(key)?;
                Ok(RequestedKey {
                    caller: key.clone(),
                    hint: schema.hint_of(&normalized),
                    normalized,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut result = RowMap::new();
        let mut lacked = Vec::new();
        {
            // Promotion reorders the cache, so lookups take the write lock.
            let mut state = self.state.write();
            for key in &requested {
                match state.rows.lookup(&CacheKey::new(table, key.hint)) {
                    Some(row) => {
                        result.insert(response_key(&key.caller, shape), row.project(&projection));
                    }
                    None => lacked.push(key),
                }
            }
        }

        self.metrics
            .record_fetch(requested.len(), requested.len() - lacked.len());

        if lacked.is_empty() {
            return Ok(result);
        }

        let mut query_keys: Vec<HintKey> = lacked.iter().map(|k| k.normalized.clone()).collect();
        query_keys.sort();
        query_keys.dedup();

        let query = RowQuery {
            table: table.to_string(),
            fields: schema.fields().iter().map(|f| f.name.clone()).collect(),
            statement: statement::select_rows(&schema, &query_keys),
            keys: query_keys,
        };

        debug!(table, lacked = query.keys.len(), "Querying backend for missing rows");

        let rows = call_with_retry("query", table, self.config.backend_timeout, || {
            self.backend.query(&query)
        })
        .await
        .map_err(Error::from)?;

        let mut fetched = HashMap::with_capacity(rows.len());
        for values in rows {
            if values.len() != schema.fields().len() {
                warn!(
                    table,
                    columns = values.len(),
                    expected = schema.fields().len(),
                    "Backend row does not match table schema"
                );
                continue;
            }
            let Some(key) = values
                .get(schema.key_index())
                .and_then(|v| schema.key_of_value(v))
            else {
                warn!(table, "Backend row has an unusable key value");
                continue;
            };
            fetched.insert(schema.hint_of(&key), CachedRow::new(values));
        }

        for key in lacked {
            if let Some(row) = fetched.get(&key.hint) {
                result.insert(response_key(&key.caller, shape), row.project(&projection));
            }
        }

        self.add_rows(&schema, fetched);
        Ok(result)
    }

    /// Insert or update one row.
    ///
    /// The key column is always taken from `key`. Whatever the outcome, the
    /// row is evicted locally and on every peer.
    pub async fn modify(
        &self,
        table: &str,
        key: &HintKey,
        values: &BTreeMap<String, String>,
    ) -> Result<()> {
        let schema = self.resolve_schema(table).await?;

        if values.is_empty() {
            return Err(Error::InvalidRequest(format!("no value to set in table {}", table)));
        }
        if values.contains_key(schema.key_column()) {
            return Err(Error::InvalidRequest(format!(
                "key column {} of table {} cannot be set",
                schema.key_column(),
                table
            )));
        }
        if let Some(unknown) = values.keys().find(|name| schema.field_index(name).is_none()) {
            return Err(Error::InvalidRequest(format!(
                "unknown field {} in table {}",
                unknown, table
            )));
        }

        let key = schema.normalize_key(key)?;
        let write = RowWrite {
            table: table.to_string(),
            statement: statement::upsert_row(&schema, &key, values),
            key,
        };
        self.write_through(&schema, write).await
    }

    /// Delete one row. Whatever the outcome, the row is evicted locally and
    /// on every peer.
    pub async fn delete(&self, table: &str, key: &HintKey) -> Result<()> {
        let schema = self.resolve_schema(table).await?;
        let key = schema.normalize_key(key)?;
        let write = RowWrite {
            table: table.to_string(),
            statement: statement::delete_row(&schema, &key),
            key,
        };
        self.write_through(&schema, write).await
    }

    /// Drop cached rows of a table by hint id. Returns the number of rows
    /// removed. Not broadcast: this is how peer row notifications land.
    pub fn invalidate(&self, table: &str, hints: &[i64]) -> usize {
        let mut state = self.state.write();
        let removed = hints
            .iter()
            .filter(|hint| state.rows.remove_key(&CacheKey::new(table, **hint)).is_some())
            .count();
        debug!(table, hints = hints.len(), removed, "Invalidated rows");
        removed
    }

    /// Drop every cached row of a table and its schema. Unless `internal`,
    /// the invalidation is broadcast to every peer.
    pub fn invalidate_table(&self, table: &str, internal: bool) -> usize {
        let removed = {
            let mut state = self.state.write();
            state.schemas.remove(table);
            state.rows.remove_table(table)
        };

        if !internal {
            self.notifier.invalidate_table(table);
        }
        info!(table, removed, internal, "Invalidated table");
        removed
    }

    /// Reload the peer roster. Returns the number of peers.
    pub fn refresh_cluster(&self) -> usize {
        self.notifier.refresh()
    }

    /// Fetch statistics and cache occupancy.
    pub fn status(&self) -> CacheStatus {
        let state = self.state.read();
        CacheStatus {
            fetch_count: self.metrics.fetch_total.get(),
            part_hit_count: self.metrics.part_hits.get(),
            full_hit_count: self.metrics.full_hits.get(),
            item_fetch_count: self.metrics.items_requested.get(),
            item_hit_count: self.metrics.items_hit.get(),
            total_cached_items: state.rows.count() as u64,
            cached_items_per_table: state.rows.table_counts(),
        }
    }

    /// The cluster notifier of this node.
    pub fn notifier(&self) -> &ClusterNotifier {
        &self.notifier
    }

    pub fn config(&self) -> &TableCacheConfig {
        &self.config
    }

    /// Whether a row is currently cached.
    pub fn contains(&self, table: &str, hint: i64) -> bool {
        self.state
            .read()
            .rows
            .find(&CacheKey::new(table, hint))
            .is_some()
    }

    /// Whether a table's schema is currently cached.
    pub fn has_schema(&self, table: &str) -> bool {
        self.state.read().schemas.get(table).is_some()
    }

    /// Serve one request.
    pub async fn handle(&self, request: CacheRequest) -> Result<CacheReply> {
        match request {
            CacheRequest::Fetch {
                table,
                key,
                keys,
                fields,
                shape,
            } => {
                let keys = CacheRequest::fetch_keys(key, keys);
                self.fetch(&table, &keys, &fields, shape)
                    .await
                    .map(CacheReply::Rows)
            }
            CacheRequest::Modify { table, key, values } => {
                self.modify(&table, &key, &values).await.map(|_| CacheReply::Empty)
            }
            CacheRequest::Delete { table, key } => {
                self.delete(&table, &key).await.map(|_| CacheReply::Empty)
            }
            CacheRequest::Invalidate { table, hints } => {
                self.invalidate(&table, &hints);
                Ok(CacheReply::Empty)
            }
            CacheRequest::InvalidateTable { table, internal } => {
                self.invalidate_table(&table, internal);
                Ok(CacheReply::Empty)
            }
            CacheRequest::RefreshCluster => {
                self.refresh_cluster();
                Ok(CacheReply::Empty)
            }
            CacheRequest::Status => Ok(CacheReply::Status(self.status())),
        }
    }

    /// Stop the network server and the cluster notifier.
    pub async fn shutdown(&self) {
        info!("Shutting down table cache");

        let server_shutdown_tx = self.server_shutdown_tx.lock().take();
        if let Some(tx) = server_shutdown_tx {
            let _ = tx.send(()).await;
        }

        self.notifier.shutdown().await;
    }

    async fn resolve_schema(&self, table: &str) -> Result<Arc<TableSchema>> {
        let cached = self.state.read().schemas.get(table);
        if let Some(schema) = cached {
            return Ok(schema);
        }

        let schema = self.loader.load(table).await?;
        Ok(self.state.write().schemas.publish(schema))
    }

    /// Cache rows fetched against `schema`, unless the table was invalidated
    /// while they were in flight.
    fn add_rows(&self, schema: &Arc<TableSchema>, rows: HashMap<i64, CachedRow>) {
        let mut state = self.state.write();
        if !state.schemas.is_current(schema) {
            debug!(
                table = schema.table(),
                rows = rows.len(),
                "Table invalidated during fetch, discarding fetched rows"
            );
            return;
        }

        for (hint, row) in rows {
            state.rows.insert(CacheKey::new(schema.table(), hint), row);
        }
    }

    async fn write_through(&self, schema: &TableSchema, write: RowWrite) -> Result<()> {
        let _evict = EvictOnDrop {
            cache: self,
            table: schema.table(),
            hint: schema.hint_of(&write.key),
        };

        call_with_retry("write", &write.table, self.config.backend_timeout, || {
            self.backend.write(&write)
        })
        .await
        .map_err(Error::from)
    }
}

/// Evicts a written row locally and queues its cluster invalidation when
/// dropped, so the cleanup runs once on success, failure or cancellation.
struct EvictOnDrop<'a> {
    cache: &'a TableCache,
    table: &'a str,
    hint: i64,
}

impl Drop for EvictOnDrop<'_> {
    fn drop(&mut self) {
        self.cache
            .state
            .write()
            .rows
            .remove_key(&CacheKey::new(self.table, self.hint));
        self.cache.notifier.invalidate(self.table, self.hint);
    }
}

fn response_key(caller: &HintKey, shape: ResponseKeyShape) -> HintKey {
    match (caller, shape) {
        (HintKey::Int(v), ResponseKeyShape::String) => HintKey::Str(v.to_string()),
        _ => caller.clone(),
    }
}

impl std::fmt::Debug for TableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCache")
            .field("listen_addr", &self.config.listen_addr)
            .field("cached_rows", &self.state.read().rows.count())
            .finish()
    }
}

/// Message handler for a [`TableCache`] node.
pub struct CacheRequestHandler {
    cache: Arc<TableCache>,
}

impl CacheRequestHandler {
    pub fn new(cache: Arc<TableCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl MessageHandler for CacheRequestHandler {
    async fn handle(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::Request { request_id, request } => {
                let operation = request.name();
                let result = self
                    .cache
                    .handle(request)
                    .await
                    .map_err(|e| {
                        debug!(request_id, operation, error = %e, "Request failed");
                        RemoteError::from(&e)
                    });
                Some(Message::Response { request_id, result })
            }
            Message::Response { request_id, .. } => {
                warn!(request_id, "Unexpected response message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBackend, RecordingConnector};
    use std::time::Duration;

    async fn cache_with(backend: Arc<MockBackend>) -> TableCache {
        let config = TableCacheConfig::new("127.0.0.1:0".parse().unwrap())
            .with_backend_timeout(Duration::from_secs(1));
        TableCache::with_connector(config, backend, Arc::new(RecordingConnector::new()))
            .await
            .unwrap()
    }

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_fetch_miss_then_hit() {
        let backend = Arc::new(MockBackend::users());
        let cache = cache_with(backend.clone()).await;

        let rows = cache
            .fetch("users", &[HintKey::Int(1)], &fields(&["name"]), ResponseKeyShape::Native)
            .await
            .unwrap();
        assert_eq!(rows.get(&HintKey::Int(1)), Some(&vec!["alice".to_string()]));
        assert_eq!(backend.query_count(), 1);

        // Cached row holds every column, so any projection is a hit.
        let rows = cache
            .fetch("users", &[HintKey::Int(1)], &fields(&["score", "name"]), ResponseKeyShape::Native)
            .await
            .unwrap();
        assert_eq!(
            rows.get(&HintKey::Int(1)),
            Some(&vec!["10".to_string(), "alice".to_string()])
        );
        assert_eq!(backend.query_count(), 1);

        let status = cache.status();
        assert_eq!(status.fetch_count, 2);
        assert_eq!(status.full_hit_count, 1);
        assert_eq!(status.part_hit_count, 0);
        assert_eq!(status.item_hit_count, 1);
        assert_eq!(status.total_cached_items, 1);
    }

    #[tokio::test]
    async fn test_partial_hit_queries_only_missing_keys() {
        let backend = Arc::new(MockBackend::users());
        let cache = cache_with(backend.clone()).await;

        cache
            .fetch("users", &[HintKey::Int(1)], &fields(&["name"]), ResponseKeyShape::Native)
            .await
            .unwrap();

        let rows = cache
            .fetch(
                "users",
                &[HintKey::Int(1), HintKey::Int(2)],
                &fields(&["name"]),
                ResponseKeyShape::Native,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let status = cache.status();
        assert_eq!(status.part_hit_count, 1);
        assert_eq!(status.item_fetch_count, 3);
        assert_eq!(status.item_hit_count, 1);

        let queries = backend.queries();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1].keys, vec![HintKey::Int(2)]);
    }

    #[tokio::test]
    async fn test_fetch_key_shapes() {
        let backend = Arc::new(MockBackend::users());
        let cache = cache_with(backend).await;

        let rows = cache
            .fetch("users", &[HintKey::Int(2)], &[], ResponseKeyShape::String)
            .await
            .unwrap();
        assert_eq!(
            rows.get(&HintKey::from("2")),
            Some(&vec!["2".to_string(), "bob".to_string(), "20".to_string()])
        );

        // String form of an integer key is accepted and kept in the response.
        let rows = cache
            .fetch("users", &[HintKey::from("2")], &fields(&["name"]), ResponseKeyShape::Native)
            .await
            .unwrap();
        assert_eq!(rows.get(&HintKey::from("2")), Some(&vec!["bob".to_string()]));
    }

    #[tokio::test]
    async fn test_fetch_rejects_bad_requests() {
        let backend = Arc::new(MockBackend::users());
        let cache = cache_with(backend).await;

        let result = cache
            .fetch("users", &[HintKey::Int(1)], &fields(&["password"]), ResponseKeyShape::Native)
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));

        let result = cache
            .fetch("users", &[HintKey::from("abc")], &[], ResponseKeyShape::Native)
            .await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));

        let result = cache.fetch("users", &[], &[], ResponseKeyShape::Native).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));

        let result = cache
            .fetch("nope", &[HintKey::Int(1)], &[], ResponseKeyShape::Native)
            .await;
        assert!(matches!(result, Err(Error::TableNotFound(_))));
    }

    #[tokio::test]
    async fn test_modify_validation() {
        let backend = Arc::new(MockBackend::users());
        let cache = cache_with(backend.clone()).await;

        let mut values = BTreeMap::new();
        values.insert("uid".to_string(), "9".to_string());
        assert!(matches!(
            cache.modify("users", &HintKey::Int(1), &values).await,
            Err(Error::InvalidRequest(_))
        ));

        let mut values = BTreeMap::new();
        values.insert("name = name; --".to_string(), "x".to_string());
        assert!(matches!(
            cache.modify("users", &HintKey::Int(1), &values).await,
            Err(Error::InvalidRequest(_))
        ));

        assert!(matches!(
            cache.modify("users", &HintKey::Int(1), &BTreeMap::new()).await,
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(backend.write_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_and_table_invalidation() {
        let backend = Arc::new(MockBackend::users());
        let cache = cache_with(backend.clone()).await;

        cache
            .fetch("users", &[HintKey::Int(1), HintKey::Int(2)], &[], ResponseKeyShape::Native)
            .await
            .unwrap();
        assert!(cache.contains("users", 1));

        assert_eq!(cache.invalidate("users", &[1, 42]), 1);
        assert!(!cache.contains("users", 1));
        assert!(cache.contains("users", 2));
        assert_eq!(cache.status().cached_items_per_table.get("users"), Some(&1));

        assert_eq!(cache.invalidate_table("users", true), 1);
        assert!(!cache.has_schema("users"));
        assert_eq!(cache.status().total_cached_items, 0);

        cache
            .fetch("users", &[HintKey::Int(1)], &[], ResponseKeyShape::Native)
            .await
            .unwrap();
        assert_eq!(backend.describe_count(), 2);
    }

    #[tokio::test]
    async fn test_handle_dispatches_requests() {
        let backend = Arc::new(MockBackend::users());
        let cache = cache_with(backend).await;

        let reply = cache
            .handle(CacheRequest::Fetch {
                table: "users".into(),
                key: Some(HintKey::Int(1)),
                keys: Vec::new(),
                fields: fields(&["name"]),
                shape: ResponseKeyShape::Native,
            })
            .await
            .unwrap();
        match reply {
            CacheReply::Rows(rows) => assert_eq!(rows.len(), 1),
            other => panic!("unexpected reply: {:?}", other),
        }

        match cache.handle(CacheRequest::Status).await.unwrap() {
            CacheReply::Status(status) => assert_eq!(status.fetch_count, 1),
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}
