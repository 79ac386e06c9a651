//! Milvus-backed `DataStore`
//!
//! Maps document chunks onto the collection layout of the tenant's
//! collection, provisions collections and indexes on first use, and
//! implements upsert, concurrent query and the three deletion modes.
//!
//! Author: hephaex@gmail.com

use crate::backend::{BackendHandle, ColumnBatch, Connector, RawHit, SearchRequest};
use crate::filter::{translate_filter, Expr, Literal};
use crate::index::{default_search_params, ensure_vector_index, fallback_search_params};
use crate::milvus::MilvusConnector;
use crate::pool::ConnectionPool;
use crate::schema::{FieldDefault, FieldValue, SchemaRegistry, SchemaVersion, EMBEDDING_FIELD};
use crate::tenant::{ConfigTenantResolver, TenantResolver};
use async_trait::async_trait;
use chunkstore_core::{
    ChunkMetadata, ChunkWithScore, ChunksByDocument, ConnectionInfo, ConsistencyLevel, DataStore,
    DocumentChunk, IndexParams, MetadataFilter, QueryResult, QueryWithEmbedding, Result,
    SearchParams, Source, StoreConfig, StoreError, Timestamp,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Maximum rows per insert call
pub const UPSERT_BATCH_SIZE: usize = 100;

/// Maximum primary keys per delete call
pub const DELETE_BATCH_SIZE: usize = 100;

/// What the adapter knows about an open collection
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionState {
    pub version: SchemaVersion,
    pub search_params: SearchParams,
}

/// Vector store adapter over Milvus-style backends
pub struct MilvusDataStore {
    pool: ConnectionPool,
    tenants: Arc<dyn TenantResolver>,
    registry: SchemaRegistry,
    index_params: Option<IndexParams>,
    search_params: Option<SearchParams>,
    consistency_level: ConsistencyLevel,
    request_timeout: Option<Duration>,
    collections: RwLock<HashMap<String, CollectionState>>,
    /// Serializes provisioning per collection
    guards: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MilvusDataStore {
    /// Create an adapter using `connector` for backend connections
    pub fn new(config: &StoreConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            pool: ConnectionPool::new(connector),
            tenants: Arc::new(ConfigTenantResolver::from_config(config)),
            registry: SchemaRegistry::new(config.embedding.dimension()),
            index_params: config.milvus.index_params.clone(),
            search_params: config.milvus.search_params.clone(),
            consistency_level: config.milvus.consistency_level,
            request_timeout: config.milvus.request_timeout_secs.map(Duration::from_secs),
            collections: RwLock::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
        }
    }

    /// Create an adapter talking to Milvus over its RESTful API
    pub fn from_config(config: &StoreConfig) -> Self {
        let mut connector = MilvusConnector::new();
        if let Some(secs) = config.milvus.request_timeout_secs {
            connector = connector.with_timeout(Duration::from_secs(secs));
        }
        Self::new(config, Arc::new(connector))
    }

    /// Replace the tenant resolver
    pub fn with_tenant_resolver(mut self, tenants: Arc<dyn TenantResolver>) -> Self {
        self.tenants = tenants;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Close all backend connections and forget cached collection state
    pub async fn close(&self) {
        self.collections.write().await.clear();
        self.pool.close_all().await;
    }

    // ------------------------------------------------------------------------
    // Collection management
    // ------------------------------------------------------------------------

    fn state_key(info: &ConnectionInfo) -> String {
        format!("{}/{}/{}", info.alias, info.db_name, info.collection_name)
    }

    async fn cached_state(&self, info: &ConnectionInfo) -> Option<CollectionState> {
        self.collections
            .read()
            .await
            .get(&Self::state_key(info))
            .cloned()
    }

    async fn remember_state(&self, info: &ConnectionInfo, state: &CollectionState) {
        self.collections
            .write()
            .await
            .insert(Self::state_key(info), state.clone());
    }

    async fn forget_state(&self, info: &ConnectionInfo) {
        self.collections
            .write()
            .await
            .remove(&Self::state_key(info));
    }

    /// Provisioning guard of one collection. The map lock is only held to
    /// look the guard up, never across backend calls.
    async fn collection_guard(&self, info: &ConnectionInfo) -> Arc<Mutex<()>> {
        self.guards
            .lock()
            .await
            .entry(Self::state_key(info))
            .or_default()
            .clone()
    }

    fn search_params_for(&self, index: Option<&IndexParams>) -> SearchParams {
        if let Some(params) = &self.search_params {
            return params.clone();
        }
        index.map_or_else(fallback_search_params, default_search_params)
    }

    /// Index the collection if needed and derive its search parameters
    async fn prepare_index(&self, backend: &BackendHandle, collection: &str) -> SearchParams {
        match ensure_vector_index(backend.as_ref(), collection, self.index_params.as_ref()).await
        {
            Ok(index) => {
                let params = self.search_params_for(Some(&index));
                info!(collection = %collection, search_params = ?params, "Milvus search parameters");
                params
            }
            Err(e) => {
                error!(collection = %collection, error = %e, "Failed to create index");
                self.search_params_for(None)
            }
        }
    }

    /// Open an existing collection, detecting its schema version once
    async fn open_collection(
        &self,
        backend: &BackendHandle,
        info: &ConnectionInfo,
    ) -> Result<CollectionState> {
        if let Some(state) = self.cached_state(info).await {
            return Ok(state);
        }

        let guard = self.collection_guard(info).await;
        let _lock = guard.lock().await;
        if let Some(state) = self.cached_state(info).await {
            return Ok(state);
        }
        self.describe_existing(backend, info).await
    }

    /// Detect the layout of an existing collection and index it.
    /// Callers hold the collection guard.
    async fn describe_existing(
        &self,
        backend: &BackendHandle,
        info: &ConnectionInfo,
    ) -> Result<CollectionState> {
        let description = backend.describe_collection(&info.collection_name).await?;
        let version = self.registry.detect_version(&description);
        info!(
            collection = %info.collection_name,
            schema = %version,
            "Milvus collection already exists"
        );

        let search_params = self.prepare_index(backend, &info.collection_name).await;
        let state = CollectionState {
            version,
            search_params,
        };
        self.remember_state(info, &state).await;
        Ok(state)
    }

    /// Create the collection with the current layout and index it.
    /// Callers hold the collection guard.
    async fn create_new_collection(
        &self,
        backend: &BackendHandle,
        info: &ConnectionInfo,
    ) -> Result<CollectionState> {
        let collection = &info.collection_name;
        let created = backend
            .create_collection(
                collection,
                &self.registry.collection_schema(SchemaVersion::V2),
                self.consistency_level,
            )
            .await;

        if let Err(e) = created {
            // another client may have created it since our check
            if backend.has_collection(collection).await.unwrap_or(false) {
                warn!(
                    collection = %collection,
                    error = %e,
                    "Collection created concurrently, opening it"
                );
                return self.describe_existing(backend, info).await;
            }
            return Err(e);
        }
        info!(
            collection = %collection,
            schema = %SchemaVersion::V2,
            consistency_level = %self.consistency_level,
            "Created Milvus collection"
        );

        let search_params = self.prepare_index(backend, collection).await;
        let state = CollectionState {
            version: SchemaVersion::V2,
            search_params,
        };
        self.remember_state(info, &state).await;
        Ok(state)
    }

    /// Create, recreate or open the collection. Callers hold the
    /// collection guard.
    async fn provision(
        &self,
        backend: &BackendHandle,
        info: &ConnectionInfo,
        create_new: bool,
    ) -> Result<CollectionState> {
        let collection = &info.collection_name;
        let exists = backend.has_collection(collection).await?;

        if exists && create_new {
            info!(collection = %collection, "Dropping existing collection");
            self.forget_state(info).await;
            backend.drop_collection(collection).await?;
            return self.create_new_collection(backend, info).await;
        }

        if exists {
            self.describe_existing(backend, info).await
        } else {
            self.forget_state(info).await;
            self.create_new_collection(backend, info).await
        }
    }

    async fn ensure_with(
        &self,
        backend: &BackendHandle,
        info: &ConnectionInfo,
        create_new: bool,
    ) -> Result<CollectionState> {
        let guard = self.collection_guard(info).await;
        let _lock = guard.lock().await;
        if !create_new {
            if let Some(state) = self.cached_state(info).await {
                return Ok(state);
            }
        }
        self.provision(backend, info, create_new).await
    }

    /// Make sure the tenant's collection exists, optionally recreating it
    ///
    /// Returns the schema version of the collection.
    pub async fn ensure_collection(
        &self,
        tenant_id: &str,
        create_new: bool,
    ) -> Result<SchemaVersion> {
        let info = self.tenants.resolve(tenant_id)?;
        let backend = self.pool.open(&info).await?;
        if !create_new {
            if let Some(state) = self.cached_state(&info).await {
                return Ok(state.version);
            }
        }
        let state = self.ensure_with(&backend, &info, create_new).await?;
        Ok(state.version)
    }

    /// Schema version of the tenant's existing collection
    pub async fn schema_version(&self, tenant_id: &str) -> Result<SchemaVersion> {
        let info = self.tenants.resolve(tenant_id)?;
        let backend = self.pool.open(&info).await?;
        Ok(self.open_collection(&backend, &info).await?.version)
    }

    // ------------------------------------------------------------------------
    // Write pipeline
    // ------------------------------------------------------------------------

    /// Convert a chunk of `document_id` into insert values ordered like the
    /// layout's insert fields. `None` when a required value is missing or a
    /// value does not fit its field.
    fn chunk_values(
        &self,
        version: SchemaVersion,
        document_id: &str,
        chunk: &DocumentChunk,
    ) -> Option<Vec<FieldValue>> {
        let chunk_id = chunk.id.as_deref().unwrap_or_default();
        let metadata = &chunk.metadata;

        let created_at = match &metadata.created_at {
            Some(ts) => match ts.to_unix_seconds() {
                Ok(secs) => secs,
                Err(e) => {
                    warn!(chunk_id = %chunk_id, error = %e, "Chunk has invalid created_at, skipping");
                    return None;
                }
            },
            None => chrono::Utc::now().timestamp(),
        };

        let text = |value: &Option<String>| {
            value
                .as_ref()
                .filter(|s| !s.is_empty())
                .map(|s| FieldValue::VarChar(s.clone()))
        };

        let mut record: HashMap<&'static str, FieldValue> = HashMap::new();
        let mut put = |name: &'static str, value: Option<FieldValue>| {
            if let Some(value) = value {
                record.insert(name, value);
            }
        };
        put("id", text(&chunk.id));
        put("text", text(&Some(chunk.text.clone())));
        put(
            EMBEDDING_FIELD,
            chunk
                .embedding
                .as_ref()
                .filter(|v| !v.is_empty())
                .map(|v| FieldValue::FloatVector(v.clone())),
        );
        put(
            "document_id",
            text(&metadata.document_id).or_else(|| text(&Some(document_id.to_string()))),
        );
        put("source_id", text(&metadata.source_id));
        put(
            "source",
            metadata
                .source
                .map(|s| FieldValue::VarChar(s.as_str().to_string())),
        );
        put("url", text(&metadata.url));
        put("created_at", Some(FieldValue::Int64(created_at)));
        put("author", text(&metadata.author));
        put(
            "json_data",
            metadata
                .json_data
                .as_ref()
                .map(|map| FieldValue::Json(Value::Object(map.clone()))),
        );

        let mut values = Vec::new();
        for field in self.registry.insert_fields(version) {
            let value = match record.remove(field.name()) {
                Some(value) => value,
                None => match &field.default {
                    FieldDefault::Value(default) => default.clone(),
                    FieldDefault::Required => {
                        warn!(
                            chunk_id = %chunk_id,
                            field = %field.name(),
                            "Chunk missing required field, skipping"
                        );
                        return None;
                    }
                },
            };
            if !field.accepts(&value) {
                warn!(
                    chunk_id = %chunk_id,
                    field = %field.name(),
                    "Chunk value does not fit field, skipping"
                );
                return None;
            }
            values.push(value);
        }
        Some(values)
    }

    async fn try_upsert(&self, chunks: &ChunksByDocument, tenant_id: &str) -> Result<()> {
        let info = self.tenants.resolve(tenant_id)?;
        let backend = self.pool.open(&info).await?;
        let version = match self.cached_state(&info).await {
            Some(state) => state.version,
            None => self.ensure_with(&backend, &info, false).await?.version,
        };

        let rows: Vec<Vec<FieldValue>> = chunks
            .iter()
            .flat_map(|(doc_id, doc_chunks)| doc_chunks.iter().map(move |c| (doc_id, c)))
            .filter_map(|(doc_id, chunk)| self.chunk_values(version, doc_id, chunk))
            .collect();
        let names: Vec<String> = self
            .registry
            .insert_fields(version)
            .map(|f| f.name().to_string())
            .collect();

        for rows in rows.chunks(UPSERT_BATCH_SIZE) {
            let batch = ColumnBatch::from_rows(&names, rows);
            info!(collection = %info.collection_name, size = batch.num_rows(), "Upserting batch");
            backend
                .insert(&info.collection_name, &batch)
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to insert batch records");
                    e
                })?;
            debug!("Upserted batch successfully");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------------

    fn hit_to_chunk(hit: RawHit) -> Result<ChunkWithScore> {
        let mut fields = hit.fields;
        let mut take_string = |name: &str| match fields.remove(name) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        };

        let id = take_string("id").unwrap_or_default();
        let text = take_string("text")
            .ok_or_else(|| StoreError::BackendError(format!("Hit {id} has no text")))?;
        let source = take_string("source").and_then(|s| s.parse::<Source>().ok());
        let document_id = take_string("document_id");
        let source_id = take_string("source_id");
        let url = take_string("url");
        let author = take_string("author");

        let created_at = fields
            .get("created_at")
            .and_then(Value::as_i64)
            .filter(|secs| *secs >= 0)
            .map(Timestamp::Epoch);
        let json_data = match fields.remove("json_data") {
            Some(Value::Object(map)) if !map.is_empty() => Some(map),
            _ => None,
        };

        Ok(ChunkWithScore {
            id,
            score: hit.score,
            text,
            metadata: ChunkMetadata {
                document_id,
                source,
                source_id,
                url,
                created_at,
                author,
                json_data,
            },
        })
    }

    async fn single_query(&self, query: &QueryWithEmbedding) -> Result<Vec<ChunkWithScore>> {
        let info = self.tenants.resolve(&query.source_id)?;
        let backend = self.pool.open(&info).await?;
        let state = self.open_collection(&backend, &info).await?;
        backend.load_collection(&info.collection_name).await?;

        let filter = match &query.filter {
            Some(filter) => translate_filter(filter)?,
            None => None,
        };

        let request = SearchRequest {
            vector: query.embedding.clone(),
            anns_field: EMBEDDING_FIELD.to_string(),
            limit: query.top_k,
            filter,
            output_fields: self.registry.output_fields(state.version),
            params: state.search_params,
        };

        backend
            .search(&info.collection_name, &request)
            .await?
            .into_iter()
            .map(Self::hit_to_chunk)
            .collect()
    }

    async fn isolated_query(&self, query: &QueryWithEmbedding) -> QueryResult {
        let outcome = match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.single_query(query))
                .await
                .unwrap_or(Err(StoreError::Timeout(timeout.as_secs()))),
            None => self.single_query(query).await,
        };

        match outcome {
            Ok(results) => QueryResult {
                query: query.query.clone(),
                results,
            },
            Err(e) => {
                error!(query = %query.query, tenant = %query.source_id, error = %e, "Failed to query");
                QueryResult::empty(query.query.clone())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------------

    /// Resolve `filter` to primary keys and delete them batch by batch
    async fn delete_matching(
        &self,
        backend: &BackendHandle,
        collection: &str,
        version: SchemaVersion,
        filter: &Expr,
    ) -> Result<u64> {
        let pk_name = self.registry.primary_key_name(version);
        let rows = backend
            .query(collection, filter, &[pk_name.to_string()])
            .await?;

        let keys: Vec<Literal> = rows
            .iter()
            .filter_map(|row| match (version, row.get(pk_name)?) {
                (SchemaVersion::V1, Value::Number(n)) => n.as_i64().map(Literal::Int),
                (SchemaVersion::V2, Value::String(s)) => Some(Literal::Str(s.clone())),
                (_, other) => {
                    warn!(key = %other, "Unexpected primary key value");
                    None
                }
            })
            .collect();

        info!(count = keys.len(), schema = %version, "Apply deletions");

        let mut deleted = 0;
        for batch in keys.chunks(DELETE_BATCH_SIZE) {
            let expr = Expr::is_in(pk_name, batch.to_vec());
            deleted += backend.delete(collection, &expr).await?;
        }
        Ok(deleted)
    }

    async fn reset_collection(&self, backend: &BackendHandle, info: &ConnectionInfo) {
        let collection = &info.collection_name;
        info!(collection = %collection, "Delete the entire collection and create new one");

        let guard = self.collection_guard(info).await;
        let _lock = guard.lock().await;
        self.forget_state(info).await;
        if let Err(e) = backend.release_collection(collection).await {
            warn!(collection = %collection, error = %e, "Failed to release collection");
        }
        if let Err(e) = backend.drop_collection(collection).await {
            warn!(collection = %collection, error = %e, "Failed to drop collection");
        }
        if let Err(e) = self.provision(backend, info, true).await {
            error!(collection = %collection, error = %e, "Failed to recreate collection");
        }
    }

    /// Delete records and report how many were removed
    ///
    /// Same modes as [`DataStore::delete`]. Failures inside a mode are logged
    /// and count as zero; only failing to reach the backend is an error.
    /// `delete_all` reports zero since the collection is dropped wholesale.
    pub async fn delete_records(
        &self,
        tenant_id: &str,
        ids: Option<&[String]>,
        filter: Option<&MetadataFilter>,
        delete_all: bool,
    ) -> Result<u64> {
        let info = self.tenants.resolve(tenant_id)?;
        let backend = self.pool.open(&info).await?;

        if delete_all {
            self.reset_collection(&backend, &info).await;
            return Ok(0);
        }

        let collection = &info.collection_name;
        let mut delete_count = 0;

        if let Some(ids) = ids.filter(|ids| !ids.is_empty()) {
            let by_ids = async {
                let state = self.open_collection(&backend, &info).await?;
                let filter = Expr::is_in(
                    "document_id",
                    ids.iter().map(|id| Literal::Str(id.clone())).collect(),
                );
                self.delete_matching(&backend, collection, state.version, &filter)
                    .await
            };
            match by_ids.await {
                Ok(count) => delete_count += count,
                Err(e) => error!(error = %e, "Failed to delete by ids"),
            }
        }

        if let Some(filter) = filter {
            let by_filter = async {
                let Some(expr) = translate_filter(filter)? else {
                    return Ok(0);
                };
                let state = self.open_collection(&backend, &info).await?;
                self.delete_matching(&backend, collection, state.version, &expr)
                    .await
            };
            match by_filter.await {
                Ok(count) => delete_count += count,
                Err(e) => error!(error = %e, "Failed to delete by filter"),
            }
        }

        info!(collection = %collection, count = delete_count, "Records deleted");
        Ok(delete_count)
    }
}

#[async_trait]
impl DataStore for MilvusDataStore {
    async fn upsert(&self, chunks: ChunksByDocument, tenant_id: &str) -> Vec<String> {
        match self.try_upsert(&chunks, tenant_id).await {
            Ok(()) => chunks.into_keys().collect(),
            Err(e) => {
                error!(tenant = %tenant_id, error = %e, "Failed to insert records");
                Vec::new()
            }
        }
    }

    async fn query(&self, queries: Vec<QueryWithEmbedding>) -> Vec<QueryResult> {
        futures::future::join_all(queries.iter().map(|q| self.isolated_query(q))).await
    }

    async fn delete(
        &self,
        tenant_id: &str,
        ids: Option<&[String]>,
        filter: Option<&MetadataFilter>,
        delete_all: bool,
    ) -> bool {
        match self.delete_records(tenant_id, ids, filter, delete_all).await {
            Ok(_) => true,
            Err(e) => {
                error!(tenant = %tenant_id, error = %e, "Failed to open collection for delete");
                false
            }
        }
    }
}
