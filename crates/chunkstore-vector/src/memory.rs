//! In-process backend
//!
//! Implements the backend operations over in-memory collections with exact
//! (brute force) search. Stands in for a Milvus deployment in the test
//! suites. Supports injecting index rejections and insert failures.

use crate::backend::{
    BackendHandle, ColumnBatch, Connector, IndexDescription, RawHit, Row, SearchRequest,
    VectorBackend,
};
use crate::filter::Expr;
use crate::schema::{CollectionDescription, FieldSchema};
use async_trait::async_trait;
use chunkstore_core::{ConnectionInfo, ConsistencyLevel, IndexParams, Result, StoreError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryCollection {
    fields: Vec<FieldSchema>,
    indexes: Vec<IndexDescription>,
    rows: Vec<Row>,
    next_pk: i64,
    loaded: bool,
}

impl MemoryCollection {
    fn metric(&self) -> Option<&str> {
        self.indexes.first().map(|i| i.params.metric_type.as_str())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<String, MemoryCollection>,
    insert_calls: usize,
    insert_batches: Vec<usize>,
    delete_batches: Vec<usize>,
}

/// In-memory collections with Milvus-like semantics
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    rejected_index_types: HashSet<String>,
    fail_insert_call: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject index creation for an index type
    pub fn reject_index_type(mut self, index_type: &str) -> Self {
        self.rejected_index_types.insert(index_type.to_uppercase());
        self
    }

    /// Fail the n-th insert call (1-based)
    pub fn fail_insert_call(mut self, n: usize) -> Self {
        self.fail_insert_call = Some(n);
        self
    }

    /// Row counts of accepted insert batches, in order
    pub fn insert_batches(&self) -> Vec<usize> {
        self.lock().insert_batches.clone()
    }

    /// Key counts of delete calls, in order
    pub fn delete_batches(&self) -> Vec<usize> {
        self.lock().delete_batches.clone()
    }

    /// Number of rows stored in a collection
    pub fn row_count(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, |c| c.rows.len())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn not_found(collection: &str) -> StoreError {
    StoreError::CollectionNotFound(collection.to_string())
}

fn collection_mut<'a>(
    state: &'a mut MemoryState,
    collection: &str,
) -> Result<&'a mut MemoryCollection> {
    state
        .collections
        .get_mut(collection)
        .ok_or_else(|| not_found(collection))
}

fn score(metric: &str, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match metric {
        "L2" => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        "COSINE" => {
            let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>().sqrt();
            let denom = norm(a) * norm(b);
            if denom == 0.0 {
                0.0
            } else {
                dot / denom
            }
        }
        _ => dot,
    }
}

fn vector_of(row: &Row, field: &str) -> Option<Vec<f32>> {
    row.get(field)?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

fn project(row: &Row, output_fields: &[String]) -> Row {
    output_fields
        .iter()
        .filter_map(|f| row.get(f).map(|v| (f.clone(), v.clone())))
        .collect()
}

#[async_trait]
impl VectorBackend for MemoryBackend {
    async fn has_collection(&self, collection: &str) -> Result<bool> {
        Ok(self.lock().collections.contains_key(collection))
    }

    async fn describe_collection(&self, collection: &str) -> Result<CollectionDescription> {
        let state = self.lock();
        let col = state
            .collections
            .get(collection)
            .ok_or_else(|| not_found(collection))?;
        Ok(CollectionDescription {
            name: collection.to_string(),
            fields: col.fields.clone(),
        })
    }

    async fn create_collection(
        &self,
        collection: &str,
        fields: &[FieldSchema],
        _consistency_level: ConsistencyLevel,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.collections.contains_key(collection) {
            return Err(StoreError::SchemaError(format!(
                "Collection {collection} already exists"
            )));
        }
        state.collections.insert(
            collection.to_string(),
            MemoryCollection {
                fields: fields.to_vec(),
                next_pk: 1,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.lock()
            .collections
            .remove(collection)
            .map(|_| ())
            .ok_or_else(|| not_found(collection))
    }

    async fn load_collection(&self, collection: &str) -> Result<()> {
        let mut state = self.lock();
        let col = collection_mut(&mut state, collection)?;
        if col.indexes.is_empty() {
            return Err(StoreError::BackendError(format!(
                "index not found for collection {collection}"
            )));
        }
        col.loaded = true;
        Ok(())
    }

    async fn release_collection(&self, collection: &str) -> Result<()> {
        let mut state = self.lock();
        collection_mut(&mut state, collection)?.loaded = false;
        Ok(())
    }

    async fn describe_indexes(&self, collection: &str) -> Result<Vec<IndexDescription>> {
        let mut state = self.lock();
        Ok(collection_mut(&mut state, collection)?.indexes.clone())
    }

    async fn create_index(
        &self,
        collection: &str,
        field: &str,
        params: &IndexParams,
    ) -> Result<()> {
        if self
            .rejected_index_types
            .contains(&params.index_type.to_uppercase())
        {
            return Err(StoreError::BackendError(format!(
                "invalid index type: {}",
                params.index_type
            )));
        }
        let mut state = self.lock();
        let col = collection_mut(&mut state, collection)?;
        if col.indexes.iter().any(|i| i.field_name == field) {
            return Err(StoreError::BackendError(format!(
                "index already exists on field {field}"
            )));
        }
        col.indexes.push(IndexDescription {
            field_name: field.to_string(),
            index_name: field.to_string(),
            params: params.clone(),
        });
        Ok(())
    }

    async fn insert(&self, collection: &str, batch: &ColumnBatch) -> Result<u64> {
        let mut state = self.lock();
        state.insert_calls += 1;
        if self.fail_insert_call == Some(state.insert_calls) {
            return Err(StoreError::BackendError("insert rejected".to_string()));
        }

        let col = collection_mut(&mut state, collection)?;
        let expected: Vec<&FieldSchema> = col.fields.iter().filter(|f| !f.auto_id).collect();
        let supplied: Vec<&str> = batch.columns().iter().map(|c| c.name.as_str()).collect();
        if expected.len() != supplied.len()
            || expected.iter().zip(&supplied).any(|(f, s)| f.name != *s)
        {
            return Err(StoreError::SchemaError(format!(
                "insert columns {supplied:?} do not match collection {collection}"
            )));
        }

        let auto_pk = col
            .fields
            .iter()
            .find(|f| f.auto_id)
            .map(|f| f.name.clone());
        let primary = col
            .fields
            .iter()
            .find(|f| f.is_primary && !f.auto_id)
            .map(|f| f.name.clone());

        let rows = batch.to_rows();
        let count = rows.len();
        for mut row in rows {
            if let Some(pk) = &auto_pk {
                row.insert(pk.clone(), Value::from(col.next_pk));
                col.next_pk += 1;
            }
            // primary keys are unique: a repeated key replaces the row
            if let Some(pk) = &primary {
                let key = row.get(pk).cloned();
                col.rows.retain(|r| r.get(pk) != key.as_ref());
            }
            col.rows.push(row);
        }

        state.insert_batches.push(count);
        Ok(count as u64)
    }

    async fn search(&self, collection: &str, request: &SearchRequest) -> Result<Vec<RawHit>> {
        let state = self.lock();
        let col = state
            .collections
            .get(collection)
            .ok_or_else(|| not_found(collection))?;
        if !col.loaded {
            return Err(StoreError::BackendError(format!(
                "collection {collection} not loaded"
            )));
        }

        let metric = col.metric().unwrap_or("IP").to_uppercase();
        let mut hits: Vec<RawHit> = col
            .rows
            .iter()
            .filter(|row| request.filter.as_ref().map_or(true, |f| f.matches(row)))
            .filter_map(|row| {
                let stored = vector_of(row, &request.anns_field)?;
                Some(RawHit {
                    score: score(&metric, &request.vector, &stored),
                    fields: project(row, &request.output_fields),
                })
            })
            .collect();

        if metric == "L2" {
            hits.sort_by(|a, b| a.score.total_cmp(&b.score));
        } else {
            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        }
        hits.truncate(request.limit);
        Ok(hits)
    }

    async fn query(
        &self,
        collection: &str,
        filter: &Expr,
        output_fields: &[String],
    ) -> Result<Vec<Row>> {
        let state = self.lock();
        let col = state
            .collections
            .get(collection)
            .ok_or_else(|| not_found(collection))?;
        Ok(col
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .map(|row| project(row, output_fields))
            .collect())
    }

    async fn delete(&self, collection: &str, filter: &Expr) -> Result<u64> {
        let mut state = self.lock();
        let col = collection_mut(&mut state, collection)?;
        let before = col.rows.len();
        col.rows.retain(|row| !filter.matches(row));
        let deleted = before - col.rows.len();

        let batch = filter.literal_count().unwrap_or(deleted);
        state.delete_batches.push(batch);
        Ok(deleted as u64)
    }
}

/// Hands out connections to a shared `MemoryBackend`
pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
    unreachable: HashSet<String>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            unreachable: HashSet::new(),
            connects: AtomicUsize::new(0),
        }
    }

    /// Refuse connections to a host
    pub fn with_unreachable_host(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }

    /// Number of connections established
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, info: &ConnectionInfo) -> Result<BackendHandle> {
        // let concurrent openers interleave with the handshake
        tokio::task::yield_now().await;

        if self.unreachable.contains(&info.host) {
            return Err(StoreError::ConnectionError(format!(
                "{}:{} unreachable",
                info.host, info.port
            )));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.backend.clone())
    }
}
