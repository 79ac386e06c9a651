//! Vector index provisioning and search parameter defaults

use crate::backend::VectorBackend;
use crate::schema::EMBEDDING_FIELD;
use chunkstore_core::{IndexParams, Result, SearchParams, StoreError};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

/// Metric used by the built-in index choices
pub const DEFAULT_METRIC: &str = "IP";

/// HNSW index with fixed construction parameters
pub fn hnsw_index_params() -> IndexParams {
    IndexParams {
        index_type: "HNSW".to_string(),
        metric_type: DEFAULT_METRIC.to_string(),
        params: params(json!({"M": 8, "efConstruction": 64})),
    }
}

/// Index type picked by the backend itself
pub fn auto_index_params() -> IndexParams {
    IndexParams {
        index_type: "AUTOINDEX".to_string(),
        metric_type: DEFAULT_METRIC.to_string(),
        params: Map::new(),
    }
}

/// Search parameters used when no index information is available
pub fn fallback_search_params() -> SearchParams {
    SearchParams {
        metric_type: DEFAULT_METRIC.to_string(),
        params: params(json!({"ef": 10})),
    }
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Default search parameters for an index, keeping its metric
pub fn default_search_params(index: &IndexParams) -> SearchParams {
    let tuning = match index.index_type.to_uppercase().as_str() {
        "IVF_FLAT" | "IVF_SQ8" | "IVF_PQ" => json!({"nprobe": 10}),
        "HNSW" | "RHNSW_FLAT" | "RHNSW_SQ" | "RHNSW_PQ" => json!({"ef": 10}),
        "IVF_HNSW" => json!({"nprobe": 10, "ef": 10}),
        "ANNOY" => json!({"search_k": 10}),
        "AUTOINDEX" => json!({}),
        other => {
            warn!(index_type = %other, "Unknown index type, using empty search parameters");
            json!({})
        }
    };

    SearchParams {
        metric_type: index.metric_type.clone(),
        params: params(tuning),
    }
}

/// Make sure the vector field of `collection` is indexed
///
/// An existing index is returned as is. Otherwise operator parameters are
/// used verbatim when given; without them an HNSW index is attempted first
/// and `AUTOINDEX` is used if the backend rejects it.
pub async fn ensure_vector_index(
    backend: &dyn VectorBackend,
    collection: &str,
    operator_params: Option<&IndexParams>,
) -> Result<IndexParams> {
    let indexes = backend.describe_indexes(collection).await?;
    if let Some(existing) = indexes.iter().find(|i| i.field_name == EMBEDDING_FIELD) {
        info!(
            collection = %collection,
            index_type = %existing.params.index_type,
            "Index already exists"
        );
        return Ok(existing.params.clone());
    }

    if let Some(params) = operator_params {
        info!(collection = %collection, index_type = %params.index_type, "Create Milvus index");
        backend
            .create_index(collection, EMBEDDING_FIELD, params)
            .await
            .map_err(|e| StoreError::IndexError(format!("Configured index rejected: {e}")))?;
        return Ok(params.clone());
    }

    let hnsw = hnsw_index_params();
    info!(collection = %collection, "Attempting creation of Milvus HNSW index");
    match backend.create_index(collection, EMBEDDING_FIELD, &hnsw).await {
        Ok(()) => {
            info!(collection = %collection, "Creation of Milvus HNSW index successful");
            Ok(hnsw)
        }
        Err(e) => {
            warn!(
                collection = %collection,
                error = %e,
                "HNSW index rejected, attempting creation of Milvus default index"
            );
            let auto = auto_index_params();
            backend
                .create_index(collection, EMBEDDING_FIELD, &auto)
                .await
                .map_err(|e| StoreError::IndexError(format!("Default index rejected: {e}")))?;
            info!(collection = %collection, "Creation of Milvus default index successful");
            Ok(auto)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::schema::{SchemaRegistry, SchemaVersion};
    use chunkstore_core::ConsistencyLevel;

    async fn backend_with_collection(backend: &MemoryBackend) {
        let registry = SchemaRegistry::new(4);
        backend
            .create_collection(
                "c",
                &registry.collection_schema(SchemaVersion::V2),
                ConsistencyLevel::Strong,
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_default_search_params_table() {
        let mut index = hnsw_index_params();
        assert_eq!(default_search_params(&index).params["ef"], 10);

        index.index_type = "IVF_SQ8".into();
        index.metric_type = "L2".into();
        let search = default_search_params(&index);
        assert_eq!(search.params["nprobe"], 10);
        assert_eq!(search.metric_type, "L2");

        index.index_type = "IVF_HNSW".into();
        let search = default_search_params(&index);
        assert_eq!(search.params.len(), 2);

        index.index_type = "ANNOY".into();
        assert_eq!(default_search_params(&index).params["search_k"], 10);

        assert!(default_search_params(&auto_index_params()).params.is_empty());
    }

    #[tokio::test]
    async fn test_hnsw_is_first_choice() {
        let backend = MemoryBackend::new();
        backend_with_collection(&backend).await;

        let params = ensure_vector_index(&backend, "c", None).await.unwrap();
        assert_eq!(params.index_type, "HNSW");
        assert_eq!(params.params["M"], 8);
        assert_eq!(params.params["efConstruction"], 64);
    }

    #[tokio::test]
    async fn test_falls_back_to_autoindex() {
        let backend = MemoryBackend::new().reject_index_type("HNSW");
        backend_with_collection(&backend).await;

        let params = ensure_vector_index(&backend, "c", None).await.unwrap();
        assert_eq!(params.index_type, "AUTOINDEX");

        let indexes = backend.describe_indexes("c").await.unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].params.index_type, "AUTOINDEX");
    }

    #[tokio::test]
    async fn test_operator_params_used_verbatim() {
        let backend = MemoryBackend::new();
        backend_with_collection(&backend).await;

        let custom = IndexParams {
            index_type: "IVF_FLAT".into(),
            metric_type: "L2".into(),
            params: params(json!({"nlist": 256})),
        };
        let params = ensure_vector_index(&backend, "c", Some(&custom)).await.unwrap();
        assert_eq!(params, custom);

        // an existing index wins over anything configured
        let again = ensure_vector_index(&backend, "c", Some(&hnsw_index_params()))
            .await
            .unwrap();
        assert_eq!(again.index_type, "IVF_FLAT");
    }
}
