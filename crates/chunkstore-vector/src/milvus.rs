//! Milvus RESTful API (v2) client
//!
//! Speaks the `/v2/vectordb/...` JSON endpoints of a Milvus deployment.
//! Every response carries an envelope `{code, message, data}`; a non-zero
//! code is reported as a backend error.
//!
//! Author: hephaex@gmail.com

use crate::backend::{
    BackendHandle, ColumnBatch, Connector, IndexDescription, RawHit, Row, SearchRequest,
    VectorBackend,
};
use crate::filter::Expr;
use crate::schema::{CollectionDescription, FieldSchema, FieldType};
use async_trait::async_trait;
use chunkstore_core::{ConnectionInfo, ConsistencyLevel, IndexParams, Result, StoreError};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Upper bound on rows returned by a key lookup query
pub const QUERY_LIMIT: usize = 16_384;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireField {
    name: String,
    #[serde(rename = "type")]
    data_type: String,
    #[serde(default)]
    primary_key: bool,
    #[serde(default)]
    auto_id: bool,
    #[serde(default)]
    params: Vec<WireParam>,
}

#[derive(Debug, Deserialize)]
struct WireParam {
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCollection {
    collection_name: String,
    #[serde(default)]
    fields: Vec<WireField>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireIndex {
    field_name: String,
    index_name: String,
    #[serde(default)]
    index_type: Option<String>,
    #[serde(default)]
    metric_type: Option<String>,
}

fn param_usize(params: &[WireParam], key: &str) -> Option<usize> {
    params.iter().find(|p| p.key == key).and_then(|p| match &p.value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        _ => None,
    })
}

impl WireField {
    fn into_schema(self) -> Result<FieldSchema> {
        let field_type = match self.data_type.as_str() {
            "Int64" => FieldType::Int64,
            "FloatVector" => FieldType::FloatVector {
                dim: param_usize(&self.params, "dim").unwrap_or_default(),
            },
            "VarChar" => FieldType::VarChar {
                max_length: param_usize(&self.params, "max_length").unwrap_or_default(),
            },
            "JSON" => FieldType::Json,
            other => {
                return Err(StoreError::SchemaError(format!(
                    "Unsupported field type {other} for field {}",
                    self.name
                )))
            }
        };
        Ok(FieldSchema {
            name: self.name,
            field_type,
            is_primary: self.primary_key,
            auto_id: self.auto_id,
        })
    }
}

fn field_to_wire(field: &FieldSchema) -> Value {
    let (data_type, params) = match &field.field_type {
        FieldType::Int64 => ("Int64", json!({})),
        FieldType::FloatVector { dim } => ("FloatVector", json!({"dim": dim.to_string()})),
        FieldType::VarChar { max_length } => {
            ("VarChar", json!({"max_length": max_length.to_string()}))
        }
        FieldType::Json => ("JSON", json!({})),
    };
    json!({
        "fieldName": field.name,
        "dataType": data_type,
        "isPrimary": field.is_primary,
        "elementTypeParams": params,
    })
}

// ============================================================================
// Client
// ============================================================================

/// Connection to one Milvus endpoint and database
pub struct MilvusRestClient {
    client: Client,
    base_url: String,
    db_name: String,
    token: Option<String>,
}

impl MilvusRestClient {
    /// Create a client for `base_url` (e.g. `http://127.0.0.1:19530`)
    pub fn new(base_url: impl Into<String>, db_name: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            db_name: db_name.into(),
            token: None,
        }
    }

    /// Create a client from tenant connection parameters
    pub fn from_info(info: &ConnectionInfo, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| StoreError::ConnectionError(format!("HTTP client setup failed: {e}")))?;

        let token = info.user.as_ref().map(|user| {
            format!("{user}:{}", info.password.as_deref().unwrap_or_default())
        });

        Ok(Self {
            client,
            base_url: info.endpoint(),
            db_name: info.db_name.clone(),
            token,
        })
    }

    /// Authenticate with `user:password` or an API key
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    async fn call(&self, path: &str, mut body: Value) -> Result<Value> {
        if let Value::Object(map) = &mut body {
            map.insert("dbName".to_string(), Value::from(self.db_name.clone()));
        }

        let url = format!("{}/v2/vectordb/{path}", self.base_url);
        debug!(url = %url, "Milvus request");

        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::ConnectionError(format!("Milvus request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(StoreError::BackendError(format!(
                "Milvus HTTP {status}: {error_text}"
            )));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| StoreError::BackendError(format!("Failed to parse Milvus response: {e}")))?;

        if envelope.code != 0 {
            return Err(StoreError::BackendError(format!(
                "Milvus error {}: {}",
                envelope.code,
                envelope.message.unwrap_or_default()
            )));
        }

        Ok(envelope.data)
    }

    async fn collection_call(&self, path: &str, collection: &str) -> Result<Value> {
        self.call(path, json!({ "collectionName": collection })).await
    }

    /// Names of all collections in the database
    pub async fn list_collections(&self) -> Result<Vec<String>> {
        let data = self.call("collections/list", json!({})).await?;
        serde_json::from_value(data)
            .map_err(|e| StoreError::BackendError(format!("Unexpected collection list: {e}")))
    }
}

fn rows_from(data: Value) -> Result<Vec<Row>> {
    match data {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                other => Err(StoreError::BackendError(format!(
                    "Unexpected row in Milvus response: {other}"
                ))),
            })
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(StoreError::BackendError(format!(
            "Unexpected Milvus result: {other}"
        ))),
    }
}

#[async_trait]
impl VectorBackend for MilvusRestClient {
    async fn has_collection(&self, collection: &str) -> Result<bool> {
        let data = self.collection_call("collections/has", collection).await?;
        Ok(data.get("has").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn describe_collection(&self, collection: &str) -> Result<CollectionDescription> {
        let data = self
            .collection_call("collections/describe", collection)
            .await
            .map_err(|e| match e {
                StoreError::BackendError(msg) if msg.contains("not found") => {
                    StoreError::CollectionNotFound(collection.to_string())
                }
                other => other,
            })?;
        let wire: WireCollection = serde_json::from_value(data)
            .map_err(|e| StoreError::SchemaError(format!("Unexpected collection schema: {e}")))?;

        Ok(CollectionDescription {
            name: wire.collection_name,
            fields: wire
                .fields
                .into_iter()
                .map(WireField::into_schema)
                .collect::<Result<_>>()?,
        })
    }

    async fn create_collection(
        &self,
        collection: &str,
        fields: &[FieldSchema],
        consistency_level: ConsistencyLevel,
    ) -> Result<()> {
        let body = json!({
            "collectionName": collection,
            "schema": {
                "autoId": fields.iter().any(|f| f.auto_id),
                "enableDynamicField": false,
                "fields": fields.iter().map(field_to_wire).collect::<Vec<_>>(),
            },
            "params": { "consistencyLevel": consistency_level.to_string() },
        });
        self.call("collections/create", body)
            .await
            .map_err(|e| StoreError::SchemaError(format!("Failed to create collection: {e}")))?;
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> Result<()> {
        self.collection_call("collections/drop", collection).await?;
        Ok(())
    }

    async fn load_collection(&self, collection: &str) -> Result<()> {
        self.collection_call("collections/load", collection).await?;
        Ok(())
    }

    async fn release_collection(&self, collection: &str) -> Result<()> {
        self.collection_call("collections/release", collection).await?;
        Ok(())
    }

    async fn describe_indexes(&self, collection: &str) -> Result<Vec<IndexDescription>> {
        let names: Vec<String> =
            serde_json::from_value(self.collection_call("indexes/list", collection).await?)
                .unwrap_or_default();

        let mut indexes = Vec::with_capacity(names.len());
        for name in names {
            let data = self
                .call(
                    "indexes/describe",
                    json!({ "collectionName": collection, "indexName": name }),
                )
                .await?;
            let described: Vec<WireIndex> = serde_json::from_value(data)
                .map_err(|e| StoreError::IndexError(format!("Unexpected index description: {e}")))?;

            indexes.extend(described.into_iter().map(|index| IndexDescription {
                field_name: index.field_name,
                index_name: index.index_name,
                params: IndexParams {
                    index_type: index.index_type.unwrap_or_else(|| "AUTOINDEX".to_string()),
                    metric_type: index.metric_type.unwrap_or_else(|| "IP".to_string()),
                    params: Map::new(),
                },
            }));
        }
        Ok(indexes)
    }

    async fn create_index(
        &self,
        collection: &str,
        field: &str,
        params: &IndexParams,
    ) -> Result<()> {
        let mut index_params = params.params.clone();
        index_params.insert("index_type".to_string(), Value::from(params.index_type.clone()));

        let body = json!({
            "collectionName": collection,
            "indexParams": [{
                "fieldName": field,
                "indexName": field,
                "metricType": params.metric_type,
                "params": index_params,
            }],
        });
        self.call("indexes/create", body).await?;
        Ok(())
    }

    async fn insert(&self, collection: &str, batch: &ColumnBatch) -> Result<u64> {
        let body = json!({
            "collectionName": collection,
            "data": batch.to_rows(),
        });
        let data = self.call("entities/insert", body).await?;
        Ok(data
            .get("insertCount")
            .and_then(Value::as_u64)
            .unwrap_or(batch.num_rows() as u64))
    }

    async fn search(&self, collection: &str, request: &SearchRequest) -> Result<Vec<RawHit>> {
        let mut body = json!({
            "collectionName": collection,
            "data": [request.vector],
            "annsField": request.anns_field,
            "limit": request.limit,
            "outputFields": request.output_fields,
            "searchParams": {
                "metricType": request.params.metric_type,
                "params": request.params.params,
            },
        });
        if let Some(filter) = &request.filter {
            body["filter"] = Value::from(filter.to_string());
        }

        let rows = rows_from(self.call("entities/search", body).await?)?;
        Ok(rows
            .into_iter()
            .map(|mut row| {
                let score = row
                    .remove("distance")
                    .and_then(|v| v.as_f64())
                    .unwrap_or_default() as f32;
                RawHit { score, fields: row }
            })
            .collect())
    }

    async fn query(
        &self,
        collection: &str,
        filter: &Expr,
        output_fields: &[String],
    ) -> Result<Vec<Row>> {
        let body = json!({
            "collectionName": collection,
            "filter": filter.to_string(),
            "outputFields": output_fields,
            "limit": QUERY_LIMIT,
        });
        rows_from(self.call("entities/query", body).await?)
    }

    async fn delete(&self, collection: &str, filter: &Expr) -> Result<u64> {
        let body = json!({
            "collectionName": collection,
            "filter": filter.to_string(),
        });
        let data = self.call("entities/delete", body).await?;
        // older servers return an empty data object
        let count = data
            .get("deleteCount")
            .and_then(Value::as_u64)
            .or_else(|| filter.literal_count().map(|n| n as u64))
            .unwrap_or_default();
        Ok(count)
    }
}

/// Opens `MilvusRestClient` connections and checks they answer
#[derive(Debug, Clone, Default)]
pub struct MilvusConnector {
    timeout: Option<Duration>,
}

impl MilvusConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout applied to every HTTP request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connector for MilvusConnector {
    async fn connect(&self, info: &ConnectionInfo) -> Result<BackendHandle> {
        let client = MilvusRestClient::from_info(info, self.timeout)?;
        client.list_collections().await.map_err(|e| {
            StoreError::ConnectionError(format!(
                "Failed to connect to Milvus server '{}:{}': {e}",
                info.host, info.port
            ))
        })?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Literal;
    use crate::schema::{FieldValue, SchemaRegistry, SchemaVersion};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok(data: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": data}))
    }

    #[tokio::test]
    async fn test_has_collection_sends_db_name() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/collections/has"))
            .and(body_partial_json(json!({"collectionName": "chunks", "dbName": "default"})))
            .respond_with(ok(json!({"has": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = MilvusRestClient::new(server.uri(), "default");
        assert!(client.has_collection("chunks").await.unwrap());
    }

    #[tokio::test]
    async fn test_describe_detects_schema_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/collections/describe"))
            .respond_with(ok(json!({
                "collectionName": "chunks",
                "fields": [
                    {"name": "embedding", "type": "FloatVector",
                     "params": [{"key": "dim", "value": "384"}]},
                    {"name": "text", "type": "VarChar",
                     "params": [{"key": "max_length", "value": "65535"}]},
                    {"name": "id", "type": "VarChar", "primaryKey": true,
                     "params": [{"key": "max_length", "value": "65535"}]},
                    {"name": "created_at", "type": "Int64"},
                    {"name": "json_data", "type": "JSON"}
                ]
            })))
            .mount(&server)
            .await;

        let client = MilvusRestClient::new(server.uri(), "default");
        let description = client.describe_collection("chunks").await.unwrap();
        assert_eq!(
            description.fields[0].field_type,
            FieldType::FloatVector { dim: 384 }
        );
        assert_eq!(
            SchemaRegistry::new(384).detect_version(&description),
            SchemaVersion::V2
        );
    }

    #[tokio::test]
    async fn test_error_code_is_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/collections/load"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"code": 100, "message": "collection not found"})),
            )
            .mount(&server)
            .await;

        let client = MilvusRestClient::new(server.uri(), "default");
        let err = client.load_collection("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::BackendError(msg) if msg.contains("not found")));
    }

    #[tokio::test]
    async fn test_insert_sends_rows_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/insert"))
            .and(header("authorization", "Bearer root:Milvus"))
            .and(body_partial_json(json!({
                "collectionName": "chunks",
                "data": [{"id": "c1", "text": "hello"}]
            })))
            .respond_with(ok(json!({"insertCount": 1, "insertIds": ["c1"]})))
            .expect(1)
            .mount(&server)
            .await;

        let client = MilvusRestClient::new(server.uri(), "default").with_token("root:Milvus");
        let batch = ColumnBatch::from_rows(
            &["id".to_string(), "text".to_string()],
            &[vec![
                FieldValue::VarChar("c1".into()),
                FieldValue::VarChar("hello".into()),
            ]],
        );
        assert_eq!(client.insert("chunks", &batch).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_search_maps_distance_to_score() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/search"))
            .and(body_partial_json(json!({
                "annsField": "embedding",
                "limit": 2,
                "filter": "(author == \"A\")",
                "searchParams": {"metricType": "IP", "params": {"ef": 10}}
            })))
            .respond_with(ok(json!([
                {"distance": 0.9, "id": "c1", "text": "hello"},
                {"distance": 0.5, "id": "c2", "text": "world"}
            ])))
            .mount(&server)
            .await;

        let client = MilvusRestClient::new(server.uri(), "default");
        let request = SearchRequest {
            vector: vec![0.1, 0.2],
            anns_field: "embedding".to_string(),
            limit: 2,
            filter: Some(Expr::eq("author", Literal::Str("A".into()))),
            output_fields: vec!["id".to_string(), "text".to_string()],
            params: crate::index::fallback_search_params(),
        };
        let hits = client.search("chunks", &request).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!((hits[0].score - 0.9).abs() < 1e-6);
        assert_eq!(hits[0].fields["id"], "c1");
        assert!(!hits[0].fields.contains_key("distance"));
    }

    #[tokio::test]
    async fn test_delete_count_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/entities/delete"))
            .and(body_partial_json(json!({"filter": "pk in [1,2,3]"})))
            .respond_with(ok(json!({})))
            .mount(&server)
            .await;

        let client = MilvusRestClient::new(server.uri(), "default");
        let filter = Expr::is_in("pk", vec![Literal::Int(1), Literal::Int(2), Literal::Int(3)]);
        assert_eq!(client.delete("chunks", &filter).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_create_index_puts_type_in_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/vectordb/indexes/create"))
            .and(body_partial_json(json!({
                "indexParams": [{
                    "fieldName": "embedding",
                    "metricType": "IP",
                    "params": {"index_type": "HNSW", "M": 8, "efConstruction": 64}
                }]
            })))
            .respond_with(ok(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = MilvusRestClient::new(server.uri(), "default");
        client
            .create_index("chunks", "embedding", &crate::index::hnsw_index_params())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connector_reports_unreachable_server() {
        let info = ConnectionInfo::new("127.0.0.1", 1, "default", "chunks");
        let connector = MilvusConnector::new().with_timeout(Duration::from_secs(2));
        assert!(matches!(
            connector.connect(&info).await,
            Err(StoreError::ConnectionError(_))
        ));
    }
}
