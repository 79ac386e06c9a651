//! chunkstore Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout chunkstore:
//! - Document chunk models (chunks, metadata, scored hits)
//! - Metadata filters and query requests
//! - Backend connection parameters
//! - Common error types
//! - The `DataStore` provider trait
//! - Configuration management

pub mod config;

pub use config::{
    ConfigError, ConsistencyLevel, EmbeddingConfig, IndexParams, LoggingConfig, MilvusConfig,
    SearchParams, StoreConfig, TenantOverride,
};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for chunkstore operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Index error: {0}")]
    IndexError(String),

    #[error("Backend error: {0}")]
    BackendError(String),

    #[error("Invalid filter: {0}")]
    FilterError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Timestamps
// ============================================================================

/// A point in time as supplied by callers.
///
/// Accepts either unix epoch seconds or a date string. Date strings may be
/// RFC 3339 (`2024-01-31T12:00:00Z`), a naive date-time
/// (`2024-01-31 12:00:00`, read as UTC) or a plain date (`2024-01-31`,
/// midnight UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Epoch(i64),
    Text(String),
}

impl Timestamp {
    /// Convert to unix epoch seconds
    pub fn to_unix_seconds(&self) -> Result<i64> {
        match self {
            Self::Epoch(secs) => Ok(*secs),
            Self::Text(text) => parse_timestamp(text.trim()),
        }
    }
}

impl From<i64> for Timestamp {
    fn from(secs: i64) -> Self {
        Self::Epoch(secs)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::Epoch(dt.timestamp())
    }
}

fn parse_timestamp(text: &str) -> Result<i64> {
    if let Ok(secs) = text.parse::<i64>() {
        return Ok(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.timestamp());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    Err(StoreError::ValidationError(format!(
        "Unrecognized timestamp: {text}"
    )))
}

// ============================================================================
// Document Models
// ============================================================================

/// Origin of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Email,
    File,
    Chat,
}

impl Source {
    /// String value stored in the backend
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::File => "file",
            Self::Chat => "chat",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "email" => Ok(Self::Email),
            "file" => Ok(Self::File),
            "chat" => Ok(Self::Chat),
            _ => Err(StoreError::ValidationError(format!("Unknown source: {s}"))),
        }
    }
}

/// Metadata attached to every stored chunk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Logical document the chunk belongs to
    #[serde(default)]
    pub document_id: Option<String>,

    #[serde(default)]
    pub source: Option<Source>,

    /// Identifier of the item in the source system
    #[serde(default)]
    pub source_id: Option<String>,

    #[serde(default)]
    pub url: Option<String>,

    /// Creation time; ingestion time is used when absent
    #[serde(default)]
    pub created_at: Option<Timestamp>,

    #[serde(default)]
    pub author: Option<String>,

    /// Free-form attributes (e.g. `property_ids`)
    #[serde(default)]
    pub json_data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A unit of text with its embedding and metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    #[serde(default)]
    pub id: Option<String>,

    pub text: String,

    #[serde(default)]
    pub metadata: ChunkMetadata,

    /// Pre-computed embedding vector
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl DocumentChunk {
    /// Create a new chunk
    pub fn new(id: impl Into<String>, text: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: Some(id.into()),
            text: text.into(),
            metadata: ChunkMetadata::default(),
            embedding: Some(embedding),
        }
    }

    /// Set metadata
    pub fn with_metadata(mut self, metadata: ChunkMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Chunks keyed by the logical document they belong to
pub type ChunksByDocument = BTreeMap<String, Vec<DocumentChunk>>;

/// A chunk returned by a similarity search
///
/// The embedding is not returned. Score direction depends on the metric
/// the collection index uses (higher is better for IP, lower for L2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkWithScore {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub metadata: ChunkMetadata,
}

// ============================================================================
// Filters and Queries
// ============================================================================

/// Predicate over chunk metadata. All present fields must match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    #[serde(default)]
    pub document_id: Option<String>,

    #[serde(default)]
    pub source: Option<Source>,

    #[serde(default)]
    pub source_id: Option<String>,

    #[serde(default)]
    pub author: Option<String>,

    /// Inclusive lower bound on `created_at`
    #[serde(default)]
    pub start_date: Option<Timestamp>,

    /// Inclusive upper bound on `created_at`
    #[serde(default)]
    pub end_date: Option<Timestamp>,

    /// Matches when `json_data.property_ids` shares any of these ids
    #[serde(default)]
    pub property_ids: Option<Vec<i64>>,
}

fn default_top_k() -> usize {
    3
}

/// A similarity query with its pre-computed embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryWithEmbedding {
    pub query: String,

    /// Tenant whose collection is searched
    pub source_id: String,

    #[serde(default)]
    pub filter: Option<MetadataFilter>,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    pub embedding: Vec<f32>,
}

impl QueryWithEmbedding {
    /// Create a new query with the default top-k
    pub fn new(
        query: impl Into<String>,
        source_id: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            query: query.into(),
            source_id: source_id.into(),
            filter: None,
            top_k: default_top_k(),
            embedding,
        }
    }

    /// Set filter
    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Set top-k
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }
}

/// Results for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub query: String,
    pub results: Vec<ChunkWithScore>,
}

impl QueryResult {
    /// An empty result for a query that failed or matched nothing
    pub fn empty(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            results: Vec::new(),
        }
    }
}

// ============================================================================
// Connection Parameters
// ============================================================================

/// Backend connection parameters for one tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Deterministic key used to share live connections
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub db_name: String,
    pub collection_name: String,
    /// Use TLS for the transport
    pub secure: bool,
}

impl ConnectionInfo {
    /// Create connection parameters, deriving the alias
    pub fn new(
        host: impl Into<String>,
        port: u16,
        db_name: impl Into<String>,
        collection_name: impl Into<String>,
    ) -> Self {
        let host = host.into();
        let db_name = db_name.into();
        let alias = connection_alias(&host, port, &db_name, None);
        Self {
            alias,
            host,
            port,
            user: None,
            password: None,
            db_name,
            collection_name: collection_name.into(),
            secure: false,
        }
    }

    /// Set credentials; a password switches the transport to TLS
    pub fn with_credentials(mut self, user: Option<String>, password: Option<String>) -> Self {
        self.secure = password.is_some();
        self.user = user;
        self.password = password;
        self.alias = connection_alias(&self.host, self.port, &self.db_name, self.user.as_deref());
        self
    }

    /// Endpoint URL of the backend
    pub fn endpoint(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

/// Alias for a `(host, port, db_name, user)` tuple
pub fn connection_alias(host: &str, port: u16, db_name: &str, user: Option<&str>) -> String {
    let mut hasher = DefaultHasher::new();
    format!("{host}_{port}_{db_name}_{}", user.unwrap_or("None")).hash(&mut hasher);
    hasher.finish().to_string()
}

// ============================================================================
// Traits
// ============================================================================

/// Provider interface for vector stores
///
/// Every operation returns a well-formed value; backend failures are
/// logged by the implementation and reported as empty results or `false`.
#[async_trait::async_trait]
pub trait DataStore: Send + Sync {
    /// Store chunks for the tenant and return the document ids written
    async fn upsert(&self, chunks: ChunksByDocument, tenant_id: &str) -> Vec<String>;

    /// Run similarity queries, one result per query in input order
    async fn query(&self, queries: Vec<QueryWithEmbedding>) -> Vec<QueryResult>;

    /// Delete by logical document ids, by filter, or everything
    async fn delete(
        &self,
        tenant_id: &str,
        ids: Option<&[String]>,
        filter: Option<&MetadataFilter>,
        delete_all: bool,
    ) -> bool;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(Timestamp::Epoch(42).to_unix_seconds().unwrap(), 42);
        assert_eq!(
            Timestamp::Text("1700000000".into()).to_unix_seconds().unwrap(),
            1_700_000_000
        );
        assert_eq!(
            Timestamp::Text("2024-01-01T00:00:00Z".into())
                .to_unix_seconds()
                .unwrap(),
            1_704_067_200
        );
        assert_eq!(
            Timestamp::Text("2024-01-01".into()).to_unix_seconds().unwrap(),
            1_704_067_200
        );
        assert_eq!(
            Timestamp::Text("2024-01-01 00:00:10".into())
                .to_unix_seconds()
                .unwrap(),
            1_704_067_210
        );
        assert!(Timestamp::Text("yesterday".into()).to_unix_seconds().is_err());
    }

    #[test]
    fn test_timestamp_deserialize_untagged() {
        let ts: Timestamp = serde_json::from_str("1700000000").unwrap();
        assert_eq!(ts, Timestamp::Epoch(1_700_000_000));
        let ts: Timestamp = serde_json::from_str("\"2024-01-01\"").unwrap();
        assert_eq!(ts, Timestamp::Text("2024-01-01".into()));
    }

    #[test]
    fn test_source_roundtrip() {
        assert_eq!("file".parse::<Source>().unwrap(), Source::File);
        assert!("fax".parse::<Source>().is_err());
        assert_eq!(serde_json::to_string(&Source::Chat).unwrap(), "\"chat\"");
    }

    #[test]
    fn test_alias_is_deterministic() {
        let a = ConnectionInfo::new("127.0.0.1", 19530, "default", "a");
        let b = ConnectionInfo::new("127.0.0.1", 19530, "default", "b");
        let c = ConnectionInfo::new("127.0.0.1", 19531, "default", "a");
        // collection name is not part of the alias
        assert_eq!(a.alias, b.alias);
        assert_ne!(a.alias, c.alias);

        let with_user = a
            .clone()
            .with_credentials(Some("root".into()), Some("secret".into()));
        assert_ne!(with_user.alias, a.alias);
        assert!(with_user.secure);
        assert_eq!(with_user.endpoint(), "https://127.0.0.1:19530");
    }

    #[test]
    fn test_query_default_top_k() {
        let q: QueryWithEmbedding = serde_json::from_value(serde_json::json!({
            "query": "hello",
            "source_id": "tenant",
            "embedding": [0.1, 0.2]
        }))
        .unwrap();
        assert_eq!(q.top_k, 3);
        assert!(q.filter.is_none());
    }
}
