//! chunkstore Configuration Management
//!
//! Handles configuration from environment variables and TOML files,
//! with defaults matching a local Milvus standalone deployment.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Default backend connection and adapter tuning
    pub milvus: MilvusConfig,

    /// Embedding model selection (drives vector dimension)
    pub embedding: EmbeddingConfig,

    /// Per-tenant connection overrides, keyed by tenant id
    pub tenants: HashMap<String, TenantOverride>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl StoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::FileReadError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })
    }

    /// Merge with environment variables (env takes precedence)
    pub fn with_env_override(mut self) -> Result<Self, ConfigError> {
        self.apply_env()?;
        Ok(self)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        // Milvus connection
        if let Ok(host) = std::env::var("MILVUS_HOST") {
            self.milvus.host = host;
        }
        if let Ok(port) = std::env::var("MILVUS_PORT") {
            self.milvus.port = parse_value("MILVUS_PORT", port)?;
        }
        if let Ok(user) = std::env::var("MILVUS_USER") {
            self.milvus.user = Some(user);
        }
        if let Ok(password) = std::env::var("MILVUS_PASSWORD") {
            self.milvus.password = Some(password);
        }
        if let Ok(db_name) = std::env::var("MILVUS_DB_NAME") {
            self.milvus.db_name = db_name;
        }
        if let Ok(collection) = std::env::var("MILVUS_COLLECTION") {
            self.milvus.collection_name = collection;
        }
        if let Ok(secure) = std::env::var("MILVUS_SECURE") {
            self.milvus.secure = Some(parse_value("MILVUS_SECURE", secure)?);
        }

        // Index and search tuning, JSON encoded
        if let Ok(params) = std::env::var("MILVUS_INDEX_PARAMS") {
            self.milvus.index_params = Some(parse_json("MILVUS_INDEX_PARAMS", params)?);
        }
        if let Ok(params) = std::env::var("MILVUS_SEARCH_PARAMS") {
            self.milvus.search_params = Some(parse_json("MILVUS_SEARCH_PARAMS", params)?);
        }
        if let Ok(level) = std::env::var("MILVUS_CONSISTENCY_LEVEL") {
            self.milvus.consistency_level = level.parse()?;
        }
        if let Ok(secs) = std::env::var("MILVUS_REQUEST_TIMEOUT_SECS") {
            self.milvus.request_timeout_secs =
                Some(parse_value("MILVUS_REQUEST_TIMEOUT_SECS", secs)?);
        }

        // Embedding
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Ok(dim) = std::env::var("EMBEDDING_DIMENSION") {
            self.embedding.dimension = Some(parse_value("EMBEDDING_DIMENSION", dim)?);
        }

        // Logging
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            self.logging.json_format = format.eq_ignore_ascii_case("json");
        }

        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(key: &str, value: String) -> Result<T, ConfigError> {
    serde_json::from_str(&value).map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
    })
}

/// Milvus connection and adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MilvusConfig {
    /// Milvus host
    pub host: String,

    /// Milvus RESTful port
    pub port: u16,

    /// Username (optional)
    pub user: Option<String>,

    /// Password (optional)
    pub password: Option<String>,

    /// Force TLS on or off; by default TLS is used when a password is set
    pub secure: Option<bool>,

    /// Database name
    pub db_name: String,

    /// Collection holding the chunks
    pub collection_name: String,

    /// Index parameters used verbatim when creating the vector index
    pub index_params: Option<IndexParams>,

    /// Search parameters overriding the index-derived defaults
    pub search_params: Option<SearchParams>,

    /// Consistency level for new collections
    pub consistency_level: ConsistencyLevel,

    /// Per-query timeout in seconds (none by default)
    pub request_timeout_secs: Option<u64>,
}

impl Default for MilvusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 19530,
            user: None,
            password: None,
            secure: None,
            db_name: "default".to_string(),
            collection_name: "test_sbert".to_string(),
            index_params: None,
            search_params: None,
            // Bounded favours search performance; tests use Strong
            consistency_level: ConsistencyLevel::Bounded,
            request_timeout_secs: None,
        }
    }
}

/// Connection fields a tenant may override
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantOverride {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub db_name: Option<String>,
    pub collection_name: Option<String>,
}

/// Vector index parameters, in the Milvus `create_index` layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexParams {
    /// Index algorithm (HNSW, IVF_FLAT, AUTOINDEX, ...)
    pub index_type: String,

    /// Distance metric (IP, L2, COSINE)
    #[serde(default = "default_metric")]
    pub metric_type: String,

    /// Build parameters
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Search-time parameters, in the Milvus `search` layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default = "default_metric")]
    pub metric_type: String,

    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_metric() -> String {
    "IP".to_string()
}

/// Read consistency of a collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    Strong,
    Session,
    #[default]
    Bounded,
    Eventually,
}

impl std::fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strong => write!(f, "Strong"),
            Self::Session => write!(f, "Session"),
            Self::Bounded => write!(f, "Bounded"),
            Self::Eventually => write!(f, "Eventually"),
        }
    }
}

impl std::str::FromStr for ConsistencyLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strong" => Ok(Self::Strong),
            "session" => Ok(Self::Session),
            "bounded" => Ok(Self::Bounded),
            "eventually" => Ok(Self::Eventually),
            _ => Err(ConfigError::InvalidValue {
                key: "MILVUS_CONSISTENCY_LEVEL".to_string(),
                value: s.to_string(),
            }),
        }
    }
}

/// Embedding model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding model name
    pub model: String,

    /// Explicit vector dimension, overriding the model lookup
    pub dimension: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: None,
        }
    }
}

impl EmbeddingConfig {
    /// Vector dimension produced by the configured model
    pub fn dimension(&self) -> usize {
        if let Some(dim) = self.dimension {
            return dim;
        }
        match self.model.to_lowercase().as_str() {
            "text-embedding-ada-002" | "text-embedding-3-small" => 1536,
            _ => 384, // sentence-transformers MiniLM family
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// JSON format for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.milvus.port, 19530);
        assert_eq!(config.milvus.collection_name, "test_sbert");
        assert_eq!(config.milvus.consistency_level, ConsistencyLevel::Bounded);
        assert_eq!(config.embedding.dimension(), 384);
        assert!(config.milvus.request_timeout_secs.is_none());
    }

    #[test]
    fn test_embedding_dimension_lookup() {
        let mut embedding = EmbeddingConfig {
            model: "text-embedding-ada-002".to_string(),
            dimension: None,
        };
        assert_eq!(embedding.dimension(), 1536);

        embedding.dimension = Some(768);
        assert_eq!(embedding.dimension(), 768);
    }

    #[test]
    fn test_consistency_level_parse() {
        assert_eq!(
            "strong".parse::<ConsistencyLevel>().unwrap(),
            ConsistencyLevel::Strong
        );
        assert_eq!(
            "Eventually".parse::<ConsistencyLevel>().unwrap(),
            ConsistencyLevel::Eventually
        );
        assert!("sometimes".parse::<ConsistencyLevel>().is_err());
    }

    #[test]
    fn test_index_params_json() {
        let params: IndexParams = serde_json::from_str(
            r#"{"index_type": "IVF_FLAT", "params": {"nlist": 256}, "metric_type": "L2"}"#,
        )
        .unwrap();
        assert_eq!(params.index_type, "IVF_FLAT");
        assert_eq!(params.metric_type, "L2");
        assert_eq!(params.params["nlist"], 256);

        let search: SearchParams = serde_json::from_str(r#"{"params": {"ef": 32}}"#).unwrap();
        assert_eq!(search.metric_type, "IP");
    }

    #[test]
    fn test_toml_with_tenants() {
        let config: StoreConfig = toml::from_str(
            r#"
            [milvus]
            host = "milvus.internal"
            consistency_level = "Strong"

            [milvus.index_params]
            index_type = "IVF_FLAT"
            params = { nlist = 128 }

            [tenants.acme]
            collection_name = "acme_chunks"
            "#,
        )
        .unwrap();

        assert_eq!(config.milvus.host, "milvus.internal");
        assert_eq!(config.milvus.port, 19530);
        assert_eq!(config.milvus.consistency_level, ConsistencyLevel::Strong);
        assert_eq!(
            config.milvus.index_params.as_ref().unwrap().metric_type,
            "IP"
        );
        assert_eq!(
            config.tenants["acme"].collection_name.as_deref(),
            Some("acme_chunks")
        );
    }
}
