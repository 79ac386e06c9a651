//! Chunkstore Vector - Milvus-style vector store adapter
//!
//! Stores document chunks with their embeddings in per-tenant collections
//! and serves top-k similarity search, metadata filtering and deletion.
//! Backends are reached through the `VectorBackend` seam: the Milvus
//! RESTful client for production, the in-memory backend for tests.

pub mod backend;
pub mod filter;
pub mod index;
pub mod memory;
pub mod milvus;
pub mod pool;
pub mod schema;
pub mod store;
pub mod tenant;

pub use backend::{
    BackendHandle, ColumnBatch, Connector, IndexDescription, RawHit, Row, SearchRequest,
    VectorBackend,
};
pub use filter::{translate_filter, Expr, Literal};
pub use memory::{MemoryBackend, MemoryConnector};
pub use milvus::{MilvusConnector, MilvusRestClient};
pub use pool::ConnectionPool;
pub use schema::{SchemaRegistry, SchemaVersion};
pub use store::{MilvusDataStore, DELETE_BATCH_SIZE, UPSERT_BATCH_SIZE};
pub use tenant::{ConfigTenantResolver, TenantResolver};
