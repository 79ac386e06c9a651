//! Backend seam
//!
//! `VectorBackend` is one live connection to an ANN engine exposing
//! Milvus-style collections. `Connector` opens such connections from
//! tenant connection parameters.

use crate::filter::Expr;
use crate::schema::{CollectionDescription, FieldSchema, FieldValue};
use async_trait::async_trait;
use chunkstore_core::{ConnectionInfo, ConsistencyLevel, IndexParams, Result, SearchParams};
use serde_json::Value;
use std::sync::Arc;

/// A record as returned by the backend
pub type Row = serde_json::Map<String, Value>;

/// Shared handle to a live backend connection
pub type BackendHandle = Arc<dyn VectorBackend>;

/// One column of an insert batch
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<FieldValue>,
}

/// Column-oriented insert batch
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnBatch {
    columns: Vec<Column>,
}

impl ColumnBatch {
    /// Build a batch from rows whose values follow `names`
    pub fn from_rows(names: &[String], rows: &[Vec<FieldValue>]) -> Self {
        let mut columns: Vec<Column> = names
            .iter()
            .map(|name| Column {
                name: name.clone(),
                values: Vec::with_capacity(rows.len()),
            })
            .collect();

        for row in rows {
            for (column, value) in columns.iter_mut().zip(row) {
                column.values.push(value.clone());
            }
        }

        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Row-oriented JSON view of the batch
    pub fn to_rows(&self) -> Vec<Row> {
        (0..self.num_rows())
            .map(|i| {
                self.columns
                    .iter()
                    .map(|c| (c.name.clone(), c.values[i].to_json()))
                    .collect()
            })
            .collect()
    }
}

/// An existing index on a collection
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescription {
    pub field_name: String,
    pub index_name: String,
    pub params: IndexParams,
}

/// Top-k similarity search
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub vector: Vec<f32>,
    pub anns_field: String,
    pub limit: usize,
    pub filter: Option<Expr>,
    pub output_fields: Vec<String>,
    pub params: SearchParams,
}

/// A search hit: its score plus the requested output fields
#[derive(Debug, Clone, PartialEq)]
pub struct RawHit {
    pub score: f32,
    pub fields: Row,
}

/// Collection, index and entity operations of an ANN backend
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn has_collection(&self, collection: &str) -> Result<bool>;

    /// Declared fields of an existing collection
    async fn describe_collection(&self, collection: &str) -> Result<CollectionDescription>;

    async fn create_collection(
        &self,
        collection: &str,
        fields: &[FieldSchema],
        consistency_level: ConsistencyLevel,
    ) -> Result<()>;

    async fn drop_collection(&self, collection: &str) -> Result<()>;

    /// Load a collection into memory for search
    async fn load_collection(&self, collection: &str) -> Result<()>;

    /// Release a loaded collection from memory
    async fn release_collection(&self, collection: &str) -> Result<()>;

    async fn describe_indexes(&self, collection: &str) -> Result<Vec<IndexDescription>>;

    async fn create_index(&self, collection: &str, field: &str, params: &IndexParams)
        -> Result<()>;

    /// Insert a batch, returning the number of rows written
    async fn insert(&self, collection: &str, batch: &ColumnBatch) -> Result<u64>;

    async fn search(&self, collection: &str, request: &SearchRequest) -> Result<Vec<RawHit>>;

    /// Fetch records matching `filter`, projected onto `output_fields`
    async fn query(&self, collection: &str, filter: &Expr, output_fields: &[String])
        -> Result<Vec<Row>>;

    /// Delete records matching `filter`, returning the number deleted
    async fn delete(&self, collection: &str, filter: &Expr) -> Result<u64>;

    /// Close the connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Opens backend connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, info: &ConnectionInfo) -> Result<BackendHandle>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_batch_from_rows() {
        let names = vec!["text".to_string(), "created_at".to_string()];
        let rows = vec![
            vec![FieldValue::VarChar("a".into()), FieldValue::Int64(1)],
            vec![FieldValue::VarChar("b".into()), FieldValue::Int64(2)],
        ];
        let batch = ColumnBatch::from_rows(&names, &rows);

        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.columns()[1].values[1], FieldValue::Int64(2));

        let json_rows = batch.to_rows();
        assert_eq!(json_rows[0]["text"], "a");
        assert_eq!(json_rows[1]["created_at"], 2);
    }

    #[test]
    fn test_empty_batch() {
        let batch = ColumnBatch::from_rows(&["text".to_string()], &[]);
        assert!(batch.is_empty());
        assert!(batch.to_rows().is_empty());
    }
}
