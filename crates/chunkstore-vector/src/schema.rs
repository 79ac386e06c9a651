//! Stored-record layouts
//!
//! Two generations of the collection layout are supported. `V1` carries an
//! auto-generated int64 `pk` primary key next to the string `id`; `V2` drops
//! `pk` and makes `id` the primary key. New collections are always `V2`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the vector field
pub const EMBEDDING_FIELD: &str = "embedding";

/// Maximum length of a VarChar field
pub const MAX_VARCHAR_LENGTH: usize = 65_535;

/// Generation of the stored-record layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1 => write!(f, "V1"),
            Self::V2 => write!(f, "V2"),
        }
    }
}

/// Backend data type of a field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Int64,
    FloatVector { dim: usize },
    VarChar { max_length: usize },
    Json,
}

/// A single field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int64(i64),
    FloatVector(Vec<f32>),
    VarChar(String),
    Json(Value),
}

impl FieldValue {
    /// JSON representation sent to the backend
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int64(v) => Value::from(*v),
            Self::FloatVector(v) => Value::from(v.clone()),
            Self::VarChar(v) => Value::from(v.clone()),
            Self::Json(v) => v.clone(),
        }
    }
}

/// How a missing value is handled on insert
#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    /// Use this value
    Value(FieldValue),
    /// The record is rejected
    Required,
}

/// Field declaration as seen by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub is_primary: bool,
    pub auto_id: bool,
}

impl FieldSchema {
    fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            is_primary: false,
            auto_id: false,
        }
    }

    fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    fn auto_id(mut self) -> Self {
        self.auto_id = true;
        self
    }
}

/// A field of a layout together with its default policy
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub schema: FieldSchema,
    pub default: FieldDefault,
}

impl FieldSpec {
    /// Field name
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Whether the backend generates this field
    pub fn is_generated(&self) -> bool {
        self.schema.auto_id
    }

    /// Whether `value` fits the declared type
    pub fn accepts(&self, value: &FieldValue) -> bool {
        match (&self.schema.field_type, value) {
            (FieldType::Int64, FieldValue::Int64(_)) => true,
            (FieldType::FloatVector { dim }, FieldValue::FloatVector(v)) => v.len() == *dim,
            (FieldType::VarChar { max_length }, FieldValue::VarChar(s)) => s.len() <= *max_length,
            (FieldType::Json, FieldValue::Json(_)) => true,
            _ => false,
        }
    }
}

/// Existing collection as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDescription {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

/// Field layouts of both schema versions for one embedding dimension
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    dimension: usize,
    v1: Vec<FieldSpec>,
    v2: Vec<FieldSpec>,
}

impl SchemaRegistry {
    /// Build both layouts for embeddings of `dimension` floats
    pub fn new(dimension: usize) -> Self {
        let varchar = || FieldType::VarChar {
            max_length: MAX_VARCHAR_LENGTH,
        };
        let empty = || FieldDefault::Value(FieldValue::VarChar(String::new()));
        let spec = |schema: FieldSchema, default: FieldDefault| FieldSpec { schema, default };

        let v1 = vec![
            spec(
                FieldSchema::new("pk", FieldType::Int64).primary().auto_id(),
                FieldDefault::Required,
            ),
            spec(
                FieldSchema::new(EMBEDDING_FIELD, FieldType::FloatVector { dim: dimension }),
                FieldDefault::Required,
            ),
            spec(FieldSchema::new("text", varchar()), FieldDefault::Required),
            spec(FieldSchema::new("document_id", varchar()), empty()),
            spec(FieldSchema::new("source_id", varchar()), empty()),
            spec(FieldSchema::new("id", varchar()), empty()),
            spec(FieldSchema::new("source", varchar()), empty()),
            spec(FieldSchema::new("url", varchar()), empty()),
            spec(
                FieldSchema::new("created_at", FieldType::Int64),
                FieldDefault::Value(FieldValue::Int64(-1)),
            ),
            spec(FieldSchema::new("author", varchar()), empty()),
            spec(
                FieldSchema::new("json_data", FieldType::Json),
                FieldDefault::Value(FieldValue::Json(Value::Object(Default::default()))),
            ),
        ];

        // V2: no `pk`, `id` becomes the primary key and is mandatory
        let v2 = v1[1..]
            .iter()
            .cloned()
            .map(|mut field| {
                if field.name() == "id" {
                    field.schema.is_primary = true;
                    field.default = FieldDefault::Required;
                }
                field
            })
            .collect();

        Self { dimension, v1, v2 }
    }

    /// Embedding dimension of the vector field
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// All fields of a layout, in declaration order
    pub fn fields(&self, version: SchemaVersion) -> &[FieldSpec] {
        match version {
            SchemaVersion::V1 => &self.v1,
            SchemaVersion::V2 => &self.v2,
        }
    }

    /// Name of the primary key field
    pub fn primary_key_name(&self, version: SchemaVersion) -> &'static str {
        match version {
            SchemaVersion::V1 => "pk",
            SchemaVersion::V2 => "id",
        }
    }

    /// Whether a field must be supplied on insert
    pub fn is_required(&self, version: SchemaVersion, field: &str) -> bool {
        self.fields(version)
            .iter()
            .any(|f| f.name() == field && f.default == FieldDefault::Required)
    }

    /// Fields supplied by the client on insert, in order
    pub fn insert_fields(&self, version: SchemaVersion) -> impl Iterator<Item = &FieldSpec> {
        self.fields(version).iter().filter(|f| !f.is_generated())
    }

    /// Fields returned by a search: everything except the generated key
    /// and the embedding itself
    pub fn output_fields(&self, version: SchemaVersion) -> Vec<String> {
        self.fields(version)
            .iter()
            .filter(|f| !f.is_generated() && f.name() != EMBEDDING_FIELD)
            .map(|f| f.name().to_string())
            .collect()
    }

    /// Backend field declarations used to create a collection
    pub fn collection_schema(&self, version: SchemaVersion) -> Vec<FieldSchema> {
        self.fields(version)
            .iter()
            .map(|f| f.schema.clone())
            .collect()
    }

    /// Detect the layout of an existing collection: a string `id` primary
    /// key means `V2`, anything else is `V1`
    pub fn detect_version(&self, description: &CollectionDescription) -> SchemaVersion {
        let id_is_primary = description.fields.iter().any(|f| {
            f.name == "id" && f.is_primary && matches!(f.field_type, FieldType::VarChar { .. })
        });
        if id_is_primary {
            SchemaVersion::V2
        } else {
            SchemaVersion::V1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(fields: &[FieldSpec]) -> Vec<&str> {
        fields.iter().map(|f| f.name()).collect()
    }

    #[test]
    fn test_v2_is_v1_without_pk() {
        let registry = SchemaRegistry::new(384);
        let v1 = names(registry.fields(SchemaVersion::V1));
        let v2 = names(registry.fields(SchemaVersion::V2));
        assert_eq!(v1[0], "pk");
        assert_eq!(&v1[1..], &v2[..]);
        assert_eq!(v2.len(), 10);
    }

    #[test]
    fn test_primary_keys() {
        let registry = SchemaRegistry::new(384);
        assert_eq!(registry.primary_key_name(SchemaVersion::V1), "pk");
        assert_eq!(registry.primary_key_name(SchemaVersion::V2), "id");

        let v2_primary: Vec<_> = registry
            .fields(SchemaVersion::V2)
            .iter()
            .filter(|f| f.schema.is_primary)
            .map(|f| f.name())
            .collect();
        assert_eq!(v2_primary, vec!["id"]);
    }

    #[test]
    fn test_required_fields() {
        let registry = SchemaRegistry::new(384);
        for version in [SchemaVersion::V1, SchemaVersion::V2] {
            assert!(registry.is_required(version, "text"));
            assert!(registry.is_required(version, EMBEDDING_FIELD));
            assert!(!registry.is_required(version, "author"));
        }
        assert!(!registry.is_required(SchemaVersion::V1, "id"));
        assert!(registry.is_required(SchemaVersion::V2, "id"));
    }

    #[test]
    fn test_insert_and_output_fields() {
        let registry = SchemaRegistry::new(384);

        let v1_insert: Vec<_> = registry
            .insert_fields(SchemaVersion::V1)
            .map(|f| f.name())
            .collect();
        assert!(!v1_insert.contains(&"pk"));
        assert_eq!(v1_insert.len(), 10);

        for version in [SchemaVersion::V1, SchemaVersion::V2] {
            let output = registry.output_fields(version);
            assert!(!output.contains(&"pk".to_string()));
            assert!(!output.contains(&EMBEDDING_FIELD.to_string()));
            assert!(output.contains(&"id".to_string()));
            assert!(output.contains(&"text".to_string()));
        }
    }

    #[test]
    fn test_detect_version() {
        let registry = SchemaRegistry::new(8);
        let v1 = CollectionDescription {
            name: "old".into(),
            fields: registry.collection_schema(SchemaVersion::V1),
        };
        let v2 = CollectionDescription {
            name: "new".into(),
            fields: registry.collection_schema(SchemaVersion::V2),
        };
        assert_eq!(registry.detect_version(&v1), SchemaVersion::V1);
        assert_eq!(registry.detect_version(&v2), SchemaVersion::V2);
    }

    #[test]
    fn test_accepts_checks_width_and_length() {
        let registry = SchemaRegistry::new(3);
        let fields = registry.fields(SchemaVersion::V2);
        let embedding = &fields[0];
        assert!(embedding.accepts(&FieldValue::FloatVector(vec![0.0; 3])));
        assert!(!embedding.accepts(&FieldValue::FloatVector(vec![0.0; 4])));

        let text = &fields[1];
        assert!(text.accepts(&FieldValue::VarChar("hello".into())));
        assert!(!text.accepts(&FieldValue::VarChar("x".repeat(MAX_VARCHAR_LENGTH + 1))));
        assert!(!text.accepts(&FieldValue::Int64(1)));
    }
}
