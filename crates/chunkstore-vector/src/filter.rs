//! Boolean filter expressions
//!
//! Metadata filters are translated into a small expression tree which is
//! rendered into the backend's expression language. String literals are
//! escaped while rendering, so metadata containing quotes cannot change the
//! structure of the expression.

use chunkstore_core::{MetadataFilter, Result, StoreError};
use serde_json::Value;
use std::fmt;

/// Field holding free-form JSON attributes
pub const JSON_FIELD: &str = "json_data";

/// A scalar literal
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Str(String),
}

impl Literal {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Int(n) => value.as_i64() == Some(*n),
            Self::Str(s) => value.as_str() == Some(s.as_str()),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        _ => write!(f, "{c}")?,
                    }
                }
                f.write_str("\"")
            }
        }
    }
}

/// Filter expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `field == value`
    Eq { field: String, value: Literal },
    /// `field >= value`
    Gte { field: String, value: i64 },
    /// `field <= value`
    Lte { field: String, value: i64 },
    /// `field in [values]`
    In { field: String, values: Vec<Literal> },
    /// JSON array at `field[key]` shares any of `values`
    JsonContainsAny {
        field: String,
        key: String,
        values: Vec<i64>,
    },
    /// Conjunction
    And(Vec<Expr>),
}

impl Expr {
    pub fn eq(field: &str, value: Literal) -> Self {
        Self::Eq {
            field: field.to_string(),
            value,
        }
    }

    pub fn is_in(field: &str, values: Vec<Literal>) -> Self {
        Self::In {
            field: field.to_string(),
            values,
        }
    }

    /// AND-join clauses; `None` when there are none
    pub fn all(mut clauses: Vec<Expr>) -> Option<Expr> {
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(Self::And(clauses)),
        }
    }

    /// Number of literals in an `In` expression
    pub fn literal_count(&self) -> Option<usize> {
        match self {
            Self::In { values, .. } => Some(values.len()),
            _ => None,
        }
    }

    /// Evaluate against a stored record
    pub fn matches(&self, row: &serde_json::Map<String, Value>) -> bool {
        let field_value = |field: &str| row.get(field).unwrap_or(&Value::Null);
        match self {
            Self::Eq { field, value } => value.matches(field_value(field)),
            Self::Gte { field, value } => field_value(field).as_i64().is_some_and(|v| v >= *value),
            Self::Lte { field, value } => field_value(field).as_i64().is_some_and(|v| v <= *value),
            Self::In { field, values } => {
                let v = field_value(field);
                values.iter().any(|lit| lit.matches(v))
            }
            Self::JsonContainsAny { field, key, values } => field_value(field)
                .get(key)
                .and_then(Value::as_array)
                .is_some_and(|stored| {
                    stored
                        .iter()
                        .filter_map(Value::as_i64)
                        .any(|id| values.contains(&id))
                }),
            Self::And(clauses) => clauses.iter().all(|c| c.matches(row)),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq { field, value } => write!(f, "({field} == {value})"),
            Self::Gte { field, value } => write!(f, "({field} >= {value})"),
            Self::Lte { field, value } => write!(f, "({field} <= {value})"),
            Self::In { field, values } => write!(f, "{field} in [{}]", join(values)),
            Self::JsonContainsAny { field, key, values } => write!(
                f,
                "(json_contains_any({field}['{key}'], [{}]))",
                join(values)
            ),
            Self::And(clauses) => {
                let rendered: Vec<String> = clauses.iter().map(ToString::to_string).collect();
                f.write_str(&rendered.join(" and "))
            }
        }
    }
}

/// Translate a metadata filter into an expression
///
/// Each present field contributes one clause; clauses are AND-joined.
/// Returns `None` when the filter has no applicable field.
pub fn translate_filter(filter: &MetadataFilter) -> Result<Option<Expr>> {
    let mut clauses = Vec::new();

    if let Some(id) = &filter.document_id {
        clauses.push(Expr::eq("document_id", Literal::Str(id.clone())));
    }
    if let Some(source) = filter.source {
        clauses.push(Expr::eq("source", Literal::Str(source.as_str().to_string())));
    }
    if let Some(source_id) = &filter.source_id {
        clauses.push(Expr::eq("source_id", Literal::Str(source_id.clone())));
    }
    if let Some(author) = &filter.author {
        clauses.push(Expr::eq("author", Literal::Str(author.clone())));
    }

    if let Some(start) = &filter.start_date {
        let value = start
            .to_unix_seconds()
            .map_err(|e| StoreError::FilterError(format!("start_date: {e}")))?;
        clauses.push(Expr::Gte {
            field: "created_at".to_string(),
            value,
        });
    }
    if let Some(end) = &filter.end_date {
        let value = end
            .to_unix_seconds()
            .map_err(|e| StoreError::FilterError(format!("end_date: {e}")))?;
        clauses.push(Expr::Lte {
            field: "created_at".to_string(),
            value,
        });
    }

    if let Some(ids) = filter.property_ids.as_ref().filter(|ids| !ids.is_empty()) {
        clauses.push(Expr::JsonContainsAny {
            field: JSON_FIELD.to_string(),
            key: "property_ids".to_string(),
            values: ids.clone(),
        });
    }

    Ok(Expr::all(clauses))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkstore_core::{Source, Timestamp};
    use proptest::prelude::*;
    use serde_json::json;

    fn row(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_empty_filter_is_none() {
        assert!(translate_filter(&MetadataFilter::default()).unwrap().is_none());

        let filter = MetadataFilter {
            property_ids: Some(vec![]),
            ..Default::default()
        };
        assert!(translate_filter(&filter).unwrap().is_none());
    }

    #[test]
    fn test_render_all_clauses() {
        let filter = MetadataFilter {
            document_id: Some("doc-1".into()),
            source: Some(Source::File),
            author: Some("A".into()),
            start_date: Some(Timestamp::Epoch(100)),
            end_date: Some(Timestamp::Text("1970-01-01 00:03:20".into())),
            property_ids: Some(vec![1, 2]),
            ..Default::default()
        };
        let expr = translate_filter(&filter).unwrap().unwrap();
        assert_eq!(
            expr.to_string(),
            "(document_id == \"doc-1\") and (source == \"file\") and (author == \"A\") \
             and (created_at >= 100) and (created_at <= 200) \
             and (json_contains_any(json_data['property_ids'], [1,2]))"
        );
    }

    #[test]
    fn test_single_clause_is_not_wrapped() {
        let filter = MetadataFilter {
            source_id: Some("s".into()),
            ..Default::default()
        };
        let expr = translate_filter(&filter).unwrap().unwrap();
        assert_eq!(expr.to_string(), "(source_id == \"s\")");
    }

    #[test]
    fn test_string_literals_are_escaped() {
        let expr = Expr::eq("author", Literal::Str(r#"a" or id != "x\"#.into()));
        assert_eq!(
            expr.to_string(),
            r#"(author == "a\" or id != \"x\\")"#
        );
    }

    #[test]
    fn test_in_rendering() {
        let ints = Expr::is_in("pk", vec![Literal::Int(1), Literal::Int(2)]);
        assert_eq!(ints.to_string(), "pk in [1,2]");
        let strs = Expr::is_in("id", vec![Literal::Str("a".into())]);
        assert_eq!(strs.to_string(), "id in [\"a\"]");
        assert_eq!(strs.literal_count(), Some(1));
    }

    #[test]
    fn test_bad_date_is_an_error() {
        let filter = MetadataFilter {
            end_date: Some(Timestamp::Text("not a date".into())),
            ..Default::default()
        };
        assert!(matches!(
            translate_filter(&filter),
            Err(StoreError::FilterError(_))
        ));
    }

    #[test]
    fn test_matches_row() {
        let stored = row(json!({
            "id": "c1",
            "source": "file",
            "author": "A",
            "created_at": 150,
            "json_data": {"property_ids": [7, 9]}
        }));

        let filter = MetadataFilter {
            source: Some(Source::File),
            start_date: Some(Timestamp::Epoch(150)),
            end_date: Some(Timestamp::Epoch(150)),
            property_ids: Some(vec![9, 10]),
            ..Default::default()
        };
        assert!(translate_filter(&filter).unwrap().unwrap().matches(&stored));

        let miss = MetadataFilter {
            property_ids: Some(vec![1]),
            ..Default::default()
        };
        assert!(!translate_filter(&miss).unwrap().unwrap().matches(&stored));

        let late = MetadataFilter {
            start_date: Some(Timestamp::Epoch(151)),
            ..Default::default()
        };
        assert!(!translate_filter(&late).unwrap().unwrap().matches(&stored));
    }

    proptest! {
        #[test]
        fn prop_clause_order_does_not_change_matches(
            author in "[a-zA-Z\" ]{0,8}",
            stored_author in "[a-zA-Z\" ]{0,8}",
            use_source in any::<bool>(),
            created_at in 0i64..1000,
            start in 0i64..1000,
        ) {
            let filter = MetadataFilter {
                author: Some(author),
                source: use_source.then_some(Source::File),
                start_date: Some(Timestamp::Epoch(start)),
                ..Default::default()
            };
            let record = row(json!({
                "author": stored_author,
                "source": "file",
                "created_at": created_at,
            }));

            let Some(Expr::And(clauses)) = translate_filter(&filter).unwrap() else {
                panic!("expected a conjunction");
            };
            let mut reversed = clauses.clone();
            reversed.reverse();

            prop_assert_eq!(
                Expr::And(clauses).matches(&record),
                Expr::And(reversed).matches(&record)
            );
        }
    }
}
