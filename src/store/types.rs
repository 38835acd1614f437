//! Data types shared by document store backends

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

use super::error::{StorageError, StorageResult};

/// Schemaless document body
pub type Document = Map<String, Value>;

/// Order key that sorts by document id instead of a field
pub const DOCUMENT_ID: &str = "__id__";

/// A document together with its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub data: Document,
}

impl StoredDocument {
    pub fn new(id: impl Into<String>, data: Document) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }

    /// Value used when ordering by `field`
    pub fn order_value(&self, field: &str) -> Value {
        if field == DOCUMENT_ID {
            Value::String(self.id.clone())
        } else {
            self.data.get(field).cloned().unwrap_or(Value::Null)
        }
    }
}

/// Simple query predicate over a top-level field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Exists(String),
    NotExists(String),
    In(String, Vec<Value>),
}

impl Predicate {
    /// Evaluate the predicate against a document
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Predicate::Eq(field, value) => document.get(field) == Some(value),
            Predicate::Ne(field, value) => document.get(field) != Some(value),
            Predicate::Gt(field, value) => {
                compare_field(document, field, value) == Some(Ordering::Greater)
            }
            Predicate::Gte(field, value) => matches!(
                compare_field(document, field, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Predicate::Lt(field, value) => {
                compare_field(document, field, value) == Some(Ordering::Less)
            }
            Predicate::Lte(field, value) => matches!(
                compare_field(document, field, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Predicate::Exists(field) => document.contains_key(field),
            Predicate::NotExists(field) => !document.contains_key(field),
            Predicate::In(field, values) => document
                .get(field)
                .map(|v| values.contains(v))
                .unwrap_or(false),
        }
    }
}

fn compare_field(document: &Document, field: &str, value: &Value) -> Option<Ordering> {
    let current = document.get(field)?;
    if type_rank(current) != type_rank(value) {
        return None;
    }
    Some(compare_values(current, value))
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: type rank first, then value
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x.len().cmp(&y.len()),
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Position after which the next page starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub order_value: Value,
    pub id: String,
}

/// Cursor-paginated query against one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub predicates: Vec<Predicate>,
    pub order_by: String,
    pub descending: bool,
    pub limit: usize,
    pub start_after: Option<Cursor>,
}

impl Query {
    /// Query every document of a collection ordered by id
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: name.into(),
            predicates: Vec::new(),
            order_by: DOCUMENT_ID.to_string(),
            descending: false,
            limit: 100,
            start_after: None,
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = field.into();
        self.descending = descending;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }
}

/// One page of query results
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub documents: Vec<StoredDocument>,
    /// Present when more results may follow
    pub next_cursor: Option<Cursor>,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// A single document mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mutation {
    /// Create or fully replace a document
    Set {
        collection: String,
        id: String,
        data: Document,
    },
    /// Merge top-level fields into an existing document, creating it if absent
    Merge {
        collection: String,
        id: String,
        fields: Document,
    },
    /// Delete a document; deleting an absent document is a no-op
    Delete { collection: String, id: String },
}

impl Mutation {
    pub fn collection(&self) -> &str {
        match self {
            Mutation::Set { collection, .. }
            | Mutation::Merge { collection, .. }
            | Mutation::Delete { collection, .. } => collection,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            Mutation::Set { id, .. } | Mutation::Merge { id, .. } | Mutation::Delete { id, .. } => {
                id
            }
        }
    }
}

/// Condition checked atomically before a write group applies.
///
/// `expected: None` requires the field (or the whole document when
/// `field` is `None`) to be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precondition {
    pub collection: String,
    pub id: String,
    pub field: Option<String>,
    pub expected: Option<Value>,
}

impl Precondition {
    pub fn document_absent(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            field: None,
            expected: None,
        }
    }

    pub fn field_equals(
        collection: impl Into<String>,
        id: impl Into<String>,
        field: impl Into<String>,
        expected: Option<Value>,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            field: Some(field.into()),
            expected,
        }
    }

    /// Check against the current document, if any
    pub fn holds(&self, current: Option<&Document>) -> bool {
        match (&self.field, current) {
            (None, None) => self.expected.is_none(),
            (None, Some(doc)) => match &self.expected {
                None => false,
                Some(Value::Object(expected)) => expected == doc,
                Some(_) => false,
            },
            (Some(_), None) => self.expected.is_none(),
            (Some(field), Some(doc)) => doc.get(field) == self.expected.as_ref(),
        }
    }
}

/// Mutations that commit together or not at all
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteGroup {
    pub preconditions: Vec<Precondition>,
    pub mutations: Vec<Mutation>,
}

impl WriteGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, precondition: Precondition) -> Self {
        self.preconditions.push(precondition);
        self
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn set(mut self, collection: impl Into<String>, id: impl Into<String>, data: Document) -> Self {
        self.mutations.push(Mutation::Set {
            collection: collection.into(),
            id: id.into(),
            data,
        });
        self
    }

    pub fn delete(mut self, collection: impl Into<String>, id: impl Into<String>) -> Self {
        self.mutations.push(Mutation::Delete {
            collection: collection.into(),
            id: id.into(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Acknowledgement of an applied write group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub mutations_applied: usize,
    pub committed_at: chrono::DateTime<chrono::Utc>,
}

/// Store health information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub backend_type: String,
    pub latency_ms: u64,
    pub errors: Vec<String>,
}

/// Serialize a typed record into a document body
pub fn to_document<T: Serialize>(value: &T) -> StorageResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StorageError::serialization(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Deserialize a document body into a typed record
pub fn from_document<T: DeserializeOwned>(document: &Document) -> StorageResult<T> {
    Ok(serde_json::from_value(Value::Object(document.clone()))?)
}
