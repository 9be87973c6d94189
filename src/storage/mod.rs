// Durable document store abstraction
// Session documents are mirrored here for recovery and inspection only

pub mod file;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use file::FileDocumentStore;
pub use memory::MemoryDocumentStore;

/// Collection holding mirrored session documents
pub const SESSIONS_COLLECTION: &str = "sessions";

/// Document store consumed by the session manager.
///
/// No transactional guarantee across calls is assumed.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace a document
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StorageError>;

    /// Fetch a document by ID
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StorageError>;

    /// Return every document in the collection matching the filter
    async fn query(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> Result<Vec<Value>, StorageError>;

    /// Cheap round trip used by health checks
    async fn ping(&self) -> Result<(), StorageError> {
        self.get("_health", "probe").await.map(|_| ())
    }
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::SerializationError(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(String, Value),
    Gte(String, Value),
}

/// Conjunction of field conditions evaluated against top-level document fields
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    conditions: Vec<Condition>,
}

impl DocumentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field must equal the value
    pub fn field_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Eq(field.to_string(), value.into()));
        self
    }

    /// Field must be greater than or equal to the value.
    ///
    /// Numbers compare numerically; strings that parse as RFC 3339 timestamps
    /// compare chronologically, other strings lexicographically.
    pub fn field_gte(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Gte(field.to_string(), value.into()));
        self
    }

    pub fn matches(&self, doc: &Value) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(field, expected) => doc.get(field) == Some(expected),
            Condition::Gte(field, bound) => doc
                .get(field)
                .and_then(|actual| compare_values(actual, bound))
                .is_some_and(|ord| ord != Ordering::Less),
        })
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (
                DateTime::parse_from_rfc3339(x),
                DateTime::parse_from_rfc3339(y),
            ) {
                (Ok(x), Ok(y)) => Some(x.with_timezone(&Utc).cmp(&y.with_timezone(&Utc))),
                _ => Some(x.cmp(y)),
            }
        }
        _ => None,
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageConfig {
    #[default]
    Memory,
    File { directory: PathBuf },
}

/// Factory function to create the document store based on configuration
pub fn create_document_store(config: &StorageConfig) -> Arc<dyn DocumentStore> {
    match config {
        StorageConfig::Memory => Arc::new(MemoryDocumentStore::new()),
        StorageConfig::File { directory } => Arc::new(FileDocumentStore::new(directory.clone())),
    }
}
