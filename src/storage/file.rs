// JSON-file document store
// One directory per collection, one file per document

use super::{DocumentFilter, DocumentStore, StorageError};
use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Document store persisting each document as `<root>/<collection>/<id>.json`
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collection_dir(&self, collection: &str) -> PathBuf {
        self.root.join(encode_key(collection))
    }

    fn document_path(&self, collection: &str, id: &str) -> PathBuf {
        self.collection_dir(collection)
            .join(format!("{}.json", encode_key(id)))
    }
}

/// Escape everything outside `[A-Za-z0-9_-]` so IDs map to distinct, safe file names
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

async fn read_document(path: &Path) -> Result<Option<Value>, StorageError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StorageError> {
        let dir = self.collection_dir(collection);
        fs::create_dir_all(&dir).await?;

        let path = self.document_path(collection, id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&doc)?;

        // Write then rename so readers never observe a partial document
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;

        debug!("Wrote document {}", path.display());
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StorageError> {
        read_document(&self.document_path(collection, id)).await
    }

    async fn query(
        &self,
        collection: &str,
        filter: &DocumentFilter,
    ) -> Result<Vec<Value>, StorageError> {
        let dir = self.collection_dir(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            match read_document(&path).await {
                Ok(Some(doc)) if filter.matches(&doc) => results.push(doc),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable document {}: {}", path.display(), e),
            }
        }

        Ok(results)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).await?;
        fs::metadata(&self.root).await?;
        Ok(())
    }
}
