//! Document Store
//!
//! Small persistence seam used by the pipeline for snapshots, cycle logs and
//! the notification history. Documents live in named collections and are
//! addressed by string keys; keys sort lexically, which callers rely on for
//! chronological ordering. Append-only logs are capped and pruned oldest-first.
//!
//! Two implementations: [`FsDocumentStore`] (one JSON file per document, one
//! JSON-lines file per log) and [`MemoryDocumentStore`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Document {collection}/{key} is not valid JSON: {source}")]
    Corrupt {
        collection: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid document key: {0}")]
    InvalidKey(String),

    #[error("Failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Persistence interface shared by every durable component.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace a document.
    async fn put(&self, collection: &str, key: &str, doc: &Value) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Returns `true` when a document was removed.
    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError>;

    /// All keys in the collection, ascending.
    async fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError>;

    /// Append a record to a capped log, pruning the oldest records beyond
    /// `cap`. Returns the log length after the append.
    async fn append(&self, log: &str, record: &Value, cap: usize) -> Result<usize, StoreError>;

    /// Every record of the log, oldest first.
    async fn read_log(&self, log: &str) -> Result<Vec<Value>, StoreError>;
}

fn check_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ==================== Filesystem ====================

/// Filesystem-backed store rooted at a state directory.
pub struct FsDocumentStore {
    root: PathBuf,
    /// Serializes log rewrites within this process.
    log_lock: Mutex<()>,
}

impl FsDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            log_lock: Mutex::new(()),
        }
    }

    fn doc_path(&self, collection: &str, key: &str) -> PathBuf {
        self.root.join(collection).join(format!("{}.json", key))
    }

    fn log_path(&self, log: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", log))
    }

    async fn read_lines(&self, path: &Path) -> Result<Vec<Value>, StoreError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => records.push(value),
                Err(e) => warn!(
                    "Skipping unreadable record {} in {}: {}",
                    lineno + 1,
                    path.display(),
                    e
                ),
            }
        }
        Ok(records)
    }
}

/// Write `bytes` next to `path` and rename into place.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("doc")
    ));
    tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

#[async_trait]
impl DocumentStore for FsDocumentStore {
    async fn put(&self, collection: &str, key: &str, doc: &Value) -> Result<(), StoreError> {
        check_key(key)?;
        let bytes = serde_json::to_vec_pretty(doc)?;
        write_atomic(&self.doc_path(collection, key), &bytes).await
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        check_key(key)?;
        let path = self.doc_path(collection, key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                collection: collection.to_string(),
                key: key.to_string(),
                source,
            })
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        check_key(key)?;
        let path = self.doc_path(collection, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(collection);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut keys = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = name.strip_suffix(".json") {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn append(&self, log: &str, record: &Value, cap: usize) -> Result<usize, StoreError> {
        check_key(log)?;
        let _guard = self.log_lock.lock().await;
        let path = self.log_path(log);

        let mut records = self.read_lines(&path).await?;
        records.push(record.clone());

        if records.len() > cap {
            // Over the cap: drop the oldest records and rewrite the whole log.
            let excess = records.len() - cap;
            records.drain(..excess);
            let mut out = Vec::new();
            for r in &records {
                serde_json::to_writer(&mut out, r)?;
                out.push(b'\n');
            }
            write_atomic(&path, &out).await?;
        } else {
            let io_err = |source| StoreError::Io {
                path: path.clone(),
                source,
            };
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(io_err)?;
            file.write_all(&line).await.map_err(io_err)?;
            file.flush().await.map_err(io_err)?;
        }

        Ok(records.len())
    }

    async fn read_log(&self, log: &str) -> Result<Vec<Value>, StoreError> {
        check_key(log)?;
        self.read_lines(&self.log_path(log)).await
    }
}

// ==================== In-memory ====================

/// Volatile store, used for tests and dry runs.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
    logs: RwLock<HashMap<String, VecDeque<Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, collection: &str, key: &str, doc: &Value) -> Result<(), StoreError> {
        check_key(key)?;
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), doc.clone());
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        check_key(key)?;
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        check_key(key)?;
        Ok(self
            .collections
            .write()
            .await
            .get_mut(collection)
            .map(|c| c.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn append(&self, log: &str, record: &Value, cap: usize) -> Result<usize, StoreError> {
        check_key(log)?;
        let mut logs = self.logs.write().await;
        let entries = logs.entry(log.to_string()).or_default();
        entries.push_back(record.clone());
        while entries.len() > cap {
            entries.pop_front();
        }
        Ok(entries.len())
    }

    async fn read_log(&self, log: &str) -> Result<Vec<Value>, StoreError> {
        check_key(log)?;
        Ok(self
            .logs
            .read()
            .await
            .get(log)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fs_store_round_trips_documents_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());

        store.put("snapshots", "b", &json!({"n": 2})).await.unwrap();
        store.put("snapshots", "a", &json!({"n": 1})).await.unwrap();

        assert_eq!(store.keys("snapshots").await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            store.get("snapshots", "a").await.unwrap(),
            Some(json!({"n": 1}))
        );
        assert!(store.delete("snapshots", "a").await.unwrap());
        assert!(!store.delete("snapshots", "a").await.unwrap());
        assert_eq!(store.get("snapshots", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn fs_store_reports_corrupt_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("snapshots")).unwrap();
        std::fs::write(dir.path().join("snapshots/bad.json"), b"{ not json").unwrap();

        let err = store.get("snapshots", "bad").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn fs_log_is_capped_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocumentStore::new(dir.path());

        for i in 0..7 {
            store.append("history", &json!({ "i": i }), 5).await.unwrap();
        }

        let records = store.read_log("history").await.unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0]["i"], 2);
        assert_eq!(records[4]["i"], 6);
    }

    #[tokio::test]
    async fn memory_log_is_capped_fifo() {
        let store = MemoryDocumentStore::new();
        for i in 0..4 {
            store.append("history", &json!(i), 3).await.unwrap();
        }
        assert_eq!(
            store.read_log("history").await.unwrap(),
            vec![json!(1), json!(2), json!(3)]
        );
    }

    #[tokio::test]
    async fn keys_with_path_separators_are_rejected() {
        let store = MemoryDocumentStore::new();
        let err = store.put("c", "../escape", &json!({})).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
