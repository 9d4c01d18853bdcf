//! Snapshot Backup Manager
//!
//! Durable, retention-bounded archive of schema snapshots. Each snapshot is a
//! document in the `snapshots` collection keyed by its capture time, so the
//! lexical key order is the chronological order and the newest key is the
//! single "current" snapshot.

use crate::error::AppError;
use crate::introspection::SchemaSnapshot;
use crate::store::DocumentStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SNAPSHOT_COLLECTION: &str = "snapshots";

/// Metadata about a snapshot (lightweight, used for listing)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub key: String,
    pub id: Uuid,
    pub strategy: crate::introspection::DetectionStrategy,
    pub captured_at: DateTime<Utc>,
    pub fingerprint: String,
    pub table_count: usize,
    pub column_count: usize,
    pub index_count: usize,
}

impl SnapshotMetadata {
    fn new(key: String, snapshot: &SchemaSnapshot) -> Self {
        Self {
            key,
            id: snapshot.id,
            strategy: snapshot.strategy,
            captured_at: snapshot.captured_at,
            fingerprint: snapshot.fingerprint.clone(),
            table_count: snapshot.payload.tables.len(),
            column_count: snapshot.payload.column_count(),
            index_count: snapshot.payload.indexes.len(),
        }
    }
}

/// Format the storage key for a capture time.
pub fn snapshot_key(captured_at: &DateTime<Utc>) -> String {
    format!("snapshot-{}", captured_at.format("%Y%m%dT%H%M%S%.9fZ"))
}

/// Retention-bounded snapshot archive
pub struct BackupManager {
    store: Arc<dyn DocumentStore>,
}

impl BackupManager {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Persist a snapshot and prune the oldest beyond `keep_versions`.
    ///
    /// Returns the key the snapshot was stored under.
    pub async fn save(
        &self,
        snapshot: &SchemaSnapshot,
        keep_versions: usize,
    ) -> Result<String, AppError> {
        let keys = self.store.keys(SNAPSHOT_COLLECTION).await?;

        let base = snapshot_key(&snapshot.captured_at);
        let mut key = base.clone();
        let mut suffix = 1;
        while keys.binary_search(&key).is_ok() {
            key = format!("{}-{}", base, suffix);
            suffix += 1;
        }

        let doc = serde_json::to_value(snapshot)?;
        self.store.put(SNAPSHOT_COLLECTION, &key, &doc).await?;

        info!(
            "Saved snapshot {} ({} strategy): {} tables, {} columns",
            key,
            snapshot.strategy,
            snapshot.payload.tables.len(),
            snapshot.payload.column_count()
        );

        self.prune(keep_versions.max(1)).await?;
        Ok(key)
    }

    /// Delete the oldest snapshots, keeping the last `keep_versions`.
    pub async fn prune(&self, keep_versions: usize) -> Result<usize, AppError> {
        let keys = self.store.keys(SNAPSHOT_COLLECTION).await?;
        if keys.len() <= keep_versions {
            return Ok(0);
        }

        let excess = keys.len() - keep_versions;
        let mut removed = 0;
        for key in keys.iter().take(excess) {
            if self.store.delete(SNAPSHOT_COLLECTION, key).await? {
                removed += 1;
            }
        }

        info!("Pruned {} old snapshots", removed);
        Ok(removed)
    }

    /// The `n` most recent snapshots, newest first.
    pub async fn latest(&self, n: usize) -> Result<Vec<SchemaSnapshot>, AppError> {
        let keys = self.store.keys(SNAPSHOT_COLLECTION).await?;
        let mut snapshots = Vec::with_capacity(n.min(keys.len()));
        for key in keys.iter().rev().take(n) {
            if let Some(snapshot) = self.load(key).await? {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// The current snapshot, if any baseline has been captured.
    pub async fn current(&self) -> Result<Option<SchemaSnapshot>, AppError> {
        Ok(self.latest(1).await?.into_iter().next())
    }

    /// List all snapshots (metadata only), newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotMetadata>, AppError> {
        let keys = self.store.keys(SNAPSHOT_COLLECTION).await?;
        let mut list = Vec::with_capacity(keys.len());
        for key in keys.into_iter().rev() {
            match self.load(&key).await {
                Ok(Some(snapshot)) => list.push(SnapshotMetadata::new(key, &snapshot)),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable snapshot {}: {}", key, e),
            }
        }
        Ok(list)
    }

    pub async fn count(&self) -> Result<usize, AppError> {
        Ok(self.store.keys(SNAPSHOT_COLLECTION).await?.len())
    }

    async fn load(&self, key: &str) -> Result<Option<SchemaSnapshot>, AppError> {
        let Some(doc) = self.store.get(SNAPSHOT_COLLECTION, key).await? else {
            debug!("Snapshot {} disappeared before it could be read", key);
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(doc)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::{DetectionStrategy, SchemaPayload, TableShape};
    use crate::store::{FsDocumentStore, MemoryDocumentStore};
    use chrono::Duration;

    fn snapshot(table: &str, offset_secs: i64) -> SchemaSnapshot {
        let mut payload = SchemaPayload::default();
        payload.tables.insert(table.to_string(), TableShape::default());
        let mut snap = SchemaSnapshot::new(DetectionStrategy::Privileged, payload).unwrap();
        snap.captured_at = DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + Duration::seconds(offset_secs);
        snap
    }

    #[test]
    fn test_key_format_sorts_chronologically() {
        let a = snapshot_key(&snapshot("a", 0).captured_at);
        let b = snapshot_key(&snapshot("b", 1).captured_at);
        assert_eq!(a, "snapshot-20260301T100000.000000000Z");
        assert!(a < b);
    }

    #[tokio::test]
    async fn test_retention_keeps_most_recent() {
        let manager = BackupManager::new(Arc::new(MemoryDocumentStore::new()));
        for i in 0..7 {
            manager
                .save(&snapshot(&format!("t{}", i), i), 3)
                .await
                .unwrap();
        }

        assert_eq!(manager.count().await.unwrap(), 3);
        let latest = manager.latest(10).await.unwrap();
        let tables: Vec<String> = latest
            .iter()
            .map(|s| s.payload.tables.keys().next().cloned().unwrap())
            .collect();
        assert_eq!(tables, vec!["t6", "t5", "t4"]);
    }

    #[tokio::test]
    async fn test_current_is_newest() {
        let manager = BackupManager::new(Arc::new(MemoryDocumentStore::new()));
        assert!(manager.current().await.unwrap().is_none());

        manager.save(&snapshot("old", 0), 10).await.unwrap();
        manager.save(&snapshot("new", 5), 10).await.unwrap();

        let current = manager.current().await.unwrap().unwrap();
        assert!(current.payload.tables.contains_key("new"));
    }

    #[tokio::test]
    async fn test_same_timestamp_gets_suffix() {
        let manager = BackupManager::new(Arc::new(MemoryDocumentStore::new()));
        let first = manager.save(&snapshot("a", 0), 10).await.unwrap();
        let second = manager.save(&snapshot("b", 0), 10).await.unwrap();

        assert_ne!(first, second);
        assert!(second.starts_with(&first));
        assert_eq!(manager.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_snapshots_are_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(Arc::new(FsDocumentStore::new(dir.path())));
        let key = manager.save(&snapshot("users", 0), 10).await.unwrap();

        let file = dir.path().join("snapshots").join(format!("{}.json", key));
        assert!(file.exists());

        let list = manager.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].table_count, 1);
    }
}
