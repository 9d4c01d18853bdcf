//! Notification history
//!
//! Append-only JSON-lines log capped at [`HISTORY_CAP`] records, oldest
//! pruned first.

use super::Notification;
use crate::error::AppError;
use crate::store::DocumentStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub const HISTORY_LOG: &str = "notifications";
pub const HISTORY_CAP: usize = 1000;

pub struct NotificationHistory {
    store: Arc<dyn DocumentStore>,
    cap: usize,
}

impl NotificationHistory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_cap(store, HISTORY_CAP)
    }

    pub fn with_cap(store: Arc<dyn DocumentStore>, cap: usize) -> Self {
        Self {
            store,
            cap: cap.max(1),
        }
    }

    /// Returns the history length after the append.
    pub async fn append(&self, notification: &Notification) -> Result<usize, AppError> {
        let record = serde_json::to_value(notification)?;
        Ok(self.store.append(HISTORY_LOG, &record, self.cap).await?)
    }

    async fn all(&self) -> Result<Vec<Notification>, AppError> {
        let records = self.store.read_log(HISTORY_LOG).await?;
        Ok(parse(records))
    }

    /// The `n` most recent notifications, newest first.
    pub async fn recent(&self, n: usize) -> Result<Vec<Notification>, AppError> {
        let mut all = self.all().await?;
        all.reverse();
        all.truncate(n);
        Ok(all)
    }

    pub async fn count(&self) -> Result<usize, AppError> {
        Ok(self.store.read_log(HISTORY_LOG).await?.len())
    }

    /// Newest entries, total and per-type counts from one read of the log.
    pub async fn summary(&self, recent: usize) -> Result<HistorySummary, AppError> {
        let records = self.store.read_log(HISTORY_LOG).await?;
        let total = records.len();
        let all = parse(records);

        let mut by_type = BTreeMap::new();
        for n in &all {
            *by_type.entry(n.notification_type.to_string()).or_insert(0) += 1;
        }
        let recent = all.into_iter().rev().take(recent).collect();

        Ok(HistorySummary {
            recent,
            total,
            by_type,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistorySummary {
    /// Newest first.
    pub recent: Vec<Notification>,
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
}

fn parse(records: Vec<serde_json::Value>) -> Vec<Notification> {
    let mut notifications = Vec::with_capacity(records.len());
    for record in records {
        match serde_json::from_value(record) {
            Ok(n) => notifications.push(n),
            Err(e) => warn!("Skipping malformed notification record: {}", e),
        }
    }
    notifications
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationType;
    use crate::store::MemoryDocumentStore;
    use crate::testing::CountingStore;
    use serde_json::json;

    #[tokio::test]
    async fn history_never_exceeds_cap() {
        let history = NotificationHistory::with_cap(Arc::new(MemoryDocumentStore::new()), 5);
        for i in 0..8 {
            let n = Notification::new(NotificationType::SyncComplete, format!("sync {}", i), json!({}));
            history.append(&n).await.unwrap();
        }

        assert_eq!(history.count().await.unwrap(), 5);
        let recent = history.recent(2).await.unwrap();
        assert_eq!(recent[0].message, "sync 7");
        assert_eq!(recent[1].message, "sync 6");
    }

    #[tokio::test]
    async fn summary_groups_by_type() {
        let history = NotificationHistory::new(Arc::new(MemoryDocumentStore::new()));
        history
            .append(&Notification::new(NotificationType::Error, "boom", json!({})))
            .await
            .unwrap();
        history
            .append(&Notification::new(NotificationType::Error, "boom again", json!({})))
            .await
            .unwrap();
        history
            .append(&Notification::new(NotificationType::SchemaChange, "new table", json!({})))
            .await
            .unwrap();

        let summary = history.summary(2).await.unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_type.get("error"), Some(&2));
        assert_eq!(summary.by_type.get("schema_change"), Some(&1));
        assert_eq!(summary.recent.len(), 2);
        assert_eq!(summary.recent[0].message, "new table");
        assert_eq!(summary.recent[1].message, "boom again");
    }

    #[tokio::test]
    async fn summary_reads_the_log_once() {
        let store = Arc::new(CountingStore::new());
        let history = NotificationHistory::new(store.clone());
        for i in 0..3 {
            let n = Notification::new(NotificationType::SyncComplete, format!("sync {}", i), json!({}));
            history.append(&n).await.unwrap();
        }

        let summary = history.summary(10).await.unwrap();

        assert_eq!(store.log_reads(), 1);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_type.get("sync_complete"), Some(&3));
        assert_eq!(summary.recent[0].message, "sync 2");
    }
}
