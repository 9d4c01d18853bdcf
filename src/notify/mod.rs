//! Notification Fan-out
//!
//! A [`Notification`] is dispatched concurrently to every enabled channel.
//! Each delivery runs under its own timeout and gets at most one retry for a
//! transient failure. The stored notification lists only the channels that
//! acknowledged, and is appended exactly once to the history whatever the
//! channels did.

pub mod channels;
pub mod history;

use crate::error::AppError;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use channels::{
    ChannelError, DesktopChannel, EmailChannel, MemoryStoreChannel, NotificationChannel,
    WebhookChannel,
};
pub use history::{HistorySummary, NotificationHistory, HISTORY_CAP};

/// Default per-channel delivery timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Notification channel identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Memory,
    Desktop,
    Email,
    Webhook,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Memory => write!(f, "memory"),
            ChannelKind::Desktop => write!(f, "desktop"),
            ChannelKind::Email => write!(f, "email"),
            ChannelKind::Webhook => write!(f, "webhook"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    SchemaChange,
    Error,
    ValidationFailed,
    TypeRegenerated,
    SyncComplete,
}

impl NotificationType {
    pub fn default_priority(self) -> Priority {
        match self {
            NotificationType::SchemaChange => Priority::High,
            NotificationType::Error => Priority::Critical,
            NotificationType::ValidationFailed => Priority::High,
            NotificationType::TypeRegenerated => Priority::Normal,
            NotificationType::SyncComplete => Priority::Low,
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationType::SchemaChange => "schema_change",
            NotificationType::Error => "error",
            NotificationType::ValidationFailed => "validation_failed",
            NotificationType::TypeRegenerated => "type_regenerated",
            NotificationType::SyncComplete => "sync_complete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// A structured event, as persisted in the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub message: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub timestamp: DateTime<Utc>,
    /// Channels that acknowledged delivery.
    #[serde(default)]
    pub channels: Vec<ChannelKind>,
}

impl Notification {
    pub fn new(
        notification_type: NotificationType,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notification_type,
            message: message.into(),
            payload,
            priority: notification_type.default_priority(),
            timestamp: Utc::now(),
            channels: Vec::new(),
        }
    }
}

// ==================== Notifier ====================

pub struct Notifier {
    channels: Vec<Arc<dyn NotificationChannel>>,
    history: NotificationHistory,
    timeout: Duration,
}

impl Notifier {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>, history: NotificationHistory) -> Self {
        Self {
            channels,
            history,
            timeout: DELIVERY_TIMEOUT,
        }
    }

    /// The four standard channels.
    pub fn standard(memory_url: Option<url::Url>, history: NotificationHistory) -> Self {
        Self::new(
            vec![
                Arc::new(MemoryStoreChannel::new(memory_url)),
                Arc::new(DesktopChannel::new()),
                Arc::new(EmailChannel),
                Arc::new(WebhookChannel),
            ],
            history,
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn history(&self) -> &NotificationHistory {
        &self.history
    }

    /// Dispatch to every enabled channel and record the outcome.
    ///
    /// Channel failures never surface here; only a history write failure does.
    pub async fn send(
        &self,
        enabled: &[ChannelKind],
        mut notification: Notification,
    ) -> Result<Notification, AppError> {
        let targets: Vec<&Arc<dyn NotificationChannel>> = self
            .channels
            .iter()
            .filter(|c| enabled.contains(&c.kind()))
            .collect();

        let outcomes = join_all(
            targets
                .iter()
                .map(|channel| self.deliver_one(channel.as_ref(), &notification)),
        )
        .await;

        notification.channels = targets
            .iter()
            .zip(outcomes)
            .filter_map(|(channel, ok)| ok.then(|| channel.kind()))
            .collect();

        self.history.append(&notification).await?;
        info!(
            "📣 {} notification delivered to [{}]: {}",
            notification.notification_type,
            notification
                .channels
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            notification.message
        );
        Ok(notification)
    }

    async fn deliver_one(&self, channel: &dyn NotificationChannel, notification: &Notification) -> bool {
        let first = self.attempt(channel.deliver(notification)).await;
        let err = match first {
            Ok(()) => return true,
            Err(e) => e,
        };

        if !err.is_transient() {
            debug!("{} channel skipped: {}", channel.kind(), err);
            return false;
        }

        warn!("{} channel failed, retrying once: {}", channel.kind(), err);
        match self.attempt(channel.retry(notification)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{} channel failed after retry: {}", channel.kind(), e);
                false
            }
        }
    }

    async fn attempt<F>(&self, delivery: F) -> Result<(), ChannelError>
    where
        F: std::future::Future<Output = Result<(), ChannelError>>,
    {
        match tokio::time::timeout(self.timeout, delivery).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;
    use crate::testing::{FailingChannel, RecordingChannel};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn history() -> NotificationHistory {
        NotificationHistory::new(Arc::new(MemoryDocumentStore::new()))
    }

    #[test]
    fn priorities_follow_type() {
        let n = Notification::new(NotificationType::Error, "boom", json!({}));
        assert_eq!(n.priority, Priority::Critical);
        assert_eq!(
            NotificationType::SyncComplete.default_priority(),
            Priority::Low
        );
    }

    #[test]
    fn notification_serializes_type_in_snake_case() {
        let n = Notification::new(NotificationType::ValidationFailed, "tsc failed", json!({}));
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "validation_failed");
        assert_eq!(value["priority"], "high");
    }

    #[tokio::test]
    async fn failing_channel_does_not_block_others() {
        let ok = Arc::new(RecordingChannel::new(ChannelKind::Memory));
        let broken = Arc::new(FailingChannel::permanent(ChannelKind::Desktop));
        let notifier = Notifier::new(vec![ok.clone(), broken.clone()], history());

        let sent = notifier
            .send(
                &[ChannelKind::Memory, ChannelKind::Desktop],
                Notification::new(NotificationType::SchemaChange, "new table", json!({})),
            )
            .await
            .unwrap();

        assert_eq!(sent.channels, vec![ChannelKind::Memory]);
        assert_eq!(ok.delivered().await.len(), 1);
        assert_eq!(notifier.history().count().await.unwrap(), 1);
        // Permanent failures are not retried.
        assert_eq!(broken.attempts(), 1);
    }

    #[tokio::test]
    async fn transient_failure_gets_exactly_one_retry() {
        let flaky = Arc::new(FailingChannel::transient(ChannelKind::Memory, 1));
        let notifier = Notifier::new(vec![flaky.clone()], history());

        let sent = notifier
            .send(
                &[ChannelKind::Memory],
                Notification::new(NotificationType::SyncComplete, "synced", json!({})),
            )
            .await
            .unwrap();
        assert_eq!(sent.channels, vec![ChannelKind::Memory]);
        assert_eq!(flaky.attempts(), 2);

        let dead = Arc::new(FailingChannel::transient(ChannelKind::Memory, 10));
        let notifier = Notifier::new(vec![dead.clone()], history());
        let sent = notifier
            .send(
                &[ChannelKind::Memory],
                Notification::new(NotificationType::SyncComplete, "synced", json!({})),
            )
            .await
            .unwrap();
        assert!(sent.channels.is_empty());
        assert_eq!(dead.attempts(), 2);
    }

    #[tokio::test]
    async fn disabled_channels_are_not_contacted() {
        let memory = Arc::new(RecordingChannel::new(ChannelKind::Memory));
        let desktop = Arc::new(RecordingChannel::new(ChannelKind::Desktop));
        let notifier = Notifier::new(vec![memory.clone(), desktop.clone()], history());

        notifier
            .send(
                &[ChannelKind::Desktop],
                Notification::new(NotificationType::Error, "boom", json!({})),
            )
            .await
            .unwrap();

        assert!(memory.delivered().await.is_empty());
        assert_eq!(desktop.delivered().await.len(), 1);
    }

    #[tokio::test]
    async fn slow_channel_times_out() {
        let slow = Arc::new(RecordingChannel::new(ChannelKind::Webhook).with_delay(Duration::from_millis(200)));
        let notifier = Notifier::new(vec![slow], history()).with_timeout(Duration::from_millis(20));

        let sent = notifier
            .send(
                &[ChannelKind::Webhook],
                Notification::new(NotificationType::Error, "boom", json!({})),
            )
            .await
            .unwrap();
        assert!(sent.channels.is_empty());
        assert_eq!(notifier.history().count().await.unwrap(), 1);
    }
}
