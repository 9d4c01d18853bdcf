//! Notification channels
//!
//! Each channel delivers independently; a failure in one never reaches the
//! others. Email and webhook are placeholders that always report
//! "not implemented".

use super::{ChannelKind, Notification, Priority};
use crate::process::{run_command, CommandSpec, ProcessError};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use url::Url;

const DESKTOP_TITLE: &str = "Schema Sentinel";

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("{0} channel is not implemented")]
    NotImplemented(ChannelKind),

    #[error("{0} channel is not configured: {1}")]
    Misconfigured(ChannelKind, String),

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("endpoint rejected the notification with HTTP {status}")]
    Rejected { status: u16 },

    #[error("notifier command failed: {0}")]
    Command(String),

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

impl ChannelError {
    /// Worth one more attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Unreachable(_) | ChannelError::Command(_) | ChannelError::Timeout(_) => {
                true
            }
            ChannelError::Rejected { status } => *status >= 500 || *status == 429,
            ChannelError::NotImplemented(_) | ChannelError::Misconfigured(..) => false,
        }
    }
}

/// A single delivery target
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError>;

    /// Second attempt after a transient failure. Redelivers by default.
    async fn retry(&self, notification: &Notification) -> Result<(), ChannelError> {
        self.deliver(notification).await
    }
}

// ==================== Memory store ====================

/// Best-effort remote memory API
pub struct MemoryStoreChannel {
    client: reqwest::Client,
    base: Option<Url>,
}

impl MemoryStoreChannel {
    pub fn new(base: Option<Url>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ChannelError> {
        let base = self.base.as_ref().ok_or_else(|| {
            ChannelError::Misconfigured(ChannelKind::Memory, "SENTINEL_MEMORY_URL is not set".to_string())
        })?;
        // Keep any path prefix on the base URL.
        let mut base = base.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(path)
            .map_err(|e| ChannelError::Misconfigured(ChannelKind::Memory, e.to_string()))
    }

    async fn post(&self, url: Url, body: &serde_json::Value) -> Result<(), ChannelError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChannelError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationChannel for MemoryStoreChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Memory
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        let body = json!({
            "content": notification.message,
            "tags": ["schema-sentinel", notification.notification_type.to_string()],
            "metadata": {
                "id": notification.id,
                "type": notification.notification_type,
                "priority": notification.priority,
                "timestamp": notification.timestamp,
                "payload": notification.payload,
            }
        });
        self.post(self.endpoint("memories")?, &body).await
    }

    /// Falls back to the lower-level raw insert.
    async fn retry(&self, notification: &Notification) -> Result<(), ChannelError> {
        let body = serde_json::to_value(notification)
            .map_err(|e| ChannelError::Misconfigured(ChannelKind::Memory, e.to_string()))?;
        self.post(self.endpoint("memories/raw")?, &body).await
    }
}

// ==================== Desktop ====================

/// Local OS push notification via `notify-send` or `osascript`
pub struct DesktopChannel {
    timeout: Duration,
}

impl DesktopChannel {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }

    fn command(&self, notification: &Notification) -> CommandSpec {
        let spec = if cfg!(target_os = "macos") {
            let script = format!(
                "display notification \"{}\" with title \"{}\"",
                notification.message.replace('\\', "\\\\").replace('"', "\\\""),
                DESKTOP_TITLE
            );
            CommandSpec::new("osascript").arg("-e").arg(script)
        } else {
            let urgency = match notification.priority {
                Priority::Critical | Priority::High => "critical",
                Priority::Normal => "normal",
                Priority::Low => "low",
            };
            CommandSpec::new("notify-send")
                .args(["-u", urgency, DESKTOP_TITLE])
                .arg(notification.message.clone())
        };
        spec.timeout(self.timeout)
    }
}

impl Default for DesktopChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for DesktopChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Desktop
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        let spec = self.command(notification);
        match run_command(&spec).await {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(ChannelError::Command(format!(
                "`{}` exited with {}",
                spec.program, output.exit_code
            ))),
            // No notifier installed on this host.
            Err(ProcessError::Spawn { program, .. }) => Err(ChannelError::Misconfigured(
                ChannelKind::Desktop,
                format!("`{}` is not available", program),
            )),
            Err(e) => Err(ChannelError::Command(e.to_string())),
        }
    }
}

// ==================== Stubs ====================

pub struct EmailChannel;

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn deliver(&self, _notification: &Notification) -> Result<(), ChannelError> {
        Err(ChannelError::NotImplemented(ChannelKind::Email))
    }
}

pub struct WebhookChannel;

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }

    async fn deliver(&self, _notification: &Notification) -> Result<(), ChannelError> {
        Err(ChannelError::NotImplemented(ChannelKind::Webhook))
    }
}
