//! Dashboard read model
//!
//! [`DashboardHub`] assembles a [`DashboardState`] from persisted state (the
//! config document, the latest snapshot and the notification history) and
//! republishes it to push subscribers over a broadcast channel whenever a
//! refresh observes a new fingerprint, a new notification or a new cycle
//! outcome. The hub never writes durable state itself.

use crate::config::{CycleStatus, PendingCommit, PendingRegeneration, ProjectIdentity};
use crate::detector::StrategyMode;
use crate::error::AppError;
use crate::introspection::SchemaSnapshot;
use crate::notify::Notification;
use crate::pipeline::Pipeline;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Buffered updates per subscriber before it starts lagging.
const UPDATE_CAPACITY: usize = 64;

// ==================== Read model ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardStats {
    pub total_notifications: usize,
    pub notifications_by_type: BTreeMap<String, usize>,
    pub snapshot_count: usize,
    pub subscribers: usize,
    pub uptime_secs: u64,
    /// Id of the newest history entry. Still moves once the history is full.
    pub latest_notification: Option<Uuid>,
}

/// Everything the dashboard shows
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardState {
    pub status: HealthStatus,
    pub project: ProjectIdentity,
    pub strategy: StrategyMode,
    pub schema: Option<SchemaSnapshot>,
    pub notifications: Vec<Notification>,
    pub stats: DashboardStats,
    pub last_cycle: Option<CycleStatus>,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_commit: Option<PendingCommit>,
    pub pending_regeneration: Option<PendingRegeneration>,
    pub cycle_in_flight: bool,
    pub generated_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn fingerprint(&self) -> Option<&str> {
        self.schema.as_ref().map(|s| s.fingerprint.as_str())
    }
}

/// What a refresh compares to decide whether subscribers need an update
#[derive(Debug, Clone, PartialEq, Eq)]
struct ObservedKey {
    fingerprint: Option<String>,
    latest_notification: Option<Uuid>,
    last_cycle: Option<(DateTime<Utc>, bool)>,
    pending_commit: bool,
    pending_regeneration: bool,
}

impl ObservedKey {
    fn of(state: &DashboardState) -> Self {
        Self {
            fingerprint: state.fingerprint().map(str::to_string),
            latest_notification: state.stats.latest_notification,
            last_cycle: state.last_cycle.as_ref().map(|c| (c.at, c.healthy)),
            pending_commit: state.pending_commit.is_some(),
            pending_regeneration: state.pending_regeneration.is_some(),
        }
    }
}

// ==================== Hub ====================

pub struct DashboardHub {
    pipeline: Arc<Pipeline>,
    sender: broadcast::Sender<DashboardState>,
    subscribers: Arc<AtomicUsize>,
    observed: Mutex<Option<ObservedKey>>,
    recent: usize,
    started: Instant,
}

/// Keeps the subscriber count accurate for as long as a stream is open
pub struct SubscriberGuard {
    subscribers: Arc<AtomicUsize>,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let left = self.subscribers.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("Dashboard subscriber left ({} remaining)", left);
    }
}

impl DashboardHub {
    pub fn new(pipeline: Arc<Pipeline>, recent_notifications: usize) -> Self {
        let (sender, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            pipeline,
            sender,
            subscribers: Arc::new(AtomicUsize::new(0)),
            observed: Mutex::new(None),
            recent: recent_notifications,
            started: Instant::now(),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> (broadcast::Receiver<DashboardState>, SubscriberGuard) {
        let receiver = self.sender.subscribe();
        let count = self.subscribers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Dashboard subscriber joined ({} connected)", count);
        (
            receiver,
            SubscriberGuard {
                subscribers: self.subscribers.clone(),
            },
        )
    }

    /// Build the current state from disk.
    pub async fn read_state(&self) -> Result<DashboardState, AppError> {
        // The monitor unit writes the document; pick up its latest version.
        let store = self.pipeline.config();
        store.reload().await?;
        let config = store.get().await;

        let backups = self.pipeline.backups();
        let history = self.pipeline.notifier().history();
        let schema = backups.current().await?;
        let mut history = history.summary(self.recent.max(1)).await?;
        let latest_notification = history.recent.first().map(|n| n.id);
        history.recent.truncate(self.recent);

        let status = match &config.last_cycle {
            Some(cycle) if !cycle.healthy => HealthStatus::Error,
            _ => HealthStatus::Healthy,
        };

        Ok(DashboardState {
            status,
            project: config.project.clone(),
            strategy: self.pipeline.detector().mode().clone(),
            schema,
            notifications: history.recent,
            stats: DashboardStats {
                total_notifications: history.total,
                notifications_by_type: history.by_type,
                snapshot_count: backups.count().await?,
                subscribers: self.subscriber_count(),
                uptime_secs: self.started.elapsed().as_secs(),
                latest_notification,
            },
            last_cycle: config.last_cycle,
            last_sync: config.last_sync,
            pending_commit: config.pending_commit,
            pending_regeneration: config.pending_regeneration,
            cycle_in_flight: self.pipeline.is_busy(),
            generated_at: Utc::now(),
        })
    }

    /// Re-read state and publish it when the fingerprint, the newest
    /// notification, the last cycle or a pending stage changed. Returns the
    /// published state, if any.
    pub async fn refresh(&self) -> Result<Option<DashboardState>, AppError> {
        let state = self.read_state().await?;
        let key = ObservedKey::of(&state);

        let mut observed = self.observed.lock().await;
        let changed = observed.as_ref() != Some(&key);
        *observed = Some(key);
        drop(observed);

        if !changed {
            return Ok(None);
        }

        // No receivers only means nobody is watching.
        let delivered = self.sender.send(state.clone()).unwrap_or(0);
        debug!("Published dashboard update to {} subscriber(s)", delivered);
        Ok(Some(state))
    }

    /// Periodic refresh until cancelled.
    pub async fn run_refresh_loop(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        info!("🔄 Dashboard refresh every {:?}", period);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Dashboard refresh loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("Dashboard refresh failed: {}", e);
                    }
                }
            }
        }
    }
}
