//! Orchestrator
//!
//! Owns the lifecycle of one sentinel instance and maps every CLI command
//! onto a method. `start` supervises two child units (the detection loop and
//! the dashboard server), which re-enter this module through the hidden
//! `monitor` and `dashboard` commands and share state only through the
//! state directory.

use crate::bindings::BindingsOutcome;
use crate::config::{
    ConfigStore, CycleStatus, Credentials, FeatureToggles, OperationalConfig, PendingCommit,
    PendingRegeneration, ProjectIdentity, StatePaths,
};
use crate::dashboard::DashboardHub;
use crate::detector::{SchemaDetector, StrategyMode};
use crate::error::AppError;
use crate::notify::{NotificationHistory, Notifier};
use crate::pipeline::{CycleReport, CycleTrigger, Pipeline, ValidationReport};
use crate::routes::create_router;
use crate::snapshot::store::SnapshotMetadata;
use crate::snapshot::BackupManager;
use crate::state::AppState;
use crate::store::{write_atomic, DocumentStore, FsDocumentStore};
use crate::supervisor::{process_alive, send_sigterm, RestartPolicy, Supervisor, UnitSpec};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the running instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Init,
    ProbeStrategy,
    Running,
    Stopping,
    Stopped,
}

/// Printed by `status`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub configured: bool,
    pub running: bool,
    pub pid: Option<u32>,
    pub config_path: PathBuf,
    pub project: ProjectIdentity,
    pub interval_secs: u64,
    pub features: FeatureToggles,
    pub fingerprint: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleStatus>,
    pub pending_commit: Option<PendingCommit>,
    pub pending_regeneration: Option<PendingRegeneration>,
    pub snapshot_count: usize,
    /// Retained snapshots, newest first.
    pub snapshots: Vec<SnapshotMetadata>,
    pub notification_count: usize,
}

/// Printed by `setup`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupOutcome {
    pub config_path: PathBuf,
    pub created: bool,
    pub strategy: Option<StrategyMode>,
    pub pulled: bool,
}

pub struct Orchestrator {
    paths: StatePaths,
    credentials: Credentials,
    lifecycle: watch::Sender<Lifecycle>,
}

impl Orchestrator {
    pub fn new(paths: StatePaths, credentials: Credentials) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Init);
        Self {
            paths,
            credentials,
            lifecycle,
        }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    fn transition(&self, next: Lifecycle) {
        let previous = self.lifecycle.send_replace(next);
        if previous != next {
            debug!("Lifecycle {:?} -> {:?}", previous, next);
        }
    }

    // ==================== Wiring ====================

    async fn load_config(&self) -> Result<Arc<ConfigStore>, AppError> {
        let store = ConfigStore::load(self.paths.config_file()).await?;
        Ok(Arc::new(store))
    }

    fn document_store(&self) -> Arc<dyn DocumentStore> {
        Arc::new(FsDocumentStore::new(&self.paths.state_dir))
    }

    /// Load config, probe the strategy once and wire the pipeline.
    pub async fn build_pipeline(&self) -> Result<Arc<Pipeline>, AppError> {
        let config_store = self.load_config().await?;
        let config = config_store.get().await;

        self.transition(Lifecycle::ProbeStrategy);
        let detector =
            SchemaDetector::probe(&config, &self.credentials, &self.paths.project_root).await;

        let store = self.document_store();
        let notifier = Notifier::standard(
            self.credentials.memory_url.clone(),
            NotificationHistory::new(store.clone()),
        );

        Ok(Arc::new(Pipeline::new(
            config_store,
            Arc::new(detector),
            store,
            notifier,
            &self.paths,
            &config,
        )))
    }

    // ==================== Commands ====================

    /// Supervise the detection loop and the dashboard until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), AppError> {
        let config = self.load_config().await?.get().await;

        if let Some(pid) = self.read_pid().await? {
            if pid != std::process::id() && process_alive(pid) {
                return Err(AppError::Internal(format!(
                    "already running as pid {}",
                    pid
                )));
            }
            warn!("Removing stale pid file for pid {}", pid);
        }
        let pid_file = self.paths.pid_file();
        write_atomic(&pid_file, format!("{}\n", std::process::id()).as_bytes()).await?;

        let exe = std::env::current_exe()?;
        let program = exe.to_string_lossy().to_string();
        let unit = |name: &str| {
            UnitSpec::new(name, program.clone())
                .arg("--project-root")
                .arg(self.paths.project_root.to_string_lossy())
                .arg("--state-dir")
                .arg(self.paths.state_dir.to_string_lossy())
                .arg(name)
        };

        self.transition(Lifecycle::Running);
        info!(
            "🚀 Supervising monitor (every {}s) and dashboard on {}:{}",
            config.interval_secs, config.dashboard.host, config.dashboard.port
        );

        let supervisor = Supervisor::new(RestartPolicy::from(&config.supervisor));
        let result = supervisor
            .run_all(vec![unit("monitor"), unit("dashboard")], cancel)
            .await;

        self.transition(Lifecycle::Stopping);
        if let Err(e) = tokio::fs::remove_file(&pid_file).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove pid file {}: {}", pid_file.display(), e);
            }
        }
        self.transition(Lifecycle::Stopped);
        result
    }

    /// Signal a running instance. Returns whether one was running.
    pub async fn stop(&self) -> Result<bool, AppError> {
        let pid_file = self.paths.pid_file();
        let Some(pid) = self.read_pid().await? else {
            info!("No running instance (no pid file)");
            return Ok(false);
        };

        if !process_alive(pid) {
            warn!("Pid {} is not running, removing stale pid file", pid);
            tokio::fs::remove_file(&pid_file).await?;
            return Ok(false);
        }

        info!("🛑 Sending SIGTERM to pid {}", pid);
        if !send_sigterm(pid) {
            return Err(AppError::Internal(format!("failed to signal pid {}", pid)));
        }

        let grace = self.load_config().await?.get().await.supervisor.shutdown_grace_secs;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(grace + 5);
        while process_alive(pid) {
            if tokio::time::Instant::now() >= deadline {
                warn!("Pid {} still running after {}s", pid, grace + 5);
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        info!("Instance {} stopped", pid);
        Ok(true)
    }

    /// Read-only summary of persisted state.
    pub async fn status(&self) -> Result<StatusSummary, AppError> {
        let config_path = self.paths.config_file();
        let configured = tokio::fs::try_exists(&config_path).await?;
        let config = self.load_config().await?.get().await;
        let pid = self.read_pid().await?;

        let store = self.document_store();
        let backups = BackupManager::new(store.clone());
        let history = NotificationHistory::new(store);
        let snapshots = backups.list().await?;

        Ok(StatusSummary {
            configured,
            running: pid.is_some_and(process_alive),
            pid,
            config_path,
            project: config.project.clone(),
            interval_secs: config.interval_secs,
            features: config.features.clone(),
            fingerprint: config.last_fingerprint.clone(),
            last_sync: config.last_sync,
            last_cycle: config.last_cycle.clone(),
            pending_commit: config.pending_commit.clone(),
            pending_regeneration: config.pending_regeneration.clone(),
            snapshot_count: snapshots.len(),
            snapshots,
            notification_count: history.count().await?,
        })
    }

    /// One detection cycle, now.
    pub async fn check(&self) -> Result<CycleReport, AppError> {
        let pipeline = self.build_pipeline().await?;
        self.transition(Lifecycle::Running);
        let report = pipeline.run_cycle(CycleTrigger::Cli).await;
        self.transition(Lifecycle::Stopped);
        report
    }

    pub async fn types(&self) -> Result<BindingsOutcome, AppError> {
        let pipeline = self.build_pipeline().await?;
        pipeline.regenerate_bindings().await
    }

    pub async fn validate(&self) -> Result<ValidationReport, AppError> {
        let pipeline = self.build_pipeline().await?;
        pipeline.validate().await
    }

    /// Write the config document if missing; with `pull`, sync remote schema
    /// files into the project.
    pub async fn setup(&self, pull: bool) -> Result<SetupOutcome, AppError> {
        let config_path = self.paths.config_file();
        let existing = ConfigStore::read_document(&config_path).await?;
        let created = existing.is_none();
        if created {
            let store = ConfigStore::with_config(&config_path, OperationalConfig::default());
            store.persist().await?;
            info!("📝 Created {}", config_path.display());
        } else {
            info!("Configuration already present at {}", config_path.display());
        }

        let mut outcome = SetupOutcome {
            config_path,
            created,
            strategy: None,
            pulled: false,
        };
        if pull {
            let pipeline = self.build_pipeline().await?;
            outcome.strategy = Some(pipeline.detector().mode().clone());
            pipeline.sync().await?;
            outcome.pulled = true;
        }
        Ok(outcome)
    }

    // ==================== Units ====================

    /// Detection loop unit.
    pub async fn run_monitor(&self, cancel: CancellationToken) -> Result<(), AppError> {
        let pipeline = self.build_pipeline().await?;
        let config = pipeline.config().get().await;
        self.transition(Lifecycle::Running);
        info!(
            "👀 Watching schema every {}s using {} detection",
            config.interval_secs,
            pipeline.detector().strategy()
        );

        let result = monitor_loop(
            pipeline,
            Duration::from_secs(config.interval_secs),
            Duration::from_secs(config.supervisor.shutdown_grace_secs),
            cancel,
        )
        .await;

        self.transition(Lifecycle::Stopped);
        result
    }

    /// Dashboard server unit.
    pub async fn run_dashboard(&self, cancel: CancellationToken) -> Result<(), AppError> {
        let pipeline = self.build_pipeline().await?;
        let config = pipeline.config().get().await;

        let hub = Arc::new(DashboardHub::new(
            pipeline,
            config.dashboard.recent_notifications,
        ));
        let refresh = tokio::spawn(hub.clone().run_refresh_loop(
            Duration::from_secs(config.dashboard.refresh_secs),
            cancel.clone(),
        ));

        let app = create_router(Arc::new(AppState::new(hub)));
        let addr = SocketAddr::from((config.dashboard.host, config.dashboard.port));
        let listener = TcpListener::bind(addr).await?;
        self.transition(Lifecycle::Running);
        info!("🌐 Dashboard listening on http://{}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .await?;

        self.transition(Lifecycle::Stopping);
        cancel.cancel();
        if let Err(e) = refresh.await {
            warn!("Dashboard refresh task ended abnormally: {}", e);
        }
        self.transition(Lifecycle::Stopped);
        info!("👋 Dashboard shutdown complete");
        Ok(())
    }

    async fn read_pid(&self) -> Result<Option<u32>, AppError> {
        match tokio::fs::read_to_string(self.paths.pid_file()).await {
            Ok(raw) => Ok(raw.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fixed-interval detection. An overlapping tick is skipped. On cancel the
/// timer stops at once and an in-flight cycle gets `grace` to finish.
pub async fn monitor_loop(
    pipeline: Arc<Pipeline>,
    period: Duration,
    grace: Duration,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let cycle = pipeline.run_cycle(CycleTrigger::Timer);
        tokio::pin!(cycle);
        let result = tokio::select! {
            result = &mut cycle => result,
            _ = cancel.cancelled() => {
                info!("Waiting up to {:?} for the in-flight cycle", grace);
                match tokio::time::timeout(grace, &mut cycle).await {
                    Ok(result) => {
                        settle(result)?;
                    }
                    Err(_) => warn!("⚠️  In-flight cycle abandoned after {:?}", grace),
                }
                break;
            }
        };
        settle(result)?;
    }

    info!("Detection loop stopped");
    Ok(())
}

fn settle(result: Result<CycleReport, AppError>) -> Result<(), AppError> {
    match result {
        Ok(report) => {
            debug!("Cycle {} outcome {:?}", report.id, report.outcome);
            Ok(())
        }
        Err(AppError::CycleInFlight) => {
            info!("Previous cycle still running, skipping this tick");
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            error!("❌ Fatal error, stopping detection loop: {}", e);
            Err(e)
        }
        // Already logged and notified by the pipeline; retried next tick.
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dashboard::tests::fixture;

    fn orchestrator(dir: &tempfile::TempDir) -> Orchestrator {
        Orchestrator::new(StatePaths::new(dir.path(), None), Credentials::default())
    }

    #[tokio::test]
    async fn setup_creates_config_once() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);

        let first = orch.setup(false).await.unwrap();
        assert!(first.created);
        assert!(first.config_path.exists());
        assert!(!first.pulled);

        let second = orch.setup(false).await.unwrap();
        assert!(!second.created);
    }

    #[tokio::test]
    async fn status_reads_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);

        let status = orch.status().await.unwrap();
        assert!(!status.configured);
        assert!(!status.running);
        assert_eq!(status.pid, None);
        assert_eq!(status.snapshot_count, 0);
        assert_eq!(orch.lifecycle(), Lifecycle::Init);
    }

    #[tokio::test]
    async fn stop_without_instance_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        assert!(!orch.stop().await.unwrap());
    }

    #[tokio::test]
    async fn stop_clears_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        let pid_file = orch.paths().pid_file();
        std::fs::create_dir_all(pid_file.parent().unwrap()).unwrap();
        std::fs::write(&pid_file, "2000000000\n").unwrap();

        assert!(!orch.stop().await.unwrap());
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn corrupt_config_is_fatal_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir);
        let config_file = orch.paths().config_file();
        std::fs::create_dir_all(config_file.parent().unwrap()).unwrap();
        std::fs::write(&config_file, "{ not json").unwrap();

        let err = orch.check().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn monitor_loop_ticks_until_cancelled() {
        let f = fixture().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        monitor_loop(
            f.hub.pipeline().clone(),
            Duration::from_millis(50),
            Duration::from_secs(1),
            cancel,
        )
        .await
        .unwrap();

        assert!(f.backend.detect_calls() >= 2);
    }

    #[tokio::test]
    async fn monitor_loop_lets_in_flight_cycle_finish() {
        let f = fixture().await;
        f.backend.set_delay(Duration::from_millis(200)).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        monitor_loop(
            f.hub.pipeline().clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
            cancel,
        )
        .await
        .unwrap();

        assert_eq!(f.backend.detect_calls(), 1);
        let snapshots = f.hub.pipeline().backups().count().await.unwrap();
        assert_eq!(snapshots, 1);
    }
}
