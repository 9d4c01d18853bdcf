//! Detection cycle
//!
//! One cycle: DETECT → CLASSIFY → (NO_OP | HANDLE_CHANGE), where
//! HANDLE_CHANGE is BACKUP → NOTIFY → [REGENERATE_BINDINGS] →
//! [VALIDATE_AND_COMMIT]. Stages run strictly in sequence; the notification
//! fan-out is the only concurrent step. The [`Pipeline`] owns every durable
//! mutation; the dashboard and CLI go through it.

use super::commit::{compose_message, CommitGate, CommitRecord};
use super::docs::render_schema_docs;
use super::gate::CycleGate;
use super::validation::{CheckConfig, ValidationGate, ValidationReport};
use crate::bindings::{BindingRegenerator, BindingsOutcome};
use crate::config::{
    ConfigStore, CycleStatus, OperationalConfig, PendingCommit, PendingRegeneration, StatePaths,
};
use crate::detector::SchemaDetector;
use crate::error::AppError;
use crate::introspection::{DetectionStrategy, SchemaSnapshot};
use crate::notify::{Notification, NotificationType, Notifier};
use crate::snapshot::{BackupManager, ChangeClassifier, ChangeSet, Classification};
use crate::store::{write_atomic, DocumentStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Collection holding one JSON record per change cycle.
pub const CYCLE_LOG_COLLECTION: &str = "logs";
const CYCLE_LOG_KEEP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleTrigger {
    Timer,
    Manual,
    Cli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Baseline,
    NoChange,
    Changed,
    Failed,
}

/// What one cycle did
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub id: Uuid,
    pub trigger: CycleTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: CycleOutcome,
    pub strategy: Option<DetectionStrategy>,
    pub fingerprint: Option<String>,
    pub snapshot_key: Option<String>,
    pub change: Option<ChangeSet>,
    pub bindings: Option<BindingsOutcome>,
    pub validation: Option<ValidationReport>,
    pub notifications: Vec<NotificationType>,
    /// Degraded detection or a failed downstream stage.
    pub warnings: Vec<String>,
    pub error: Option<String>,
    #[serde(skip)]
    pending_commit: Option<PendingCommit>,
    #[serde(skip)]
    pending_regeneration: Option<PendingRegeneration>,
}

impl CycleReport {
    fn new(trigger: CycleTrigger) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            trigger,
            started_at: now,
            finished_at: now,
            outcome: CycleOutcome::Failed,
            strategy: None,
            fingerprint: None,
            snapshot_key: None,
            change: None,
            bindings: None,
            validation: None,
            notifications: Vec::new(),
            warnings: Vec::new(),
            error: None,
            pending_commit: None,
            pending_regeneration: None,
        }
    }

    pub fn commit(&self) -> Option<&CommitRecord> {
        self.validation.as_ref().and_then(|v| v.commit.as_ref())
    }

    /// Healthy unless a stage failed; degraded detection alone stays healthy.
    pub fn healthy(&self) -> bool {
        self.error.is_none()
            && self.pending_commit.is_none()
            && self.pending_regeneration.is_none()
            && self.validation.as_ref().map(|v| v.overall).unwrap_or(true)
    }

    pub fn message(&self) -> String {
        if let Some(err) = &self.error {
            return err.clone();
        }
        match self.outcome {
            CycleOutcome::Baseline => "Baseline snapshot captured".to_string(),
            CycleOutcome::NoChange if self.bindings.is_some() => {
                "No schema changes; pending binding regeneration completed".to_string()
            }
            CycleOutcome::NoChange => "No schema changes".to_string(),
            CycleOutcome::Changed => self
                .change
                .as_ref()
                .map(|c| c.summary.clone())
                .unwrap_or_else(|| "Schema changed".to_string()),
            CycleOutcome::Failed => "Cycle failed".to_string(),
        }
    }
}

pub struct Pipeline {
    config: Arc<ConfigStore>,
    detector: Arc<SchemaDetector>,
    store: Arc<dyn DocumentStore>,
    backups: BackupManager,
    notifier: Notifier,
    bindings: BindingRegenerator,
    validation: ValidationGate,
    commits: CommitGate,
    gate: CycleGate,
    schema_docs: PathBuf,
}

impl Pipeline {
    /// Wire a pipeline from its collaborators. Paths and commit settings are
    /// taken from `settings` once; everything else is re-read per cycle.
    pub fn new(
        config: Arc<ConfigStore>,
        detector: Arc<SchemaDetector>,
        store: Arc<dyn DocumentStore>,
        notifier: Notifier,
        paths: &StatePaths,
        settings: &OperationalConfig,
    ) -> Self {
        Self {
            config,
            detector,
            backups: BackupManager::new(store.clone()),
            store,
            notifier,
            bindings: BindingRegenerator::new(
                paths.in_project(&settings.paths.bindings_file),
                paths.bindings_backup_dir(),
                settings.paths.custom_marker.clone(),
            ),
            validation: ValidationGate::new(&paths.project_root),
            commits: CommitGate::new(&paths.project_root, settings.commit.resolved(paths)),
            gate: CycleGate::with_lock_file(
                paths.lock_file(),
                Duration::from_secs(settings.supervisor.stale_lock_secs),
            ),
            schema_docs: paths.in_project(&settings.paths.schema_docs),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn detector(&self) -> &SchemaDetector {
        &self.detector
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    // ==================== Cycle ====================

    /// Run one detection cycle. Fails fast with [`AppError::CycleInFlight`]
    /// when another cycle holds the gate.
    pub async fn run_cycle(&self, trigger: CycleTrigger) -> Result<CycleReport, AppError> {
        let _guard = self.gate.try_acquire().await?;

        // Another unit may have rewritten the document since the last cycle.
        self.config.reload().await?;
        let config = self.config.get().await;

        let mut report = CycleReport::new(trigger);
        let result = self.execute(&config, &mut report).await;
        report.finished_at = Utc::now();

        match result {
            Ok(()) => {
                self.record(&report).await?;
                info!(
                    "Cycle {} ({:?}) finished: {}",
                    report.id,
                    report.trigger,
                    report.message()
                );
                Ok(report)
            }
            Err(e) => {
                let cycle_id = report.id;
                error!("❌ Cycle {} failed: {}", cycle_id, e);
                report.outcome = CycleOutcome::Failed;
                report.error = Some(e.to_string());
                self.notify(
                    &config,
                    &mut report,
                    NotificationType::Error,
                    format!("Detection cycle failed: {}", e),
                    json!({ "code": e.code(), "trigger": trigger, "cycleId": cycle_id }),
                )
                .await;
                if let Err(record_err) = self.record(&report).await {
                    warn!("Failed to record cycle status: {}", record_err);
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        config: &OperationalConfig,
        report: &mut CycleReport,
    ) -> Result<(), AppError> {
        // DETECT
        let snapshot = self.detector.detect().await;
        report.strategy = Some(snapshot.strategy);
        if !snapshot.is_usable() {
            return Err(AppError::TransientDetection(
                snapshot
                    .error
                    .clone()
                    .unwrap_or_else(|| "detection produced no data".to_string()),
            ));
        }
        if let Some(degraded) = &snapshot.error {
            report.warnings.push(degraded.clone());
        }
        report.fingerprint = Some(snapshot.fingerprint.clone());

        // CLASSIFY
        let previous = self.backups.current().await?;
        match ChangeClassifier::classify(previous.as_ref(), &snapshot)? {
            Classification::Baseline => {
                let key = self
                    .backups
                    .save(&snapshot, config.retention.keep_versions)
                    .await?;
                report.snapshot_key = Some(key.clone());
                report.outcome = CycleOutcome::Baseline;
                info!("📸 Baseline captured as {}", key);
                self.notify(
                    config,
                    report,
                    NotificationType::SyncComplete,
                    format!(
                        "Baseline schema captured: {} tables via {} detection",
                        snapshot.payload.tables.len(),
                        snapshot.strategy
                    ),
                    json!({ "snapshotKey": key, "fingerprint": snapshot.fingerprint }),
                )
                .await;
            }
            Classification::NoChange => {
                report.outcome = CycleOutcome::NoChange;
                match &config.pending_regeneration {
                    Some(pending) if config.features.auto_regenerate => {
                        info!(
                            "🔁 No schema changes; retrying binding regeneration pending since {}",
                            pending.at
                        );
                        report.change = Some(pending.change.clone());
                        self.reconcile(config, &snapshot, &pending.change, report)
                            .await?;
                    }
                    _ => info!("No schema changes detected"),
                }
            }
            Classification::Changed(change) => {
                report.outcome = CycleOutcome::Changed;
                self.handle_change(config, &snapshot, change, report).await?;
            }
        }
        Ok(())
    }

    async fn handle_change(
        &self,
        config: &OperationalConfig,
        snapshot: &SchemaSnapshot,
        change: ChangeSet,
        report: &mut CycleReport,
    ) -> Result<(), AppError> {
        info!("🔔 {}", change.summary);
        report.change = Some(change.clone());

        // BACKUP
        let key = self
            .backups
            .save(snapshot, config.retention.keep_versions)
            .await?;
        report.snapshot_key = Some(key.clone());
        let docs = render_schema_docs(snapshot, &change);
        if let Err(e) = write_atomic(&self.schema_docs, docs.as_bytes()).await {
            warn!("Failed to write schema docs: {}", e);
            report.warnings.push(format!("schema docs not written: {}", e));
        }
        if let Err(e) = self.write_cycle_log(report).await {
            warn!("Failed to write cycle log: {}", e);
            report.warnings.push(format!("cycle log not written: {}", e));
        }

        // NOTIFY
        let mut payload = serde_json::to_value(&change)?;
        payload["snapshotKey"] = json!(key);
        payload["strategy"] = json!(snapshot.strategy);
        self.notify(
            config,
            report,
            NotificationType::SchemaChange,
            change.summary.clone(),
            payload,
        )
        .await;

        self.reconcile(config, snapshot, &change, report).await
    }

    /// REGENERATE_BINDINGS then VALIDATE_AND_COMMIT for a snapshot that is
    /// already saved. A failed regeneration is kept as pending so that the
    /// next cycle retries it.
    async fn reconcile(
        &self,
        config: &OperationalConfig,
        snapshot: &SchemaSnapshot,
        change: &ChangeSet,
        report: &mut CycleReport,
    ) -> Result<(), AppError> {
        // REGENERATE_BINDINGS
        if config.features.auto_regenerate {
            match self.write_bindings(snapshot).await {
                Ok(outcome) => {
                    self.notify(
                        config,
                        report,
                        NotificationType::TypeRegenerated,
                        format!(
                            "Regenerated {} ({} generator)",
                            outcome.path.display(),
                            outcome.strategy
                        ),
                        serde_json::to_value(&outcome)?,
                    )
                    .await;
                    report.bindings = Some(outcome);
                }
                Err(e) => {
                    // Validation against stale bindings would be meaningless.
                    let message = format!("Binding regeneration failed: {}", e);
                    error!("{}", message);
                    report.error = Some(message.clone());
                    report.pending_regeneration = Some(PendingRegeneration {
                        at: Utc::now(),
                        fingerprint: snapshot.fingerprint.clone(),
                        change: change.clone(),
                        error: e.to_string(),
                    });
                    self.notify(
                        config,
                        report,
                        NotificationType::Error,
                        message,
                        json!({ "code": e.code(), "stage": "regenerate_bindings" }),
                    )
                    .await;
                    return Ok(());
                }
            }
        }

        // VALIDATE_AND_COMMIT
        if config.features.auto_commit || config.validation.enabled {
            self.validate_and_commit(config, change, report).await;
        }

        Ok(())
    }

    async fn validate_and_commit(
        &self,
        config: &OperationalConfig,
        change: &ChangeSet,
        report: &mut CycleReport,
    ) {
        let checks: &[CheckConfig] = if config.validation.enabled {
            &config.validation.checks
        } else {
            &[]
        };
        let has_checks = checks.iter().any(|c| c.enabled);
        let mut validation = self.validation.run(checks).await;

        if !validation.overall {
            let failed: Vec<String> = validation.failures().map(|r| r.kind.to_string()).collect();
            self.notify(
                config,
                report,
                NotificationType::ValidationFailed,
                format!("Validation failed: {}", failed.join(", ")),
                json!({ "failed": failed, "results": validation.results }),
            )
            .await;
            report.validation = Some(validation);
            return;
        }

        if config.features.auto_commit && !has_checks {
            let message = "Auto-commit skipped: no validation checks are enabled".to_string();
            warn!("{}", message);
            report.warnings.push(message);
        } else if config.features.auto_commit {
            let message = compose_message(&config.commit.message_prefix, change, &validation);
            match self.commits.commit(&message).await {
                Ok(record) => validation.commit = record,
                Err(e) => {
                    let files = self.commits.candidate_files().await.unwrap_or_default();
                    report.pending_commit = Some(PendingCommit {
                        at: Utc::now(),
                        files: files.clone(),
                        message,
                        error: e.to_string(),
                    });
                    self.notify(
                        config,
                        report,
                        NotificationType::Error,
                        format!("Commit failed, changes left pending: {}", e),
                        json!({ "code": e.code(), "stage": "commit", "files": files }),
                    )
                    .await;
                }
            }
        }
        report.validation = Some(validation);
    }

    async fn write_bindings(&self, snapshot: &SchemaSnapshot) -> Result<BindingsOutcome, AppError> {
        let (source, strategy) = self.detector.regenerate_bindings(snapshot).await?;
        self.bindings.write(&source, strategy).await
    }

    async fn write_cycle_log(&self, report: &CycleReport) -> Result<(), AppError> {
        let key = format!("cycle-{}", report.started_at.format("%Y%m%dT%H%M%S%.3fZ"));
        let record = serde_json::to_value(report)?;
        self.store.put(CYCLE_LOG_COLLECTION, &key, &record).await?;

        let keys = self.store.keys(CYCLE_LOG_COLLECTION).await?;
        if keys.len() > CYCLE_LOG_KEEP {
            for old in &keys[..keys.len() - CYCLE_LOG_KEEP] {
                self.store.delete(CYCLE_LOG_COLLECTION, old).await?;
            }
        }
        Ok(())
    }

    /// Send through the notifier. A history write failure is logged, never raised.
    async fn notify(
        &self,
        config: &OperationalConfig,
        report: &mut CycleReport,
        notification_type: NotificationType,
        message: String,
        payload: serde_json::Value,
    ) {
        report.notifications.push(notification_type);
        let notification = Notification::new(notification_type, message, payload);
        if let Err(e) = self
            .notifier
            .send(&config.features.notification_channels, notification)
            .await
        {
            warn!("Failed to record {} notification: {}", notification_type, e);
        }
    }

    async fn record(&self, report: &CycleReport) -> Result<(), AppError> {
        let healthy = report.healthy();
        let message = report.message();
        let fingerprint = match report.outcome {
            CycleOutcome::Failed => None,
            _ => report.fingerprint.clone(),
        };
        let committed = report.commit().is_some();
        let pending = report.pending_commit.clone();
        let regenerated = report.bindings.is_some();
        let pending_regeneration = report.pending_regeneration.clone();
        let at = report.finished_at;

        self.config
            .update(move |c| {
                if let Some(fp) = fingerprint {
                    c.last_fingerprint = Some(fp);
                    c.last_sync = Some(at);
                }
                c.last_cycle = Some(CycleStatus {
                    at,
                    healthy,
                    message,
                });
                if pending.is_some() {
                    c.pending_commit = pending;
                } else if committed {
                    c.pending_commit = None;
                }
                if pending_regeneration.is_some() {
                    c.pending_regeneration = pending_regeneration;
                } else if regenerated {
                    c.pending_regeneration = None;
                }
            })
            .await?;
        Ok(())
    }

    // ==================== Standalone operations ====================

    /// Regenerate bindings from a fresh read-only detection.
    pub async fn regenerate_bindings(&self) -> Result<BindingsOutcome, AppError> {
        let _guard = self.gate.try_acquire().await?;
        let config = self.config.get().await;

        let snapshot = self.detector.detect().await;
        if !snapshot.is_usable() {
            return Err(AppError::TransientDetection(
                snapshot.error.unwrap_or_default(),
            ));
        }
        let outcome = self.write_bindings(&snapshot).await?;
        self.config
            .update(|c| c.pending_regeneration = None)
            .await?;

        let mut scratch = CycleReport::new(CycleTrigger::Manual);
        self.notify(
            &config,
            &mut scratch,
            NotificationType::TypeRegenerated,
            format!("Regenerated {} on request", outcome.path.display()),
            serde_json::to_value(&outcome)?,
        )
        .await;
        Ok(outcome)
    }

    /// Run the validation battery alone. Never commits.
    pub async fn validate(&self) -> Result<ValidationReport, AppError> {
        let config = self.config.get().await;
        let report = self.validation.run(&config.validation.checks).await;
        if !report.overall {
            let failed: Vec<String> = report.failures().map(|r| r.kind.to_string()).collect();
            let mut scratch = CycleReport::new(CycleTrigger::Cli);
            self.notify(
                &config,
                &mut scratch,
                NotificationType::ValidationFailed,
                format!("Validation failed: {}", failed.join(", ")),
                json!({ "failed": failed, "results": report.results }),
            )
            .await;
        }
        Ok(report)
    }

    /// Pull remote schema files into the project. Never called by the timer.
    pub async fn sync(&self) -> Result<String, AppError> {
        let _guard = self.gate.try_acquire().await?;
        let output = self.detector.sync().await?;
        let config = self
            .config
            .update(|c| c.last_sync = Some(Utc::now()))
            .await?;

        let mut scratch = CycleReport::new(CycleTrigger::Cli);
        self.notify(
            &config,
            &mut scratch,
            NotificationType::SyncComplete,
            "Remote schema pulled into local files".to_string(),
            json!({ "output": crate::process::truncate_output(&output, 2_000) }),
        )
        .await;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelKind, NotificationChannel, NotificationHistory};
    use crate::pipeline::validation::CheckKind;
    use crate::store::FsDocumentStore;
    use crate::testing::{FakeBackend, RecordingChannel};
    use std::path::Path;

    struct Harness {
        _dir: tempfile::TempDir,
        paths: StatePaths,
        pipeline: Arc<Pipeline>,
        backend: Arc<FakeBackend>,
        channel: Arc<RecordingChannel>,
    }

    fn check(kind: CheckKind, argv: &[&str]) -> CheckConfig {
        CheckConfig {
            kind,
            command: argv.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 30,
            enabled: true,
        }
    }

    fn base_config() -> OperationalConfig {
        let mut config = OperationalConfig::default();
        config.features.notification_channels = vec![ChannelKind::Memory];
        config.validation.checks = Vec::new();
        config
    }

    fn harness(config: OperationalConfig) -> Harness {
        let backend = Arc::new(FakeBackend::new(DetectionStrategy::Privileged));
        let fallback = Arc::new(FakeBackend::new(DetectionStrategy::Fallback));
        let detector = SchemaDetector::new(Some(backend.clone()), fallback, "");
        harness_with(config, detector, backend)
    }

    fn harness_with(
        config: OperationalConfig,
        detector: SchemaDetector,
        backend: Arc<FakeBackend>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = StatePaths::new(dir.path(), None);
        let store: Arc<dyn DocumentStore> = Arc::new(FsDocumentStore::new(&paths.state_dir));
        let config_store = Arc::new(ConfigStore::with_config(paths.config_file(), config.clone()));
        let detector = Arc::new(detector);

        let channel = Arc::new(RecordingChannel::new(ChannelKind::Memory));
        let channels: Vec<Arc<dyn NotificationChannel>> = vec![channel.clone()];
        let notifier = Notifier::new(channels, NotificationHistory::new(store.clone()));

        let pipeline = Arc::new(Pipeline::new(
            config_store,
            detector,
            store,
            notifier,
            &paths,
            &config,
        ));
        Harness {
            _dir: dir,
            paths,
            pipeline,
            backend,
            channel,
        }
    }

    async fn count_of(h: &Harness, t: NotificationType) -> usize {
        h.channel
            .delivered()
            .await
            .iter()
            .filter(|n| n.notification_type == t)
            .count()
    }

    #[tokio::test]
    async fn first_run_captures_baseline() {
        let h = harness(base_config());
        h.backend.set_tables(&[("public.users", &["id", "email"])]).await;

        let report = h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Baseline);
        assert_eq!(h.pipeline.backups().count().await.unwrap(), 1);
        assert_eq!(count_of(&h, NotificationType::SchemaChange).await, 0);

        let config = h.pipeline.config().get().await;
        assert_eq!(config.last_fingerprint, report.fingerprint);
        assert!(config.last_cycle.unwrap().healthy);
        assert!(h.paths.config_file().exists());
    }

    #[tokio::test]
    async fn identical_second_run_is_a_no_op() {
        let h = harness(base_config());
        h.backend.set_tables(&[("public.users", &["id"])]).await;

        h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();
        let report = h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::NoChange);
        assert_eq!(report.message(), "No schema changes");
        assert_eq!(h.pipeline.backups().count().await.unwrap(), 1);
        assert_eq!(count_of(&h, NotificationType::SchemaChange).await, 0);
    }

    #[tokio::test]
    async fn new_table_triggers_change_handling() {
        let mut config = base_config();
        config.validation.enabled = false;
        let h = harness(config);
        h.backend.set_tables(&[("public.users", &["id"])]).await;
        h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        h.backend
            .set_tables(&[("public.users", &["id"]), ("public.invoices", &["id", "total"])])
            .await;
        let report = h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Changed);
        let changes: Vec<Notification> = h
            .channel
            .delivered()
            .await
            .into_iter()
            .filter(|n| n.notification_type == NotificationType::SchemaChange)
            .collect();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].message.contains("invoices"));
        assert_eq!(changes[0].channels, vec![ChannelKind::Memory]);
        assert_eq!(h.pipeline.backups().count().await.unwrap(), 2);

        let bindings = std::fs::read_to_string(h.paths.in_project(Path::new("src/types/database.ts")))
            .unwrap();
        assert!(bindings.contains("invoices"));
        let docs = std::fs::read_to_string(h.paths.in_project(Path::new("docs/schema-changes.md")))
            .unwrap();
        assert!(docs.contains("invoices"));
        assert_eq!(count_of(&h, NotificationType::TypeRegenerated).await, 1);
        assert!(report.validation.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_type_check_blocks_commit() {
        let mut config = base_config();
        config.features.auto_commit = true;
        config.validation.checks = vec![check(CheckKind::TypeCheck, &["false"])];
        let h = harness(config);
        h.backend.set_tables(&[("public.users", &["id"])]).await;
        h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        h.backend
            .set_tables(&[("public.users", &["id", "name"])])
            .await;
        let report = h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        let validation = report.validation.as_ref().unwrap();
        assert!(!validation.overall);
        assert!(report.commit().is_none());
        assert_eq!(count_of(&h, NotificationType::ValidationFailed).await, 1);
        assert!(!h.pipeline.config().get().await.last_cycle.unwrap().healthy);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passing_validation_commits_allow_listed_bindings_only() {
        let mut config = base_config();
        config.features.auto_commit = true;
        config.validation.checks = vec![check(CheckKind::TypeCheck, &["true"])];
        config.commit.allow_list = vec!["src/types/database.ts".to_string()];
        let h = harness(config);

        let root = h.paths.project_root.clone();
        let git = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(&root)
                .output()
                .unwrap();
            assert!(status.status.success());
        };
        git(&["init", "-q"]);
        git(&["-c", "user.name=t", "-c", "user.email=t@localhost", "commit", "-q", "--allow-empty", "-m", "init"]);

        h.backend.set_tables(&[("public.users", &["id"])]).await;
        h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();
        h.backend
            .set_tables(&[("public.users", &["id"]), ("public.kiosks", &["id"])])
            .await;
        let report = h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        let commit = report.commit().expect("a commit record");
        assert_eq!(commit.files, vec!["src/types/database.ts".to_string()]);
        assert!(commit.message.starts_with("chore(schema): sync schema"));
        assert!(h.pipeline.config().get().await.pending_commit.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn commit_failure_leaves_pending_commit() {
        let mut config = base_config();
        config.features.auto_commit = true;
        config.validation.checks = vec![check(CheckKind::TypeCheck, &["true"])];
        let h = harness(config);
        h.backend.set_tables(&[("public.users", &["id"])]).await;
        h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        // The temp project is not a git repository.
        h.backend.set_tables(&[("public.orders", &["id"])]).await;
        let report = h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        assert!(report.commit().is_none());
        assert_eq!(count_of(&h, NotificationType::Error).await, 1);
        let config = h.pipeline.config().get().await;
        assert!(config.pending_commit.is_some());
        assert!(!config.last_cycle.unwrap().healthy);
    }

    #[tokio::test]
    async fn auto_commit_without_enabled_checks_is_skipped() {
        let mut config = base_config();
        config.features.auto_commit = true;
        config.validation.enabled = false;
        let h = harness(config);
        h.backend.set_tables(&[("public.users", &["id"])]).await;
        h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        h.backend
            .set_tables(&[("public.users", &["id"]), ("public.refunds", &["id"])])
            .await;
        let report = h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        assert!(report.commit().is_none());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("no validation checks are enabled")));
        assert_eq!(count_of(&h, NotificationType::Error).await, 0);
        let config = h.pipeline.config().get().await;
        assert!(config.pending_commit.is_none());
        assert!(config.last_cycle.unwrap().healthy);
    }

    #[tokio::test]
    async fn binding_failure_skips_validation_and_is_retried() {
        let mut config = base_config();
        config.features.auto_commit = true;
        config.validation.enabled = true;
        let backend = Arc::new(FakeBackend::new(DetectionStrategy::Privileged));
        let fallback = Arc::new(FakeBackend::new(DetectionStrategy::Fallback));
        let detector = SchemaDetector::new(Some(backend.clone()), fallback.clone(), "");
        let h = harness_with(config, detector, backend);
        h.backend.set_tables(&[("public.users", &["id"])]).await;
        h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        h.backend
            .set_tables(&[("public.users", &["id"]), ("public.invoices", &["id", "total"])])
            .await;
        h.backend.fail_bindings(true).await;
        fallback.fail_bindings(true).await;
        let failed = h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        assert_eq!(failed.outcome, CycleOutcome::Changed);
        assert!(failed
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("Binding regeneration failed")));
        assert!(failed.validation.is_none());
        assert!(failed.commit().is_none());
        assert_eq!(count_of(&h, NotificationType::SchemaChange).await, 1);
        assert_eq!(count_of(&h, NotificationType::Error).await, 1);
        assert_eq!(count_of(&h, NotificationType::TypeRegenerated).await, 0);
        let bindings = h.paths.in_project(Path::new("src/types/database.ts"));
        assert!(!bindings.exists());

        let config = h.pipeline.config().get().await;
        let pending = config.pending_regeneration.expect("regeneration left pending");
        assert_eq!(Some(pending.fingerprint), failed.fingerprint);
        assert!(pending.change.new_tables.iter().any(|t| t.contains("invoices")));
        assert!(!config.last_cycle.unwrap().healthy);

        // Same schema on the next tick: the leftover stage runs again.
        h.backend.fail_bindings(false).await;
        fallback.fail_bindings(false).await;
        let retried = h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();

        assert_eq!(retried.outcome, CycleOutcome::NoChange);
        assert!(retried.healthy());
        assert!(retried.validation.is_some());
        assert!(std::fs::read_to_string(&bindings).unwrap().contains("invoices"));
        assert_eq!(count_of(&h, NotificationType::TypeRegenerated).await, 1);
        let config = h.pipeline.config().get().await;
        assert!(config.pending_regeneration.is_none());
        assert!(config.last_cycle.unwrap().healthy);

        let settled = h.pipeline.run_cycle(CycleTrigger::Timer).await.unwrap();
        assert_eq!(settled.message(), "No schema changes");
        assert_eq!(count_of(&h, NotificationType::TypeRegenerated).await, 1);
    }

    #[tokio::test]
    async fn failed_detection_notifies_error() {
        let fallback = Arc::new(FakeBackend::new(DetectionStrategy::Fallback));
        fallback.fail_next("REST unreachable").await;
        let detector = SchemaDetector::new(None, fallback.clone(), "probe failed");
        let h = harness_with(base_config(), detector, fallback);

        let err = h.pipeline.run_cycle(CycleTrigger::Manual).await.unwrap_err();

        assert!(matches!(err, AppError::TransientDetection(_)));
        let delivered = h.channel.delivered().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].notification_type, NotificationType::Error);
        assert_eq!(h.pipeline.backups().count().await.unwrap(), 0);
        assert!(!h.pipeline.config().get().await.last_cycle.unwrap().healthy);
        assert_eq!(h.pipeline.notifier().history().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_triggers_run_at_most_one_cycle() {
        let h = harness(base_config());
        h.backend.set_tables(&[("public.users", &["id"])]).await;
        h.backend.set_delay(Duration::from_millis(200)).await;

        let a = {
            let p = h.pipeline.clone();
            tokio::spawn(async move { p.run_cycle(CycleTrigger::Manual).await })
        };
        let b = {
            let p = h.pipeline.clone();
            tokio::spawn(async move { p.run_cycle(CycleTrigger::Manual).await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let in_flight = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(AppError::CycleInFlight)))
            .count();
        assert_eq!(in_flight, 1);
        assert_eq!(h.backend.detect_calls(), 1);
        assert!(a.is_ok() || b.is_ok());
    }
}
