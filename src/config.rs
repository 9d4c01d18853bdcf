//! Application configuration module
//!
//! Two layers: the durable `config.json` document under the state directory
//! (operational settings plus the last-known schema fingerprint, rewritten
//! after every cycle) and environment variables loaded through `dotenvy`.
//! Environment values win over the document. Secrets only ever come from the
//! environment and are never written back.

use crate::notify::ChannelKind;
use crate::pipeline::validation::{default_checks, CheckConfig};
use crate::snapshot::ChangeSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;
use validator::Validate;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// The document exists but cannot be parsed. Startup must refuse to continue.
    #[error("Configuration document {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode configuration: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Default state directory, relative to the project root.
pub const DEFAULT_STATE_DIR: &str = ".schema-sentinel";

/// Allow-list prefix standing for the state directory, wherever it lives.
pub const STATE_DIR_PLACEHOLDER: &str = "{stateDir}";

// ==================== Document ====================

/// Project identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectIdentity {
    pub name: String,
    /// Platform project reference used by the privileged CLI.
    pub project_ref: Option<String>,
}

impl Default for ProjectIdentity {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            project_ref: None,
        }
    }
}

/// Feature toggles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureToggles {
    pub auto_commit: bool,
    pub auto_regenerate: bool,
    pub notification_channels: Vec<ChannelKind>,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            auto_commit: false,
            auto_regenerate: true,
            notification_channels: vec![ChannelKind::Memory, ChannelKind::Desktop],
        }
    }
}

/// Dashboard server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardConfig {
    pub host: Ipv4Addr,
    #[validate(range(min = 1))]
    pub port: u16,
    /// Seconds between read-model refreshes.
    #[validate(range(min = 1, max = 3600))]
    pub refresh_secs: u64,
    /// Notifications included in the dashboard state.
    #[validate(range(min = 1, max = 1000))]
    pub recent_notifications: usize,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(127, 0, 0, 1),
            port: 3210,
            refresh_secs: 5,
            recent_notifications: 20,
        }
    }
}

/// Validation battery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub checks: Vec<CheckConfig>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checks: default_checks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionConfig {
    #[validate(range(min = 1, max = 1000))]
    pub keep_versions: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { keep_versions: 10 }
    }
}

/// Paths inside the project that the pipeline writes to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PathsConfig {
    pub bindings_file: PathBuf,
    pub schema_docs: PathBuf,
    /// Line that separates generated bindings from hand-written extensions.
    pub custom_marker: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            bindings_file: PathBuf::from("src/types/database.ts"),
            schema_docs: PathBuf::from("docs/schema-changes.md"),
            custom_marker: "// ==== CUSTOM TYPES (preserved across regeneration) ====".to_string(),
        }
    }
}

/// Commit gate settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CommitConfig {
    /// Glob patterns, relative to the project root, eligible for auto-commit.
    pub allow_list: Vec<String>,
    pub author_name: String,
    pub author_email: String,
    pub message_prefix: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            allow_list: vec![
                "src/types/database.ts".to_string(),
                "docs/schema-changes.md".to_string(),
                format!("{}/logs/**", STATE_DIR_PLACEHOLDER),
                format!("{}/snapshots/**", STATE_DIR_PLACEHOLDER),
            ],
            author_name: "schema-sentinel".to_string(),
            author_email: "schema-sentinel@localhost".to_string(),
            message_prefix: "chore(schema)".to_string(),
        }
    }
}

impl CommitConfig {
    /// Settings with every state directory placeholder expanded for `paths`.
    /// Patterns naming a state directory outside the project are dropped.
    pub fn resolved(&self, paths: &StatePaths) -> Self {
        let allow_list = self
            .allow_list
            .iter()
            .filter_map(|pattern| {
                let resolved = paths.resolve_allow_pattern(pattern);
                if resolved.is_none() {
                    warn!(
                        "State directory {} is outside the project, ignoring allow-list pattern {}",
                        paths.state_dir.display(),
                        pattern
                    );
                }
                resolved
            })
            .collect();
        Self {
            allow_list,
            ..self.clone()
        }
    }
}

/// Privileged platform CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PrivilegedConfig {
    pub cli_program: String,
    pub schema: String,
    /// Ask the CLI for a structured diff on every privileged detection.
    pub diff_enabled: bool,
    pub timeout_secs: u64,
}

impl Default for PrivilegedConfig {
    fn default() -> Self {
        Self {
            cli_program: "supabase".to_string(),
            schema: "public".to_string(),
            diff_enabled: true,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackConfig {
    pub timeout_secs: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// Restart policy for supervised units
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    pub restart_backoff_secs: u64,
    pub max_restarts: usize,
    pub restart_window_secs: u64,
    pub shutdown_grace_secs: u64,
    pub stale_lock_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_backoff_secs: 5,
            max_restarts: 5,
            restart_window_secs: 300,
            shutdown_grace_secs: 30,
            stale_lock_secs: 1800,
        }
    }
}

/// Outcome of the most recent cycle, as shown by `status` and the dashboard
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CycleStatus {
    pub at: DateTime<Utc>,
    pub healthy: bool,
    pub message: String,
}

/// Commit left for manual resolution after version control refused it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommit {
    pub at: DateTime<Utc>,
    pub files: Vec<String>,
    pub message: String,
    pub error: String,
}

/// Binding regeneration that failed after its snapshot was saved. The next
/// cycle retries it even when the schema has not moved again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingRegeneration {
    pub at: DateTime<Utc>,
    pub fingerprint: String,
    pub change: ChangeSet,
    pub error: String,
}

/// The durable operational configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationalConfig {
    pub project: ProjectIdentity,
    #[validate(range(min = 10, max = 86_400))]
    pub interval_secs: u64,
    pub features: FeatureToggles,
    #[validate(nested)]
    pub dashboard: DashboardConfig,
    pub validation: ValidationConfig,
    #[validate(nested)]
    pub retention: RetentionConfig,
    pub paths: PathsConfig,
    pub commit: CommitConfig,
    pub privileged: PrivilegedConfig,
    pub fallback: FallbackConfig,
    pub supervisor: SupervisorConfig,
    pub last_fingerprint: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_cycle: Option<CycleStatus>,
    pub pending_commit: Option<PendingCommit>,
    pub pending_regeneration: Option<PendingRegeneration>,
}

impl Default for OperationalConfig {
    fn default() -> Self {
        Self {
            project: ProjectIdentity::default(),
            interval_secs: 300,
            features: FeatureToggles::default(),
            dashboard: DashboardConfig::default(),
            validation: ValidationConfig::default(),
            retention: RetentionConfig::default(),
            paths: PathsConfig::default(),
            commit: CommitConfig::default(),
            privileged: PrivilegedConfig::default(),
            fallback: FallbackConfig::default(),
            supervisor: SupervisorConfig::default(),
            last_fingerprint: None,
            last_sync: None,
            last_cycle: None,
            pending_commit: None,
            pending_regeneration: None,
        }
    }
}

/// Apply environment overrides to a document. `lookup` is `std::env::var`
/// in production.
pub fn apply_env_overrides(
    config: &mut OperationalConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    fn parse<T: std::str::FromStr>(name: &str, raw: String) -> Result<T, ConfigError> {
        raw.trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{}={}", name, raw)))
    }

    if let Some(v) = lookup("SENTINEL_INTERVAL_SECS") {
        config.interval_secs = parse("SENTINEL_INTERVAL_SECS", v)?;
    }
    if let Some(v) = lookup("SENTINEL_DASHBOARD_HOST") {
        config.dashboard.host = parse("SENTINEL_DASHBOARD_HOST", v)?;
    }
    if let Some(v) = lookup("SENTINEL_DASHBOARD_PORT") {
        config.dashboard.port = parse("SENTINEL_DASHBOARD_PORT", v)?;
    }
    if let Some(v) = lookup("SENTINEL_AUTO_COMMIT") {
        config.features.auto_commit = parse("SENTINEL_AUTO_COMMIT", v)?;
    }
    if let Some(v) = lookup("SUPABASE_PROJECT_REF") {
        config.project.project_ref = Some(v);
    }
    Ok(())
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// ==================== Credentials ====================

/// Secrets and endpoints, read from the environment only.
#[derive(Clone, Default)]
pub struct Credentials {
    pub database_url: Option<String>,
    pub access_token: Option<String>,
    pub rest_url: Option<Url>,
    pub anon_key: Option<String>,
    pub memory_url: Option<Url>,
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let parse_url = |name: &str| -> Result<Option<Url>, ConfigError> {
            lookup(name)
                .map(|raw| {
                    Url::parse(raw.trim()).map_err(|e| {
                        ConfigError::InvalidValue(format!("{} is not a valid URL: {}", name, e))
                    })
                })
                .transpose()
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL"),
            access_token: lookup("SUPABASE_ACCESS_TOKEN"),
            rest_url: parse_url("SUPABASE_URL")?,
            anon_key: lookup("SUPABASE_ANON_KEY"),
            memory_url: parse_url("SENTINEL_MEMORY_URL")?,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| if v.is_some() { "****" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("database_url", &mask(&self.database_url))
            .field("access_token", &mask(&self.access_token))
            .field("rest_url", &self.rest_url.as_ref().map(Url::as_str))
            .field("anon_key", &mask(&self.anon_key))
            .field("memory_url", &self.memory_url.as_ref().map(Url::as_str))
            .finish()
    }
}

// ==================== Paths ====================

/// Well-known locations under the project root and state directory.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
}

impl StatePaths {
    pub fn new(project_root: impl Into<PathBuf>, state_dir: Option<PathBuf>) -> Self {
        let project_root = project_root.into();
        let state_dir = match state_dir {
            Some(dir) if dir.is_absolute() => dir,
            Some(dir) => project_root.join(dir),
            None => project_root.join(DEFAULT_STATE_DIR),
        };
        Self {
            project_root,
            state_dir,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("sentinel.pid")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("cycle.lock")
    }

    pub fn bindings_backup_dir(&self) -> PathBuf {
        self.state_dir.join("bindings-backups")
    }

    /// Expand [`STATE_DIR_PLACEHOLDER`] into the project-relative state
    /// directory. `None` when the state directory is not under the project.
    pub fn resolve_allow_pattern(&self, pattern: &str) -> Option<String> {
        let Some(rest) = pattern.strip_prefix(STATE_DIR_PLACEHOLDER) else {
            return Some(pattern.to_string());
        };
        let relative = self.state_dir.strip_prefix(&self.project_root).ok()?;
        let prefix = relative
            .components()
            .filter(|c| !matches!(c, std::path::Component::CurDir))
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if prefix.is_empty() {
            return Some(rest.trim_start_matches('/').to_string());
        }
        Some(format!("{}{}", prefix, rest))
    }

    /// Resolve a project-relative path.
    pub fn in_project(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.project_root.join(relative)
        }
    }
}

// ==================== Store ====================

/// Loads, holds and persists the operational configuration document.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<OperationalConfig>,
}

impl ConfigStore {
    /// Load the document, falling back to defaults when it does not exist.
    /// A document that exists but cannot be parsed is a fatal error.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let mut config = Self::read_document(&path).await?.unwrap_or_default();
        apply_env_overrides(&mut config, env_lookup)?;
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        debug!("Configuration loaded from {}", path.display());
        Ok(Self {
            path,
            current: RwLock::new(config),
        })
    }

    /// Build a store around an in-memory document (no env overrides).
    pub fn with_config(path: impl Into<PathBuf>, config: OperationalConfig) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(config),
        }
    }

    /// Read the durable document without applying overrides.
    pub async fn read_document(path: &Path) -> Result<Option<OperationalConfig>, ConfigError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ConfigError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    pub async fn get(&self) -> OperationalConfig {
        self.current.read().await.clone()
    }

    /// Re-read the document so that writes made by another unit are visible.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        if let Some(mut config) = Self::read_document(&self.path).await? {
            apply_env_overrides(&mut config, env_lookup)?;
            *self.current.write().await = config;
        }
        Ok(())
    }

    /// Mutate the configuration and persist it.
    pub async fn update<F>(&self, mutate: F) -> Result<OperationalConfig, ConfigError>
    where
        F: FnOnce(&mut OperationalConfig),
    {
        let mut guard = self.current.write().await;
        let mut next = guard.clone();
        mutate(&mut next);
        next.validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::write_document(&self.path, &next).await?;
        *guard = next.clone();
        Ok(next)
    }

    pub async fn persist(&self) -> Result<(), ConfigError> {
        let config = self.current.read().await.clone();
        Self::write_document(&self.path, &config).await
    }

    async fn write_document(path: &Path, config: &OperationalConfig) -> Result<(), ConfigError> {
        let bytes = serde_json::to_vec_pretty(config)?;
        crate::store::write_atomic(path, &bytes)
            .await
            .map_err(|e| match e {
                crate::store::StoreError::Io { path, source } => ConfigError::Io { path, source },
                other => ConfigError::InvalidValue(other.to_string()),
            })?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}
