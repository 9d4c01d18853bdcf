//! Schema Detector
//!
//! Dual-strategy detection. The strategy is decided once at startup by
//! probing for the privileged tooling; a failed probe downgrades the whole
//! run to the fallback strategy. A privileged failure during a single cycle
//! only makes that cycle fall back.
//!
//! [`SchemaDetector::detect`] never returns an error: whatever goes wrong is
//! carried in the snapshot's `error` field.

pub mod fallback;
pub mod privileged;

use crate::config::{Credentials, OperationalConfig};
use crate::error::AppError;
use crate::introspection::{DetectionStrategy, SchemaSnapshot};
use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub use fallback::FallbackBackend;
pub use privileged::PrivilegedBackend;

/// Capability shared by both strategies
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    fn strategy(&self) -> DetectionStrategy;

    /// Read-only capture of the current structure.
    async fn detect(&self) -> Result<SchemaSnapshot, AppError>;

    /// Generated bindings source for the given snapshot.
    async fn regenerate_bindings(&self, snapshot: &SchemaSnapshot) -> Result<String, AppError>;

    /// Pull the remote schema into local files. Mutates the project tree.
    async fn sync(&self) -> Result<String, AppError> {
        Err(AppError::StrategyUnavailable(format!(
            "the {} strategy cannot sync local schema files",
            self.strategy()
        )))
    }
}

/// Strategy decided at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum StrategyMode {
    Privileged,
    Fallback { reason: String },
}

pub struct SchemaDetector {
    mode: StrategyMode,
    privileged: Option<Arc<dyn SchemaBackend>>,
    fallback: Arc<dyn SchemaBackend>,
}

impl SchemaDetector {
    /// Build from already-constructed backends. `privileged` is `None` when
    /// the run is downgraded; `reason` explains why.
    pub fn new(
        privileged: Option<Arc<dyn SchemaBackend>>,
        fallback: Arc<dyn SchemaBackend>,
        reason: impl Into<String>,
    ) -> Self {
        let mode = match privileged {
            Some(_) => StrategyMode::Privileged,
            None => StrategyMode::Fallback {
                reason: reason.into(),
            },
        };
        Self {
            mode,
            privileged,
            fallback,
        }
    }

    /// Probe the privileged path once and pick the strategy for this run.
    pub async fn probe(
        config: &OperationalConfig,
        credentials: &Credentials,
        project_root: &Path,
    ) -> Self {
        let fallback: Arc<dyn SchemaBackend> =
            Arc::new(FallbackBackend::new(credentials, &config.fallback));

        match PrivilegedBackend::probe(config, credentials, project_root).await {
            Ok(backend) => {
                info!("🔑 Privileged detection available, using catalog introspection");
                Self::new(Some(Arc::new(backend)), fallback, "")
            }
            Err(e) => {
                warn!("⚠️  Privileged detection unavailable, downgrading to fallback: {}", e);
                Self::new(None, fallback, e.to_string())
            }
        }
    }

    pub fn mode(&self) -> &StrategyMode {
        &self.mode
    }

    pub fn strategy(&self) -> DetectionStrategy {
        match self.mode {
            StrategyMode::Privileged => DetectionStrategy::Privileged,
            StrategyMode::Fallback { .. } => DetectionStrategy::Fallback,
        }
    }

    /// Capture the current schema. Never fails.
    pub async fn detect(&self) -> SchemaSnapshot {
        let mut degraded = None;

        if let Some(privileged) = &self.privileged {
            match privileged.detect().await {
                Ok(snapshot) => return snapshot,
                Err(e) => {
                    warn!("Privileged detection failed this cycle, falling back: {}", e);
                    degraded = Some(format!("privileged detection failed: {}", e));
                }
            }
        }

        match self.fallback.detect().await {
            Ok(snapshot) => match degraded {
                Some(reason) => snapshot.with_error(reason),
                None => snapshot,
            },
            Err(e) => {
                warn!("Fallback detection failed: {}", e);
                let message = match degraded {
                    Some(reason) => format!("{}; fallback detection failed: {}", reason, e),
                    None => format!("fallback detection failed: {}", e),
                };
                SchemaSnapshot::failed(DetectionStrategy::Fallback, message)
            }
        }
    }

    /// Generate bindings, preferring the privileged tool. Returns the source
    /// and the strategy that produced it.
    pub async fn regenerate_bindings(
        &self,
        snapshot: &SchemaSnapshot,
    ) -> Result<(String, DetectionStrategy), AppError> {
        if let Some(privileged) = &self.privileged {
            match privileged.regenerate_bindings(snapshot).await {
                Ok(source) => return Ok((source, DetectionStrategy::Privileged)),
                Err(e) => warn!(
                    "Privileged binding generation failed, using local generator: {}",
                    e
                ),
            }
        }
        let source = self.fallback.regenerate_bindings(snapshot).await?;
        Ok((source, DetectionStrategy::Fallback))
    }

    /// Pull remote schema files. Only the privileged strategy can do this.
    pub async fn sync(&self) -> Result<String, AppError> {
        match &self.privileged {
            Some(privileged) => privileged.sync().await,
            None => self.fallback.sync().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[tokio::test]
    async fn transient_privileged_failure_falls_back_for_one_cycle() {
        let privileged = Arc::new(FakeBackend::new(DetectionStrategy::Privileged));
        let fallback = Arc::new(FakeBackend::new(DetectionStrategy::Fallback));
        privileged.set_tables(&[("public.users", &["id"])]).await;
        fallback.set_tables(&[("users", &["id"])]).await;
        privileged.fail_next("connection reset").await;

        let detector = SchemaDetector::new(Some(privileged.clone()), fallback, "");

        let first = detector.detect().await;
        assert_eq!(first.strategy, DetectionStrategy::Fallback);
        assert!(first.error.as_deref().unwrap().contains("connection reset"));
        assert!(first.is_usable());

        let second = detector.detect().await;
        assert_eq!(second.strategy, DetectionStrategy::Privileged);
        assert!(second.error.is_none());
        assert_eq!(detector.mode(), &StrategyMode::Privileged);
    }

    #[tokio::test]
    async fn both_strategies_failing_yields_error_snapshot() {
        let fallback = Arc::new(FakeBackend::new(DetectionStrategy::Fallback));
        fallback.fail_next("REST unreachable").await;

        let detector = SchemaDetector::new(None, fallback, "no CLI");
        let snapshot = detector.detect().await;

        assert!(!snapshot.is_usable());
        assert!(snapshot.error.unwrap().contains("REST unreachable"));
        assert_eq!(
            detector.mode(),
            &StrategyMode::Fallback {
                reason: "no CLI".to_string()
            }
        );
    }

    #[tokio::test]
    async fn bindings_fall_back_to_local_generator() {
        let privileged = Arc::new(FakeBackend::new(DetectionStrategy::Privileged));
        let fallback = Arc::new(FakeBackend::new(DetectionStrategy::Fallback));
        privileged.fail_bindings(true).await;

        let detector = SchemaDetector::new(Some(privileged), fallback, "");
        let snapshot = detector.detect().await;
        let (_, strategy) = detector.regenerate_bindings(&snapshot).await.unwrap();
        assert_eq!(strategy, DetectionStrategy::Fallback);
    }

    #[tokio::test]
    async fn sync_requires_privileged_strategy() {
        let fallback = Arc::new(FakeBackend::new(DetectionStrategy::Fallback));
        let detector = SchemaDetector::new(None, fallback, "no CLI");
        assert!(matches!(
            detector.sync().await,
            Err(AppError::StrategyUnavailable(_))
        ));
    }
}
