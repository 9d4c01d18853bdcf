//! Cycle gate
//!
//! At most one detection cycle runs at a time. Within a process this is a
//! try-lock; across processes (the monitor, the dashboard's trigger endpoint,
//! a CLI `check`) it is a lock file created with `create_new`. A lock file
//! older than the stale age is assumed to belong to a dead process and is
//! taken over.

use crate::error::AppError;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

pub struct CycleGate {
    local: Arc<Mutex<()>>,
    lock_file: Option<PathBuf>,
    stale_after: Duration,
}

/// Held for the duration of one cycle
pub struct CycleGuard {
    _local: OwnedMutexGuard<()>,
    lock_file: Option<PathBuf>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if let Some(path) = &self.lock_file {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to release cycle lock {}: {}", path.display(), e);
                }
            }
        }
    }
}

impl CycleGate {
    /// In-process gate only.
    pub fn local() -> Self {
        Self {
            local: Arc::new(Mutex::new(())),
            lock_file: None,
            stale_after: Duration::MAX,
        }
    }

    pub fn with_lock_file(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            local: Arc::new(Mutex::new(())),
            lock_file: Some(path.into()),
            stale_after,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.local.try_lock().is_err()
    }

    /// Take the gate or fail with [`AppError::CycleInFlight`].
    pub async fn try_acquire(&self) -> Result<CycleGuard, AppError> {
        let local = self
            .local
            .clone()
            .try_lock_owned()
            .map_err(|_| AppError::CycleInFlight)?;

        if let Some(path) = &self.lock_file {
            self.acquire_file(path).await?;
        }

        Ok(CycleGuard {
            _local: local,
            lock_file: self.lock_file.clone(),
        })
    }

    async fn acquire_file(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        for attempt in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    let stamp = format!("{} {}\n", std::process::id(), Utc::now().to_rfc3339());
                    file.write_all(stamp.as_bytes()).await?;
                    debug!("Acquired cycle lock {}", path.display());
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt == 0 => {
                    if !self.is_stale(path).await {
                        return Err(AppError::CycleInFlight);
                    }
                    warn!("Taking over stale cycle lock {}", path.display());
                    match tokio::fs::remove_file(path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    return Err(AppError::CycleInFlight)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::CycleInFlight)
    }

    async fn is_stale(&self, path: &Path) -> bool {
        let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            // Vanished in between: treat as free.
            Err(_) => return true,
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age >= self.stale_after)
            .unwrap_or(false)
    }
}
