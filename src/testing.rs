//! Test doubles shared by the module tests.

use crate::bindings::render_typescript;
use crate::error::AppError;
use crate::introspection::{DetectionStrategy, SchemaPayload, SchemaSnapshot, TableShape};
use crate::detector::SchemaBackend;
use crate::notify::{ChannelError, ChannelKind, Notification, NotificationChannel};
use crate::store::{DocumentStore, MemoryDocumentStore, StoreError};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

// ==================== Backend ====================

/// Scriptable detection backend
pub struct FakeBackend {
    strategy: DetectionStrategy,
    payload: Mutex<SchemaPayload>,
    fail_next: Mutex<Option<String>>,
    fail_bindings: AtomicBool,
    delay: Mutex<Duration>,
    detect_calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new(strategy: DetectionStrategy) -> Self {
        Self {
            strategy,
            payload: Mutex::new(SchemaPayload::default()),
            fail_next: Mutex::new(None),
            fail_bindings: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
            detect_calls: AtomicUsize::new(0),
        }
    }

    pub async fn set_tables(&self, tables: &[(&str, &[&str])]) {
        let mut payload = SchemaPayload::default();
        for (table, columns) in tables {
            let mut shape = TableShape::default();
            for column in *columns {
                shape.columns.insert(
                    column.to_string(),
                    crate::introspection::ColumnShape {
                        data_type: "text".to_string(),
                        nullable: *column != "id",
                        default_value: None,
                        is_primary_key: *column == "id",
                    },
                );
            }
            payload.tables.insert(table.to_string(), shape);
        }
        *self.payload.lock().await = payload;
    }

    pub async fn fail_next(&self, message: &str) {
        *self.fail_next.lock().await = Some(message.to_string());
    }

    pub async fn fail_bindings(&self, fail: bool) {
        self.fail_bindings.store(fail, Ordering::SeqCst);
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = delay;
    }

    pub fn detect_calls(&self) -> usize {
        self.detect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SchemaBackend for FakeBackend {
    fn strategy(&self) -> DetectionStrategy {
        self.strategy
    }

    async fn detect(&self) -> Result<SchemaSnapshot, AppError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.fail_next.lock().await.take() {
            return Err(AppError::TransientDetection(message));
        }
        let payload = self.payload.lock().await.clone();
        SchemaSnapshot::new(self.strategy, payload)
    }

    async fn regenerate_bindings(&self, snapshot: &SchemaSnapshot) -> Result<String, AppError> {
        if self.fail_bindings.load(Ordering::SeqCst) {
            return Err(AppError::Internal("type generation failed".to_string()));
        }
        Ok(render_typescript(&snapshot.payload))
    }
}

// ==================== Channels ====================

/// Accepts and records every notification
pub struct RecordingChannel {
    kind: ChannelKind,
    delivered: Mutex<Vec<Notification>>,
    delay: Duration,
}

impl RecordingChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            delivered: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub async fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().await.clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), ChannelError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.delivered.lock().await.push(notification.clone());
        Ok(())
    }
}

/// Fails a fixed number of attempts, then succeeds
pub struct FailingChannel {
    kind: ChannelKind,
    transient: bool,
    failures: usize,
    attempts: AtomicUsize,
}

impl FailingChannel {
    /// Always fails with a non-retryable error.
    pub fn permanent(kind: ChannelKind) -> Self {
        Self {
            kind,
            transient: false,
            failures: usize::MAX,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fails the first `failures` attempts with a retryable error.
    pub fn transient(kind: ChannelKind, failures: usize) -> Self {
        Self {
            kind,
            transient: true,
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationChannel for FailingChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn deliver(&self, _notification: &Notification) -> Result<(), ChannelError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.failures {
            return Ok(());
        }
        if self.transient {
            Err(ChannelError::Unreachable("connection refused".to_string()))
        } else {
            Err(ChannelError::Misconfigured(self.kind, "no endpoint".to_string()))
        }
    }
}

// ==================== Store ====================

/// In-memory store that counts log reads
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryDocumentStore,
    log_reads: AtomicUsize,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_reads(&self) -> usize {
        self.log_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for CountingStore {
    async fn put(&self, collection: &str, key: &str, doc: &Value) -> Result<(), StoreError> {
        self.inner.put(collection, key, doc).await
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(collection, key).await
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(collection, key).await
    }

    async fn keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        self.inner.keys(collection).await
    }

    async fn append(&self, log: &str, record: &Value, cap: usize) -> Result<usize, StoreError> {
        self.inner.append(log, record, cap).await
    }

    async fn read_log(&self, log: &str) -> Result<Vec<Value>, StoreError> {
        self.log_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_log(log).await
    }
}
