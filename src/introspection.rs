//! Schema Introspection Module
//!
//! Snapshot types shared by every stage of the pipeline, plus the catalog
//! introspector used by the privileged strategy. The payload is built from
//! ordered maps so that its JSON serialization, and therefore its
//! fingerprint, depends only on content.

use crate::error::AppError;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use uuid::Uuid;

/// Which detection path produced a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStrategy {
    Privileged,
    Fallback,
}

impl std::fmt::Display for DetectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionStrategy::Privileged => write!(f, "privileged"),
            DetectionStrategy::Fallback => write!(f, "fallback"),
        }
    }
}

/// Column representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnShape {
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default)]
    pub is_primary_key: bool,
}

/// Table representation, keyed by column name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableShape {
    pub columns: BTreeMap<String, ColumnShape>,
}

/// Raw structural payload of a snapshot.
///
/// Table keys are `schema.table` on the privileged path and bare table names
/// on the fallback path; [`SchemaPayload::coarse`] normalizes both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaPayload {
    pub tables: BTreeMap<String, TableShape>,
    #[serde(default)]
    pub indexes: BTreeSet<String>,
}

impl SchemaPayload {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.indexes.is_empty()
    }

    pub fn column_count(&self) -> usize {
        self.tables.values().map(|t| t.columns.len()).sum()
    }

    /// Table → column names with `public.` stripped; the only view both
    /// strategies can produce.
    pub fn coarse(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.tables
            .iter()
            .map(|(name, table)| {
                (
                    normalize_table_name(name),
                    table.columns.keys().cloned().collect(),
                )
            })
            .collect()
    }
}

/// Strip quotes and the default `public` schema from a table reference.
pub fn normalize_table_name(raw: &str) -> String {
    let unquoted: String = raw.chars().filter(|c| *c != '"').collect();
    match unquoted.strip_prefix("public.") {
        Some(rest) => rest.to_string(),
        None => unquoted,
    }
}

/// Complete schema snapshot at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub id: Uuid,
    pub strategy: DetectionStrategy,
    pub captured_at: DateTime<Utc>,
    pub payload: SchemaPayload,
    pub fingerprint: String,
    /// Structured diff text emitted by the privileged tool, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    /// Set when detection degraded (privileged failure, or nothing could be read).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SchemaSnapshot {
    pub fn new(strategy: DetectionStrategy, payload: SchemaPayload) -> Result<Self, AppError> {
        let fingerprint = Self::compute_fingerprint(&payload)?;
        Ok(Self {
            id: Uuid::new_v4(),
            strategy,
            captured_at: Utc::now(),
            payload,
            fingerprint,
            diff: None,
            error: None,
        })
    }

    /// A snapshot carrying no structure, only the reason detection failed.
    pub fn failed(strategy: DetectionStrategy, error: impl Into<String>) -> Self {
        let payload = SchemaPayload::default();
        let fingerprint = Self::compute_fingerprint(&payload).unwrap_or_default();
        Self {
            id: Uuid::new_v4(),
            strategy,
            captured_at: Utc::now(),
            payload,
            fingerprint,
            diff: None,
            error: Some(error.into()),
        }
    }

    pub fn with_diff(mut self, diff: Option<String>) -> Self {
        self.diff = diff.filter(|d| !d.trim().is_empty());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// SHA-256 over the stable JSON serialization of the payload.
    pub fn compute_fingerprint(payload: &SchemaPayload) -> Result<String, AppError> {
        let bytes = serde_json::to_vec(payload)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// False when detection produced nothing to compare against.
    pub fn is_usable(&self) -> bool {
        !(self.error.is_some() && self.payload.is_empty())
    }
}

// ==================== Privileged catalog introspection ====================

/// Create a connection pool from a DATABASE_URL, with TLS when the URL asks
/// for it or the host is a managed platform.
pub fn connect_pool(database_url: &str) -> Result<Pool, AppError> {
    let config = database_url
        .parse::<tokio_postgres::Config>()
        .map_err(|e| AppError::StrategyUnavailable(format!("Failed to parse DATABASE_URL: {}", e)))?;

    let host = match config.get_hosts().first() {
        Some(tokio_postgres::config::Host::Tcp(s)) => s.clone(),
        #[cfg(unix)]
        Some(tokio_postgres::config::Host::Unix(_)) => {
            return Err(AppError::StrategyUnavailable(
                "Unix socket connections are not supported".to_string(),
            ))
        }
        None => {
            return Err(AppError::StrategyUnavailable(
                "No host in DATABASE_URL".to_string(),
            ))
        }
    };

    let port = config.get_ports().first().copied().unwrap_or(5432);
    let user = config
        .get_user()
        .map(|u| u.to_string())
        .ok_or_else(|| AppError::StrategyUnavailable("No user in DATABASE_URL".to_string()))?;
    let password = config
        .get_password()
        .map(|p| String::from_utf8_lossy(p).to_string())
        .unwrap_or_default();
    let dbname = config
        .get_dbname()
        .map(|db| db.to_string())
        .ok_or_else(|| {
            AppError::StrategyUnavailable("No database name in DATABASE_URL".to_string())
        })?;

    let use_tls = host.ends_with("supabase.co")
        || host.ends_with("supabase.com")
        || host.contains("neon.tech")
        || database_url.contains("sslmode=require");

    let mut cfg = Config::new();
    cfg.host = Some(host);
    cfg.port = Some(port);
    cfg.user = Some(user);
    cfg.password = Some(password);
    cfg.dbname = Some(dbname);
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let created = if use_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
        cfg.create_pool(Some(Runtime::Tokio1), tls)
    } else {
        cfg.create_pool(Some(Runtime::Tokio1), tokio_postgres::NoTls)
    };
    let pool = created
        .map_err(|e| AppError::StrategyUnavailable(format!("Failed to create pool: {}", e)))?;

    info!("Database pool created (TLS: {})", use_tls);
    Ok(pool)
}

/// Schema introspector for PostgreSQL
pub struct PostgresIntrospector;

impl PostgresIntrospector {
    /// Verify the pool can reach the database.
    pub async fn ping(pool: &Pool) -> Result<(), AppError> {
        let client = pool.get().await?;
        client.query_one("SELECT 1 AS ok", &[]).await?;
        Ok(())
    }

    /// Introspect tables, columns and indexes of one schema.
    pub async fn introspect(pool: &Pool, schema: &str) -> Result<SchemaPayload, AppError> {
        let client = pool.get().await?;

        let column_rows = client
            .query(
                r#"
                SELECT
                    c.table_name,
                    c.column_name,
                    c.data_type,
                    c.is_nullable,
                    c.column_default,
                    COALESCE(
                        (SELECT true FROM information_schema.table_constraints tc
                         JOIN information_schema.key_column_usage kcu
                            ON tc.constraint_name = kcu.constraint_name
                            AND tc.table_schema = kcu.table_schema
                         WHERE tc.constraint_type = 'PRIMARY KEY'
                            AND tc.table_schema = c.table_schema
                            AND tc.table_name = c.table_name
                            AND kcu.column_name = c.column_name
                         LIMIT 1),
                        false
                    ) AS is_primary_key
                FROM information_schema.columns c
                JOIN information_schema.tables t
                    ON t.table_schema = c.table_schema AND t.table_name = c.table_name
                WHERE c.table_schema = $1
                  AND t.table_type = 'BASE TABLE'
                ORDER BY c.table_name, c.ordinal_position
                "#,
                &[&schema],
            )
            .await?;

        let mut payload = SchemaPayload::default();
        for row in &column_rows {
            let table: String = row.get("table_name");
            let column: String = row.get("column_name");
            payload
                .tables
                .entry(format!("{}.{}", schema, table))
                .or_default()
                .columns
                .insert(
                    column,
                    ColumnShape {
                        data_type: row.get("data_type"),
                        nullable: row.get::<_, String>("is_nullable") == "YES",
                        default_value: row.get("column_default"),
                        is_primary_key: row.get("is_primary_key"),
                    },
                );
        }

        // Tables without columns still exist.
        let table_rows = client
            .query(
                "SELECT table_name FROM information_schema.tables
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'",
                &[&schema],
            )
            .await?;
        for row in &table_rows {
            let table: String = row.get("table_name");
            payload
                .tables
                .entry(format!("{}.{}", schema, table))
                .or_default();
        }

        let index_rows = client
            .query(
                "SELECT indexname FROM pg_indexes WHERE schemaname = $1",
                &[&schema],
            )
            .await?;
        for row in &index_rows {
            let name: String = row.get("indexname");
            payload.indexes.insert(format!("{}.{}", schema, name));
        }

        debug!(
            "Introspected schema {} with {} tables, {} columns, {} indexes",
            schema,
            payload.tables.len(),
            payload.column_count(),
            payload.indexes.len()
        );

        Ok(payload)
    }
}
