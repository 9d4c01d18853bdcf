//! Fallback detection
//!
//! Uses only the application's restricted client: the REST endpoint's
//! OpenAPI description, which enumerates exposed tables and their columns.
//! No indexes, no structured diff.

use super::SchemaBackend;
use crate::bindings::render_typescript;
use crate::config::{Credentials, FallbackConfig};
use crate::error::AppError;
use crate::introspection::{ColumnShape, DetectionStrategy, SchemaPayload, SchemaSnapshot};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// PostgREST marks primary key columns with this tag in their description.
const PRIMARY_KEY_TAG: &str = "<pk/>";

pub struct FallbackBackend {
    client: reqwest::Client,
    rest_url: Option<Url>,
    anon_key: Option<String>,
    timeout: Duration,
}

impl FallbackBackend {
    pub fn new(credentials: &Credentials, settings: &FallbackConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            rest_url: credentials.rest_url.clone(),
            anon_key: credentials.anon_key.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }

    fn endpoint(&self) -> Result<(Url, &str), AppError> {
        let base = self
            .rest_url
            .as_ref()
            .ok_or_else(|| AppError::StrategyUnavailable("SUPABASE_URL is not set".to_string()))?;
        let key = self.anon_key.as_deref().ok_or_else(|| {
            AppError::StrategyUnavailable("SUPABASE_ANON_KEY is not set".to_string())
        })?;
        let url = base
            .join("rest/v1/")
            .map_err(|e| AppError::StrategyUnavailable(format!("invalid SUPABASE_URL: {}", e)))?;
        Ok((url, key))
    }
}

#[async_trait]
impl SchemaBackend for FallbackBackend {
    fn strategy(&self) -> DetectionStrategy {
        DetectionStrategy::Fallback
    }

    async fn detect(&self) -> Result<SchemaSnapshot, AppError> {
        let (url, key) = self.endpoint()?;

        let response = self
            .client
            .get(url.clone())
            .header("apikey", key)
            .bearer_auth(key)
            .header("Accept", "application/openapi+json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| AppError::TransientDetection(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::TransientDetection(format!(
                "GET {} returned HTTP {}",
                url,
                status.as_u16()
            )));
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| AppError::TransientDetection(format!("invalid OpenAPI body: {}", e)))?;

        let payload = parse_openapi(&document)?;
        debug!(
            "Fallback introspection found {} tables, {} columns",
            payload.tables.len(),
            payload.column_count()
        );
        SchemaSnapshot::new(DetectionStrategy::Fallback, payload)
    }

    async fn regenerate_bindings(&self, snapshot: &SchemaSnapshot) -> Result<String, AppError> {
        Ok(render_typescript(&snapshot.payload))
    }
}

/// Build a payload from the OpenAPI (Swagger 2.0) document served by the
/// REST endpoint.
pub fn parse_openapi(document: &Value) -> Result<SchemaPayload, AppError> {
    let definitions = document
        .get("definitions")
        .and_then(Value::as_object)
        .ok_or_else(|| {
            AppError::TransientDetection("OpenAPI document has no definitions".to_string())
        })?;

    let mut payload = SchemaPayload::default();
    for (table, definition) in definitions {
        let required: Vec<&str> = definition
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let shape = payload.tables.entry(table.clone()).or_default();
        let Some(properties) = definition.get("properties").and_then(Value::as_object) else {
            continue;
        };

        for (column, property) in properties {
            let data_type = property
                .get("format")
                .or_else(|| property.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let default_value = property.get("default").map(|d| match d {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            let is_primary_key = property
                .get("description")
                .and_then(Value::as_str)
                .map(|d| d.contains(PRIMARY_KEY_TAG))
                .unwrap_or(false);

            shape.columns.insert(
                column.clone(),
                ColumnShape {
                    data_type,
                    nullable: !required.contains(&column.as_str()),
                    default_value,
                    is_primary_key,
                },
            );
        }
    }

    Ok(payload)
}
