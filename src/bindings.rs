//! Binding Regenerator
//!
//! Writes the typed bindings file from freshly generated source while
//! keeping the hand-written block that follows the custom marker. The file
//! as it was before the merge is copied to a timestamped backup first.
//!
//! [`render_typescript`] is the local, lower-fidelity generator used when the
//! platform CLI is not available.

use crate::error::AppError;
use crate::introspection::{DetectionStrategy, SchemaPayload};
use crate::store::write_atomic;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CUSTOM_PLACEHOLDER: &str = "// Hand-written types below this line are kept when bindings are regenerated.";

/// Result of one regeneration
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingsOutcome {
    pub path: PathBuf,
    pub backup: Option<PathBuf>,
    pub strategy: DetectionStrategy,
    pub preserved_custom_block: bool,
    pub bytes_written: usize,
}

pub struct BindingRegenerator {
    bindings_file: PathBuf,
    backup_dir: PathBuf,
    marker: String,
}

impl BindingRegenerator {
    pub fn new(
        bindings_file: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        marker: impl Into<String>,
    ) -> Self {
        Self {
            bindings_file: bindings_file.into(),
            backup_dir: backup_dir.into(),
            marker: marker.into(),
        }
    }

    pub fn bindings_file(&self) -> &Path {
        &self.bindings_file
    }

    /// Back up the current file, then write `generated` merged with its custom block.
    pub async fn write(
        &self,
        generated: &str,
        strategy: DetectionStrategy,
    ) -> Result<BindingsOutcome, AppError> {
        let previous = match tokio::fs::read_to_string(&self.bindings_file).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let backup = match &previous {
            Some(text) => Some(self.backup(text).await?),
            None => None,
        };

        let preserved = previous
            .as_deref()
            .and_then(|p| custom_block(p, &self.marker))
            .is_some();
        let merged = merge(generated, previous.as_deref(), &self.marker);
        write_atomic(&self.bindings_file, merged.as_bytes()).await?;

        info!(
            "🧬 Regenerated {} ({} strategy, {} bytes, custom block {})",
            self.bindings_file.display(),
            strategy,
            merged.len(),
            if preserved { "preserved" } else { "initialized" }
        );

        Ok(BindingsOutcome {
            path: self.bindings_file.clone(),
            backup,
            strategy,
            preserved_custom_block: preserved,
            bytes_written: merged.len(),
        })
    }

    async fn backup(&self, contents: &str) -> Result<PathBuf, AppError> {
        let file_name = self
            .bindings_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bindings".to_string());
        let path = self.backup_dir.join(format!(
            "{}.{}.bak",
            file_name,
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        write_atomic(&path, contents.as_bytes()).await?;
        debug!("Backed up bindings to {}", path.display());
        Ok(path)
    }
}

/// The custom block of a previous file: the marker line through end of file.
pub fn custom_block<'a>(previous: &'a str, marker: &str) -> Option<&'a str> {
    previous.find(marker).map(|pos| &previous[pos..])
}

/// Generated source followed by the preserved (or a fresh) custom block.
pub fn merge(generated: &str, previous: Option<&str>, marker: &str) -> String {
    // Generated output must not carry its own custom block.
    let generated = match generated.find(marker) {
        Some(pos) => &generated[..pos],
        None => generated,
    };

    let mut merged = String::with_capacity(generated.len() + 256);
    merged.push_str(generated.trim_end());
    merged.push_str("\n\n");
    match previous.and_then(|p| custom_block(p, marker)) {
        Some(block) => merged.push_str(block),
        None => {
            merged.push_str(marker);
            merged.push('\n');
            merged.push_str(CUSTOM_PLACEHOLDER);
        }
    }
    if !merged.ends_with('\n') {
        merged.push('\n');
    }
    merged
}

// ==================== Local generator ====================

fn ts_type(data_type: &str) -> &'static str {
    let t = data_type.to_ascii_lowercase();
    if t == "array" || t.ends_with("[]") || t.starts_with('_') {
        return "Json[]";
    }
    match t.as_str() {
        "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" | "numeric" | "decimal"
        | "real" | "double precision" | "float4" | "float8" | "number" => "number",
        "boolean" | "bool" => "boolean",
        "json" | "jsonb" => "Json",
        _ => "string",
    }
}

fn ts_key(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\\\""))
    }
}

/// Render a `Database` type from a payload, one `Row`/`Insert`/`Update`
/// triple per table, grouped by schema.
pub fn render_typescript(payload: &SchemaPayload) -> String {
    let mut schemas: BTreeMap<&str, Vec<(&str, &crate::introspection::TableShape)>> =
        BTreeMap::new();
    for (name, table) in &payload.tables {
        let (schema, table_name) = name.split_once('.').unwrap_or(("public", name.as_str()));
        schemas.entry(schema).or_default().push((table_name, table));
    }
    schemas.entry("public").or_default();

    let mut out = String::new();
    out.push_str("export type Json =\n  | string\n  | number\n  | boolean\n  | null\n  | { [key: string]: Json | undefined }\n  | Json[]\n\n");
    out.push_str("export type Database = {\n");
    for (schema, tables) in &schemas {
        let _ = writeln!(out, "  {}: {{", ts_key(schema));
        out.push_str("    Tables: {\n");
        for (table, shape) in tables {
            let _ = writeln!(out, "      {}: {{", ts_key(table));
            for section in ["Row", "Insert", "Update"] {
                let _ = writeln!(out, "        {}: {{", section);
                for (column, col) in &shape.columns {
                    let mut ty = ts_type(&col.data_type).to_string();
                    if col.nullable {
                        ty.push_str(" | null");
                    }
                    let optional = match section {
                        "Row" => false,
                        "Insert" => col.nullable || col.default_value.is_some(),
                        _ => true,
                    };
                    let _ = writeln!(
                        out,
                        "          {}{}: {}",
                        ts_key(column),
                        if optional { "?" } else { "" },
                        ty
                    );
                }
                out.push_str("        }\n");
            }
            out.push_str("      }\n");
        }
        out.push_str("    }\n");
        out.push_str("  }\n");
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::{ColumnShape, TableShape};

    const MARKER: &str = "// ==== CUSTOM TYPES (preserved across regeneration) ====";

    #[test]
    fn merge_preserves_custom_block() {
        let previous = format!(
            "export type Old = 1\n\n{}\nexport type Mine = {{ a: string }}\n",
            MARKER
        );
        let merged = merge("export type New = 2\n", Some(&previous), MARKER);

        assert!(merged.starts_with("export type New = 2\n\n"));
        assert!(merged.contains("export type Mine = { a: string }"));
        assert!(!merged.contains("Old"));
        assert_eq!(merged.matches(MARKER).count(), 1);
    }

    #[test]
    fn merge_without_previous_adds_marker() {
        let merged = merge("export type New = 2", None, MARKER);
        assert!(merged.contains(MARKER));
        assert!(merged.ends_with('\n'));
    }

    #[test]
    fn render_typescript_maps_types_and_optionality() {
        let mut table = TableShape::default();
        table.columns.insert(
            "id".to_string(),
            ColumnShape {
                data_type: "uuid".to_string(),
                nullable: false,
                default_value: Some("gen_random_uuid()".to_string()),
                is_primary_key: true,
            },
        );
        table.columns.insert(
            "total".to_string(),
            ColumnShape {
                data_type: "numeric".to_string(),
                nullable: true,
                default_value: None,
                is_primary_key: false,
            },
        );
        let mut payload = SchemaPayload::default();
        payload.tables.insert("public.orders".to_string(), table);

        let ts = render_typescript(&payload);
        assert!(ts.contains("export type Database = {"));
        assert!(ts.contains("      orders: {"));
        assert!(ts.contains("          id: string\n"));
        assert!(ts.contains("          id?: string\n"));
        assert!(ts.contains("          total?: number | null\n"));
    }

    #[tokio::test]
    async fn write_backs_up_and_keeps_custom_types() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("src/types/database.ts");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, format!("old\n{}\nexport type Mine = 1\n", MARKER)).unwrap();

        let regen = BindingRegenerator::new(&file, dir.path().join("backups"), MARKER);
        let outcome = regen
            .write("export type Fresh = 1\n", DetectionStrategy::Fallback)
            .await
            .unwrap();

        assert!(outcome.preserved_custom_block);
        let backup = outcome.backup.unwrap();
        assert!(std::fs::read_to_string(backup).unwrap().starts_with("old"));
        let written = std::fs::read_to_string(&file).unwrap();
        assert!(written.starts_with("export type Fresh = 1"));
        assert!(written.contains("export type Mine = 1"));
    }
}
