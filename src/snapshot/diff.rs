//! Change Classifier
//!
//! Compares the previous snapshot with the current one and decides whether
//! anything changed and, if so, what. Three sources of detail, best first:
//! diff markers from the privileged tool, a structural comparison of two
//! privileged payloads, and a coarse table/column comparison whenever a
//! fallback snapshot is involved. Only the first two are high confidence.

use crate::error::AppError;
use crate::introspection::{DetectionStrategy, SchemaPayload, SchemaSnapshot};
use crate::snapshot::ddl::parse_diff;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How much the classification can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Low,
}

/// Classified delta between two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub new_tables: Vec<String>,
    pub new_columns: BTreeMap<String, Vec<String>>,
    pub new_indexes: Vec<String>,
    /// Tables present before and missing now.
    #[serde(default)]
    pub dropped_tables: Vec<String>,
    pub summary: String,
    pub confidence: Confidence,
    pub from_fingerprint: String,
    pub to_fingerprint: String,
}

impl ChangeSet {
    pub fn new_column_count(&self) -> usize {
        self.new_columns.values().map(Vec::len).sum()
    }
}

/// Result of classifying one cycle
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// No previous snapshot: this capture becomes the baseline.
    Baseline,
    NoChange,
    Changed(ChangeSet),
}

/// The classifier that compares schema snapshots
pub struct ChangeClassifier;

impl ChangeClassifier {
    pub fn classify(
        previous: Option<&SchemaSnapshot>,
        current: &SchemaSnapshot,
    ) -> Result<Classification, AppError> {
        let Some(previous) = previous else {
            return Ok(Classification::Baseline);
        };

        // Recompute rather than trusting stored fingerprints.
        let from = SchemaSnapshot::compute_fingerprint(&previous.payload)?;
        let to = SchemaSnapshot::compute_fingerprint(&current.payload)?;
        if from == to {
            return Ok(Classification::NoChange);
        }

        let mixed = previous.strategy != current.strategy;
        if mixed && previous.payload.coarse() == current.payload.coarse() {
            // Same tables and columns seen through a different lens.
            return Ok(Classification::NoChange);
        }

        let mut change = if current.strategy == DetectionStrategy::Privileged {
            Self::from_markers(current).unwrap_or_else(|| {
                if mixed {
                    Self::coarse_diff(&previous.payload, &current.payload)
                } else {
                    Self::structural_diff(&previous.payload, &current.payload)
                }
            })
        } else {
            Self::coarse_diff(&previous.payload, &current.payload)
        };

        change.from_fingerprint = from;
        change.to_fingerprint = to;
        change.summary = Self::summarize(&change);
        Ok(Classification::Changed(change))
    }

    fn empty(confidence: Confidence) -> ChangeSet {
        ChangeSet {
            new_tables: Vec::new(),
            new_columns: BTreeMap::new(),
            new_indexes: Vec::new(),
            dropped_tables: Vec::new(),
            summary: String::new(),
            confidence,
            from_fingerprint: String::new(),
            to_fingerprint: String::new(),
        }
    }

    fn from_markers(current: &SchemaSnapshot) -> Option<ChangeSet> {
        let parsed = parse_diff(current.diff.as_deref()?);
        if parsed.is_empty() {
            return None;
        }
        let mut change = Self::empty(Confidence::High);
        change.new_tables = parsed.new_tables();
        change.new_columns = parsed.new_columns();
        change.new_indexes = parsed.new_indexes();
        Some(change)
    }

    /// Full comparison of two privileged payloads.
    fn structural_diff(from: &SchemaPayload, to: &SchemaPayload) -> ChangeSet {
        let mut change = Self::empty(Confidence::High);
        Self::diff_tables(&from.coarse(), &to.coarse(), &mut change);

        let display = |name: &String| crate::introspection::normalize_table_name(name);
        change.new_indexes = to
            .indexes
            .difference(&from.indexes)
            .map(display)
            .collect();
        change
    }

    /// Table/column enumeration only; cannot see types, defaults or indexes.
    fn coarse_diff(from: &SchemaPayload, to: &SchemaPayload) -> ChangeSet {
        let mut change = Self::empty(Confidence::Low);
        Self::diff_tables(&from.coarse(), &to.coarse(), &mut change);
        change
    }

    fn diff_tables(
        from: &BTreeMap<String, BTreeSet<String>>,
        to: &BTreeMap<String, BTreeSet<String>>,
        change: &mut ChangeSet,
    ) {
        for (table, columns) in to {
            match from.get(table) {
                None => change.new_tables.push(table.clone()),
                Some(before) => {
                    let added: Vec<String> = columns.difference(before).cloned().collect();
                    if !added.is_empty() {
                        change.new_columns.insert(table.clone(), added);
                    }
                }
            }
        }
        change.dropped_tables = from
            .keys()
            .filter(|t| !to.contains_key(*t))
            .cloned()
            .collect();
    }

    fn summarize(change: &ChangeSet) -> String {
        let mut parts = Vec::new();
        if !change.new_tables.is_empty() {
            parts.push(format!(
                "{} new table(s): {}",
                change.new_tables.len(),
                change.new_tables.join(", ")
            ));
        }
        if !change.new_columns.is_empty() {
            let detail: Vec<String> = change
                .new_columns
                .iter()
                .map(|(t, cols)| format!("{}({})", t, cols.join(", ")))
                .collect();
            parts.push(format!(
                "{} new column(s): {}",
                change.new_column_count(),
                detail.join("; ")
            ));
        }
        if !change.new_indexes.is_empty() {
            parts.push(format!(
                "{} new index(es): {}",
                change.new_indexes.len(),
                change.new_indexes.join(", ")
            ));
        }
        if !change.dropped_tables.is_empty() {
            parts.push(format!(
                "{} dropped table(s): {}",
                change.dropped_tables.len(),
                change.dropped_tables.join(", ")
            ));
        }

        let detail = if parts.is_empty() {
            "schema fingerprint changed".to_string()
        } else {
            parts.join("; ")
        };

        match change.confidence {
            Confidence::High => format!("Schema changed: {}", detail),
            Confidence::Low => format!(
                "Schema changed (low confidence, fallback detection only enumerates tables and columns): {}",
                detail
            ),
        }
    }
}
