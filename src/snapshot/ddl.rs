//! Diff marker parser
//!
//! Reads the SQL emitted by the platform CLI's schema diff and extracts the
//! statements that create structure: tables, added columns and indexes.
//! Anything else in the diff (grants, comments, policies, drops) is counted
//! but not classified.

use crate::introspection::normalize_table_name;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

const IDENT: &str = r#"(?:"[^"]+"|[A-Za-z_][A-Za-z0-9_$]*)"#;

static CREATE_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^create\s+(?:unlogged\s+)?table\s+(?:if\s+not\s+exists\s+)?({id}(?:\.{id})?)",
        id = IDENT
    ))
    .expect("valid CREATE TABLE pattern")
});

static ALTER_ADD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^alter\s+table\s+(?:if\s+exists\s+)?(?:only\s+)?({id}(?:\.{id})?)\s+add\s+(?:column\s+)?(?:if\s+not\s+exists\s+)?({id})",
        id = IDENT
    ))
    .expect("valid ALTER TABLE ADD pattern")
});

static CREATE_INDEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)^create\s+(?:unique\s+)?index\s+(?:concurrently\s+)?(?:if\s+not\s+exists\s+)?({id}(?:\.{id})?)",
        id = IDENT
    ))
    .expect("valid CREATE INDEX pattern")
});

/// Words that follow `ADD` without naming a column.
const ADD_NON_COLUMN: &[&str] = &[
    "constraint", "primary", "foreign", "unique", "check", "exclude",
];

/// One recognised statement from a structured diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffMarker {
    CreateTable { table: String },
    AddColumn { table: String, column: String },
    CreateIndex { name: String },
}

/// Markers extracted from a diff, plus how many statements were left unclassified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDiff {
    pub markers: Vec<DiffMarker>,
    pub unclassified: usize,
}

impl ParsedDiff {
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn new_tables(&self) -> Vec<String> {
        self.markers
            .iter()
            .filter_map(|m| match m {
                DiffMarker::CreateTable { table } => Some(table.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn new_columns(&self) -> BTreeMap<String, Vec<String>> {
        let mut columns: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for marker in &self.markers {
            if let DiffMarker::AddColumn { table, column } = marker {
                columns.entry(table.clone()).or_default().push(column.clone());
            }
        }
        columns
    }

    pub fn new_indexes(&self) -> Vec<String> {
        self.markers
            .iter()
            .filter_map(|m| match m {
                DiffMarker::CreateIndex { name } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

fn unquote(ident: &str) -> String {
    ident.trim_matches('"').to_string()
}

/// Split SQL into statements, dropping `--` comments. Quoted literals and
/// identifiers are kept whole, so `--` or `;` inside them neither starts a
/// comment nor ends a statement.
fn statements(sql: &str) -> Vec<String> {
    let mut raw = Vec::new();
    let mut current = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(open) = quote {
            current.push(c);
            // A doubled quote closes and reopens, which leaves the state right.
            if c == open {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                for skipped in chars.by_ref() {
                    if skipped == '\n' {
                        current.push('\n');
                        break;
                    }
                }
            }
            ';' => raw.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    raw.push(current);

    raw.into_iter()
        .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse the SQL diff text produced by the privileged tool.
pub fn parse_diff(sql: &str) -> ParsedDiff {
    let mut parsed = ParsedDiff::default();

    for stmt in statements(sql) {
        if let Some(caps) = CREATE_TABLE.captures(&stmt) {
            parsed.markers.push(DiffMarker::CreateTable {
                table: normalize_table_name(&caps[1]),
            });
        } else if let Some(caps) = ALTER_ADD.captures(&stmt) {
            let column = unquote(&caps[2]);
            if ADD_NON_COLUMN.contains(&column.to_lowercase().as_str()) {
                parsed.unclassified += 1;
                continue;
            }
            parsed.markers.push(DiffMarker::AddColumn {
                table: normalize_table_name(&caps[1]),
                column,
            });
        } else if let Some(caps) = CREATE_INDEX.captures(&stmt) {
            parsed.markers.push(DiffMarker::CreateIndex {
                name: normalize_table_name(&caps[1]),
            });
        } else {
            parsed.unclassified += 1;
        }
    }

    parsed
}
