//! Schema docs
//!
//! Markdown page rewritten on every change cycle: the latest change followed
//! by the current table listing.

use crate::introspection::SchemaSnapshot;
use crate::snapshot::ChangeSet;
use std::fmt::Write as _;

pub fn render_schema_docs(snapshot: &SchemaSnapshot, change: &ChangeSet) -> String {
    let mut out = String::new();
    out.push_str("# Schema changes\n\n");
    let _ = writeln!(
        out,
        "_Last updated {} by {} detection (fingerprint `{}`)._\n",
        snapshot.captured_at.format("%Y-%m-%d %H:%M:%S UTC"),
        snapshot.strategy,
        &snapshot.fingerprint[..snapshot.fingerprint.len().min(12)]
    );

    out.push_str("## Latest change\n\n");
    let _ = writeln!(out, "{}\n", change.summary);
    for table in &change.new_tables {
        let _ = writeln!(out, "- new table `{}`", table);
    }
    for (table, columns) in &change.new_columns {
        for column in columns {
            let _ = writeln!(out, "- new column `{}.{}`", table, column);
        }
    }
    for index in &change.new_indexes {
        let _ = writeln!(out, "- new index `{}`", index);
    }
    for table in &change.dropped_tables {
        let _ = writeln!(out, "- dropped table `{}`", table);
    }

    out.push_str("\n## Current tables\n\n");
    out.push_str("| Table | Columns |\n|---|---|\n");
    for (table, columns) in snapshot.payload.coarse() {
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        let _ = writeln!(out, "| `{}` | {} |", table, columns.join(", "));
    }
    out
}
