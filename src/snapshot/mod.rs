//! Schema Snapshot Module
//!
//! Everything that looks at snapshots after detection:
//! - Diff marker parsing (typed reading of the privileged diff)
//! - Change classification (previous vs current)
//! - Backup and history (retention-bounded archive)

pub mod ddl;
pub mod diff;
pub mod store;

pub use diff::{ChangeClassifier, ChangeSet, Classification, Confidence};
pub use store::BackupManager;
