//! Reconciliation Pipeline Module
//!
//! Everything that happens after a schema change is detected:
//!
//! 1. **Cycle**: detect, classify, back up, notify
//! 2. **Validation**: the configured check battery
//! 3. **Commit**: allow-listed staging and committing
//! 4. **Gate**: one cycle at a time, across processes

pub mod commit;
pub mod cycle;
pub mod docs;
pub mod gate;
pub mod validation;

pub use cycle::{CycleOutcome, CycleReport, CycleTrigger, Pipeline};
pub use validation::ValidationReport;
