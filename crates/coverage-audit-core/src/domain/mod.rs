//! Domain models for the coverage audit.
//!
//! - `WorkItem` / `IngestionRecord`: expected and observed task work
//! - `RunKey`: upstream run identifier accepted by the reprocessing queue
//! - `CoverageRecord` / `FileCoverageSet`: per-file line coverage

pub mod coverage;
pub mod error;
pub mod work;

pub use coverage::{CoverageByVariant, CoverageRecord, FileCoverageSet, VariantCoverage};
pub use error::{AuditError, ExprError, Result};
pub use work::{GroupBy, GroupKey, IngestionRecord, RunKey, WorkItem, RUN_KEY_SEPARATOR};
