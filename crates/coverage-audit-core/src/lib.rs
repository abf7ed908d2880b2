//! Coverage Audit Core Library
//!
//! Audits the code-coverage ETL pipeline through its query service:
//!
//! - [`reconcile`]: expected vs. ingested work per revision, with completion
//!   rates and missing-work sets
//! - [`requeue`]: at-most-once-per-process reprocessing requests for missing runs
//! - [`batch`]: volume-bounded, per-variant coverage fetching
//! - [`diff`]: directional line-coverage differences between variants

pub mod batch;
pub mod config;
pub mod diff;
pub mod domain;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod query;
pub mod reconcile;
pub mod requeue;
pub mod telemetry;

pub use batch::{partition_by_volume, CoverageBatchReader, FileBatch, FileWeight, Variant, VariantSpec};
pub use config::{AuditConfig, WorkQueueConfig};
pub use diff::{diff, CoverageDiff, DiffGroup, DiffRow};
pub use domain::{
    AuditError, CoverageByVariant, CoverageRecord, ExprError, FileCoverageSet, GroupBy, GroupKey,
    IngestionRecord, Result, RunKey, VariantCoverage, WorkItem,
};
pub use query::{Dataset, Expr, HttpQueryGateway, Predicate, Query, QueryGateway, QueryResponse};
pub use reconcile::{
    reconcile_group, GroupObservation, ReconciliationReport, Reconciler, TaskWindow, WorkGroup,
};
pub use requeue::{
    DryRunQueue, HttpWorkQueue, RequeueMessage, RequeuePublisher, SentForRerun, WorkQueue,
};

pub use metrics::METRICS;
pub use obs::PassSpan;
pub use telemetry::{init_tracing, LogOptions};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
