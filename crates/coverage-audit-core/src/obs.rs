//! Structured observability hooks for the audit passes.
//!
//! Events are emitted at `info!` level unless noted (configurable via
//! `RUST_LOG`). For JSON output, pass `--json` to the CLI.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::domain::work::{GroupKey, RunKey};
use crate::reconcile::{ReconciliationReport, SAMPLE_SIZE};

/// RAII guard that enters a pass-scoped tracing span.
///
/// # Example
///
/// ```ignore
/// let _span = PassSpan::enter("status");
/// // every event below is tagged pass = "status"
/// ```
pub struct PassSpan {
    _span: tracing::span::EnteredSpan,
}

impl PassSpan {
    pub fn enter(pass: &str) -> Self {
        let span = tracing::info_span!("coverage_audit.pass", pass = %pass);
        Self {
            _span: span.entered(),
        }
    }
}

fn sample<T: ToString>(items: impl IntoIterator<Item = T>) -> Vec<String> {
    items
        .into_iter()
        .take(SAMPLE_SIZE)
        .map(|i| i.to_string())
        .collect()
}

/// Emit event: one reconciliation group's completion.
pub fn emit_group_status(report: &ReconciliationReport) {
    info!(
        event = "status.group",
        group = %report.group,
        overall_rate = report.overall_rate,
        ingested_tasks = report.ingested_tasks,
        total_tasks = report.total_tasks,
        task_rate = report.task_rate,
        summary_files = report.summary_files,
        files_processed = report.files_processed,
        file_rate = report.file_rate,
    );
}

/// Emit event: tasks expected but not ingested (first few listed).
pub fn emit_missing_tasks(group: &GroupKey, missing: &BTreeSet<String>) {
    info!(
        event = "status.missing_tasks",
        group = %group,
        num = missing.len(),
        sample = ?sample(missing),
    );
}

/// Emit event: processed files absent from the summary (first few listed).
pub fn emit_missing_files(group: &GroupKey, missing: &BTreeSet<String>) {
    info!(
        event = "status.missing_files",
        group = %group,
        num = missing.len(),
        sample = ?sample(missing),
    );
}

/// Emit event: run keys sent for reprocessing (not previously sent).
pub fn emit_requeue_sent(keys: &[RunKey]) {
    info!(
        event = "requeue.sent",
        num = keys.len(),
        keys = ?keys.iter().map(RunKey::as_str).collect::<Vec<_>>(),
    );
}

/// Emit event: one coverage batch fetched.
pub fn emit_batch_fetched(files: usize, weight: u64, records: usize) {
    info!(event = "coverage.batch_fetched", files, weight, records);
}

/// Emit event: a request returned as many rows as its limit (warning level);
/// the result is probably truncated.
pub fn emit_row_limit_reached(what: &str, rows: u64, limit: u64) {
    if rows >= limit {
        warn!(event = "query.row_limit", what = %what, rows, limit);
    }
}

/// Emit event: one ranked diff row.
pub fn emit_diff_row(row: &crate::diff::DiffRow, rank: usize) {
    info!(
        event = "diff.row",
        variant_x = %row.variant_x,
        variant_y = %row.variant_y,
        rank,
        file = %row.file,
        additional = row.remainder_size,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_span_create() {
        let _span = PassSpan::enter("diff");
    }

    #[test]
    fn test_sample_takes_first_three() {
        let set: BTreeSet<String> = ["d", "a", "c", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(sample(&set), ["a", "b", "c"]);
    }
}
