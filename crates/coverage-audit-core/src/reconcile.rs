//! Ingestion reconciliation.
//!
//! Expected work (test tasks of coverage builds) is grouped by revision, or
//! revision and branch, and each group is compared with what reached the
//! `coverage` and `coverage-summary` datasets:
//!
//! - `task_rate` = ingested expected tasks / expected tasks
//! - `file_rate` = summarised files / processed files (only looked up once
//!   any task is ingested)
//! - `overall_rate` = `task_rate * file_rate`
//!
//! Missing tasks are mapped to their upstream [`RunKey`]s and handed to the
//! [`RequeuePublisher`]. Missing files are reported only.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::domain::coverage::FILE_NAME_FIELD;
use crate::domain::error::Result;
use crate::domain::work::{GroupBy, GroupKey, IngestionRecord, RunKey, WorkItem};
use crate::obs;
use crate::query::{CompareOp, Dataset, Expr, Projection, Query, QueryGateway};
use crate::requeue::RequeuePublisher;

pub const DEFAULT_TASK_LIMIT: u64 = 10_000;
pub const DEFAULT_FILE_LIMIT: u64 = 100_000;

/// Identifiers listed in log lines about a gap.
pub const SAMPLE_SIZE: usize = 3;

const REVISION_FIELD: &str = "repo.changeset.id12";
const BRANCH_FIELD: &str = "repo.branch.name";

// ---------------------------------------------------------------------------
// Expected work
// ---------------------------------------------------------------------------

/// Which finished coverage tasks count as expected work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWindow {
    /// Tasks must have ended at least this long ago.
    pub settle_hours: u32,
    /// Tasks must have ended within this many days.
    pub lookback_days: u32,
    /// Restrict to these revisions (12-char ids); empty means all.
    #[serde(default)]
    pub revisions: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

impl Default for TaskWindow {
    fn default() -> Self {
        TaskWindow {
            settle_hours: 6,
            lookback_days: 3,
            revisions: Vec::new(),
            branch: None,
        }
    }
}

impl TaskWindow {
    /// The `task` dataset query for this window.
    pub fn query(&self, limit: u64) -> Query {
        let mut terms = vec![
            Expr::eq("treeherder.jobKind", "test"),
            Expr::eq("task.run.state", "completed"),
            Expr::eq("build.type", "ccov"),
            Expr::compare(
                CompareOp::Lt,
                "action.end_time",
                json!({"date": format!("now-{}hour", self.settle_hours)}),
            ),
            Expr::compare(
                CompareOp::Gte,
                "action.end_time",
                json!({"date": format!("now-{}day", self.lookback_days)}),
            ),
        ];
        if !self.revisions.is_empty() {
            terms.push(Expr::Member {
                op: crate::query::MemberOp::In,
                field: REVISION_FIELD.to_string(),
                values: self.revisions.iter().map(|r| json!(r)).collect(),
            });
        }
        if let Some(branch) = &self.branch {
            terms.push(Expr::eq(BRANCH_FIELD, branch.as_str()));
        }

        Query::new(Dataset::Task)
            .select(Projection::field("_id"))
            .select(Projection::named("date", "repo.changeset.date"))
            .select(Projection::named("task", "task.id"))
            .select(Projection::named("rev", REVISION_FIELD))
            .select(Projection::named("branch", BRANCH_FIELD))
            .filter(Expr::all(terms))
            .limit(limit)
    }
}

/// Expected work sharing one [`GroupKey`].
#[derive(Debug, Clone, PartialEq)]
pub struct WorkGroup {
    pub key: GroupKey,
    pub items: Vec<WorkItem>,
}

impl WorkGroup {
    /// Distinct non-empty task ids.
    pub fn task_ids(&self) -> BTreeSet<String> {
        self.items
            .iter()
            .filter_map(|i| i.task_id.clone())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// Stable sort putting the most recent changesets first; undated items last.
pub fn sort_most_recent_first(items: &mut [WorkItem]) {
    items.sort_by(|a, b| match (a.date, b.date) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// Group `items` by key, groups in first-seen order. Items without a
/// revision belong to no group.
pub fn group_work(items: Vec<WorkItem>, group_by: GroupBy) -> Vec<WorkGroup> {
    let mut index: HashMap<GroupKey, usize> = HashMap::new();
    let mut groups: Vec<WorkGroup> = Vec::new();
    for item in items {
        let Some(key) = GroupKey::for_item(&item, group_by) else {
            debug!(record_id = ?item.record_id, "work item has no revision");
            continue;
        };
        match index.get(&key) {
            Some(&idx) => groups[idx].items.push(item),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push(WorkGroup {
                    key,
                    items: vec![item],
                });
            }
        }
    }
    groups
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What the datasets show for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupObservation {
    pub ingested_tasks: BTreeSet<String>,
    pub files_processed: BTreeSet<String>,
    pub summary_files: BTreeSet<String>,
}

impl GroupObservation {
    /// Distinct confirmed task ids among `records`.
    pub fn with_ingested(records: &[IngestionRecord]) -> Self {
        GroupObservation {
            ingested_tasks: records
                .iter()
                .filter_map(|r| r.confirmed_task().map(str::to_string))
                .collect(),
            ..Default::default()
        }
    }
}

/// Completion of one reconciliation group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub group: GroupKey,
    /// Changeset date of the group's most recent item.
    pub ingestion_date: Option<DateTime<Utc>>,
    pub total_tasks: usize,
    pub ingested_tasks: usize,
    /// Tasks seen in `coverage` that were not expected.
    pub unexpected_tasks: usize,
    pub task_rate: f64,
    pub files_processed: usize,
    pub summary_files: usize,
    pub file_rate: f64,
    pub overall_rate: f64,
    pub missing_tasks: BTreeSet<String>,
    /// Upstream runs producing `missing_tasks`.
    pub missing_runs: BTreeSet<RunKey>,
    /// Processed files absent from the summary; only filled when no task is
    /// missing.
    pub missing_files: BTreeSet<String>,
}

impl ReconciliationReport {
    pub fn is_complete(&self) -> bool {
        self.missing_tasks.is_empty() && self.missing_files.is_empty()
    }
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date = self
            .ingestion_date
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "unknown date".to_string());
        write!(
            f,
            "{} - {} DONE - {} Tasks {}/{} ({})  Files {}/{} ({})",
            self.group,
            percent(self.overall_rate),
            date,
            self.ingested_tasks,
            self.total_tasks,
            percent(self.task_rate),
            self.summary_files,
            self.files_processed,
            percent(self.file_rate),
        )
    }
}

/// Reconcile one group against its observation.
///
/// Returns `None` when the group has no expected task ids. Ingested tasks
/// and summarised files are counted only when they fall inside the
/// expected / processed sets, so both rates stay within `[0, 1]`.
pub fn reconcile_group(group: &WorkGroup, observed: &GroupObservation) -> Option<ReconciliationReport> {
    let total: BTreeSet<String> = group.task_ids();
    if total.is_empty() {
        return None;
    }

    let ingested: BTreeSet<&String> = total.intersection(&observed.ingested_tasks).collect();
    let unexpected_tasks = observed.ingested_tasks.len() - ingested.len();
    let task_rate = ingested.len() as f64 / total.len() as f64;

    let summarised = observed
        .files_processed
        .intersection(&observed.summary_files)
        .count();
    let file_rate = if ingested.is_empty() || observed.files_processed.is_empty() {
        0.0
    } else {
        summarised as f64 / observed.files_processed.len() as f64
    };

    let missing_tasks: BTreeSet<String> = total.difference(&observed.ingested_tasks).cloned().collect();
    let missing_runs: BTreeSet<RunKey> = group
        .items
        .iter()
        .filter(|i| i.task_id.as_ref().is_some_and(|t| missing_tasks.contains(t)))
        .filter_map(WorkItem::run_key)
        .collect();
    let missing_files = if missing_tasks.is_empty() {
        observed
            .files_processed
            .difference(&observed.summary_files)
            .cloned()
            .collect()
    } else {
        BTreeSet::new()
    };

    Some(ReconciliationReport {
        group: group.key.clone(),
        ingestion_date: group.items.first().and_then(WorkItem::changeset_date),
        total_tasks: total.len(),
        ingested_tasks: ingested.len(),
        unexpected_tasks,
        task_rate,
        files_processed: observed.files_processed.len(),
        summary_files: summarised,
        file_rate,
        overall_rate: task_rate * file_rate,
        missing_tasks,
        missing_runs,
        missing_files,
    })
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FileRow {
    #[serde(default)]
    file: Option<String>,
}

/// Fetches expected and observed work and reconciles group by group.
pub struct Reconciler {
    gateway: Arc<dyn QueryGateway>,
    group_by: GroupBy,
    task_limit: u64,
    file_limit: u64,
}

impl Reconciler {
    pub fn new(gateway: Arc<dyn QueryGateway>) -> Self {
        Self {
            gateway,
            group_by: GroupBy::default(),
            task_limit: DEFAULT_TASK_LIMIT,
            file_limit: DEFAULT_FILE_LIMIT,
        }
    }

    pub fn with_group_by(mut self, group_by: GroupBy) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn with_limits(mut self, task_limit: u64, file_limit: u64) -> Self {
        self.task_limit = task_limit;
        self.file_limit = file_limit;
        self
    }

    /// Expected work in `window`, most recent changeset first.
    pub async fn expected_work(&self, window: &TaskWindow) -> Result<Vec<WorkItem>> {
        let response = self.gateway.execute(&window.query(self.task_limit)).await?;
        let mut items: Vec<WorkItem> = response.decode()?;
        obs::emit_row_limit_reached("task.expected", items.len() as u64, self.task_limit);
        sort_most_recent_first(&mut items);
        Ok(items)
    }

    fn scope(key: &GroupKey) -> Expr {
        let mut terms = vec![Expr::eq(REVISION_FIELD, key.revision.as_str())];
        if let Some(branch) = &key.branch {
            terms.push(Expr::eq(BRANCH_FIELD, branch.as_str()));
        }
        Expr::all(terms)
    }

    async fn distinct_files(&self, from: Dataset, scope: &Expr) -> Result<BTreeSet<String>> {
        let query = Query::new(from)
            .edge(Projection::named("file", FILE_NAME_FIELD))
            .filter(scope.clone())
            .limit(self.file_limit);
        let rows: Vec<FileRow> = self.gateway.execute(&query).await?.decode()?;
        obs::emit_row_limit_reached("files.distinct", rows.len() as u64, self.file_limit);
        Ok(rows.into_iter().filter_map(|r| r.file).collect())
    }

    /// Everything the datasets show for `key`. File sets are only fetched
    /// once some task of the group has been ingested.
    pub async fn observe(&self, key: &GroupKey) -> Result<GroupObservation> {
        let scope = Self::scope(key);
        let query = Query::new(Dataset::Coverage)
            .edge(Projection::named("task", "task.id"))
            .filter(scope.clone())
            .limit(self.task_limit);
        let records: Vec<IngestionRecord> = self.gateway.execute(&query).await?.decode()?;
        let mut observed = GroupObservation::with_ingested(&records);

        if !observed.ingested_tasks.is_empty() {
            observed.files_processed = self.distinct_files(Dataset::Coverage, &scope).await?;
            observed.summary_files = self.distinct_files(Dataset::CoverageSummary, &scope).await?;
        }
        Ok(observed)
    }

    /// Reconcile `expected` group by group, in input order.
    ///
    /// Each group's observation is fully fetched before its missing work is
    /// computed. Missing runs go to `publisher` when one is given. Any
    /// gateway or queue failure aborts the pass.
    pub async fn reconcile(
        &self,
        expected: Vec<WorkItem>,
        mut publisher: Option<&mut RequeuePublisher>,
    ) -> Result<Vec<ReconciliationReport>> {
        let mut reports = Vec::new();
        for group in group_work(expected, self.group_by) {
            if group.task_ids().is_empty() {
                debug!(group = %group.key, "no expected tasks, skipping");
                continue;
            }
            let observed = self.observe(&group.key).await?;
            let Some(report) = reconcile_group(&group, &observed) else {
                continue;
            };

            obs::emit_group_status(&report);
            if !report.missing_tasks.is_empty() {
                obs::emit_missing_tasks(&report.group, &report.missing_tasks);
                if let Some(publisher) = publisher.as_deref_mut() {
                    publisher.publish(&report.missing_runs).await?;
                }
            } else if !report.missing_files.is_empty() {
                obs::emit_missing_files(&report.group, &report.missing_files);
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Fetch the expected work in `window` and reconcile it.
    pub async fn run_status(
        &self,
        window: &TaskWindow,
        publisher: Option<&mut RequeuePublisher>,
    ) -> Result<Vec<ReconciliationReport>> {
        let expected = self.expected_work(window).await?;
        debug!(items = expected.len(), "expected work fetched");
        self.reconcile(expected, publisher).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, task: &str, rev: &str, date: f64) -> WorkItem {
        WorkItem {
            record_id: Some(id.to_string()),
            task_id: Some(task.to_string()),
            revision: Some(rev.to_string()),
            branch: Some("mozilla-central".to_string()),
            date: Some(date),
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn group(items: Vec<WorkItem>) -> WorkGroup {
        group_work(items, GroupBy::RevisionBranch).remove(0)
    }

    #[test]
    fn test_partial_ingestion_reports_missing_runs() {
        let g = group(vec![
            item("r1:a", "T1", "R", 1.0),
            item("r2:a", "T2", "R", 1.0),
            item("r3:a", "T3", "R", 1.0),
            item("r3:b", "T3", "R", 1.0),
        ]);
        let observed = GroupObservation {
            ingested_tasks: set(&["T1", "T2"]),
            files_processed: set(&["a", "b"]),
            summary_files: set(&["a", "b"]),
        };
        let report = reconcile_group(&g, &observed).unwrap();
        assert!((report.task_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.missing_tasks, set(&["T3"]));
        assert_eq!(report.missing_runs, BTreeSet::from([RunKey::from("r3")]));
        assert!(report.missing_files.is_empty());
    }

    #[test]
    fn test_complete_tasks_surface_missing_files() {
        let g = group(vec![item("r1:a", "T1", "R", 1.0)]);
        let observed = GroupObservation {
            ingested_tasks: set(&["T1"]),
            files_processed: set(&["a", "b", "c"]),
            summary_files: set(&["a", "b"]),
        };
        let report = reconcile_group(&g, &observed).unwrap();
        assert_eq!(report.task_rate, 1.0);
        assert!((report.file_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.missing_files, set(&["c"]));
        assert!(report.missing_runs.is_empty());
    }

    #[test]
    fn test_rates_stay_in_unit_interval() {
        let g = group(vec![item("r1:a", "T1", "R", 1.0)]);
        let observed = GroupObservation {
            ingested_tasks: set(&["T1", "T9", "T10"]),
            files_processed: set(&["a"]),
            summary_files: set(&["a", "z"]),
        };
        let report = reconcile_group(&g, &observed).unwrap();
        assert_eq!(report.task_rate, 1.0);
        assert_eq!(report.file_rate, 1.0);
        assert_eq!(report.unexpected_tasks, 2);
        assert!(report.missing_tasks.is_empty());
    }

    #[test]
    fn test_nothing_ingested_has_zero_file_rate() {
        let g = group(vec![item("r1:a", "T1", "R", 1.0)]);
        let report = reconcile_group(&g, &GroupObservation::default()).unwrap();
        assert_eq!(report.task_rate, 0.0);
        assert_eq!(report.file_rate, 0.0);
        assert_eq!(report.overall_rate, 0.0);
    }

    #[test]
    fn test_group_without_tasks_is_skipped() {
        let mut no_task = item("r1:a", "", "R", 1.0);
        no_task.task_id = None;
        let g = group(vec![no_task]);
        assert!(reconcile_group(&g, &GroupObservation::default()).is_none());
    }

    #[test]
    fn test_grouping_keeps_first_seen_order_after_date_sort() {
        let mut items = vec![
            item("a:1", "T1", "OLD", 100.0),
            item("b:1", "T2", "NEW", 300.0),
            item("c:1", "T3", "MID", 200.0),
            item("d:1", "T4", "NEW", 300.0),
        ];
        sort_most_recent_first(&mut items);
        let groups = group_work(items, GroupBy::Revision);
        let order: Vec<_> = groups.iter().map(|g| g.key.revision.as_str()).collect();
        assert_eq!(order, ["NEW", "MID", "OLD"]);
        assert_eq!(groups[0].items.len(), 2);
    }

    #[test]
    fn test_report_status_line() {
        let g = group(vec![item("r1:a", "T1", "abc", 1_500_000_000.0), item("r2:a", "T2", "abc", 1.0)]);
        let observed = GroupObservation {
            ingested_tasks: set(&["T1"]),
            files_processed: set(&["a", "b"]),
            summary_files: set(&["a"]),
        };
        let line = reconcile_group(&g, &observed).unwrap().to_string();
        assert_eq!(
            line,
            "mozilla-central-abc - 25.0% DONE - 2017-07-14 02:40:00 Tasks 1/2 (50.0%)  Files 1/2 (50.0%)"
        );
    }

    #[test]
    fn test_window_query_filters_revisions() {
        let window = TaskWindow {
            revisions: vec!["abc".to_string()],
            ..TaskWindow::default()
        };
        let doc = serde_json::to_value(window.query(10)).unwrap();
        assert_eq!(doc["from"], "task");
        let terms = doc["where"]["and"].as_array().unwrap();
        assert!(terms.contains(&json!({"in": {"repo.changeset.id12": ["abc"]}})));
        assert!(terms.contains(&json!({"lt": {"action.end_time": {"date": "now-6hour"}}})));
    }
}
