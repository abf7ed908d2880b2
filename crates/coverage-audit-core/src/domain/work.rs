//! Expected and observed units of work.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Separator between the run key and the per-task suffix in a compound
/// task record id (`<run key>:<suffix>`).
pub const RUN_KEY_SEPARATOR: char = ':';

/// An expected unit of test-execution work, as returned by the `task`
/// dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Compound record id; its prefix identifies the upstream run.
    #[serde(rename = "_id", default)]
    pub record_id: Option<String>,
    #[serde(rename = "task", default)]
    pub task_id: Option<String>,
    #[serde(rename = "rev", default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    /// Changeset date in epoch seconds.
    #[serde(default)]
    pub date: Option<f64>,
}

impl WorkItem {
    /// Changeset date as a UTC instant, if present and representable.
    pub fn changeset_date(&self) -> Option<DateTime<Utc>> {
        let secs = self.date?;
        DateTime::from_timestamp(secs.trunc() as i64, 0)
    }

    /// Upstream run key derived from the compound record id.
    pub fn run_key(&self) -> Option<RunKey> {
        self.record_id.as_deref().map(RunKey::from_record_id)
    }
}

/// An observed ingestion row: one distinct task id seen in a dataset,
/// with the number of records carrying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    #[serde(rename = "task", default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub count: Option<u64>,
}

impl IngestionRecord {
    /// The task id, unless it is null/placeholder or backed by no records.
    pub fn confirmed_task(&self) -> Option<&str> {
        match (self.task_id.as_deref(), self.count) {
            (Some(""), _) | (None, _) | (_, Some(0)) => None,
            (Some(task), _) => Some(task),
        }
    }
}

/// Identifier of an upstream run, as accepted by the reprocessing queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunKey(String);

impl RunKey {
    /// Truncate a compound record id at its first [`RUN_KEY_SEPARATOR`].
    pub fn from_record_id(record_id: &str) -> Self {
        let key = record_id
            .split_once(RUN_KEY_SEPARATOR)
            .map_or(record_id, |(prefix, _)| prefix);
        RunKey(key.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunKey {
    fn from(s: &str) -> Self {
        RunKey(s.to_string())
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How expected work is grouped for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupBy {
    Revision,
    #[default]
    RevisionBranch,
}

/// The grouping key of one reconciliation group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub revision: String,
    pub branch: Option<String>,
}

impl GroupKey {
    /// Key for `item` under `group_by`; `None` when the item has no revision.
    pub fn for_item(item: &WorkItem, group_by: GroupBy) -> Option<Self> {
        let revision = item.revision.clone()?;
        let branch = match group_by {
            GroupBy::Revision => None,
            GroupBy::RevisionBranch => item.branch.clone(),
        };
        Some(GroupKey { revision, branch })
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.branch {
            Some(branch) => write!(f, "{}-{}", branch, self.revision),
            None => f.write_str(&self.revision),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_key_truncates_at_first_separator() {
        assert_eq!(RunKey::from_record_id("tc.1234:56:7").as_str(), "tc.1234");
        assert_eq!(RunKey::from_record_id("no-separator").as_str(), "no-separator");
        assert_eq!(RunKey::from_record_id(":lead").as_str(), "");
    }

    #[test]
    fn test_work_item_deserializes_from_task_row() {
        let item: WorkItem = serde_json::from_value(json!({
            "_id": "tc.99:3",
            "task": "T1",
            "rev": "37d777d87200",
            "branch": "mozilla-central",
            "date": 1_500_000_000.5
        }))
        .unwrap();
        assert_eq!(item.task_id.as_deref(), Some("T1"));
        assert_eq!(item.run_key(), Some(RunKey::from("tc.99")));
        assert_eq!(item.changeset_date().unwrap().timestamp(), 1_500_000_000);
    }

    #[test]
    fn test_ingestion_record_rejects_null_and_empty() {
        let null: IngestionRecord = serde_json::from_value(json!({"task": null, "count": 4})).unwrap();
        assert_eq!(null.confirmed_task(), None);

        let empty = IngestionRecord {
            task_id: Some("T1".to_string()),
            count: Some(0),
        };
        assert_eq!(empty.confirmed_task(), None);

        let ok = IngestionRecord {
            task_id: Some("T1".to_string()),
            count: None,
        };
        assert_eq!(ok.confirmed_task(), Some("T1"));
    }

    #[test]
    fn test_group_key_display() {
        let item = WorkItem {
            record_id: None,
            task_id: Some("T1".to_string()),
            revision: Some("abc".to_string()),
            branch: Some("try".to_string()),
            date: None,
        };
        let by_branch = GroupKey::for_item(&item, GroupBy::RevisionBranch).unwrap();
        assert_eq!(by_branch.to_string(), "try-abc");
        let by_rev = GroupKey::for_item(&item, GroupBy::Revision).unwrap();
        assert_eq!(by_rev.to_string(), "abc");
    }
}
