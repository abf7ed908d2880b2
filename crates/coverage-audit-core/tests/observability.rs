//! Structured events emitted by the audit passes.

use std::collections::BTreeSet;
use std::sync::Arc;

use coverage_audit_core::fakes::{FakeGateway, MemoryWorkQueue};
use coverage_audit_core::obs::{emit_missing_files, emit_row_limit_reached};
use coverage_audit_core::{
    Dataset, GroupKey, PassSpan, QueryResponse, Reconciler, RequeuePublisher, RunKey, TaskWindow,
};
use serde_json::json;
use tracing_test::traced_test;

fn key() -> GroupKey {
    GroupKey {
        revision: "37d777d87200".to_string(),
        branch: Some("mozilla-central".to_string()),
    }
}

#[traced_test]
#[test]
fn missing_files_event_lists_a_sample() {
    let missing: BTreeSet<String> = ["z.js", "a.js", "m.js", "q.js"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    emit_missing_files(&key(), &missing);

    assert!(logs_contain("status.missing_files"));
    assert!(logs_contain("num=4"));
    assert!(logs_contain("a.js"));
    assert!(!logs_contain("z.js"));
}

#[traced_test]
#[test]
fn row_limit_warns_only_at_the_limit() {
    emit_row_limit_reached("task.expected", 9, 10);
    assert!(!logs_contain("query.row_limit"));
    emit_row_limit_reached("task.expected", 10, 10);
    assert!(logs_contain("query.row_limit"));
}

#[tokio::test]
#[traced_test]
async fn requeue_event_names_only_new_keys() {
    let _span = PassSpan::enter("status");
    let mut publisher = RequeuePublisher::new(Arc::new(MemoryWorkQueue::new()));
    publisher
        .publish(&BTreeSet::from([RunKey::from("tc.first")]))
        .await
        .unwrap();
    let sent = publisher
        .publish(&BTreeSet::from([
            RunKey::from("tc.first"),
            RunKey::from("tc.second"),
        ]))
        .await
        .unwrap();
    assert_eq!(sent, [RunKey::from("tc.second")]);

    logs_assert(|lines: &[&str]| {
        let events: Vec<&&str> = lines.iter().filter(|l| l.contains("requeue.sent")).collect();
        if events.len() != 2 {
            return Err(format!("expected 2 requeue events, got {}", events.len()));
        }
        let second = events[1];
        if !second.contains("num=1") || !second.contains("tc.second") || second.contains("tc.first") {
            return Err(format!("second event should name only tc.second: {second}"));
        }
        Ok(())
    });
}

#[tokio::test]
#[traced_test]
async fn truncated_task_listing_is_flagged() {
    let gateway = Arc::new(FakeGateway::new(|query| {
        if query.from == Dataset::Task {
            Ok(QueryResponse::list(vec![
                json!({"_id": "r1:0", "task": "T1", "rev": "R", "branch": "b", "date": 2}),
                json!({"_id": "r2:0", "task": "T2", "rev": "R", "branch": "b", "date": 1}),
            ]))
        } else {
            Ok(QueryResponse::list(Vec::new()))
        }
    }));

    Reconciler::new(gateway)
        .with_limits(2, 100)
        .run_status(&TaskWindow::default(), None)
        .await
        .unwrap();

    assert!(logs_contain("query.row_limit"));
    assert!(logs_contain("status.group"));
    assert!(logs_contain("status.missing_tasks"));
}
