//! Batched coverage reads feeding the directional diff.

use std::collections::BTreeSet;
use std::sync::Arc;

use coverage_audit_core::diff::DEFAULT_TOP_N;
use coverage_audit_core::fakes::FakeGateway;
use coverage_audit_core::query::{Format, Projection};
use coverage_audit_core::{
    diff, AuditError, CoverageBatchReader, Dataset, Expr, FileCoverageSet, QueryResponse, Variant,
};
use serde_json::{json, Value};

fn e10s_variants() -> Vec<Variant> {
    let base = |mode: Expr| {
        Expr::all([
            Expr::eq("repo.changeset.id12", "37d777d87200"),
            Expr::eq("run.suite.name", "mochitest"),
            mode,
        ])
    };
    vec![
        Variant::new("e10s", base(Expr::eq("run.type", "e10s"))).unwrap(),
        Variant::new("non-e10s", base(Expr::ne("run.type", "e10s"))).unwrap(),
    ]
}

fn row(mode: &str, file: &str, lines: &[u32]) -> Value {
    json!({
        "repo": {"changeset": {"id12": "37d777d87200"}},
        "run": {"type": mode, "suite": {"name": "mochitest"}},
        "source": {"file": {"name": file, "covered": lines}}
    })
}

/// Answers the weight query from `weights` and batch queries by filtering
/// `rows` down to the requested files.
fn service(weights: Vec<(&'static str, u64)>, rows: Vec<Value>) -> FakeGateway {
    FakeGateway::new(move |query| {
        assert_eq!(query.from, Dataset::Coverage);
        match query.format {
            Format::Table => Ok(QueryResponse::table(
                &["source.file.name", "count"],
                weights.iter().map(|(f, c)| vec![json!(f), json!(c)]).collect(),
            )),
            Format::List => {
                let wanted = requested_files(query.filter.as_ref().unwrap());
                Ok(QueryResponse::list(
                    rows.iter()
                        .filter(|r| wanted.contains(r["source"]["file"]["name"].as_str().unwrap()))
                        .cloned()
                        .collect(),
                ))
            }
        }
    })
}

fn requested_files(filter: &Expr) -> BTreeSet<String> {
    let Expr::And(terms) = filter else {
        panic!("batch filter should be a conjunction: {filter}");
    };
    terms
        .iter()
        .find_map(|t| match t {
            Expr::Member { field, values, .. } if field == "source.file.name" => Some(
                values
                    .iter()
                    .map(|v| v.as_str().unwrap().to_string())
                    .collect(),
            ),
            _ => None,
        })
        .expect("batch filter restricts file names")
}

#[tokio::test]
async fn e10s_lines_missing_from_non_e10s_are_ranked() {
    let variants = e10s_variants();
    let gateway = Arc::new(service(
        vec![("f1", 5)],
        vec![
            row("e10s", "f1", &[10, 11]),
            row("e10s", "f1", &[12]),
            row("chunked", "f1", &[10, 11]),
        ],
    ));

    let coverage = CoverageBatchReader::new(gateway)
        .read_variant_coverage(&variants, &Variant::union_scope(&variants))
        .await
        .unwrap();
    assert_eq!(
        coverage.get("e10s").unwrap(),
        &FileCoverageSet::from_iter([("f1", vec![10, 11, 12])])
    );

    let report = diff(&coverage, DEFAULT_TOP_N);
    let forward = report.direction("e10s", "non-e10s").unwrap();
    assert_eq!(forward.rows[0].file, "f1");
    assert_eq!(forward.rows[0].remainder, BTreeSet::from([12]));
    assert!(report.direction("non-e10s", "e10s").unwrap().rows.is_empty());
}

#[tokio::test]
async fn batches_follow_volume_and_project_variant_fields() {
    let variants = e10s_variants();
    let gateway = Arc::new(service(
        vec![("a", 3000), ("b", 2500), ("c", 10), ("d", 40)],
        vec![row("e10s", "a", &[1]), row("plain", "d", &[2])],
    ));

    CoverageBatchReader::new(gateway.clone())
        .with_batch_volume(5000)
        .read_variant_coverage(&variants, &Variant::union_scope(&variants))
        .await
        .unwrap();

    let queries = gateway.queries();
    assert_eq!(queries.len(), 3, "one weight query and two batches");

    let weight = serde_json::to_value(&queries[0]).unwrap();
    assert_eq!(weight["groupby"], json!(["source.file.name"]));
    assert_eq!(weight["select"], json!([{"aggregate": "count"}]));
    let weight_terms = weight["where"]["and"].as_array().unwrap();
    assert!(weight_terms.contains(&json!({"eq": {"source.is_file": "T"}})));
    assert!(weight_terms.contains(&json!({"gt": {"source.file.total_covered": 0}})));

    let first = requested_files(queries[1].filter.as_ref().unwrap());
    let second = requested_files(queries[2].filter.as_ref().unwrap());
    assert_eq!(first, BTreeSet::from(["a".to_string(), "b".to_string()]));
    assert_eq!(second, BTreeSet::from(["c".to_string(), "d".to_string()]));

    let selected = &queries[1].select;
    for field in [
        "source.file.covered",
        "source.file.name",
        "repo.changeset.id12",
        "run.suite.name",
        "run.type",
    ] {
        assert!(selected.contains(&Projection::field(field)), "missing {field}");
    }
    assert_eq!(selected.len(), 5);
}

#[tokio::test]
async fn failed_batch_aborts_the_read() {
    let variants = e10s_variants();
    let gateway = Arc::new(FakeGateway::new(|query| match query.format {
        Format::Table => Ok(QueryResponse::table(
            &["source.file.name", "count"],
            vec![vec![json!("a"), json!(6000)], vec![json!("b"), json!(6000)]],
        )),
        Format::List => Err(AuditError::Transport {
            endpoint: "fake://query".to_string(),
            detail: "connection reset".to_string(),
        }),
    }));

    let err = CoverageBatchReader::new(gateway.clone())
        .read_variant_coverage(&variants, &Variant::union_scope(&variants))
        .await
        .unwrap_err();
    assert!(matches!(err, AuditError::Transport { .. }));
    assert_eq!(gateway.queries().len(), 2, "stops at the first failed batch");
}
