//! Volume-bounded coverage fetching.
//!
//! [`CoverageBatchReader`] sizes the file universe with one grouped count
//! query, partitions it into batches whose summed coverage weight reaches
//! [`DEFAULT_BATCH_VOLUME`], and fetches each batch in turn. Every returned
//! row is routed to every [`Variant`] whose predicate accepts it.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::coverage::{CoverageByVariant, CoverageRecord, COVERED_FIELD, FILE_NAME_FIELD};
use crate::domain::error::{AuditError, ExprError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::query::{CompareOp, Dataset, Expr, Format, Predicate, Projection, Query, QueryGateway};

/// Summed per-file covered-line count at which a batch is closed.
pub const DEFAULT_BATCH_VOLUME: u64 = 5000;

/// Row cap on each coverage request.
pub const DEFAULT_COVERAGE_LIMIT: u64 = 50_000;

/// A named filter selecting which coverage rows belong to one side of a
/// comparison. Variants may overlap.
#[derive(Debug, Clone)]
pub struct Variant {
    name: String,
    filter: Expr,
    predicate: Predicate,
}

impl Variant {
    pub fn new(name: &str, filter: Expr) -> std::result::Result<Self, ExprError> {
        let predicate = filter.compile()?;
        Ok(Variant {
            name: name.to_string(),
            filter,
            predicate,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &Expr {
        &self.filter
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.predicate.evaluate(record)
    }

    /// Disjunction of all variant filters: every row any variant could claim.
    pub fn union_scope(variants: &[Variant]) -> Expr {
        Expr::any(variants.iter().map(|v| v.filter.clone()))
    }
}

/// Serialized form of a [`Variant`], as read from a variants file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub name: String,
    pub filter: Expr,
}

impl TryFrom<VariantSpec> for Variant {
    type Error = ExprError;

    fn try_from(spec: VariantSpec) -> std::result::Result<Self, Self::Error> {
        Variant::new(&spec.name, spec.filter)
    }
}

/// A source file and its total covered-line count in scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWeight {
    pub file: String,
    pub weight: u64,
}

/// A group of files fetched with one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBatch {
    pub files: Vec<String>,
    pub weight: u64,
}

/// Greedily group `files` in order until each batch's weight reaches
/// `threshold`. Only the final batch may fall short; every file lands in
/// exactly one batch.
pub fn partition_by_volume(files: &[FileWeight], threshold: u64) -> Vec<FileBatch> {
    let mut batches = Vec::new();
    let mut current = FileBatch::default();
    for fw in files {
        current.files.push(fw.file.clone());
        current.weight = current.weight.saturating_add(fw.weight);
        if current.weight >= threshold {
            batches.push(std::mem::take(&mut current));
        }
    }
    if !current.files.is_empty() {
        batches.push(current);
    }
    batches
}

/// Union each row's covered lines into every variant that accepts it.
///
/// Returns the number of rows claimed by at least one variant. Rows with no
/// file name are ignored.
pub fn route_records(variants: &[Variant], rows: &[Value], coverage: &mut CoverageByVariant) -> u64 {
    let mut routed = 0;
    for row in rows {
        let Some(record) = CoverageRecord::from_row(row) else {
            continue;
        };
        let mut claimed = false;
        for (variant, acc) in variants.iter().zip(coverage.variants.iter_mut()) {
            if variant.matches(row) {
                acc.files
                    .absorb(&record.file_name, record.covered_lines.iter().copied());
                claimed = true;
            }
        }
        if claimed {
            routed += 1;
        }
    }
    routed
}

/// Fetches per-variant coverage in volume-bounded batches.
pub struct CoverageBatchReader {
    gateway: Arc<dyn QueryGateway>,
    batch_volume: u64,
    row_limit: u64,
}

impl CoverageBatchReader {
    pub fn new(gateway: Arc<dyn QueryGateway>) -> Self {
        Self {
            gateway,
            batch_volume: DEFAULT_BATCH_VOLUME,
            row_limit: DEFAULT_COVERAGE_LIMIT,
        }
    }

    pub fn with_batch_volume(mut self, batch_volume: u64) -> Self {
        self.batch_volume = batch_volume;
        self
    }

    pub fn with_row_limit(mut self, row_limit: u64) -> Self {
        self.row_limit = row_limit;
        self
    }

    /// Covered-line weight of every real, covered file matching `scope`.
    pub async fn file_weights(&self, scope: &Expr) -> Result<Vec<FileWeight>> {
        let query = Query::new(Dataset::Coverage)
            .select(Projection::count())
            .groupby(FILE_NAME_FIELD)
            .filter(Expr::all([
                scope.clone(),
                Expr::eq("source.is_file", "T"),
                Expr::compare(CompareOp::Gt, "source.file.total_covered", 0),
            ]))
            .limit(self.row_limit)
            .format(Format::Table);
        let response = self.gateway.execute(&query).await?;

        let header = response.header.clone().unwrap_or_default();
        let file_col = header.iter().position(|h| h == FILE_NAME_FIELD).unwrap_or(0);
        let count_col = header.iter().position(|h| h == "count").unwrap_or(1);

        let mut weights = Vec::new();
        for row in response.rows()? {
            let Some(file) = row.get(file_col).and_then(Value::as_str) else {
                continue;
            };
            let weight = row
                .get(count_col)
                .and_then(|c| c.as_u64().or_else(|| c.as_f64().map(|f| f.max(0.0) as u64)))
                .ok_or_else(|| AuditError::Decode(format!("no count for file {file}")))?;
            weights.push(FileWeight {
                file: file.to_string(),
                weight,
            });
        }
        obs::emit_row_limit_reached("coverage.file_weights", weights.len() as u64, self.row_limit);
        Ok(weights)
    }

    /// Fetch the coverage rows of one batch, projecting only `fields`.
    pub async fn fetch_batch(
        &self,
        batch: &FileBatch,
        scope: &Expr,
        fields: &BTreeSet<String>,
    ) -> Result<Vec<Value>> {
        let mut query = Query::new(Dataset::Coverage)
            .filter(Expr::all([
                scope.clone(),
                Expr::terms(FILE_NAME_FIELD, batch.files.iter().cloned()),
            ]))
            .limit(self.row_limit)
            .format(Format::List);
        for field in fields {
            query = query.select(Projection::field(field));
        }
        let response = self.gateway.execute(&query).await?;
        let rows = response.records()?.to_vec();
        METRICS.inc_batches();
        obs::emit_batch_fetched(batch.files.len(), batch.weight, rows.len());
        obs::emit_row_limit_reached("coverage.batch", rows.len() as u64, self.row_limit);
        Ok(rows)
    }

    /// Accumulate a [`FileCoverageSet`](crate::domain::FileCoverageSet) per
    /// variant over every covered file in `scope`.
    ///
    /// Any failed request aborts the whole read; no partial result is
    /// returned.
    pub async fn read_variant_coverage(
        &self,
        variants: &[Variant],
        scope: &Expr,
    ) -> Result<CoverageByVariant> {
        let weights = self.file_weights(scope).await?;
        info!(files = weights.len(), "unique files in scope");

        let mut fields: BTreeSet<String> = [COVERED_FIELD, FILE_NAME_FIELD]
            .into_iter()
            .map(String::from)
            .collect();
        for variant in variants {
            fields.extend(variant.filter().vars());
        }

        let mut coverage = CoverageByVariant::new(variants.iter().map(Variant::name));
        let batches = partition_by_volume(&weights, self.batch_volume);
        debug!(batches = batches.len(), volume = self.batch_volume, "partitioned file universe");

        for batch in &batches {
            let rows = self.fetch_batch(batch, scope, &fields).await?;
            let routed = route_records(variants, &rows, &mut coverage);
            METRICS.add_records_routed(routed);
        }
        Ok(coverage)
    }
}
