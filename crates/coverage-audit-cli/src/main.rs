//! Coverage Audit CLI
//!
//! The `coverage-audit` command checks the code-coverage ETL pipeline
//! through its query service.
//!
//! ## Commands
//!
//! - `status`: compare expected coverage tasks with what was ingested, and
//!   requeue runs that never made it
//! - `diff`: lines covered under one test variant but not another

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use coverage_audit_core::{
    diff, init_tracing, obs, AuditConfig, CoverageBatchReader, CoverageDiff, DryRunQueue, Expr,
    GroupBy, HttpQueryGateway, HttpWorkQueue, LogOptions, PassSpan, QueryGateway, Reconciler,
    RequeuePublisher, Variant, VariantSpec, WorkQueue, METRICS,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const REVISION_FIELD: &str = "repo.changeset.id12";
const SUITE_FIELD: &str = "run.suite.name";
const RUN_TYPE_FIELD: &str = "run.type";

#[derive(Parser)]
#[command(name = "coverage-audit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Audit the code-coverage ETL pipeline", long_about = None)]
struct Cli {
    /// Settings file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report ingestion completeness of recent coverage tasks
    Status {
        /// Only these revisions (12-character changeset ids)
        #[arg(short, long)]
        revision: Vec<String>,

        /// Only this branch
        #[arg(short, long)]
        branch: Option<String>,

        /// How expected work is grouped
        #[arg(long, value_enum, default_value = "revision-branch")]
        group_by: GroupByArg,

        /// Log reprocessing requests instead of sending them
        #[arg(long)]
        dry_run: bool,

        /// Report only; never request reprocessing
        #[arg(long, conflicts_with = "dry_run")]
        no_requeue: bool,
    },

    /// Show lines covered by one variant but not another
    Diff {
        /// Revision to compare e10s and non-e10s runs on
        #[arg(short, long, required_unless_present = "variants")]
        revision: Option<String>,

        /// Test suite for the built-in comparison
        #[arg(short, long, default_value = "mochitest")]
        suite: String,

        /// Variants file: a JSON array of `{name, filter}`
        #[arg(long, conflicts_with = "revision")]
        variants: Option<PathBuf>,

        /// Extra filter (JSON) applied to every coverage request
        #[arg(long)]
        scope: Option<String>,

        /// Rows kept per direction
        #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
        top: Option<u64>,

        /// Print the report as JSON
        #[arg(long)]
        output_json: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum GroupByArg {
    Revision,
    RevisionBranch,
}

impl From<GroupByArg> for GroupBy {
    fn from(arg: GroupByArg) -> Self {
        match arg {
            GroupByArg::Revision => GroupBy::Revision,
            GroupByArg::RevisionBranch => GroupBy::RevisionBranch,
        }
    }
}

/// What happens to missing runs during `status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequeueMode {
    Send,
    DryRun,
    Disabled,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AuditConfig::load(cli.config.as_deref()).context("Failed to load settings")?;
    init_tracing(LogOptions {
        json: cli.json,
        verbose: cli.verbose || config.debug,
    });

    let gateway: Arc<dyn QueryGateway> = Arc::new(
        HttpQueryGateway::new(&config.query_url).context("Failed to build query client")?,
    );

    let outcome = match cli.command {
        Commands::Status {
            revision,
            branch,
            group_by,
            dry_run,
            no_requeue,
        } => {
            let mode = if no_requeue {
                RequeueMode::Disabled
            } else if dry_run {
                RequeueMode::DryRun
            } else {
                RequeueMode::Send
            };
            cmd_status(&config, gateway, revision, branch, group_by.into(), mode).await
        }
        Commands::Diff {
            revision,
            suite,
            variants,
            scope,
            top,
            output_json,
        } => {
            let variants = match (variants, revision) {
                (Some(path), _) => load_variants(&path)?,
                (None, Some(revision)) => e10s_variants(&revision, &suite)?,
                (None, None) => bail!("either --revision or --variants is required"),
            };
            let scope = scope.as_deref().map(parse_scope).transpose()?;
            let top = top.map_or(config.top_n, |n| n as usize);
            cmd_diff(&config, gateway, &variants, scope, top, output_json).await
        }
    };

    METRICS.flush();
    outcome
}

fn work_queue(config: &AuditConfig, mode: RequeueMode) -> Result<Option<Arc<dyn WorkQueue>>> {
    match mode {
        RequeueMode::Disabled => Ok(None),
        RequeueMode::DryRun => {
            let queue: Arc<dyn WorkQueue> = Arc::new(DryRunQueue);
            Ok(Some(queue))
        }
        RequeueMode::Send => {
            let Some(url) = config.work_queue.url.as_deref() else {
                bail!(
                    "no work queue configured; set work_queue.url or COVERAGE_AUDIT_QUEUE_URL, \
                     or pass --dry-run / --no-requeue"
                );
            };
            let queue: Arc<dyn WorkQueue> = Arc::new(
                HttpWorkQueue::new(url).context("Failed to build work queue client")?,
            );
            Ok(Some(queue))
        }
    }
}

async fn cmd_status(
    config: &AuditConfig,
    gateway: Arc<dyn QueryGateway>,
    revisions: Vec<String>,
    branch: Option<String>,
    group_by: GroupBy,
    mode: RequeueMode,
) -> Result<()> {
    let _span = PassSpan::enter("status");

    let mut publisher = work_queue(config, mode)?.map(|queue| {
        RequeuePublisher::new(queue).with_buckets(
            &config.work_queue.source_bucket,
            &config.work_queue.destination_bucket,
        )
    });

    let mut window = config.task_window();
    window.revisions = revisions;
    window.branch = branch;

    let reports = Reconciler::new(gateway)
        .with_group_by(group_by)
        .with_limits(config.task_limit, config.file_limit)
        .run_status(&window, publisher.as_mut())
        .await
        .context("Status pass failed")?;

    for report in &reports {
        println!("{}", report);
    }

    let complete = reports.iter().filter(|r| r.is_complete()).count();
    let requeued = publisher.as_ref().map_or(0, |p| p.sent().len());
    info!(groups = reports.len(), complete, requeued, "status pass finished");
    Ok(())
}

async fn cmd_diff(
    config: &AuditConfig,
    gateway: Arc<dyn QueryGateway>,
    variants: &[Variant],
    scope: Option<Expr>,
    top: usize,
    output_json: bool,
) -> Result<()> {
    let _span = PassSpan::enter("diff");

    let union = Variant::union_scope(variants);
    let scope = match scope {
        Some(extra) => Expr::all([extra, union]),
        None => union,
    };

    let coverage = CoverageBatchReader::new(gateway)
        .with_batch_volume(config.batch_volume)
        .with_row_limit(config.coverage_limit)
        .read_variant_coverage(variants, &scope)
        .await
        .context("Coverage read failed")?;

    let report = diff(&coverage, top);
    if output_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_diff(&report);
    }
    Ok(())
}

fn print_diff(report: &CoverageDiff) {
    for group in &report.groups {
        println!(
            "{} vs {}: {} files differ",
            group.variant_x, group.variant_y, group.files_differing
        );
        for (rank, row) in group.rows.iter().enumerate() {
            obs::emit_diff_row(row, rank + 1);
            println!("  {}", row);
        }
    }
}

/// The classic comparison: e10s runs against everything else for one
/// revision and suite.
fn e10s_variants(revision: &str, suite: &str) -> Result<Vec<Variant>> {
    let base = |mode: Expr| {
        Expr::all([
            Expr::eq(REVISION_FIELD, revision),
            Expr::eq(SUITE_FIELD, suite),
            mode,
        ])
    };
    Ok(vec![
        Variant::new("non-e10s", base(Expr::ne(RUN_TYPE_FIELD, "e10s")))?,
        Variant::new("e10s", base(Expr::eq(RUN_TYPE_FIELD, "e10s")))?,
    ])
}

fn load_variants(path: &Path) -> Result<Vec<Variant>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read variants file {}", path.display()))?;
    let specs: Vec<VariantSpec> = serde_json::from_str(&content)
        .with_context(|| format!("Invalid variants file {}", path.display()))?;
    if specs.len() < 2 {
        bail!("a diff needs at least two variants, found {}", specs.len());
    }
    let mut seen = HashSet::new();
    if let Some(dup) = specs.iter().find(|s| !seen.insert(s.name.as_str())) {
        bail!("variant name {:?} appears more than once", dup.name);
    }
    specs
        .into_iter()
        .map(|spec| {
            let name = spec.name.clone();
            Variant::try_from(spec).with_context(|| format!("Invalid filter for variant {name}"))
        })
        .collect()
}

fn parse_scope(raw: &str) -> Result<Expr> {
    let value: serde_json::Value = serde_json::from_str(raw).context("--scope is not valid JSON")?;
    Expr::from_json(&value).context("--scope is not a valid filter")
}
