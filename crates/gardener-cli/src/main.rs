use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use gardener_core::{parse_table_name, DatatypePolicy, Job, QueryBuilder, TableRef};
use gardener_promote::{summarize, GardenerConfig, PromotionOutcome, PromotionRunner, Promoter};
use gardener_warehouse::{MemoryWarehouse, Warehouse};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gardener-cli")]
#[command(about = "Staging to archive partition gardener")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Args)]
struct JobArgs {
    #[arg(long)]
    datatype: String,
    #[arg(long)]
    date: NaiveDate,
    #[arg(long, default_value = "ndt")]
    experiment: String,
    #[arg(long, default_value = "archive-measurement-lab")]
    bucket: String,
    /// Defaults to GARDENER_PROJECT.
    #[arg(long)]
    project: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the dedup statement for one partition.
    DedupQuery(JobArgs),
    /// Print the cleanup statement for one partition.
    CleanupQuery(JobArgs),
    /// Classify a table name as partition, shard or plain.
    ParseTable { name: String },
    /// Print the registered datatype policies as a loadable YAML policy file.
    Policies,
    /// Promote the jobs of a JSON fixture against an in-memory warehouse.
    Simulate { fixture: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = GardenerConfig::from_env();

    match cli.command {
        Commands::DedupQuery(args) => {
            let builder = query_builder(&config, &args)?;
            println!("{}", builder.dedup_query_text()?);
        }
        Commands::CleanupQuery(args) => {
            let builder = query_builder(&config, &args)?;
            println!("{}", builder.cleanup_query_text()?);
        }
        Commands::ParseTable { name } => {
            let parts = parse_table_name(&name)?;
            println!("{}", serde_json::to_string_pretty(&parts)?);
        }
        Commands::Policies => {
            let registry = config.load_registry()?;
            let file = PolicyFile {
                policies: registry.policies().collect(),
            };
            print!("{}", serde_yaml::to_string(&file)?);
        }
        Commands::Simulate { fixture } => simulate(&fixture, config).await?,
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .init();
}

fn query_builder(config: &GardenerConfig, args: &JobArgs) -> Result<QueryBuilder> {
    let registry = config.load_registry()?;
    let job = Job::new(&args.bucket, &args.experiment, &args.datatype, args.date);
    let project = args.project.as_deref().unwrap_or(&config.project);
    QueryBuilder::new(&registry, project, &job).with_context(|| format!("building queries for {job}"))
}

#[derive(Serialize)]
struct PolicyFile<'a> {
    policies: Vec<&'a DatatypePolicy>,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    #[serde(default)]
    project: Option<String>,
    jobs: Vec<Job>,
    #[serde(default)]
    tables: Vec<FixtureTable>,
}

#[derive(Debug, Deserialize)]
struct FixtureTable {
    /// `project.dataset.table$YYYYMMDD`
    table: String,
    #[serde(default)]
    rows: Vec<serde_json::Value>,
}

fn parse_table_ref(name: &str) -> Result<TableRef> {
    let mut parts = name.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(project), Some(dataset), Some(table))
            if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
        {
            let table_ref = TableRef::new(project, dataset, table);
            table_ref
                .parts()
                .with_context(|| format!("invalid table name in {name}"))?;
            Ok(table_ref)
        }
        _ => anyhow::bail!("expected project.dataset.table, got {name:?}"),
    }
}

fn describe(outcome: &PromotionOutcome) -> String {
    match outcome {
        PromotionOutcome::CleanedUp {
            deduped_rows,
            copied_rows,
            cleaned_rows,
        } => format!(
            "cleaned up (deduped={} copied={copied_rows} cleaned={})",
            deduped_rows.map_or_else(|| "?".to_string(), |n| n.to_string()),
            cleaned_rows.map_or_else(|| "partition".to_string(), |n| n.to_string()),
        ),
        PromotionOutcome::SkippedEmpty => "skipped, staging partition empty".to_string(),
        PromotionOutcome::PromotedCleanupFailed { copied_rows, error } => {
            format!("promoted {copied_rows} rows, cleanup failed: {error}")
        }
    }
}

async fn simulate(path: &Path, mut config: GardenerConfig) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    let fixture: Fixture = serde_json::from_str(&text)
        .with_context(|| format!("parsing fixture {}", path.display()))?;
    if let Some(project) = fixture.project {
        config.project = project;
    }

    let registry = config.load_registry()?;
    let memory = MemoryWarehouse::new(registry.clone());
    for table in fixture.tables {
        let table_ref = parse_table_ref(&table.table)?;
        memory
            .insert_rows(&table_ref, table.rows)
            .await
            .with_context(|| format!("loading rows into {}", table.table))?;
    }
    for job in &fixture.jobs {
        memory.create_table(&job.staging_table(&config.project)).await;
    }

    let warehouse: Arc<dyn Warehouse> = Arc::new(memory);
    let promoter = Promoter::from_config(warehouse, registry, &config);
    let runner = PromotionRunner::new(Arc::new(promoter), config.max_concurrency);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    info!(jobs = fixture.jobs.len(), project = %config.project, "simulating promotions");
    let reports = runner.run(&cancel, fixture.jobs).await;
    for report in &reports {
        match &report.result {
            Ok(outcome) => println!("{}: {}", report.job, describe(outcome)),
            Err(err) => println!("{}: aborted in {} stage: {}", report.job, err.stage, err.source),
        }
    }

    let counts: BTreeMap<_, _> = summarize(&reports).into_iter().collect();
    println!("summary: {counts:?}");
    let aborted = reports.iter().filter(|r| r.result.is_err()).count();
    if aborted > 0 {
        anyhow::bail!("{aborted} of {} promotions aborted", reports.len());
    }
    Ok(())
}
