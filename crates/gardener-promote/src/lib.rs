//! Sanity checking and the dedup → sanity → copy → cleanup promotion sequence.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gardener_core::{
    CoreError, DatatypePolicy, Job, PolicyRegistry, QueryBuilder, RenderedQuery, TableRef,
};
use gardener_warehouse::{
    wait_for_job, AnnotatedTable, CopyExecutor, DeleteExecutor, JobStatistics, JobStatus,
    MetadataProvider, PollBackoff, QueryExecutor, TableMetadata, Warehouse, WarehouseError,
    WriteDisposition,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gardener-promote";

/// How far the source partition may trail the destination before a copy is refused.
///
/// A ratio of 1.0 requires the source to be at least as large as the
/// destination; 0.99 tolerates a one percent shrink.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SanityPolicy {
    pub min_source_file_ratio: f64,
    pub min_record_ratio: f64,
    /// Refuse to overwrite a destination modified after the source. Off by default.
    pub require_source_newer: bool,
}

impl Default for SanityPolicy {
    fn default() -> Self {
        Self {
            min_source_file_ratio: 1.0,
            min_record_ratio: 1.0,
            require_source_newer: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanityFailure {
    #[error("partition mismatch: {source_table} vs {destination_table}")]
    MismatchedPartitions {
        source_table: String,
        destination_table: String,
    },
    #[error("too few source files: {source_count} < {destination_count}")]
    TooFewSourceFiles {
        source_count: u64,
        destination_count: u64,
    },
    #[error("too few distinct records: {source_count} < {destination_count}")]
    TooFewRecords {
        source_count: u64,
        destination_count: u64,
    },
    #[error("too few rows: {source_count} < {destination_count}")]
    TooFewRows {
        source_count: u64,
        destination_count: u64,
    },
    #[error("source modified at {source_modified} is older than destination modified at {destination_modified}")]
    SourceOlderThanDestination {
        source_modified: DateTime<Utc>,
        destination_modified: DateTime<Utc>,
    },
    #[error("{destination_table} holds no promoted rows")]
    ArchiveMissing { destination_table: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanityError {
    #[error("invalid table name: {0}")]
    InvalidTable(#[from] CoreError),
    #[error("metadata unavailable for {table}: {cause}")]
    MetadataUnavailable { table: String, cause: WarehouseError },
    #[error("sanity check failed: {0}")]
    SanityCheckFailed(SanityFailure),
    #[error("copy failed: {0}")]
    Copy(WarehouseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CopyOutcome {
    Copied { rows: u64, job_id: String },
    /// The source partition is missing or has no rows. Nothing was written.
    NothingToPromote,
}

fn at_least(source: u64, destination: u64, ratio: f64) -> bool {
    source as f64 >= destination as f64 * ratio
}

fn unavailable<P: MetadataProvider + ?Sized>(table: &AnnotatedTable<P>, cause: WarehouseError) -> SanityError {
    SanityError::MetadataUnavailable {
        table: table.table().fully_qualified(),
        cause,
    }
}

/// Compares `source` against `destination` and, when safe, replaces the
/// destination partition with a copy of the source.
///
/// Never deletes anything. A refusal leaves both tables untouched.
pub async fn check_and_copy<P, C>(
    cancel: &CancellationToken,
    source: &AnnotatedTable<P>,
    destination: &AnnotatedTable<P>,
    copier: &C,
    policy: &DatatypePolicy,
    sanity: &SanityPolicy,
    backoff: &PollBackoff,
) -> Result<CopyOutcome, SanityError>
where
    P: MetadataProvider + ?Sized,
    C: CopyExecutor + ?Sized,
{
    let source_parts = source.table().parts()?;
    let destination_parts = destination.table().parts()?;
    if source_parts.date() != destination_parts.date() {
        return Err(SanityError::SanityCheckFailed(
            SanityFailure::MismatchedPartitions {
                source_table: source.table().fully_qualified(),
                destination_table: destination.table().fully_qualified(),
            },
        ));
    }

    let source_meta = match source.metadata().await {
        Ok(meta) if meta.num_rows > 0 => meta,
        Ok(_) => return Ok(CopyOutcome::NothingToPromote),
        Err(err) if err.is_not_found() => return Ok(CopyOutcome::NothingToPromote),
        Err(err) => return Err(unavailable(source, err)),
    };
    let destination_meta = match destination.metadata().await {
        Ok(meta) => Some(meta),
        Err(err) if err.is_not_found() => None,
        Err(err) => return Err(unavailable(destination, err)),
    };

    if let Some(destination_meta) = destination_meta.filter(|m| m.num_rows > 0) {
        compare(source, destination, &source_meta, &destination_meta, policy, sanity)
            .await?;
    }

    let job = copier
        .copy(source.table(), destination.table(), WriteDisposition::Truncate)
        .await
        .map_err(SanityError::Copy)?;
    info!(
        job_id = job.id(),
        source = %source.table(),
        destination = %destination.table(),
        rows = source_meta.num_rows,
        "copying partition"
    );
    wait_for_job(job.as_ref(), cancel, backoff)
        .await
        .map_err(SanityError::Copy)?;
    Ok(CopyOutcome::Copied {
        rows: source_meta.num_rows,
        job_id: job.id().to_string(),
    })
}

async fn compare<P: MetadataProvider + ?Sized>(
    source: &AnnotatedTable<P>,
    destination: &AnnotatedTable<P>,
    source_meta: &TableMetadata,
    destination_meta: &TableMetadata,
    policy: &DatatypePolicy,
    sanity: &SanityPolicy,
) -> Result<(), SanityError> {
    let refuse = |failure| Err(SanityError::SanityCheckFailed(failure));

    if policy.is_detailed() {
        let source_detail = source.detail().await.map_err(|e| unavailable(source, e))?;
        let destination_detail = destination
            .detail()
            .await
            .map_err(|e| unavailable(destination, e))?;
        debug!(?source_detail, ?destination_detail, "comparing partition detail");

        if !at_least(
            source_detail.distinct_source_file_count,
            destination_detail.distinct_source_file_count,
            sanity.min_source_file_ratio,
        ) {
            return refuse(SanityFailure::TooFewSourceFiles {
                source_count: source_detail.distinct_source_file_count,
                destination_count: destination_detail.distinct_source_file_count,
            });
        }
        if !at_least(
            source_detail.distinct_record_count,
            destination_detail.distinct_record_count,
            sanity.min_record_ratio,
        ) {
            return refuse(SanityFailure::TooFewRecords {
                source_count: source_detail.distinct_record_count,
                destination_count: destination_detail.distinct_record_count,
            });
        }
    }

    if !at_least(source_meta.num_rows, destination_meta.num_rows, sanity.min_record_ratio) {
        return refuse(SanityFailure::TooFewRows {
            source_count: source_meta.num_rows,
            destination_count: destination_meta.num_rows,
        });
    }

    if sanity.require_source_newer
        && source_meta.last_modified_time < destination_meta.last_modified_time
    {
        return refuse(SanityFailure::SourceOlderThanDestination {
            source_modified: source_meta.last_modified_time,
            destination_modified: destination_meta.last_modified_time,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Dedup,
    Sanity,
    Copy,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Dedup => "dedup",
            Stage::Sanity => "sanity",
            Stage::Copy => "copy",
            Stage::Cleanup => "cleanup",
        })
    }
}

/// Points along a single promotion, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PromotionState {
    Start,
    Deduped,
    SanityChecked,
    Copied,
    CleanedUp,
    SkippedEmpty,
    PromotedCleanupFailed,
}

impl fmt::Display for PromotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error(transparent)]
    Query(#[from] CoreError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    #[error(transparent)]
    Sanity(#[from] SanityError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{job}: {stage} stage failed: {source}")]
pub struct PromotionError {
    pub job: Job,
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl PromotionError {
    fn new(job: &Job, stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            job: job.clone(),
            stage,
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    CleanedUp {
        deduped_rows: Option<u64>,
        copied_rows: u64,
        cleaned_rows: Option<u64>,
    },
    SkippedEmpty,
    /// The archive holds the new partition but staging was not cleared.
    /// Retry with [`Promoter::cleanup_only`].
    PromotedCleanupFailed { copied_rows: u64, error: StageError },
}

impl PromotionOutcome {
    pub fn state(&self) -> PromotionState {
        match self {
            PromotionOutcome::CleanedUp { .. } => PromotionState::CleanedUp,
            PromotionOutcome::SkippedEmpty => PromotionState::SkippedEmpty,
            PromotionOutcome::PromotedCleanupFailed { .. } => PromotionState::PromotedCleanupFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupStrategy {
    /// Run the rendered cleanup `DELETE` against the staging partition.
    #[default]
    Query,
    /// Drop the staging partition through the delete executor.
    DeletePartition,
}

impl FromStr for CleanupStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "query" => Ok(CleanupStrategy::Query),
            "delete-partition" => Ok(CleanupStrategy::DeletePartition),
            other => anyhow::bail!("unknown cleanup strategy {other:?}"),
        }
    }
}

pub struct Promoter<W: ?Sized = dyn Warehouse> {
    warehouse: Arc<W>,
    registry: PolicyRegistry,
    project: String,
    backoff: PollBackoff,
    sanity: SanityPolicy,
    cleanup: CleanupStrategy,
}

impl<W: Warehouse + ?Sized> Promoter<W> {
    pub fn new(warehouse: Arc<W>, registry: PolicyRegistry, project: impl Into<String>) -> Self {
        Self {
            warehouse,
            registry,
            project: project.into(),
            backoff: PollBackoff::default(),
            sanity: SanityPolicy::default(),
            cleanup: CleanupStrategy::default(),
        }
    }

    pub fn from_config(warehouse: Arc<W>, registry: PolicyRegistry, config: &GardenerConfig) -> Self {
        Self::new(warehouse, registry, config.project.clone())
            .with_backoff(config.poll_backoff())
            .with_sanity_policy(config.sanity)
            .with_cleanup_strategy(config.cleanup)
    }

    pub fn with_backoff(mut self, backoff: PollBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sanity_policy(mut self, sanity: SanityPolicy) -> Self {
        self.sanity = sanity;
        self
    }

    pub fn with_cleanup_strategy(mut self, cleanup: CleanupStrategy) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    /// Runs dedup, sanity check + copy, and cleanup for one partition.
    ///
    /// Any failure before the copy commits aborts with the failing stage and
    /// leaves the archive untouched. A cleanup failure after the copy is
    /// reported as [`PromotionOutcome::PromotedCleanupFailed`].
    pub async fn promote(
        &self,
        cancel: &CancellationToken,
        job: &Job,
    ) -> Result<PromotionOutcome, PromotionError> {
        let attempt_id = Uuid::new_v4();
        let span = info_span!("promote", %attempt_id, job = %job);
        self.promote_inner(cancel, job).instrument(span).await
    }

    async fn promote_inner(
        &self,
        cancel: &CancellationToken,
        job: &Job,
    ) -> Result<PromotionOutcome, PromotionError> {
        let builder = self.builder(job, Stage::Dedup)?;
        info!(state = %PromotionState::Start, "promotion started");

        let dedup = builder
            .dedup()
            .map_err(|e| PromotionError::new(job, Stage::Dedup, e))?;
        let status = self
            .run(cancel, &dedup, false)
            .await
            .map_err(|e| PromotionError::new(job, Stage::Dedup, e))?;
        let deduped_rows = status.statistics.rows_affected;
        info!(state = %PromotionState::Deduped, ?deduped_rows, "dedup finished");

        let staging = builder.staging_table();
        let archive = builder.archive_table();
        let detail = |table: &TableRef| {
            builder
                .detail(table)
                .map_err(|e| PromotionError::new(job, Stage::Sanity, e))
        };
        let source = AnnotatedTable::new(staging.clone(), self.warehouse.clone(), detail(&staging)?);
        let destination =
            AnnotatedTable::new(archive.clone(), self.warehouse.clone(), detail(&archive)?);

        let copied_rows = match check_and_copy(
            cancel,
            &source,
            &destination,
            self.warehouse.as_ref(),
            builder.policy(),
            &self.sanity,
            &self.backoff,
        )
        .await
        {
            Ok(CopyOutcome::NothingToPromote) => {
                info!(state = %PromotionState::SkippedEmpty, "staging partition is empty");
                return Ok(PromotionOutcome::SkippedEmpty);
            }
            Ok(CopyOutcome::Copied { rows, job_id }) => {
                info!(state = %PromotionState::Copied, %job_id, rows, "partition promoted");
                rows
            }
            Err(SanityError::Copy(err)) => return Err(PromotionError::new(job, Stage::Copy, err)),
            Err(err) => {
                warn!(error = %err, "sanity check refused promotion");
                return Err(PromotionError::new(job, Stage::Sanity, err));
            }
        };

        match self.cleanup_partition(cancel, &builder).await {
            Ok(cleaned_rows) => {
                info!(state = %PromotionState::CleanedUp, ?cleaned_rows, "staging partition cleaned up");
                Ok(PromotionOutcome::CleanedUp {
                    deduped_rows,
                    copied_rows,
                    cleaned_rows,
                })
            }
            Err(error) => {
                warn!(state = %PromotionState::PromotedCleanupFailed, error = %error, "cleanup failed after copy");
                Ok(PromotionOutcome::PromotedCleanupFailed { copied_rows, error })
            }
        }
    }

    /// Clears the staging partition of a job whose copy already committed.
    ///
    /// Refuses when the archive partition is missing or empty, so a stray call
    /// cannot discard data that was never promoted.
    pub async fn cleanup_only(
        &self,
        cancel: &CancellationToken,
        job: &Job,
    ) -> Result<Option<u64>, PromotionError> {
        let attempt_id = Uuid::new_v4();
        let span = info_span!("cleanup_only", %attempt_id, job = %job);
        self.cleanup_only_inner(cancel, job).instrument(span).await
    }

    async fn cleanup_only_inner(
        &self,
        cancel: &CancellationToken,
        job: &Job,
    ) -> Result<Option<u64>, PromotionError> {
        let builder = self.builder(job, Stage::Cleanup)?;
        let archive = builder.archive_table();
        let promoted = match self.warehouse.metadata(&archive).await {
            Ok(meta) => meta.num_rows > 0,
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(PromotionError::new(job, Stage::Cleanup, err)),
        };
        if !promoted {
            let failure = SanityError::SanityCheckFailed(SanityFailure::ArchiveMissing {
                destination_table: archive.fully_qualified(),
            });
            return Err(PromotionError::new(job, Stage::Cleanup, failure));
        }

        let cleaned_rows = self
            .cleanup_partition(cancel, &builder)
            .await
            .map_err(|e| PromotionError::new(job, Stage::Cleanup, e))?;
        info!(state = %PromotionState::CleanedUp, ?cleaned_rows, "staging partition cleaned up");
        Ok(cleaned_rows)
    }

    /// Validates and costs the dedup statement without touching data.
    pub async fn dry_run_dedup(
        &self,
        cancel: &CancellationToken,
        job: &Job,
    ) -> Result<JobStatistics, PromotionError> {
        let builder = self.builder(job, Stage::Dedup)?;
        let dedup = builder
            .dedup()
            .map_err(|e| PromotionError::new(job, Stage::Dedup, e))?;
        let status = self
            .run(cancel, &dedup, true)
            .await
            .map_err(|e| PromotionError::new(job, Stage::Dedup, e))?;
        Ok(status.statistics)
    }

    fn builder(&self, job: &Job, stage: Stage) -> Result<QueryBuilder, PromotionError> {
        QueryBuilder::new(&self.registry, self.project.as_str(), job)
            .map_err(|e| PromotionError::new(job, stage, e))
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        query: &RenderedQuery,
        dry_run: bool,
    ) -> Result<JobStatus, WarehouseError> {
        let handle = self.warehouse.run_query(query, dry_run).await?;
        debug!(
            job_id = handle.id(),
            kind = %query.kind(),
            fingerprint = %query.fingerprint(),
            dry_run,
            "query submitted"
        );
        wait_for_job(handle.as_ref(), cancel, &self.backoff).await
    }

    async fn cleanup_partition(
        &self,
        cancel: &CancellationToken,
        builder: &QueryBuilder,
    ) -> Result<Option<u64>, StageError> {
        match self.cleanup {
            CleanupStrategy::Query => {
                let query = builder.cleanup()?;
                let status = self.run(cancel, &query, false).await?;
                Ok(status.statistics.rows_affected)
            }
            CleanupStrategy::DeletePartition => {
                self.warehouse
                    .delete_partition(&builder.staging_table())
                    .await?;
                Ok(None)
            }
        }
    }
}

#[derive(Debug)]
pub struct PromotionReport {
    pub job: Job,
    pub result: Result<PromotionOutcome, PromotionError>,
}

/// Promotes a batch of partitions concurrently with a cap on in-flight promotions.
pub struct PromotionRunner<W: ?Sized = dyn Warehouse> {
    promoter: Arc<Promoter<W>>,
    max_concurrency: usize,
}

impl<W: Warehouse + ?Sized + 'static> PromotionRunner<W> {
    pub fn new(promoter: Arc<Promoter<W>>, max_concurrency: usize) -> Self {
        Self {
            promoter,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Reports come back in the order of `jobs`. A panicked task is logged and omitted.
    pub async fn run(&self, cancel: &CancellationToken, jobs: Vec<Job>) -> Vec<PromotionReport> {
        let permits = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for (index, job) in jobs.into_iter().enumerate() {
            let permits = permits.clone();
            let promoter = self.promoter.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = promoter.promote(&cancel, &job).await;
                (index, PromotionReport { job, result })
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => error!(error = %err, "promotion task failed"),
            }
        }
        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }
}

#[derive(Debug, Clone)]
pub struct GardenerConfig {
    pub project: String,
    pub max_concurrency: usize,
    pub poll_base_ms: u64,
    pub poll_max_ms: u64,
    pub cleanup: CleanupStrategy,
    pub sanity: SanityPolicy,
    pub policy_file: Option<PathBuf>,
}

impl Default for GardenerConfig {
    fn default() -> Self {
        Self::from_vars(|_| None)
    }
}

impl GardenerConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to their defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = SanityPolicy::default();
        let ratio = |key: &str, default: f64| {
            var(key)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|r| r.is_finite() && *r >= 0.0)
                .unwrap_or(default)
        };
        Self {
            project: var("GARDENER_PROJECT").unwrap_or_else(|| "mlab-sandbox".to_string()),
            max_concurrency: var("GARDENER_MAX_CONCURRENCY")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(4),
            poll_base_ms: var("GARDENER_POLL_BASE_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),
            poll_max_ms: var("GARDENER_POLL_MAX_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            cleanup: var("GARDENER_CLEANUP")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            sanity: SanityPolicy {
                min_source_file_ratio: ratio("GARDENER_MIN_FILE_RATIO", defaults.min_source_file_ratio),
                min_record_ratio: ratio("GARDENER_MIN_RECORD_RATIO", defaults.min_record_ratio),
                require_source_newer: var("GARDENER_REQUIRE_SOURCE_NEWER")
                    .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                    .unwrap_or(defaults.require_source_newer),
            },
            policy_file: var("GARDENER_POLICY_FILE").map(PathBuf::from),
        }
    }

    pub fn poll_backoff(&self) -> PollBackoff {
        PollBackoff {
            base_delay: Duration::from_millis(self.poll_base_ms),
            max_delay: Duration::from_millis(self.poll_max_ms.max(self.poll_base_ms)),
        }
    }

    /// Built-in policies plus any from `policy_file`, which override by datatype.
    pub fn load_registry(&self) -> Result<PolicyRegistry> {
        let mut registry = PolicyRegistry::builtin();
        if let Some(path) = &self.policy_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading policy file {}", path.display()))?;
            let count = registry
                .register_yaml(&text)
                .with_context(|| format!("loading policies from {}", path.display()))?;
            info!(path = %path.display(), count, "registered policies from file");
        }
        Ok(registry)
    }
}

/// Counts of each outcome kind across a batch.
pub fn summarize(reports: &[PromotionReport]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for report in reports {
        let key = match &report.result {
            Ok(outcome) => outcome.state().to_string(),
            Err(err) => format!("Aborted({})", err.stage),
        };
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use gardener_warehouse::{MemoryOperation, MemoryWarehouse};
    use serde_json::{json, Value};

    const PROJECT: &str = "proj";

    fn fast() -> PollBackoff {
        PollBackoff {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn job_on(datatype: &str, day: u32) -> Job {
        Job::new(
            "bucket",
            "ndt",
            datatype,
            NaiveDate::from_ymd_opt(2020, 3, day).unwrap(),
        )
    }

    fn ndt7_row(id: &str, time: &str, archive: &str) -> Value {
        json!({"id": id, "date": "2020-03-01", "parser": {"Time": time, "ArchiveURL": archive}})
    }

    fn setup() -> (MemoryWarehouse, Promoter<MemoryWarehouse>) {
        let warehouse = MemoryWarehouse::new(PolicyRegistry::builtin());
        let promoter = Promoter::new(Arc::new(warehouse.clone()), PolicyRegistry::builtin(), PROJECT)
            .with_backoff(fast());
        (warehouse, promoter)
    }

    async fn stage_duplicates(warehouse: &MemoryWarehouse, job: &Job) {
        warehouse
            .insert_rows(
                &job.staging_table(PROJECT),
                vec![
                    ndt7_row("a", "2020-03-02T01:00:00Z", "gs://x/1.tgz"),
                    ndt7_row("a", "2020-03-02T05:00:00Z", "gs://x/2.tgz"),
                ],
            )
            .await
            .unwrap();
    }

    fn annotated(
        warehouse: &MemoryWarehouse,
        builder: &QueryBuilder,
        table: TableRef,
    ) -> AnnotatedTable<MemoryWarehouse> {
        let detail = builder.detail(&table).unwrap();
        AnnotatedTable::new(table, Arc::new(warehouse.clone()), detail)
    }

    #[tokio::test]
    async fn duplicates_are_removed_promoted_and_cleaned_up() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);
        stage_duplicates(&warehouse, &job).await;

        let outcome = promoter.promote(&CancellationToken::new(), &job).await.unwrap();
        assert_eq!(
            outcome,
            PromotionOutcome::CleanedUp {
                deduped_rows: Some(1),
                copied_rows: 1,
                cleaned_rows: Some(1),
            }
        );

        let archived = warehouse.rows(&job.archive_table(PROJECT)).await;
        assert_eq!(archived, vec![ndt7_row("a", "2020-03-02T05:00:00Z", "gs://x/2.tgz")]);
        assert!(warehouse.rows(&job.staging_table(PROJECT)).await.is_empty());
    }

    #[tokio::test]
    async fn empty_partition_is_skipped() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);
        warehouse.create_table(&job.staging_table(PROJECT)).await;

        let outcome = promoter.promote(&CancellationToken::new(), &job).await.unwrap();
        assert_eq!(outcome, PromotionOutcome::SkippedEmpty);
        assert!(warehouse
            .metadata(&job.archive_table(PROJECT))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn archive_with_more_records_is_not_overwritten() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);
        let archived = vec![
            ndt7_row("a", "t1", "gs://x/1.tgz"),
            ndt7_row("b", "t1", "gs://x/1.tgz"),
        ];
        warehouse
            .insert_rows(&job.archive_table(PROJECT), archived.clone())
            .await
            .unwrap();
        warehouse
            .insert_rows(
                &job.staging_table(PROJECT),
                vec![
                    ndt7_row("c", "t2", "gs://x/1.tgz"),
                    ndt7_row("c", "t2", "gs://x/1.tgz"),
                ],
            )
            .await
            .unwrap();

        let err = promoter.promote(&CancellationToken::new(), &job).await.unwrap_err();
        assert_eq!(err.stage, Stage::Sanity);
        assert!(matches!(
            err.source,
            StageError::Sanity(SanityError::SanityCheckFailed(SanityFailure::TooFewRecords {
                source_count: 1,
                destination_count: 2,
            }))
        ));
        assert_eq!(warehouse.rows(&job.archive_table(PROJECT)).await, archived);
        assert_eq!(warehouse.rows(&job.staging_table(PROJECT)).await.len(), 2);
    }

    #[tokio::test]
    async fn copy_failure_aborts_before_cleanup() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);
        stage_duplicates(&warehouse, &job).await;
        warehouse.fail_next(MemoryOperation::Copy, "copy quota exceeded").await;

        let err = promoter.promote(&CancellationToken::new(), &job).await.unwrap_err();
        assert_eq!(err.stage, Stage::Copy);
        assert!(matches!(err.source, StageError::Warehouse(WarehouseError::Job { .. })));
        assert!(err.to_string().starts_with("bucket/ndt/ndt7/2020-03-01: copy stage failed"));

        let staging = warehouse.rows(&job.staging_table(PROJECT)).await;
        assert_eq!(staging, vec![ndt7_row("a", "2020-03-02T05:00:00Z", "gs://x/2.tgz")]);
        assert!(warehouse.rows(&job.archive_table(PROJECT)).await.is_empty());
    }

    #[tokio::test]
    async fn cleanup_failure_is_reported_and_retried_alone() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);
        stage_duplicates(&warehouse, &job).await;
        warehouse.fail_next(MemoryOperation::Cleanup, "backend error").await;

        let outcome = promoter.promote(&CancellationToken::new(), &job).await.unwrap();
        assert_eq!(outcome.state(), PromotionState::PromotedCleanupFailed);
        assert_eq!(warehouse.rows(&job.archive_table(PROJECT)).await.len(), 1);
        assert_eq!(warehouse.rows(&job.staging_table(PROJECT)).await.len(), 1);

        let cleaned = promoter.cleanup_only(&CancellationToken::new(), &job).await.unwrap();
        assert_eq!(cleaned, Some(1));
        assert!(warehouse.rows(&job.staging_table(PROJECT)).await.is_empty());
        assert_eq!(warehouse.rows(&job.archive_table(PROJECT)).await.len(), 1);
    }

    #[tokio::test]
    async fn full_retry_after_cleanup_failure_cleans_up() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);
        stage_duplicates(&warehouse, &job).await;
        warehouse.fail_next(MemoryOperation::Cleanup, "backend error").await;

        let first = promoter.promote(&CancellationToken::new(), &job).await.unwrap();
        assert_eq!(first.state(), PromotionState::PromotedCleanupFailed);

        let second = promoter.promote(&CancellationToken::new(), &job).await.unwrap();
        assert_eq!(
            second,
            PromotionOutcome::CleanedUp {
                deduped_rows: Some(0),
                copied_rows: 1,
                cleaned_rows: Some(1),
            }
        );
        let archived = warehouse.rows(&job.archive_table(PROJECT)).await;
        assert_eq!(archived, vec![ndt7_row("a", "2020-03-02T05:00:00Z", "gs://x/2.tgz")]);
        assert!(warehouse.rows(&job.staging_table(PROJECT)).await.is_empty());
    }

    #[tokio::test]
    async fn missing_staging_table_aborts_in_dedup() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);

        let err = promoter.promote(&CancellationToken::new(), &job).await.unwrap_err();
        assert_eq!(err.stage, Stage::Dedup);
        assert!(matches!(
            err.source,
            StageError::Warehouse(WarehouseError::Job { ref message, .. }) if message.starts_with("Not found")
        ));
        assert!(warehouse
            .metadata(&job.archive_table(PROJECT))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn cleanup_only_requires_a_promoted_archive() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);
        stage_duplicates(&warehouse, &job).await;

        let err = promoter
            .cleanup_only(&CancellationToken::new(), &job)
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Cleanup);
        assert_eq!(warehouse.rows(&job.staging_table(PROJECT)).await.len(), 2);
    }

    #[tokio::test]
    async fn delete_partition_strategy_drops_staging() {
        let (warehouse, promoter) = setup();
        let promoter = promoter.with_cleanup_strategy(CleanupStrategy::DeletePartition);
        let job = job_on("ndt7", 1);
        stage_duplicates(&warehouse, &job).await;

        let outcome = promoter.promote(&CancellationToken::new(), &job).await.unwrap();
        assert!(matches!(
            outcome,
            PromotionOutcome::CleanedUp { cleaned_rows: None, copied_rows: 1, .. }
        ));
        assert!(warehouse.rows(&job.staging_table(PROJECT)).await.is_empty());
    }

    #[tokio::test]
    async fn metadata_outage_aborts_in_sanity_stage() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);
        stage_duplicates(&warehouse, &job).await;
        warehouse
            .fail_metadata(&job.archive_table(PROJECT), "metadata service down")
            .await;

        let err = promoter.promote(&CancellationToken::new(), &job).await.unwrap_err();
        assert_eq!(err.stage, Stage::Sanity);
        assert!(matches!(
            err.source,
            StageError::Sanity(SanityError::MetadataUnavailable { .. })
        ));
        assert_eq!(warehouse.rows(&job.staging_table(PROJECT)).await.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_dedup_without_mutation() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);
        stage_duplicates(&warehouse, &job).await;
        warehouse.set_job_delay(u32::MAX).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = promoter.promote(&cancel, &job).await.unwrap_err();
        assert_eq!(err.stage, Stage::Dedup);
        assert!(matches!(
            err.source,
            StageError::Warehouse(WarehouseError::Cancelled { .. })
        ));
        assert_eq!(warehouse.rows(&job.staging_table(PROJECT)).await.len(), 2);
    }

    #[tokio::test]
    async fn unsupported_datatype_aborts_in_dedup() {
        let (_, promoter) = setup();
        let err = promoter
            .promote(&CancellationToken::new(), &job_on("traceroute", 1))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Dedup);
        assert_eq!(
            err.source,
            StageError::Query(CoreError::DatatypeNotSupported("traceroute".into()))
        );
    }

    #[tokio::test]
    async fn dry_run_costs_without_mutation() {
        let (warehouse, promoter) = setup();
        let job = job_on("ndt7", 1);
        stage_duplicates(&warehouse, &job).await;

        let stats = promoter
            .dry_run_dedup(&CancellationToken::new(), &job)
            .await
            .unwrap();
        assert!(stats.bytes_processed.unwrap_or(0) > 0);
        assert_eq!(warehouse.rows(&job.staging_table(PROJECT)).await.len(), 2);
    }

    #[tokio::test]
    async fn mismatched_partitions_are_refused() {
        let (warehouse, _) = setup();
        let job = job_on("ndt7", 1);
        stage_duplicates(&warehouse, &job).await;
        let builder = QueryBuilder::new(&PolicyRegistry::builtin(), PROJECT, &job).unwrap();
        let other_day = job_on("ndt7", 2).archive_table(PROJECT);

        let err = check_and_copy(
            &CancellationToken::new(),
            &annotated(&warehouse, &builder, builder.staging_table()),
            &annotated(&warehouse, &builder, other_day),
            &warehouse,
            builder.policy(),
            &SanityPolicy::default(),
            &fast(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            SanityError::SanityCheckFailed(SanityFailure::MismatchedPartitions { .. })
        ));
    }

    #[tokio::test]
    async fn stale_source_is_refused_only_when_required() {
        let (warehouse, _) = setup();
        let job = job_on("ndt7", 1);
        let builder = QueryBuilder::new(&PolicyRegistry::builtin(), PROJECT, &job).unwrap();
        warehouse
            .insert_rows(
                &builder.staging_table(),
                vec![
                    ndt7_row("a", "t2", "gs://x/1.tgz"),
                    ndt7_row("b", "t2", "gs://x/1.tgz"),
                ],
            )
            .await
            .unwrap();
        warehouse
            .insert_rows(&builder.archive_table(), vec![ndt7_row("a", "t1", "gs://x/1.tgz")])
            .await
            .unwrap();
        warehouse
            .set_last_modified(&builder.staging_table(), Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();

        let check = |sanity: SanityPolicy| {
            let source = annotated(&warehouse, &builder, builder.staging_table());
            let destination = annotated(&warehouse, &builder, builder.archive_table());
            let warehouse = warehouse.clone();
            let policy = builder.policy().clone();
            async move {
                check_and_copy(
                    &CancellationToken::new(),
                    &source,
                    &destination,
                    &warehouse,
                    &policy,
                    &sanity,
                    &fast(),
                )
                .await
            }
        };

        let strict = SanityPolicy {
            require_source_newer: true,
            ..SanityPolicy::default()
        };
        let err = check(strict).await.unwrap_err();
        assert!(matches!(
            err,
            SanityError::SanityCheckFailed(SanityFailure::SourceOlderThanDestination { .. })
        ));
        assert_eq!(warehouse.rows(&builder.archive_table()).await.len(), 1);

        let outcome = check(SanityPolicy::default()).await.unwrap();
        assert!(matches!(outcome, CopyOutcome::Copied { rows: 2, .. }));
        assert_eq!(warehouse.rows(&builder.archive_table()).await.len(), 2);
    }

    #[tokio::test]
    async fn ratios_tolerate_small_shrinkage() {
        let (warehouse, _) = setup();
        let job = job_on("ndt7", 1);
        let builder = QueryBuilder::new(&PolicyRegistry::builtin(), PROJECT, &job).unwrap();
        let rows = |n: usize| {
            (0..n)
                .map(|i| ndt7_row(&format!("r{i}"), "t1", "gs://x/1.tgz"))
                .collect::<Vec<_>>()
        };
        warehouse.insert_rows(&builder.archive_table(), rows(100)).await.unwrap();
        warehouse.insert_rows(&builder.staging_table(), rows(99)).await.unwrap();

        let sanity = SanityPolicy {
            min_source_file_ratio: 0.99,
            min_record_ratio: 0.99,
            require_source_newer: true,
        };
        let outcome = check_and_copy(
            &CancellationToken::new(),
            &annotated(&warehouse, &builder, builder.staging_table()),
            &annotated(&warehouse, &builder, builder.archive_table()),
            &warehouse,
            builder.policy(),
            &sanity,
            &fast(),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, CopyOutcome::Copied { rows: 99, .. }));
    }

    #[tokio::test]
    async fn runner_promotes_batches_in_order() {
        let (warehouse, promoter) = setup();
        let jobs: Vec<Job> = (1..=3).map(|day| job_on("ndt7", day)).collect();
        for job in &jobs {
            stage_duplicates(&warehouse, job).await;
        }
        let empty = job_on("ndt7", 4);
        warehouse.create_table(&empty.staging_table(PROJECT)).await;

        let mut batch = jobs.clone();
        batch.push(empty.clone());
        let runner = PromotionRunner::new(Arc::new(promoter), 2);
        let reports = runner.run(&CancellationToken::new(), batch).await;

        assert_eq!(reports.len(), 4);
        for (report, job) in reports.iter().zip(jobs.iter()) {
            assert_eq!(&report.job, job);
            assert_eq!(report.result.as_ref().unwrap().state(), PromotionState::CleanedUp);
            assert_eq!(warehouse.rows(&job.archive_table(PROJECT)).await.len(), 1);
        }
        assert_eq!(reports[3].result, Ok(PromotionOutcome::SkippedEmpty));

        let counts = summarize(&reports);
        assert_eq!(counts.get("CleanedUp"), Some(&3));
        assert_eq!(counts.get("SkippedEmpty"), Some(&1));
    }

    #[test]
    fn config_reads_variables_with_defaults() {
        let vars: HashMap<&str, &str> = [
            ("GARDENER_PROJECT", "mlab-oti"),
            ("GARDENER_MAX_CONCURRENCY", "8"),
            ("GARDENER_CLEANUP", "delete-partition"),
            ("GARDENER_MIN_RECORD_RATIO", "0.99"),
            ("GARDENER_REQUIRE_SOURCE_NEWER", "false"),
            ("GARDENER_POLL_BASE_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config = GardenerConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.project, "mlab-oti");
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.cleanup, CleanupStrategy::DeletePartition);
        assert_eq!(config.sanity.min_record_ratio, 0.99);
        assert_eq!(config.sanity.min_source_file_ratio, 1.0);
        assert!(!config.sanity.require_source_newer);
        assert_eq!(config.poll_base_ms, 250);

        let strict = GardenerConfig::from_vars(|k| {
            (k == "GARDENER_REQUIRE_SOURCE_NEWER").then(|| "true".to_string())
        });
        assert!(strict.sanity.require_source_newer);
        assert_eq!(config.policy_file, None);

        let defaults = GardenerConfig::default();
        assert_eq!(defaults.project, "mlab-sandbox");
        assert!(!defaults.sanity.require_source_newer);
        assert_eq!(defaults.cleanup, CleanupStrategy::Query);
        assert_eq!(defaults.poll_backoff().max_delay, Duration::from_secs(10));
    }

    #[test]
    fn policy_file_extends_builtin_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.yaml");
        std::fs::write(
            &path,
            "policies:\n  - datatype: scamper1\n    date_column: date\n    partition_keys:\n      - name: id\n        column: id\n",
        )
        .unwrap();

        let config = GardenerConfig {
            policy_file: Some(path.clone()),
            ..GardenerConfig::default()
        };
        let registry = config.load_registry().unwrap();
        assert!(registry.get("scamper1").is_ok());
        assert!(registry.get("ndt7").is_ok());

        std::fs::write(&path, "policies: [").unwrap();
        let err = config.load_registry().unwrap_err();
        assert!(format!("{err:#}").contains("loading policies from"));

        let missing = GardenerConfig {
            policy_file: Some(dir.path().join("absent.yaml")),
            ..GardenerConfig::default()
        };
        assert!(missing.load_registry().is_err());
    }
}
