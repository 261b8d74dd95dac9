//! Warehouse collaborator contracts, remote job polling and the per-table metadata cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gardener_core::{RenderedQuery, TableRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod memory;

pub use memory::{MemoryOperation, MemoryWarehouse};

pub const CRATE_NAME: &str = "gardener-warehouse";

/// Errors are `Clone` so a cached failure can be handed to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WarehouseError {
    #[error("table not found: {0}")]
    NotFound(String),
    #[error("job {job_id} failed: {message}")]
    Job { job_id: String, message: String },
    #[error("job {job_id} cancelled")]
    Cancelled { job_id: String },
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl WarehouseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WarehouseError::NotFound(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteDisposition {
    /// Replace the destination partition wholesale.
    Truncate,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub num_rows: u64,
    pub num_bytes: u64,
    pub creation_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
    pub is_partitioned: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDetail {
    pub distinct_source_file_count: u64,
    pub distinct_record_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub rows_affected: Option<u64>,
    pub bytes_processed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    /// Set when a finished job reports a hard failure.
    pub error: Option<String>,
    pub statistics: JobStatistics,
}

impl JobStatus {
    pub fn running() -> Self {
        Self {
            state: JobState::Running,
            error: None,
            statistics: JobStatistics::default(),
        }
    }

    pub fn done(statistics: JobStatistics) -> Self {
        Self {
            state: JobState::Done,
            error: None,
            statistics,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: JobState::Done,
            error: Some(message.into()),
            statistics: JobStatistics::default(),
        }
    }
}

/// A remote query or copy job. Callers only see this interface.
#[async_trait]
pub trait JobHandle: Send + Sync {
    fn id(&self) -> &str;
    async fn status(&self) -> Result<JobStatus, WarehouseError>;
    async fn cancel(&self) -> Result<(), WarehouseError>;
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// A dry run validates and costs the query without mutating data.
    async fn run_query(
        &self,
        query: &RenderedQuery,
        dry_run: bool,
    ) -> Result<Box<dyn JobHandle>, WarehouseError>;
}

#[async_trait]
pub trait CopyExecutor: Send + Sync {
    async fn copy(
        &self,
        source: &TableRef,
        destination: &TableRef,
        disposition: WriteDisposition,
    ) -> Result<Box<dyn JobHandle>, WarehouseError>;
}

#[async_trait]
pub trait DeleteExecutor: Send + Sync {
    async fn delete_partition(&self, table: &TableRef) -> Result<(), WarehouseError>;
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Fails with [`WarehouseError::NotFound`] when the table does not exist.
    async fn metadata(&self, table: &TableRef) -> Result<TableMetadata, WarehouseError>;
    async fn detail(&self, query: &RenderedQuery) -> Result<TableDetail, WarehouseError>;
}

/// Everything a promotion needs from the warehouse client.
pub trait Warehouse: QueryExecutor + CopyExecutor + DeleteExecutor + MetadataProvider {}

impl<T> Warehouse for T where T: QueryExecutor + CopyExecutor + DeleteExecutor + MetadataProvider {}

/// Capped exponential delay between job status polls.
#[derive(Debug, Clone, Copy)]
pub struct PollBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl PollBackoff {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Polls `job` until it finishes. Cancelling `cancel` also cancels the remote job.
pub async fn wait_for_job(
    job: &dyn JobHandle,
    cancel: &CancellationToken,
    backoff: &PollBackoff,
) -> Result<JobStatus, WarehouseError> {
    let mut attempt = 0usize;
    loop {
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancel_job(job).await),
            status = job.status() => status?,
        };

        if status.state == JobState::Done {
            return match status.error {
                Some(message) => Err(WarehouseError::Job {
                    job_id: job.id().to_string(),
                    message,
                }),
                None => Ok(status),
            };
        }

        let delay = backoff.delay_for_attempt(attempt);
        attempt += 1;
        debug!(job_id = job.id(), ?delay, "job still running");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancel_job(job).await),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn cancel_job(job: &dyn JobHandle) -> WarehouseError {
    if let Err(err) = job.cancel().await {
        warn!(job_id = job.id(), error = %err, "cancelling remote job failed");
    }
    WarehouseError::Cancelled {
        job_id: job.id().to_string(),
    }
}

/// A table reference with memoized metadata and detail.
///
/// Concurrent callers share one upstream fetch per entry and all observe the
/// same value or the same error. Entries never expire: an instance belongs to
/// one promotion attempt, and a retry that needs fresh numbers must build a new
/// instance or call [`AnnotatedTable::refresh`].
pub struct AnnotatedTable<P: ?Sized> {
    table: TableRef,
    provider: Arc<P>,
    detail_query: RenderedQuery,
    metadata: OnceCell<Result<TableMetadata, WarehouseError>>,
    detail: OnceCell<Result<TableDetail, WarehouseError>>,
}

impl<P: MetadataProvider + ?Sized> AnnotatedTable<P> {
    pub fn new(table: TableRef, provider: Arc<P>, detail_query: RenderedQuery) -> Self {
        Self {
            table,
            provider,
            detail_query,
            metadata: OnceCell::new(),
            detail: OnceCell::new(),
        }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub async fn metadata(&self) -> Result<TableMetadata, WarehouseError> {
        self.metadata
            .get_or_init(|| async {
                debug!(table = %self.table, "fetching table metadata");
                self.provider.metadata(&self.table).await
            })
            .await
            .clone()
    }

    pub async fn detail(&self) -> Result<TableDetail, WarehouseError> {
        self.detail
            .get_or_init(|| async {
                debug!(table = %self.table, query = %self.detail_query.fingerprint(), "fetching table detail");
                self.provider.detail(&self.detail_query).await
            })
            .await
            .clone()
    }

    /// Drops both cached entries so the next read goes upstream again.
    pub fn refresh(&mut self) {
        self.metadata = OnceCell::new();
        self.detail = OnceCell::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::NaiveDate;
    use gardener_core::{Job, PolicyRegistry, QueryBuilder};

    struct CountingProvider {
        metadata_calls: AtomicUsize,
        detail_calls: AtomicUsize,
        fail: bool,
    }

    impl CountingProvider {
        fn new(fail: bool) -> Self {
            Self {
                metadata_calls: AtomicUsize::new(0),
                detail_calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl MetadataProvider for CountingProvider {
        async fn metadata(&self, table: &TableRef) -> Result<TableMetadata, WarehouseError> {
            self.metadata_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(WarehouseError::NotFound(table.fully_qualified()));
            }
            let now = Utc::now();
            Ok(TableMetadata {
                num_rows: 8,
                num_bytes: 168,
                creation_time: now,
                last_modified_time: now,
                is_partitioned: true,
            })
        }

        async fn detail(&self, _query: &RenderedQuery) -> Result<TableDetail, WarehouseError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            Ok(TableDetail {
                distinct_source_file_count: 2,
                distinct_record_count: 4,
            })
        }
    }

    fn annotated(provider: Arc<CountingProvider>) -> AnnotatedTable<CountingProvider> {
        let job = Job::new(
            "bucket",
            "ndt",
            "ndt7",
            NaiveDate::from_ymd_opt(1999, 1, 1).unwrap(),
        );
        let builder = QueryBuilder::new(&PolicyRegistry::builtin(), "proj", &job).unwrap();
        let table = builder.staging_table();
        let detail = builder.detail(&table).unwrap();
        AnnotatedTable::new(table, provider, detail)
    }

    struct ScriptedJob {
        polls_until_done: AtomicUsize,
        cancelled: AtomicUsize,
        error: Option<String>,
    }

    #[async_trait]
    impl JobHandle for ScriptedJob {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn status(&self) -> Result<JobStatus, WarehouseError> {
            let remaining = self.polls_until_done.load(Ordering::SeqCst);
            if remaining > 0 {
                self.polls_until_done.store(remaining - 1, Ordering::SeqCst);
                return Ok(JobStatus::running());
            }
            Ok(match &self.error {
                Some(message) => JobStatus::failed(message.clone()),
                None => JobStatus::done(JobStatistics {
                    rows_affected: Some(3),
                    bytes_processed: None,
                }),
            })
        }

        async fn cancel(&self) -> Result<(), WarehouseError> {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_backoff() -> PollBackoff {
        PollBackoff {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn concurrent_metadata_reads_share_one_fetch() {
        let provider = Arc::new(CountingProvider::new(false));
        let table = annotated(provider.clone());

        let (a, b, c) = tokio::join!(table.metadata(), table.metadata(), table.metadata());
        assert_eq!(a.unwrap().num_rows, 8);
        assert_eq!(b.unwrap(), c.unwrap());
        assert_eq!(provider.metadata_calls.load(Ordering::SeqCst), 1);

        table.metadata().await.unwrap();
        assert_eq!(provider.metadata_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cached_errors_are_shared_until_refresh() {
        let provider = Arc::new(CountingProvider::new(true));
        let mut table = annotated(provider.clone());

        let (a, b) = tokio::join!(table.metadata(), table.metadata());
        assert!(a.unwrap_err().is_not_found());
        assert!(b.unwrap_err().is_not_found());
        assert_eq!(provider.metadata_calls.load(Ordering::SeqCst), 1);

        table.refresh();
        assert!(table.metadata().await.is_err());
        assert_eq!(provider.metadata_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn detail_is_cached_separately() {
        let provider = Arc::new(CountingProvider::new(false));
        let table = annotated(provider.clone());

        let detail = table.detail().await.unwrap();
        assert_eq!(detail.distinct_source_file_count, 2);
        assert_eq!(detail.distinct_record_count, 4);
        table.detail().await.unwrap();
        assert_eq!(provider.detail_calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.metadata_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn poll_backoff_is_exponential_and_capped() {
        let backoff = PollBackoff {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn wait_polls_until_done() {
        let job = ScriptedJob {
            polls_until_done: AtomicUsize::new(3),
            cancelled: AtomicUsize::new(0),
            error: None,
        };
        let status = wait_for_job(&job, &CancellationToken::new(), &fast_backoff())
            .await
            .unwrap();
        assert_eq!(status.state, JobState::Done);
        assert_eq!(status.statistics.rows_affected, Some(3));
    }

    #[tokio::test]
    async fn wait_surfaces_job_errors() {
        let job = ScriptedJob {
            polls_until_done: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
            error: Some("quota exceeded".into()),
        };
        let err = wait_for_job(&job, &CancellationToken::new(), &fast_backoff())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WarehouseError::Job {
                job_id: "scripted".into(),
                message: "quota exceeded".into()
            }
        );
    }

    #[tokio::test]
    async fn cancellation_cancels_remote_job() {
        let job = ScriptedJob {
            polls_until_done: AtomicUsize::new(usize::MAX),
            cancelled: AtomicUsize::new(0),
            error: None,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = wait_for_job(&job, &cancel, &fast_backoff()).await.unwrap_err();
        assert!(matches!(err, WarehouseError::Cancelled { .. }));
        assert_eq!(job.cancelled.load(Ordering::SeqCst), 1);
    }
}
