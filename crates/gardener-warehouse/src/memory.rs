//! In-process warehouse over JSON rows.
//!
//! Tables are date-partitioned and addressed by their base [`TableRef`]; rows
//! are `serde_json` objects and column paths such as `parser.Time` walk nested
//! objects. Dedup, cleanup, copy and detail follow the semantics of the
//! rendered statements, using the datatype policy named by the query. Jobs
//! finish on a later status poll, which is when their side effect lands, so a
//! cancelled job never touches data.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use gardener_core::{DatatypePolicy, PolicyRegistry, QueryKind, RenderedQuery, TableRef};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    CopyExecutor, DeleteExecutor, JobHandle, JobStatistics, JobStatus, MetadataProvider,
    QueryExecutor, TableDetail, TableMetadata, WarehouseError, WriteDisposition,
};

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOperation {
    Dedup,
    Cleanup,
    Copy,
    DeletePartition,
}

#[derive(Clone)]
pub struct MemoryWarehouse {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    registry: PolicyRegistry,
    state: Mutex<MemoryState>,
    next_job: AtomicU64,
}

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<TableRef, MemoryTable>,
    faults: Vec<(MemoryOperation, String)>,
    metadata_faults: BTreeMap<TableRef, String>,
    job_delay_polls: u32,
}

struct MemoryTable {
    created: DateTime<Utc>,
    partitions: BTreeMap<NaiveDate, MemoryPartition>,
}

impl MemoryTable {
    fn new() -> Self {
        Self {
            created: Utc::now(),
            partitions: BTreeMap::new(),
        }
    }
}

#[derive(Clone)]
struct MemoryPartition {
    rows: Vec<Value>,
    modified: DateTime<Utc>,
}

enum PendingOperation {
    Query(RenderedQuery),
    Copy {
        source: TableRef,
        destination: TableRef,
        disposition: WriteDisposition,
    },
}

impl MemoryWarehouse {
    pub fn new(registry: PolicyRegistry) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                registry,
                state: Mutex::new(MemoryState::default()),
                next_job: AtomicU64::new(1),
            }),
        }
    }

    /// Creates the base table of `table` if it does not exist yet.
    pub async fn create_table(&self, table: &TableRef) {
        let mut state = self.inner.state.lock().await;
        state.tables.entry(table.base()).or_insert_with(MemoryTable::new);
    }

    /// Appends rows to the `$YYYYMMDD` partition named by `table`.
    pub async fn insert_rows(&self, table: &TableRef, rows: Vec<Value>) -> Result<(), WarehouseError> {
        let date = partition_date(table)?;
        let mut state = self.inner.state.lock().await;
        let entry = state.tables.entry(table.base()).or_insert_with(MemoryTable::new);
        let partition = entry.partitions.entry(date).or_insert_with(|| MemoryPartition {
            rows: Vec::new(),
            modified: Utc::now(),
        });
        partition.rows.extend(rows);
        partition.modified = Utc::now();
        Ok(())
    }

    /// Rows of one partition; empty when the table or partition does not exist.
    pub async fn rows(&self, table: &TableRef) -> Vec<Value> {
        let Ok(date) = partition_date(table) else {
            return Vec::new();
        };
        let state = self.inner.state.lock().await;
        state
            .tables
            .get(&table.base())
            .and_then(|t| t.partitions.get(&date))
            .map(|p| p.rows.clone())
            .unwrap_or_default()
    }

    pub async fn set_last_modified(
        &self,
        table: &TableRef,
        at: DateTime<Utc>,
    ) -> Result<(), WarehouseError> {
        let date = partition_date(table)?;
        let mut state = self.inner.state.lock().await;
        let partition = state
            .tables
            .get_mut(&table.base())
            .and_then(|t| t.partitions.get_mut(&date))
            .ok_or_else(|| WarehouseError::NotFound(table.fully_qualified()))?;
        partition.modified = at;
        Ok(())
    }

    /// Makes the next job of `operation` finish with `message` as its error.
    pub async fn fail_next(&self, operation: MemoryOperation, message: impl Into<String>) {
        let mut state = self.inner.state.lock().await;
        state.faults.push((operation, message.into()));
    }

    /// Makes metadata reads of `table` fail until cleared with [`MemoryWarehouse::clear_faults`].
    pub async fn fail_metadata(&self, table: &TableRef, message: impl Into<String>) {
        let mut state = self.inner.state.lock().await;
        state.metadata_faults.insert(table.base(), message.into());
    }

    pub async fn clear_faults(&self) {
        let mut state = self.inner.state.lock().await;
        state.faults.clear();
        state.metadata_faults.clear();
    }

    /// Number of status polls a job reports `Running` before it completes.
    pub async fn set_job_delay(&self, polls: u32) {
        self.inner.state.lock().await.job_delay_polls = polls;
    }

    async fn submit(
        &self,
        operation: PendingOperation,
        kind: MemoryOperation,
    ) -> Box<dyn JobHandle> {
        let mut state = self.inner.state.lock().await;
        let fault = take_fault(&mut state, kind);
        let id = self.next_job_id();
        debug!(job_id = %id, ?kind, "memory job submitted");
        Box::new(MemoryJob {
            id,
            inner: self.inner.clone(),
            state: Mutex::new(MemoryJobState {
                remaining_polls: state.job_delay_polls,
                operation: Some(operation),
                fault,
                finished: None,
            }),
        })
    }

    fn next_job_id(&self) -> String {
        format!("memory-job-{}", self.inner.next_job.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl QueryExecutor for MemoryWarehouse {
    async fn run_query(
        &self,
        query: &RenderedQuery,
        dry_run: bool,
    ) -> Result<Box<dyn JobHandle>, WarehouseError> {
        let kind = match query.kind() {
            QueryKind::Dedup => MemoryOperation::Dedup,
            QueryKind::Cleanup => MemoryOperation::Cleanup,
            QueryKind::Detail => {
                return Err(WarehouseError::Unsupported(
                    "detail queries are read through MetadataProvider::detail".into(),
                ))
            }
        };
        self.inner.registry.get(query.datatype()).map_err(|e| {
            WarehouseError::Unsupported(format!("no policy for {}: {e}", query.datatype()))
        })?;

        if dry_run {
            let state = self.inner.state.lock().await;
            let bytes = query
                .partition_date()
                .and_then(|date| state.tables.get(&query.table().base())?.partitions.get(&date))
                .map(|p| rows_bytes(&p.rows))
                .unwrap_or(0);
            return Ok(Box::new(MemoryJob::finished(
                self.next_job_id(),
                self.inner.clone(),
                JobStatus::done(JobStatistics {
                    rows_affected: None,
                    bytes_processed: Some(bytes),
                }),
            )));
        }

        Ok(self.submit(PendingOperation::Query(query.clone()), kind).await)
    }
}

#[async_trait]
impl CopyExecutor for MemoryWarehouse {
    async fn copy(
        &self,
        source: &TableRef,
        destination: &TableRef,
        disposition: WriteDisposition,
    ) -> Result<Box<dyn JobHandle>, WarehouseError> {
        partition_date(source)?;
        partition_date(destination)?;
        Ok(self
            .submit(
                PendingOperation::Copy {
                    source: source.clone(),
                    destination: destination.clone(),
                    disposition,
                },
                MemoryOperation::Copy,
            )
            .await)
    }
}

#[async_trait]
impl DeleteExecutor for MemoryWarehouse {
    async fn delete_partition(&self, table: &TableRef) -> Result<(), WarehouseError> {
        let date = partition_date(table)?;
        let mut state = self.inner.state.lock().await;
        if let Some(message) = take_fault(&mut state, MemoryOperation::DeletePartition) {
            return Err(WarehouseError::Unavailable(message));
        }
        let entry = state
            .tables
            .get_mut(&table.base())
            .ok_or_else(|| WarehouseError::NotFound(table.fully_qualified()))?;
        entry.partitions.remove(&date);
        info!(table = %table, "memory partition deleted");
        Ok(())
    }
}

#[async_trait]
impl MetadataProvider for MemoryWarehouse {
    async fn metadata(&self, table: &TableRef) -> Result<TableMetadata, WarehouseError> {
        let parts = table
            .parts()
            .map_err(|e| WarehouseError::Unsupported(e.to_string()))?;
        let state = self.inner.state.lock().await;
        if let Some(message) = state.metadata_faults.get(&table.base()) {
            return Err(WarehouseError::Unavailable(message.clone()));
        }
        let entry = state
            .tables
            .get(&table.base())
            .ok_or_else(|| WarehouseError::NotFound(table.fully_qualified()))?;

        let selected: Vec<&MemoryPartition> = match parts.date() {
            Some(date) if parts.is_partitioned => entry.partitions.get(&date).into_iter().collect(),
            _ => entry.partitions.values().collect(),
        };
        Ok(TableMetadata {
            num_rows: selected.iter().map(|p| p.rows.len() as u64).sum(),
            num_bytes: selected.iter().map(|p| rows_bytes(&p.rows)).sum(),
            creation_time: entry.created,
            last_modified_time: selected
                .iter()
                .map(|p| p.modified)
                .max()
                .unwrap_or(entry.created),
            is_partitioned: true,
        })
    }

    async fn detail(&self, query: &RenderedQuery) -> Result<TableDetail, WarehouseError> {
        let policy = self
            .inner
            .registry
            .get(query.datatype())
            .map_err(|e| WarehouseError::Unsupported(e.to_string()))?;
        let parts = query
            .table()
            .parts()
            .map_err(|e| WarehouseError::Unsupported(e.to_string()))?;
        let state = self.inner.state.lock().await;
        let entry = state
            .tables
            .get(&query.table().base())
            .ok_or_else(|| WarehouseError::NotFound(query.table().fully_qualified()))?;

        let rows: Vec<&Value> = match parts.date() {
            Some(date) if parts.is_partitioned => entry
                .partitions
                .get(&date)
                .map(|p| p.rows.iter().collect())
                .unwrap_or_default(),
            _ => entry.partitions.values().flat_map(|p| p.rows.iter()).collect(),
        };
        Ok(detail_of(&rows, policy))
    }
}

struct MemoryJob {
    id: String,
    inner: Arc<MemoryInner>,
    state: Mutex<MemoryJobState>,
}

struct MemoryJobState {
    remaining_polls: u32,
    operation: Option<PendingOperation>,
    fault: Option<String>,
    finished: Option<JobStatus>,
}

impl MemoryJob {
    fn finished(id: String, inner: Arc<MemoryInner>, status: JobStatus) -> Self {
        Self {
            id,
            inner,
            state: Mutex::new(MemoryJobState {
                remaining_polls: 0,
                operation: None,
                fault: None,
                finished: Some(status),
            }),
        }
    }
}

#[async_trait]
impl JobHandle for MemoryJob {
    fn id(&self) -> &str {
        &self.id
    }

    async fn status(&self) -> Result<JobStatus, WarehouseError> {
        let mut job = self.state.lock().await;
        if let Some(status) = &job.finished {
            return Ok(status.clone());
        }
        if job.remaining_polls > 0 {
            job.remaining_polls -= 1;
            return Ok(JobStatus::running());
        }

        let status = match (job.fault.take(), job.operation.take()) {
            (Some(message), _) => JobStatus::failed(message),
            (None, Some(operation)) => self.inner.apply(operation).await,
            (None, None) => JobStatus::done(JobStatistics::default()),
        };
        debug!(job_id = %self.id, error = ?status.error, "memory job finished");
        job.finished = Some(status.clone());
        Ok(status)
    }

    async fn cancel(&self) -> Result<(), WarehouseError> {
        let mut job = self.state.lock().await;
        if job.finished.is_none() {
            job.operation = None;
            job.finished = Some(JobStatus::failed("job cancelled"));
        }
        Ok(())
    }
}

impl MemoryInner {
    async fn apply(&self, operation: PendingOperation) -> JobStatus {
        let mut state = self.state.lock().await;
        let result = match operation {
            PendingOperation::Query(query) => match query.kind() {
                QueryKind::Dedup => self.apply_dedup(&mut state, &query),
                QueryKind::Cleanup => apply_cleanup(&mut state, &query),
                QueryKind::Detail => Err("detail queries do not run as jobs".to_string()),
            },
            PendingOperation::Copy {
                source,
                destination,
                disposition,
            } => apply_copy(&mut state, &source, &destination, disposition),
        };
        match result {
            Ok(rows) => JobStatus::done(JobStatistics {
                rows_affected: Some(rows),
                bytes_processed: None,
            }),
            Err(message) => JobStatus::failed(message),
        }
    }

    fn apply_dedup(&self, state: &mut MemoryState, query: &RenderedQuery) -> Result<u64, String> {
        let policy = self.registry.get(query.datatype()).map_err(|e| e.to_string())?;
        let partition = target_partition(state, query)?;
        let Some(partition) = partition else {
            return Ok(0);
        };
        let removed = dedup_rows(&mut partition.rows, policy)?;
        if removed > 0 {
            partition.modified = Utc::now();
        }
        Ok(removed)
    }
}

fn target_partition<'a>(
    state: &'a mut MemoryState,
    query: &RenderedQuery,
) -> Result<Option<&'a mut MemoryPartition>, String> {
    let date = query
        .partition_date()
        .ok_or_else(|| format!("{} query has no partition date", query.kind()))?;
    let table = state
        .tables
        .get_mut(&query.table().base())
        .ok_or_else(|| format!("Not found: Table {}", query.table().base()))?;
    Ok(table.partitions.get_mut(&date))
}

fn apply_cleanup(state: &mut MemoryState, query: &RenderedQuery) -> Result<u64, String> {
    let date = query
        .partition_date()
        .ok_or_else(|| "cleanup query has no partition date".to_string())?;
    let table = state
        .tables
        .get_mut(&query.table().base())
        .ok_or_else(|| format!("Not found: Table {}", query.table().base()))?;
    Ok(table
        .partitions
        .remove(&date)
        .map(|p| p.rows.len() as u64)
        .unwrap_or(0))
}

fn apply_copy(
    state: &mut MemoryState,
    source: &TableRef,
    destination: &TableRef,
    disposition: WriteDisposition,
) -> Result<u64, String> {
    let source_date = partition_date(source).map_err(|e| e.to_string())?;
    let destination_date = partition_date(destination).map_err(|e| e.to_string())?;
    let rows = state
        .tables
        .get(&source.base())
        .and_then(|t| t.partitions.get(&source_date))
        .map(|p| p.rows.clone())
        .ok_or_else(|| format!("Not found: Table {source}"))?;
    let copied = rows.len() as u64;

    let table = state
        .tables
        .entry(destination.base())
        .or_insert_with(MemoryTable::new);
    let now = Utc::now();
    match disposition {
        WriteDisposition::Truncate => {
            table.partitions.insert(
                destination_date,
                MemoryPartition {
                    rows,
                    modified: now,
                },
            );
        }
        WriteDisposition::Append => {
            let partition = table
                .partitions
                .entry(destination_date)
                .or_insert_with(|| MemoryPartition {
                    rows: Vec::new(),
                    modified: now,
                });
            partition.rows.extend(rows);
            partition.modified = now;
        }
    }
    Ok(copied)
}

fn take_fault(state: &mut MemoryState, operation: MemoryOperation) -> Option<String> {
    let idx = state.faults.iter().position(|(op, _)| *op == operation)?;
    Some(state.faults.remove(idx).1)
}

fn partition_date(table: &TableRef) -> Result<NaiveDate, WarehouseError> {
    let parts = table
        .parts()
        .map_err(|e| WarehouseError::Unsupported(e.to_string()))?;
    match parts.date() {
        Some(date) if parts.is_partitioned => Ok(date),
        _ => Err(WarehouseError::Unsupported(format!(
            "{table} does not name a $YYYYMMDD partition"
        ))),
    }
}

fn rows_bytes(rows: &[Value]) -> u64 {
    rows.iter()
        .map(|row| serde_json::to_vec(row).map(|b| b.len() as u64).unwrap_or(0))
        .sum()
}

/// Walks a dotted column path through nested objects.
fn lookup<'a>(row: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(row, |value, segment| value.get(segment))
        .filter(|v| !v.is_null())
}

enum SortExpr {
    Column(String),
    ArrayLength(String),
}

struct SortTerm {
    expr: SortExpr,
    descending: bool,
}

impl SortTerm {
    fn eval(&self, row: &Value) -> Value {
        match &self.expr {
            SortExpr::Column(path) => lookup(row, path).cloned().unwrap_or(Value::Null),
            SortExpr::ArrayLength(path) => lookup(row, path)
                .and_then(Value::as_array)
                .map(|a| Value::from(a.len()))
                .unwrap_or(Value::Null),
        }
    }
}

/// Understands comma-separated column paths and `ARRAY_LENGTH(path)`, each optionally `ASC`/`DESC`.
fn parse_tie_break(order: &str) -> Result<Vec<SortTerm>, String> {
    order
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(|term| {
            let (expr, descending) = match term.rsplit_once(char::is_whitespace) {
                Some((expr, dir)) if dir.eq_ignore_ascii_case("desc") => (expr.trim(), true),
                Some((expr, dir)) if dir.eq_ignore_ascii_case("asc") => (expr.trim(), false),
                _ => (term, false),
            };
            let expr = match expr
                .strip_prefix("ARRAY_LENGTH(")
                .and_then(|rest| rest.strip_suffix(')'))
            {
                Some(path) if is_column_path(path) => SortExpr::ArrayLength(path.to_string()),
                None if is_column_path(expr) => SortExpr::Column(expr.to_string()),
                _ => return Err(format!("unsupported ordering expression {term:?}")),
            };
            Ok(SortTerm { expr, descending })
        })
        .collect()
}

fn is_column_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// NULL sorts first, then booleans, numbers, strings, and everything else.
fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)).then_with(|| a.to_string().cmp(&b.to_string())),
    }
}

/// Key values of a row, or `None` when any is NULL: SQL equality never matches NULL.
fn key_of(row: &Value, policy: &DatatypePolicy) -> Option<String> {
    let values = policy
        .partition_keys
        .iter()
        .map(|k| lookup(row, &k.column).cloned())
        .collect::<Option<Vec<_>>>()?;
    Some(Value::Array(values).to_string())
}

fn dedup_rows(rows: &mut Vec<Value>, policy: &DatatypePolicy) -> Result<u64, String> {
    let order = parse_tie_break(&policy.tie_break_order)?;
    let ingestion = policy.ingestion_time_column.as_str();

    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, row) in rows.iter().enumerate() {
        if let Some(key) = key_of(row, policy) {
            groups.entry(key).or_default().push(idx);
        }
    }

    let preference = |a: &Value, b: &Value| {
        order
            .iter()
            .map(|term| {
                let ord = compare_values(&term.eval(a), &term.eval(b));
                if term.descending {
                    ord.reverse()
                } else {
                    ord
                }
            })
            .find(|ord| *ord != CmpOrdering::Equal)
            .unwrap_or_else(|| {
                let ta = lookup(a, ingestion).cloned().unwrap_or(Value::Null);
                let tb = lookup(b, ingestion).cloned().unwrap_or(Value::Null);
                compare_values(&tb, &ta)
            })
    };

    let mut keep = BTreeSet::new();
    for (key, members) in &groups {
        let best = members
            .iter()
            .copied()
            .min_by(|&a, &b| preference(&rows[a], &rows[b]));
        if let Some(time) = best.and_then(|idx| lookup(&rows[idx], ingestion)) {
            keep.insert((key.clone(), time.to_string()));
        }
    }

    let before = rows.len();
    rows.retain(|row| {
        match (key_of(row, policy), lookup(row, ingestion)) {
            (Some(key), Some(time)) => keep.contains(&(key, time.to_string())),
            _ => false,
        }
    });
    Ok((before - rows.len()) as u64)
}

fn detail_of(rows: &[&Value], policy: &DatatypePolicy) -> TableDetail {
    let source_files: BTreeSet<String> = policy
        .source_file_column
        .as_deref()
        .map(|column| {
            rows.iter()
                .filter_map(|row| lookup(row, column))
                .map(Value::to_string)
                .collect()
        })
        .unwrap_or_default();

    let records: BTreeSet<String> = if policy.partition_keys.len() == 1 {
        let column = &policy.partition_keys[0].column;
        rows.iter()
            .filter_map(|row| lookup(row, column))
            .map(Value::to_string)
            .collect()
    } else {
        rows.iter()
            .map(|row| {
                let values = policy
                    .partition_keys
                    .iter()
                    .map(|k| lookup(row, &k.column).cloned().unwrap_or(Value::Null))
                    .collect();
                Value::Array(values).to_string()
            })
            .collect()
    };

    TableDetail {
        distinct_source_file_count: source_files.len() as u64,
        distinct_record_count: records.len() as u64,
    }
}
