//! Job model, datatype policies, table-name parsing and SQL rendering for the gardener.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use askama::Template;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "gardener-core";

pub const DEFAULT_INGESTION_TIME_COLUMN: &str = "parser.Time";

/// Column aliases the dedup template reserves for itself.
const RESERVED_ALIASES: [&str; 2] = ["ingestion_time", "row_number"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("datatype not supported: {0}")]
    DatatypeNotSupported(String),
    #[error("invalid partition name {name:?}: {reason}")]
    InvalidPartitionName { name: String, reason: &'static str },
    #[error("invalid policy for {datatype:?}: {reason}")]
    InvalidPolicy { datatype: String, reason: String },
    #[error("parsing policy file: {0}")]
    PolicyFile(String),
    #[error("rendering {kind} query: {message}")]
    Render { kind: QueryKind, message: String },
}

/// One unit of work handed out by the tracker: a single datatype partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Job {
    pub bucket: String,
    pub experiment: String,
    pub datatype: String,
    pub date: NaiveDate,
}

impl Job {
    pub fn new(
        bucket: impl Into<String>,
        experiment: impl Into<String>,
        datatype: impl Into<String>,
        date: NaiveDate,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            experiment: experiment.into(),
            datatype: datatype.into(),
            date,
        }
    }

    pub fn partition_suffix(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }

    pub fn staging_dataset(&self) -> String {
        format!("staging_{}", self.experiment)
    }

    pub fn archive_dataset(&self) -> String {
        format!("archive_{}", self.experiment)
    }

    /// `<project>.staging_<experiment>.<datatype>$YYYYMMDD`
    pub fn staging_table(&self, project: &str) -> TableRef {
        TableRef::new(project, self.staging_dataset(), &self.datatype).partition(self.date)
    }

    /// `<project>.archive_<experiment>.<datatype>$YYYYMMDD`
    pub fn archive_table(&self, project: &str) -> TableRef {
        TableRef::new(project, self.archive_dataset(), &self.datatype).partition(self.date)
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.bucket, self.experiment, self.datatype, self.date
        )
    }
}

/// Datatypes with a built-in dedup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Annotation,
    Ndt5,
    Ndt7,
    Tcpinfo,
}

impl Datatype {
    pub const ALL: [Datatype; 4] = [
        Datatype::Annotation,
        Datatype::Ndt5,
        Datatype::Ndt7,
        Datatype::Tcpinfo,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Datatype::Annotation => "annotation",
            Datatype::Ndt5 => "ndt5",
            Datatype::Ndt7 => "ndt7",
            Datatype::Tcpinfo => "tcpinfo",
        }
    }

    pub fn policy(self) -> DatatypePolicy {
        match self {
            Datatype::Annotation => DatatypePolicy {
                datatype: self.as_str().to_string(),
                date_column: "date".into(),
                partition_keys: vec![PartitionKey::new("id", "id")],
                tie_break_order: String::new(),
                ingestion_time_column: DEFAULT_INGESTION_TIME_COLUMN.into(),
                source_file_column: None,
            },
            Datatype::Ndt5 => DatatypePolicy {
                datatype: self.as_str().to_string(),
                date_column: "DATE(log_time)".into(),
                partition_keys: vec![PartitionKey::new("test_id", "test_id")],
                tie_break_order: String::new(),
                ingestion_time_column: DEFAULT_INGESTION_TIME_COLUMN.into(),
                source_file_column: Some("parser.ArchiveURL".into()),
            },
            Datatype::Ndt7 => DatatypePolicy {
                datatype: self.as_str().to_string(),
                date_column: "date".into(),
                partition_keys: vec![PartitionKey::new("id", "id")],
                tie_break_order: String::new(),
                ingestion_time_column: DEFAULT_INGESTION_TIME_COLUMN.into(),
                source_file_column: Some("parser.ArchiveURL".into()),
            },
            Datatype::Tcpinfo => DatatypePolicy {
                datatype: self.as_str().to_string(),
                date_column: "DATE(TestTime)".into(),
                partition_keys: vec![
                    PartitionKey::new("uuid", "uuid"),
                    PartitionKey::new("Timestamp", "FinalSnapshot.Timestamp"),
                ],
                tie_break_order: "ARRAY_LENGTH(Snapshots) DESC, ParseInfo.TaskFileName".into(),
                ingestion_time_column: "ParseInfo.ParseTime".into(),
                source_file_column: Some("ParseInfo.TaskFileName".into()),
            },
        }
    }
}

impl fmt::Display for Datatype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Datatype {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Datatype::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| CoreError::DatatypeNotSupported(s.to_string()))
    }
}

/// A logical key name and the fully-qualified column it reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKey {
    pub name: String,
    pub column: String,
}

impl PartitionKey {
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
        }
    }
}

fn default_ingestion_time_column() -> String {
    DEFAULT_INGESTION_TIME_COLUMN.to_string()
}

/// How rows of one datatype are grouped, ranked and counted.
///
/// The partition keys, combined with the date column, are assumed to identify
/// one logical record. Nothing here verifies that against the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatatypePolicy {
    pub datatype: String,
    pub date_column: String,
    pub partition_keys: Vec<PartitionKey>,
    /// Extra ordering applied ahead of the ingestion-time tie break.
    #[serde(default)]
    pub tie_break_order: String,
    #[serde(default = "default_ingestion_time_column")]
    pub ingestion_time_column: String,
    /// When set, promotion compares distinct source files and records, not just rows.
    #[serde(default)]
    pub source_file_column: Option<String>,
}

impl DatatypePolicy {
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |reason: String| CoreError::InvalidPolicy {
            datatype: self.datatype.clone(),
            reason,
        };

        if self.datatype.trim().is_empty() {
            return Err(invalid("datatype name is empty".into()));
        }
        if self.date_column.trim().is_empty() {
            return Err(invalid("date column is empty".into()));
        }
        if self.ingestion_time_column.trim().is_empty() {
            return Err(invalid("ingestion time column is empty".into()));
        }
        if self.partition_keys.is_empty() {
            return Err(invalid("at least one partition key is required".into()));
        }

        let mut seen = BTreeSet::new();
        for key in &self.partition_keys {
            if !is_identifier(&key.name) {
                return Err(invalid(format!("key name {:?} is not an identifier", key.name)));
            }
            if RESERVED_ALIASES.contains(&key.name.as_str()) {
                return Err(invalid(format!("key name {:?} is reserved", key.name)));
            }
            if key.column.trim().is_empty() {
                return Err(invalid(format!("key {:?} has no column", key.name)));
            }
            if !seen.insert(key.name.as_str()) {
                return Err(invalid(format!("duplicate key name {:?}", key.name)));
            }
        }
        Ok(())
    }

    pub fn is_detailed(&self) -> bool {
        self.source_file_column.is_some()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    policies: Vec<DatatypePolicy>,
}

/// Policies keyed by datatype name. Unknown datatypes are rejected at lookup.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, DatatypePolicy>,
}

impl PolicyRegistry {
    pub fn builtin() -> Self {
        let policies = Datatype::ALL
            .into_iter()
            .map(|d| (d.as_str().to_string(), d.policy()))
            .collect();
        Self { policies }
    }

    /// Validates and registers a policy, replacing any previous one for the datatype.
    pub fn register(&mut self, policy: DatatypePolicy) -> Result<(), CoreError> {
        policy.validate()?;
        self.policies.insert(policy.datatype.clone(), policy);
        Ok(())
    }

    /// Registers every policy of a YAML `policies:` document; nothing is registered on error.
    pub fn register_yaml(&mut self, text: &str) -> Result<usize, CoreError> {
        let file: PolicyFile =
            serde_yaml::from_str(text).map_err(|e| CoreError::PolicyFile(e.to_string()))?;
        for policy in &file.policies {
            policy.validate()?;
        }
        let count = file.policies.len();
        for policy in file.policies {
            self.policies.insert(policy.datatype.clone(), policy);
        }
        Ok(count)
    }

    pub fn get(&self, datatype: &str) -> Result<&DatatypePolicy, CoreError> {
        self.policies
            .get(datatype)
            .ok_or_else(|| CoreError::DatatypeNotSupported(datatype.to_string()))
    }

    pub fn policies(&self) -> impl Iterator<Item = &DatatypePolicy> {
        self.policies.values()
    }
}

/// A warehouse table, optionally carrying a `$YYYYMMDD` partition decorator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Table name without any partition decorator.
    pub fn base_name(&self) -> &str {
        self.table.split('$').next().unwrap_or(&self.table)
    }

    pub fn base(&self) -> TableRef {
        TableRef::new(&self.project, &self.dataset, self.base_name())
    }

    pub fn partition(&self, date: NaiveDate) -> TableRef {
        TableRef::new(
            &self.project,
            &self.dataset,
            format!("{}${}", self.base_name(), date.format("%Y%m%d")),
        )
    }

    pub fn parts(&self) -> Result<TableParts, CoreError> {
        parse_table_name(&self.table)
    }

    pub fn fully_qualified(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }

    /// Backquoted name usable in a FROM clause.
    pub fn sql_name(&self) -> String {
        format!("`{}.{}.{}`", self.project, self.dataset, self.base_name())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fully_qualified())
    }
}

/// A table name split into prefix, separator kind and dense date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableParts {
    pub prefix: String,
    /// True only for the `$YYYYMMDD` partition decorator.
    pub is_partitioned: bool,
    pub yyyymmdd: Option<String>,
}

impl TableParts {
    pub fn date(&self) -> Option<NaiveDate> {
        self.yyyymmdd.as_deref().and_then(dense_date)
    }
}

/// Parses `prefix$YYYYMMDD` (partition), `prefix_YYYYMMDD` (shard) or a plain name.
pub fn parse_table_name(name: &str) -> Result<TableParts, CoreError> {
    let invalid = |reason| CoreError::InvalidPartitionName {
        name: name.to_string(),
        reason,
    };

    if let Some((prefix, suffix)) = name.split_once('$') {
        if suffix.contains('$') {
            return Err(invalid("more than one partition separator"));
        }
        if prefix.is_empty() {
            return Err(invalid("empty table prefix"));
        }
        if sharded_suffix(prefix).is_some() {
            return Err(invalid("both shard and partition suffixes present"));
        }
        check_dense_date(suffix).map_err(invalid)?;
        return Ok(TableParts {
            prefix: prefix.to_string(),
            is_partitioned: true,
            yyyymmdd: Some(suffix.to_string()),
        });
    }

    match sharded_suffix(name) {
        Some((prefix, digits)) => {
            if prefix.is_empty() {
                return Err(invalid("empty table prefix"));
            }
            check_dense_date(digits).map_err(invalid)?;
            Ok(TableParts {
                prefix: prefix.to_string(),
                is_partitioned: false,
                yyyymmdd: Some(digits.to_string()),
            })
        }
        None => Ok(TableParts {
            prefix: name.to_string(),
            is_partitioned: false,
            yyyymmdd: None,
        }),
    }
}

fn sharded_suffix(name: &str) -> Option<(&str, &str)> {
    let (prefix, digits) = name.rsplit_once('_')?;
    (digits.len() == 8 && digits.bytes().all(|b| b.is_ascii_digit())).then_some((prefix, digits))
}

fn check_dense_date(digits: &str) -> Result<(), &'static str> {
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err("partition suffix must be exactly 8 digits");
    }
    dense_date(digits)
        .map(|_| ())
        .ok_or("partition suffix is not a calendar date")
}

fn dense_date(digits: &str) -> Option<NaiveDate> {
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = digits[0..4].parse().ok()?;
    let month = digits[4..6].parse().ok()?;
    let day = digits[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Dedup,
    Cleanup,
    Detail,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryKind::Dedup => "dedup",
            QueryKind::Cleanup => "cleanup",
            QueryKind::Detail => "detail",
        })
    }
}

/// SQL text plus the table and partition it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedQuery {
    kind: QueryKind,
    datatype: String,
    table: TableRef,
    partition_date: Option<NaiveDate>,
    text: String,
}

impl RenderedQuery {
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    pub fn datatype(&self) -> &str {
        &self.datatype
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn partition_date(&self) -> Option<NaiveDate> {
        self.partition_date
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Hex SHA-256 of the query text; equal for byte-identical renders.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Template)]
#[template(path = "dedup.sql", escape = "none")]
struct DedupTemplate<'a> {
    table: &'a str,
    date_column: &'a str,
    date: &'a str,
    keys: &'a [PartitionKey],
    ingestion_time: &'a str,
    partition_by: &'a str,
    order_by: &'a str,
}

#[derive(Template)]
#[template(path = "cleanup.sql", escape = "none")]
struct CleanupTemplate<'a> {
    table: &'a str,
    date_column: &'a str,
    date: &'a str,
}

#[derive(Template)]
#[template(path = "detail.sql", escape = "none")]
struct DetailTemplate<'a> {
    table: &'a str,
    source_file_expr: &'a str,
    record_key_expr: &'a str,
    filter: &'a str,
}

fn render(kind: QueryKind, template: &impl Template) -> Result<String, CoreError> {
    template.render().map_err(|e| CoreError::Render {
        kind,
        message: e.to_string(),
    })
}

/// Renders the dedup, cleanup and detail statements for one job.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    project: String,
    job: Job,
    policy: DatatypePolicy,
}

impl QueryBuilder {
    pub fn new(
        registry: &PolicyRegistry,
        project: impl Into<String>,
        job: &Job,
    ) -> Result<Self, CoreError> {
        let policy = registry.get(&job.datatype)?.clone();
        Self::with_policy(project, job, policy)
    }

    pub fn with_policy(
        project: impl Into<String>,
        job: &Job,
        policy: DatatypePolicy,
    ) -> Result<Self, CoreError> {
        policy.validate()?;
        Ok(Self {
            project: project.into(),
            job: job.clone(),
            policy,
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn policy(&self) -> &DatatypePolicy {
        &self.policy
    }

    pub fn staging_table(&self) -> TableRef {
        self.job.staging_table(&self.project)
    }

    pub fn archive_table(&self) -> TableRef {
        self.job.archive_table(&self.project)
    }

    fn sql_date(&self) -> String {
        self.job.date.format("%Y-%m-%d").to_string()
    }

    pub fn dedup(&self) -> Result<RenderedQuery, CoreError> {
        let table = self.staging_table();
        let sql_table = table.sql_name();
        let date = self.sql_date();
        let partition_by = self
            .policy
            .partition_keys
            .iter()
            .map(|k| k.column.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let tie_break = self.policy.tie_break_order.trim().trim_end_matches(',');
        let order_by = if tie_break.is_empty() {
            format!("{} DESC", self.policy.ingestion_time_column)
        } else {
            format!("{tie_break}, {} DESC", self.policy.ingestion_time_column)
        };

        let text = render(
            QueryKind::Dedup,
            &DedupTemplate {
                table: &sql_table,
                date_column: &self.policy.date_column,
                date: &date,
                keys: &self.policy.partition_keys,
                ingestion_time: &self.policy.ingestion_time_column,
                partition_by: &partition_by,
                order_by: &order_by,
            },
        )?;
        Ok(self.rendered(QueryKind::Dedup, table, text))
    }

    pub fn cleanup(&self) -> Result<RenderedQuery, CoreError> {
        let table = self.staging_table();
        let sql_table = table.sql_name();
        let date = self.sql_date();
        let text = render(
            QueryKind::Cleanup,
            &CleanupTemplate {
                table: &sql_table,
                date_column: &self.policy.date_column,
                date: &date,
            },
        )?;
        Ok(self.rendered(QueryKind::Cleanup, table, text))
    }

    /// Aggregate counts over `table`: one partition for `$` names, the whole shard otherwise.
    pub fn detail(&self, table: &TableRef) -> Result<RenderedQuery, CoreError> {
        let parts = table.parts()?;
        let partition_date = parts.date();
        let filter = match partition_date {
            Some(date) if parts.is_partitioned => format!(
                "\nWHERE {} = \"{}\"",
                self.policy.date_column,
                date.format("%Y-%m-%d")
            ),
            _ => String::new(),
        };
        let source_file_expr = self
            .policy
            .source_file_column
            .clone()
            .unwrap_or_else(|| "NULL".to_string());
        let record_key_expr = match self.policy.partition_keys.as_slice() {
            [single] => single.column.clone(),
            keys => format!(
                "TO_JSON_STRING(STRUCT({}))",
                keys.iter()
                    .map(|k| k.column.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };

        let text = render(
            QueryKind::Detail,
            &DetailTemplate {
                table: &table.sql_name(),
                source_file_expr: &source_file_expr,
                record_key_expr: &record_key_expr,
                filter: &filter,
            },
        )?;
        Ok(RenderedQuery {
            kind: QueryKind::Detail,
            datatype: self.policy.datatype.clone(),
            table: table.clone(),
            partition_date,
            text,
        })
    }

    pub fn dedup_query_text(&self) -> Result<String, CoreError> {
        self.dedup().map(RenderedQuery::into_text)
    }

    pub fn cleanup_query_text(&self) -> Result<String, CoreError> {
        self.cleanup().map(RenderedQuery::into_text)
    }

    fn rendered(&self, kind: QueryKind, table: TableRef, text: String) -> RenderedQuery {
        RenderedQuery {
            kind,
            datatype: self.policy.datatype.clone(),
            table,
            partition_date: Some(self.job.date),
            text,
        }
    }
}
