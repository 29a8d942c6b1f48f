//! Where job descriptors come from, and where job runs are recorded.
//!
//! Two descriptor sources: a TOML file with `[[tables]]` entries, and a
//! control table in the warehouse (`etl.etl_job` by default) whose active
//! rows each describe one job. The control table doubles as a run ledger:
//! `start_ts`/`end_ts`/`status` are stamped around every job.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_postgres::{Client, Row};
use tracing::{debug, info, warn};

use crate::error::{SyncError, describe};
use crate::job::{DEFAULT_INCREMENTAL_COLUMN, DEFAULT_UNIQUE_KEY, SyncJobDescriptor};
use crate::sql::{qualified_name, quote_ident};

/// Supplies the ordered descriptor list for one batch. Must not have side effects.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn descriptors(&self) -> Result<Vec<SyncJobDescriptor>, SyncError>;
}

#[async_trait]
impl DescriptorSource for Vec<SyncJobDescriptor> {
    async fn descriptors(&self) -> Result<Vec<SyncJobDescriptor>, SyncError> {
        Ok(self.clone())
    }
}

/// Records job start and end. Failures are reported, never fatal to a job.
#[async_trait]
pub trait RunLedger: Send + Sync {
    async fn job_started(&self, descriptor: &SyncJobDescriptor) -> Result<(), SyncError>;

    async fn job_finished(
        &self,
        descriptor: &SyncJobDescriptor,
        succeeded: bool,
    ) -> Result<(), SyncError>;
}

/// Ledger that records nothing.
pub struct NoLedger;

#[async_trait]
impl RunLedger for NoLedger {
    async fn job_started(&self, _descriptor: &SyncJobDescriptor) -> Result<(), SyncError> {
        Ok(())
    }

    async fn job_finished(
        &self,
        _descriptor: &SyncJobDescriptor,
        _succeeded: bool,
    ) -> Result<(), SyncError> {
        Ok(())
    }
}

// ── TOML file ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    tables: Vec<SyncJobDescriptor>,
}

/// `[[tables]]` entries of a TOML file, in file order.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn parse(text: &str) -> Result<Vec<SyncJobDescriptor>, SyncError> {
        let file: DescriptorFile = toml::from_str(text)
            .map_err(|e| SyncError::Configuration(format!("invalid table descriptors: {e}")))?;
        Ok(file.tables)
    }
}

#[async_trait]
impl DescriptorSource for FileSource {
    async fn descriptors(&self) -> Result<Vec<SyncJobDescriptor>, SyncError> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SyncError::Configuration(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let descriptors = Self::parse(&text)?;
        debug!(
            path = %self.path.display(),
            count = descriptors.len(),
            "read table descriptors"
        );
        Ok(descriptors)
    }
}

// ── Control table ───────────────────────────────────────────────────────

const STATUS_RUNNING: i32 = -1;
const STATUS_SUCCEEDED: i32 = 1;
const STATUS_FAILED: i32 = 0;

/// Columns a control table may lack; absent ones read as NULL.
const OPTIONAL_COLUMNS: [&str; 2] = ["sync_type", "incremental_column"];

/// Job descriptors and run ledger backed by a warehouse table.
pub struct ControlTable {
    client: Client,
    table: String,
}

impl ControlTable {
    /// `table` may be schema-qualified (`etl.etl_job`).
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    async fn stamp(&self, job_name: &str, assignments: &str) -> Result<(), SyncError> {
        let query = format!(
            "UPDATE {} SET {assignments} WHERE job_name = $1",
            qualified_name(&self.table)
        );
        self.client
            .execute(&query, &[&job_name])
            .await
            .map_err(|e| SyncError::load(&format!("update {} for {job_name}", self.table), e))?;
        Ok(())
    }

    fn read_error(&self, err: tokio_postgres::Error) -> SyncError {
        SyncError::Configuration(format!(
            "cannot read control table {}: {}",
            self.table,
            describe(&err)
        ))
    }

    /// Names of the control table's columns. Unqualified names resolve in
    /// the current schema.
    async fn column_names(&self) -> Result<Vec<String>, SyncError> {
        let (schema, table) = match self.table.split_once('.') {
            Some((schema, table)) => (Some(schema), table),
            None => (None, self.table.as_str()),
        };
        let rows = self
            .client
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema::text = COALESCE($1, current_schema()::text) \
                   AND table_name::text = $2",
                &[&schema, &table],
            )
            .await
            .map_err(|e| self.read_error(e))?;
        Ok(rows.iter().filter_map(|row| row.try_get(0).ok()).collect())
    }
}

/// Descriptor for one control row, or the reason it cannot be used.
fn descriptor_from_row(row: &Row) -> Result<SyncJobDescriptor, String> {
    let job_name: Option<String> = row.try_get(0).map_err(|e| e.to_string())?;
    let job_name = job_name.ok_or_else(|| "job_name is NULL".to_string())?;
    let unusable = |what: &str| format!("job {job_name}: {what}");

    let query_id: Option<String> = row.try_get(1).map_err(|e| unusable(&e.to_string()))?;
    let query_id = query_id.ok_or_else(|| unusable("query_id is NULL"))?;
    let query_id: i64 = query_id
        .trim()
        .parse()
        .map_err(|_| unusable(&format!("query_id {query_id:?} is not an integer")))?;

    let table_name: Option<String> = row.try_get(2).map_err(|e| unusable(&e.to_string()))?;
    let table_name = table_name
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| unusable("target_table is NULL"))?;

    let p_key: Option<String> = row.try_get(3).map_err(|e| unusable(&e.to_string()))?;
    let sync_type: Option<String> = row.try_get(4).map_err(|e| unusable(&e.to_string()))?;
    let incremental_column: Option<String> =
        row.try_get(5).map_err(|e| unusable(&e.to_string()))?;

    Ok(SyncJobDescriptor {
        table_name,
        query_id,
        sync_type,
        unique_keys: parse_key_list(p_key.as_deref()),
        incremental_column: incremental_column
            .unwrap_or_else(|| DEFAULT_INCREMENTAL_COLUMN.to_string()),
        query_parameters: Default::default(),
        job_name: Some(job_name),
    })
}

/// Split a comma-separated key list; `None` falls back to the default key.
pub fn parse_key_list(p_key: Option<&str>) -> Vec<String> {
    match p_key {
        None => vec![DEFAULT_UNIQUE_KEY.to_string()],
        Some(list) => list
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

#[async_trait]
impl DescriptorSource for ControlTable {
    async fn descriptors(&self) -> Result<Vec<SyncJobDescriptor>, SyncError> {
        let present = self.column_names().await?;
        let optional: Vec<String> = OPTIONAL_COLUMNS
            .iter()
            .map(|name| {
                if present.iter().any(|c| c == name) {
                    format!("{}::text", quote_ident(name))
                } else {
                    "NULL::text".to_string()
                }
            })
            .collect();
        let query = format!(
            "SELECT job_name::text, query_id::text, target_table::text, p_key::text, {} \
             FROM {} WHERE active = 1 ORDER BY job_name",
            optional.join(", "),
            qualified_name(&self.table)
        );
        let rows = self
            .client
            .query(&query, &[])
            .await
            .map_err(|e| self.read_error(e))?;

        let descriptors: Vec<SyncJobDescriptor> = rows
            .iter()
            .filter_map(|row| match descriptor_from_row(row) {
                Ok(descriptor) => Some(descriptor),
                Err(reason) => {
                    warn!(table = %self.table, %reason, "skipping unusable control row");
                    None
                }
            })
            .collect();
        info!(table = %self.table, count = descriptors.len(), "read active jobs");
        Ok(descriptors)
    }
}

fn ledger_name(descriptor: &SyncJobDescriptor) -> &str {
    descriptor
        .job_name
        .as_deref()
        .unwrap_or(&descriptor.table_name)
}

#[async_trait]
impl RunLedger for ControlTable {
    async fn job_started(&self, descriptor: &SyncJobDescriptor) -> Result<(), SyncError> {
        self.stamp(
            ledger_name(descriptor),
            &format!("start_ts = now(), end_ts = NULL, status = {STATUS_RUNNING}"),
        )
        .await
    }

    async fn job_finished(
        &self,
        descriptor: &SyncJobDescriptor,
        succeeded: bool,
    ) -> Result<(), SyncError> {
        let status = if succeeded {
            STATUS_SUCCEEDED
        } else {
            STATUS_FAILED
        };
        self.stamp(
            ledger_name(descriptor),
            &format!("end_ts = now(), status = {status}"),
        )
        .await
    }
}
