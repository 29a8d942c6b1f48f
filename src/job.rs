//! One table sync: resolve the strategy, run the remote query, load rows.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{SyncError, SyncJobError};
use crate::loader::{LoadStrategy, LoadStrategyKind, TableStore, UniqueKeys};
use crate::remote::{QueryExecutor, RemoteQuerySpec};
use crate::rows::Scalar;

pub const DEFAULT_UNIQUE_KEY: &str = "id";
pub const DEFAULT_INCREMENTAL_COLUMN: &str = "updated_at";

fn default_unique_keys() -> Vec<String> {
    vec![DEFAULT_UNIQUE_KEY.to_string()]
}

fn default_incremental_column() -> String {
    DEFAULT_INCREMENTAL_COLUMN.to_string()
}

/// Declared sync type of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    FullRefresh,
    Incremental,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::FullRefresh => "full_refresh",
            SyncType::Incremental => "incremental",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, SyncError> {
        match s.trim().to_lowercase().as_str() {
            "full_refresh" | "full" => Ok(SyncType::FullRefresh),
            "incremental" => Ok(SyncType::Incremental),
            // Older descriptor files spell it this way.
            "sync_incremental" => Ok(SyncType::Incremental),
            other => Err(SyncError::Configuration(format!(
                "unknown sync type: {other}. Must be 'full_refresh' or 'incremental'"
            ))),
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one table sync, read once per batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncJobDescriptor {
    #[serde(alias = "name")]
    pub table_name: String,
    #[serde(alias = "id")]
    pub query_id: i64,
    /// Kept raw so an invalid value fails only this job.
    #[serde(default)]
    pub sync_type: Option<String>,
    #[serde(default = "default_unique_keys", alias = "source_unique_keys")]
    pub unique_keys: Vec<String>,
    #[serde(default = "default_incremental_column")]
    pub incremental_column: String,
    #[serde(default)]
    pub query_parameters: BTreeMap<String, Value>,
    /// Control-table job name, used by the run ledger.
    #[serde(default)]
    pub job_name: Option<String>,
}

impl SyncJobDescriptor {
    pub fn new(table_name: impl Into<String>, query_id: i64) -> Self {
        Self {
            table_name: table_name.into(),
            query_id,
            sync_type: None,
            unique_keys: default_unique_keys(),
            incremental_column: default_incremental_column(),
            query_parameters: BTreeMap::new(),
            job_name: None,
        }
    }

    /// Absent means incremental.
    pub fn sync_type(&self) -> Result<SyncType, SyncError> {
        self.sync_type
            .as_deref()
            .map_or(Ok(SyncType::Incremental), SyncType::from_str)
    }
}

/// Per-run knobs shared by every job of a batch.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub max_wait: Duration,
    pub watermark_parameter: String,
    pub force_full_refresh: bool,
    /// Replaces the watermark read from the target table.
    pub incremental_value: Option<String>,
    pub batch_deadline: Option<Instant>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(300),
            watermark_parameter: "date".to_string(),
            force_full_refresh: false,
            incremental_value: None,
            batch_deadline: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncResult {
    pub table_name: String,
    pub rows_loaded: u64,
    pub strategy_used: LoadStrategyKind,
    pub duration: Duration,
}

pub struct SyncJob<'a> {
    descriptor: &'a SyncJobDescriptor,
    executor: &'a QueryExecutor,
    options: &'a JobOptions,
}

impl<'a> SyncJob<'a> {
    pub fn new(
        descriptor: &'a SyncJobDescriptor,
        executor: &'a QueryExecutor,
        options: &'a JobOptions,
    ) -> Self {
        Self {
            descriptor,
            executor,
            options,
        }
    }

    /// Run the job against `store`. Every failure is wrapped with the table name.
    pub async fn run(&self, store: &mut dyn TableStore) -> Result<SyncResult, SyncJobError> {
        let started = Instant::now();
        let table_name = &self.descriptor.table_name;
        info!(
            table = %table_name,
            query_id = self.descriptor.query_id,
            "sync job starting"
        );

        match self.execute(store).await {
            Ok((rows_loaded, strategy_used)) => {
                let duration = started.elapsed();
                info!(
                    table = %table_name,
                    rows = rows_loaded,
                    strategy = %strategy_used,
                    duration_ms = duration.as_millis() as u64,
                    "sync job finished"
                );
                Ok(SyncResult {
                    table_name: table_name.clone(),
                    rows_loaded,
                    strategy_used,
                    duration,
                })
            }
            Err(cause) => {
                warn!(
                    table = %table_name,
                    kind = %cause.kind(),
                    error = %cause,
                    "sync job failed"
                );
                Err(SyncJobError::new(table_name.clone(), cause))
            }
        }
    }

    async fn execute(
        &self,
        store: &mut dyn TableStore,
    ) -> Result<(u64, LoadStrategyKind), SyncError> {
        let strategy = self.plan(store).await?;
        let spec = self.query_spec(&strategy);
        let rows = self
            .executor
            .run(&spec, self.options.max_wait, self.options.batch_deadline)
            .await?;
        let loaded = store.load(&rows, &strategy).await?;
        Ok((loaded, strategy.kind()))
    }

    /// Resolve the load strategy, downgrading to a full refresh when no safe
    /// incremental path exists.
    pub async fn plan(&self, store: &mut dyn TableStore) -> Result<LoadStrategy, SyncError> {
        let desc = self.descriptor;
        let table = desc.table_name.as_str();

        if self.options.force_full_refresh {
            info!(table, "full refresh forced for this run");
            return Ok(LoadStrategy::FullRefresh);
        }
        if desc.sync_type()? == SyncType::FullRefresh {
            return Ok(LoadStrategy::FullRefresh);
        }

        let Some(keys) = UniqueKeys::new(desc.unique_keys.clone()) else {
            warn!(table, "incremental sync without unique keys, using full refresh");
            return Ok(LoadStrategy::FullRefresh);
        };

        if !store.table_exists().await? {
            info!(table, "target table does not exist yet, using full refresh");
            return Ok(LoadStrategy::FullRefresh);
        }

        let since = match &self.options.incremental_value {
            Some(value) => Some(Scalar::Text(value.clone())),
            None => store.current_max_value(&desc.incremental_column).await?,
        };

        match since {
            Some(since_value) => {
                info!(
                    table,
                    column = %desc.incremental_column,
                    since = %since_value,
                    "incremental sync"
                );
                Ok(LoadStrategy::Incremental {
                    keys,
                    column: desc.incremental_column.clone(),
                    since_value,
                })
            }
            None => {
                info!(
                    table,
                    column = %desc.incremental_column,
                    "no watermark in target table, using full refresh"
                );
                Ok(LoadStrategy::FullRefresh)
            }
        }
    }

    /// Static parameters, plus the watermark parameter on the incremental path.
    pub fn query_spec(&self, strategy: &LoadStrategy) -> RemoteQuerySpec {
        let mut spec = RemoteQuerySpec {
            query_id: self.descriptor.query_id,
            parameters: self.descriptor.query_parameters.clone(),
        };
        if let LoadStrategy::Incremental { since_value, .. } = strategy {
            spec.parameters.insert(
                self.options.watermark_parameter.clone(),
                since_value.to_parameter(),
            );
        }
        spec
    }
}
