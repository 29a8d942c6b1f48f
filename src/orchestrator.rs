//! Batch orchestration: run many independent table syncs and report on each.
//!
//! A failing job never aborts the batch. Its [`SyncJobError`] is recorded in
//! the [`BatchReport`] and the next descriptor runs. Only a failure to read
//! the descriptor list itself is fatal.
//!
//! Jobs run with bounded concurrency (default 1, strictly sequential). Each
//! job opens its own store connection; nothing mutable is shared between
//! jobs. Report entries keep descriptor order whatever the concurrency.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{RunOverrides, Settings, TableFilter};
use crate::error::{SyncError, SyncJobError};
use crate::job::{JobOptions, SyncJob, SyncJobDescriptor, SyncResult};
use crate::loader::{LoadStrategyKind, StoreFactory, TargetTable};
use crate::remote::QueryExecutor;
use crate::source::{DescriptorSource, NoLedger, RunLedger};

/// Batch-wide settings.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub target_schema: String,
    pub max_wait: Duration,
    pub watermark_parameter: String,
    pub concurrency: usize,
    pub batch_deadline: Option<Duration>,
}

impl BatchOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            target_schema: settings.target_schema.clone(),
            max_wait: settings.max_wait(),
            watermark_parameter: settings.watermark_parameter.clone(),
            concurrency: settings.concurrency,
            batch_deadline: settings.batch_deadline(),
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Outcome of one table in a batch.
#[derive(Debug)]
pub struct TableReport {
    pub table_name: String,
    pub outcome: Result<SyncResult, SyncJobError>,
    pub duration: Duration,
}

impl TableReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn rows_loaded(&self) -> u64 {
        self.outcome.as_ref().map_or(0, |r| r.rows_loaded)
    }

    pub fn strategy_used(&self) -> Option<LoadStrategyKind> {
        self.outcome.as_ref().ok().map(|r| r.strategy_used)
    }

    pub fn error(&self) -> Option<&SyncJobError> {
        self.outcome.as_ref().err()
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }
}

/// Per-table outcomes of one batch, in descriptor order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub entries: Vec<TableReport>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.succeeded()
    }

    pub fn total_rows(&self) -> u64 {
        self.entries.iter().map(TableReport::rows_loaded).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SyncJobError> {
        self.entries.iter().filter_map(TableReport::error)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    pub fn entry(&self, table_name: &str) -> Option<&TableReport> {
        self.entries.iter().find(|e| e.table_name == table_name)
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            match &entry.outcome {
                Ok(result) => writeln!(
                    f,
                    "{:<32} OK      {:<13} {:>10} rows {:>8} ms",
                    entry.table_name,
                    result.strategy_used.as_str(),
                    result.rows_loaded,
                    entry.duration_ms()
                )?,
                Err(err) => writeln!(
                    f,
                    "{:<32} FAILED  {:<13} {}",
                    entry.table_name,
                    err.kind().to_string(),
                    err.cause
                )?,
            }
        }
        write!(
            f,
            "{} tables: {} succeeded, {} failed, {} rows loaded",
            self.entries.len(),
            self.succeeded(),
            self.failed(),
            self.total_rows()
        )
    }
}

pub struct Orchestrator {
    executor: QueryExecutor,
    stores: Arc<dyn StoreFactory>,
    options: BatchOptions,
    overrides: RunOverrides,
    filter: TableFilter,
    ledger: Arc<dyn RunLedger>,
}

impl Orchestrator {
    pub fn new(executor: QueryExecutor, stores: Arc<dyn StoreFactory>, options: BatchOptions) -> Self {
        Self {
            executor,
            stores,
            options,
            overrides: RunOverrides::default(),
            filter: TableFilter::default(),
            ledger: Arc::new(NoLedger),
        }
    }

    pub fn with_overrides(mut self, overrides: RunOverrides) -> Result<Self, SyncError> {
        self.filter = overrides.filter()?;
        self.overrides = overrides;
        Ok(self)
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn RunLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Read descriptors from `source`, apply the table filter, run the batch.
    pub async fn run(&self, source: &dyn DescriptorSource) -> Result<BatchReport, SyncError> {
        let descriptors = source.descriptors().await?;
        let total = descriptors.len();
        let selected: Vec<SyncJobDescriptor> = descriptors
            .into_iter()
            .filter(|d| self.filter.matches(&d.table_name))
            .collect();
        if !self.filter.is_empty() {
            info!(
                selected = selected.len(),
                skipped = total - selected.len(),
                "applied table selection"
            );
        }
        Ok(self.run_batch(&selected).await)
    }

    /// Run every descriptor; per-job failures are recorded, never raised.
    pub async fn run_batch(&self, descriptors: &[SyncJobDescriptor]) -> BatchReport {
        let started = Instant::now();
        let job_options = JobOptions {
            max_wait: self.options.max_wait,
            watermark_parameter: self.options.watermark_parameter.clone(),
            force_full_refresh: self.overrides.full_refresh,
            incremental_value: self.overrides.incremental_value.clone(),
            batch_deadline: self.options.batch_deadline.map(|d| started + d),
        };
        let concurrency = self.options.concurrency.max(1);
        info!(jobs = descriptors.len(), concurrency, "batch starting");

        let entries: Vec<TableReport> = stream::iter(descriptors)
            .map(|descriptor| self.run_one(descriptor, &job_options))
            .buffered(concurrency)
            .collect()
            .await;

        let report = BatchReport { entries };
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            rows = report.total_rows(),
            duration_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );
        report
    }

    async fn run_one(&self, descriptor: &SyncJobDescriptor, options: &JobOptions) -> TableReport {
        let started = Instant::now();
        let table_name = descriptor.table_name.clone();

        if let Err(e) = self.ledger.job_started(descriptor).await {
            warn!(table = %table_name, error = %e, "could not record job start");
        }

        let target = TargetTable::new(self.options.target_schema.clone(), table_name.clone());
        let outcome = match self.stores.open(target).await {
            Ok(mut store) => {
                SyncJob::new(descriptor, &self.executor, options)
                    .run(store.as_mut())
                    .await
            }
            Err(cause) => {
                warn!(table = %table_name, error = %cause, "could not open store");
                Err(SyncJobError::new(table_name.clone(), cause))
            }
        };

        if let Err(e) = self.ledger.job_finished(descriptor, outcome.is_ok()).await {
            warn!(table = %table_name, error = %e, "could not record job end");
        }

        TableReport {
            table_name,
            outcome,
            duration: started.elapsed(),
        }
    }
}
