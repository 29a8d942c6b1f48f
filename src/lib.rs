//! pg_dunesync — sync Dune query results into PostgreSQL tables.
//!
//! A batch reads a list of table descriptors, and for each one runs a saved
//! remote query and writes its rows into a target table, either replacing
//! the table contents (full refresh) or upserting on unique keys through a
//! staging table (incremental). One table's failure never stops the others.
//!
//! Layers, leaf first:
//!
//! - [`remote`]: submit a query, poll it to completion under a deadline.
//! - [`loader`]: create, truncate, or upsert one target table transactionally.
//! - [`job`]: pick the strategy for one table, fetch, and load.
//! - [`orchestrator`]: run every job of a batch and collect a report.

pub mod config;
pub mod error;
pub mod hash;
pub mod infer;
pub mod job;
pub mod loader;
pub mod orchestrator;
pub mod remote;
pub mod rows;
pub mod source;
pub mod sql;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use config::{RunOverrides, Settings, SourceKind, TableFilter};
pub use error::{SyncError, SyncErrorKind, SyncJobError};
pub use job::{JobOptions, SyncJob, SyncJobDescriptor, SyncResult, SyncType};
pub use loader::{
    LoadStrategy, LoadStrategyKind, PgConnector, PgLoader, StoreFactory, TableStore, TargetTable,
    UniqueKeys,
};
pub use orchestrator::{BatchOptions, BatchReport, Orchestrator, TableReport};
pub use remote::{DuneClient, ExecutionHandle, QueryExecutor, QueryService, RemoteQuerySpec};
pub use rows::{RowSet, Scalar};
pub use source::{ControlTable, DescriptorSource, FileSource, NoLedger, RunLedger};
