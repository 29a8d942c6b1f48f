//! Load strategy engine: persists a [`RowSet`] into one target table.
//!
//! Two write paths, selected by [`LoadStrategy`]:
//!
//! - **FULL_REFRESH**: create the table from inferred column types if it is
//!   missing, otherwise `TRUNCATE` it, then bulk insert.
//! - **INCREMENTAL**: stage the rows in a per-run `UNLOGGED` table, then
//!   merge them into the target with one `INSERT … ON CONFLICT (keys) DO
//!   UPDATE`. A missing target table degrades to the full-load path.
//!
//! Every multi-statement operation runs in a single transaction that first
//! takes a transaction-scoped advisory lock on `(schema, table)`. A second
//! concurrent run against the same table fails fast instead of
//! interleaving. Success commits once; any error rolls back explicitly
//! before it is returned, so the target is never left half-truncated or
//! half-merged.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, GenericClient, NoTls, Transaction};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::hash::advisory_lock_key;
use crate::infer::{ColumnDef, infer_columns, infer_kind};
use crate::rows::{RowSet, Scalar};
use crate::sql;

/// A destination table, `(schema, table)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetTable {
    pub schema: String,
    pub table: String,
}

impl TargetTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Quoted `"schema"."table"`.
    pub fn qualified(&self) -> String {
        sql::qualified(&self.schema, &self.table)
    }
}

impl fmt::Display for TargetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// A non-empty, ordered set of key columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKeys(Vec<String>);

impl UniqueKeys {
    /// `None` when `keys` is empty. Duplicates are dropped, first occurrence wins.
    pub fn new(keys: Vec<String>) -> Option<Self> {
        let mut seen = HashSet::new();
        let deduped: Vec<String> = keys
            .into_iter()
            .filter(|k| seen.insert(k.clone()))
            .collect();
        if deduped.is_empty() {
            None
        } else {
            Some(Self(deduped))
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// How a row set is written. `Incremental` cannot exist without keys or a
/// resolved watermark.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadStrategy {
    FullRefresh,
    Incremental {
        keys: UniqueKeys,
        column: String,
        since_value: Scalar,
    },
}

impl LoadStrategy {
    pub fn kind(&self) -> LoadStrategyKind {
        match self {
            LoadStrategy::FullRefresh => LoadStrategyKind::FullRefresh,
            LoadStrategy::Incremental { .. } => LoadStrategyKind::Incremental,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategyKind {
    FullRefresh,
    Incremental,
}

impl LoadStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategyKind::FullRefresh => "FULL_REFRESH",
            LoadStrategyKind::Incremental => "INCREMENTAL",
        }
    }
}

impl fmt::Display for LoadStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The store operations a sync job needs for one target table.
#[async_trait]
pub trait TableStore: Send {
    fn target(&self) -> &TargetTable;

    async fn table_exists(&mut self) -> Result<bool, SyncError>;

    /// `MAX(column)`; `None` when the table is missing or has no non-null value.
    async fn current_max_value(&mut self, column: &str) -> Result<Option<Scalar>, SyncError>;

    /// Write `rows` with `strategy`; returns the number of rows written.
    async fn load(&mut self, rows: &RowSet, strategy: &LoadStrategy) -> Result<u64, SyncError>;
}

/// Opens one store (and connection) per sync job.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open(&self, target: TargetTable) -> Result<Box<dyn TableStore>, SyncError>;
}

// ── PostgreSQL implementation ───────────────────────────────────────────

/// [`TableStore`] over a dedicated `tokio_postgres` connection.
pub struct PgLoader {
    client: Client,
    target: TargetTable,
}

impl PgLoader {
    pub fn new(client: Client, target: TargetTable) -> Self {
        Self { client, target }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// `CREATE SCHEMA IF NOT EXISTS`; safe to call repeatedly.
    pub async fn ensure_schema(&mut self) -> Result<(), SyncError> {
        self.client
            .batch_execute(&sql::create_schema_sql(&self.target.schema))
            .await
            .map_err(|e| SyncError::load(&format!("create schema {}", self.target.schema), e))
    }

    pub async fn table_exists(&mut self) -> Result<bool, SyncError> {
        table_exists(&self.client, &self.target).await
    }

    /// Replace the table contents with `rows`, creating the table if needed.
    pub async fn load_full_refresh(&mut self, rows: &RowSet) -> Result<u64, SyncError> {
        let Self { client, target } = self;
        let tx = begin(client, target).await?;
        let result = full_refresh_in(&tx, target, rows).await;
        let loaded = finish(tx, result).await?;
        info!(table = %target, rows = loaded, strategy = "FULL_REFRESH", "load committed");
        Ok(loaded)
    }

    /// Upsert `rows` on `keys` through a staging table.
    ///
    /// Empty `keys` downgrades to [`PgLoader::load_full_refresh`]. `column`
    /// and `since` only describe the watermark the rows were fetched with.
    pub async fn load_incremental(
        &mut self,
        rows: &RowSet,
        keys: &[String],
        column: &str,
        since: Option<&Scalar>,
    ) -> Result<u64, SyncError> {
        let Some(keys) = UniqueKeys::new(keys.to_vec()) else {
            warn!(
                table = %self.target,
                "no unique keys for incremental load, falling back to full refresh"
            );
            return self.load_full_refresh(rows).await;
        };
        debug!(
            table = %self.target,
            column,
            since = %since.map(|s| s.to_string()).unwrap_or_default(),
            "incremental load"
        );

        let staging = sql::staging_name(&self.target.table, Uuid::new_v4());
        let Self { client, target } = self;
        let tx = begin(client, target).await?;
        let result = incremental_in(&tx, target, rows, &keys, &staging).await;
        let outcome = finish(tx, result).await;

        if outcome.is_err() {
            // Rollback already discards a staging table created in the
            // transaction; this covers one left by a failed commit.
            let drop_sql = sql::drop_table_if_exists_sql(&target.schema, &staging);
            if let Err(e) = client.batch_execute(&drop_sql).await {
                warn!(table = %target, staging = %staging, error = %e, "staging cleanup failed");
            }
        }

        let loaded = outcome?;
        info!(table = %target, rows = loaded, strategy = "INCREMENTAL", "load committed");
        Ok(loaded)
    }

    /// Maximum value of `column`, decoded from its text form according to
    /// the column type.
    pub async fn current_max_value(&mut self, column: &str) -> Result<Option<Scalar>, SyncError> {
        if !table_exists(&self.client, &self.target).await? {
            return Ok(None);
        }
        let query = sql::max_value_sql(&self.target.schema, &self.target.table, column);
        let row = self
            .client
            .query_one(&query, &[])
            .await
            .map_err(|e| SyncError::load(&format!("max({column}) on {}", self.target), e))?;
        let text: Option<String> = row.get(0);
        let pg_type: Option<String> = row.get(1);
        Ok(text.map(|t| Scalar::from_store(&t, pg_type.as_deref().unwrap_or_default())))
    }

    /// Row count of the target; 0 when the table does not exist.
    pub async fn record_count(&mut self) -> Result<i64, SyncError> {
        if !table_exists(&self.client, &self.target).await? {
            return Ok(0);
        }
        let query = sql::count_sql(&self.target.schema, &self.target.table);
        let row = self
            .client
            .query_one(&query, &[])
            .await
            .map_err(|e| SyncError::load(&format!("count {}", self.target), e))?;
        Ok(row.get(0))
    }

    /// `DELETE FROM target WHERE <condition>` with `$n` bound to `params`.
    pub async fn delete_where(
        &mut self,
        condition: &str,
        params: &[Scalar],
    ) -> Result<u64, SyncError> {
        let Self { client, target } = self;
        let tx = begin(client, target).await?;
        let query = sql::delete_where_sql(&target.schema, &target.table, condition);
        let bound: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        let result = tx
            .execute(&query, &bound)
            .await
            .map_err(|e| SyncError::load(&format!("delete from {target}"), e));
        let deleted = finish(tx, result).await?;
        info!(table = %target, rows = deleted, "deleted rows");
        Ok(deleted)
    }
}

#[async_trait]
impl TableStore for PgLoader {
    fn target(&self) -> &TargetTable {
        &self.target
    }

    async fn table_exists(&mut self) -> Result<bool, SyncError> {
        PgLoader::table_exists(self).await
    }

    async fn current_max_value(&mut self, column: &str) -> Result<Option<Scalar>, SyncError> {
        PgLoader::current_max_value(self, column).await
    }

    async fn load(&mut self, rows: &RowSet, strategy: &LoadStrategy) -> Result<u64, SyncError> {
        match strategy {
            LoadStrategy::FullRefresh => self.load_full_refresh(rows).await,
            LoadStrategy::Incremental {
                keys,
                column,
                since_value,
            } => {
                self.load_incremental(rows, keys.as_slice(), column, Some(since_value))
                    .await
            }
        }
    }
}

/// Connects a fresh `tokio_postgres` session per job.
pub struct PgConnector {
    database_url: String,
}

impl PgConnector {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    pub async fn connect(&self) -> Result<Client, SyncError> {
        let (client, connection) = tokio_postgres::connect(&self.database_url, NoTls)
            .await
            .map_err(|e| SyncError::load("connect", e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection closed with error");
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl StoreFactory for PgConnector {
    async fn open(&self, target: TargetTable) -> Result<Box<dyn TableStore>, SyncError> {
        let client = self.connect().await?;
        Ok(Box::new(PgLoader::new(client, target)))
    }
}

// ── Transaction plumbing ────────────────────────────────────────────────

async fn begin<'a>(
    client: &'a mut Client,
    target: &TargetTable,
) -> Result<Transaction<'a>, SyncError> {
    let tx = client
        .transaction()
        .await
        .map_err(|e| SyncError::load("begin transaction", e))?;

    let key = advisory_lock_key(&target.schema, &target.table);
    let acquired: bool = match tx
        .query_one("SELECT pg_try_advisory_xact_lock($1)", &[&key])
        .await
    {
        Ok(row) => row.get(0),
        Err(e) => return finish(tx, Err(SyncError::load("advisory lock", e))).await,
    };
    if !acquired {
        return finish(
            tx,
            Err(SyncError::Load(format!("sync already in progress for {target}"))),
        )
        .await;
    }
    Ok(tx)
}

/// Commit on success, roll back on error. The original error wins over a
/// rollback failure.
async fn finish<T>(tx: Transaction<'_>, result: Result<T, SyncError>) -> Result<T, SyncError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| SyncError::load("commit", e))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "rollback failed");
            }
            Err(err)
        }
    }
}

// ── Write paths (run inside a transaction) ──────────────────────────────

async fn table_exists(
    client: &impl GenericClient,
    target: &TargetTable,
) -> Result<bool, SyncError> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema::text = $1 AND table_name::text = $2)",
            &[&target.schema, &target.table],
        )
        .await
        .map_err(|e| SyncError::load(&format!("table check {target}"), e))?;
    Ok(row.get(0))
}

async fn existing_columns(
    tx: &Transaction<'_>,
    target: &TargetTable,
) -> Result<HashSet<String>, SyncError> {
    let rows = tx
        .query(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema::text = $1 AND table_name::text = $2",
            &[&target.schema, &target.table],
        )
        .await
        .map_err(|e| SyncError::load(&format!("column list {target}"), e))?;
    Ok(rows.iter().map(|r| r.get::<_, String>(0)).collect())
}

async fn create_table(
    tx: &Transaction<'_>,
    target: &TargetTable,
    rows: &RowSet,
) -> Result<Vec<ColumnDef>, SyncError> {
    let columns = infer_columns(rows);
    tx.batch_execute(&sql::create_table_sql(&target.schema, &target.table, &columns))
        .await
        .map_err(|e| SyncError::load(&format!("create table {target}"), e))?;
    info!(
        table = %target,
        columns = columns.len(),
        "created table from inferred column types"
    );
    Ok(columns)
}

/// Add row-set columns the target lacks. Existing columns are never altered.
async fn add_missing_columns(
    tx: &Transaction<'_>,
    target: &TargetTable,
    rows: &RowSet,
) -> Result<(), SyncError> {
    let existing = existing_columns(tx, target).await?;
    for (idx, name) in rows.columns().iter().enumerate() {
        if existing.contains(name) {
            continue;
        }
        let column = ColumnDef::new(name.clone(), infer_kind(rows.column_values(idx)));
        tx.batch_execute(&sql::add_column_sql(&target.schema, &target.table, &column))
            .await
            .map_err(|e| SyncError::load(&format!("add column {name} to {target}"), e))?;
        info!(table = %target, column = %name, kind = column.kind.sql_type(), "added column");
    }
    Ok(())
}

/// Create the upsert index for `keys`, dropping indexes this engine built
/// for an earlier key set of the same table.
async fn ensure_unique_index(
    tx: &Transaction<'_>,
    target: &TargetTable,
    keys: &UniqueKeys,
) -> Result<(), SyncError> {
    let wanted = sql::unique_index_name(&target.table, keys.as_slice());
    let prefix = sql::unique_index_prefix(&target.table);
    let existing = tx
        .query(
            "SELECT indexname::text FROM pg_indexes \
             WHERE schemaname::text = $1 AND tablename::text = $2",
            &[&target.schema, &target.table],
        )
        .await
        .map_err(|e| SyncError::load(&format!("index list {target}"), e))?;

    for stale in existing
        .iter()
        .filter_map(|r| r.try_get::<_, String>(0).ok())
        .filter(|name| name.starts_with(&prefix) && *name != wanted)
    {
        tx.batch_execute(&sql::drop_index_sql(&target.schema, &stale))
            .await
            .map_err(|e| SyncError::load(&format!("drop index {stale}"), e))?;
        info!(table = %target, index = %stale, "dropped unique index of previous key set");
    }

    tx.batch_execute(&sql::unique_index_sql(
        &target.schema,
        &target.table,
        keys.as_slice(),
    ))
    .await
    .map_err(|e| SyncError::load(&format!("unique index on {target}"), e))
}

/// Chunked multi-row INSERT. With `ordinal`, each row also gets its
/// position in `rows` in the ordinal column.
async fn insert_rows(
    tx: &Transaction<'_>,
    table_sql: &str,
    rows: &RowSet,
    ordinal: bool,
) -> Result<u64, SyncError> {
    if rows.is_empty() {
        return Ok(0);
    }
    if rows.columns().is_empty() {
        return Err(SyncError::Configuration(
            "result set has rows but no columns".into(),
        ));
    }

    let mut columns = rows.columns().to_vec();
    if ordinal {
        columns.push(sql::ORDINAL_COLUMN.to_string());
    }
    let chunk_size = sql::rows_per_chunk(columns.len());

    let mut inserted = 0u64;
    for (chunk_idx, chunk) in rows.rows().chunks(chunk_size).enumerate() {
        let first = chunk_idx * chunk_size;
        let ordinals: Vec<Scalar> = if ordinal {
            (0..chunk.len())
                .map(|i| Scalar::Int((first + i) as i64))
                .collect()
        } else {
            Vec::new()
        };

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(chunk.len() * columns.len());
        for (i, row) in chunk.iter().enumerate() {
            params.extend(row.iter().map(|v| v as &(dyn ToSql + Sync)));
            if ordinal {
                params.push(&ordinals[i]);
            }
        }

        let stmt = sql::insert_values_sql(table_sql, &columns, chunk.len());
        inserted += tx
            .execute(&stmt, &params)
            .await
            .map_err(|e| SyncError::load(&format!("insert into {table_sql}"), e))?;
    }
    Ok(inserted)
}

async fn full_refresh_in(
    tx: &Transaction<'_>,
    target: &TargetTable,
    rows: &RowSet,
) -> Result<u64, SyncError> {
    tx.batch_execute(&sql::create_schema_sql(&target.schema))
        .await
        .map_err(|e| SyncError::load(&format!("create schema {}", target.schema), e))?;

    if table_exists(tx, target).await? {
        add_missing_columns(tx, target, rows).await?;
        tx.batch_execute(&sql::truncate_sql(&target.schema, &target.table))
            .await
            .map_err(|e| SyncError::load(&format!("truncate {target}"), e))?;
    } else {
        create_table(tx, target, rows).await?;
    }

    insert_rows(tx, &target.qualified(), rows, false).await
}

/// Drop records with a NULL in any key column. They can never conflict with
/// an existing row, so upserting them would insert a new copy on every run.
fn without_null_keys<'r>(
    rows: &'r RowSet,
    keys: &UniqueKeys,
) -> Result<Cow<'r, RowSet>, SyncError> {
    let key_idx: Vec<usize> = keys
        .as_slice()
        .iter()
        .filter_map(|k| rows.column_index(k))
        .collect();
    let has_null_key = |row: &[Scalar]| key_idx.iter().any(|&i| row[i].is_null());

    let skipped = rows.rows().iter().filter(|r| has_null_key(r)).count();
    if skipped == 0 {
        return Ok(Cow::Borrowed(rows));
    }
    warn!(
        skipped,
        keys = ?keys.as_slice(),
        "skipping records with NULL unique key values"
    );
    let kept = rows
        .rows()
        .iter()
        .filter(|r| !has_null_key(r))
        .cloned()
        .collect();
    Ok(Cow::Owned(RowSet::new(rows.columns().to_vec(), kept)?))
}

async fn incremental_in(
    tx: &Transaction<'_>,
    target: &TargetTable,
    rows: &RowSet,
    keys: &UniqueKeys,
    staging: &str,
) -> Result<u64, SyncError> {
    tx.batch_execute(&sql::create_schema_sql(&target.schema))
        .await
        .map_err(|e| SyncError::load(&format!("create schema {}", target.schema), e))?;

    let has_all_keys = keys
        .as_slice()
        .iter()
        .all(|k| rows.column_index(k).is_some());

    if table_exists(tx, target).await? {
        add_missing_columns(tx, target, rows).await?;
    } else {
        info!(table = %target, "target table missing, creating it");
        create_table(tx, target, rows).await?;
        if !has_all_keys {
            return insert_rows(tx, &target.qualified(), rows, false).await;
        }
    }

    if rows.is_empty() {
        return Ok(0);
    }
    if !has_all_keys {
        return Err(SyncError::Configuration(format!(
            "unique keys {:?} not all present in result columns {:?}",
            keys.as_slice(),
            rows.columns()
        )));
    }
    let keyed = without_null_keys(rows, keys)?;
    let rows: &RowSet = &keyed;
    if rows.is_empty() {
        return Ok(0);
    }
    ensure_unique_index(tx, target, keys).await?;

    tx.batch_execute(&sql::create_staging_sql(
        &target.schema,
        staging,
        &target.table,
    ))
    .await
    .map_err(|e| SyncError::load(&format!("create staging table {staging}"), e))?;

    let staged = insert_rows(tx, &sql::qualified(&target.schema, staging), rows, true).await?;
    debug!(table = %target, staging, rows = staged, "staged rows");

    let upsert = sql::upsert_from_staging_sql(
        &target.schema,
        &target.table,
        staging,
        rows.columns(),
        keys.as_slice(),
    );
    let merged = tx
        .execute(&upsert, &[])
        .await
        .map_err(|e| SyncError::load(&format!("upsert into {target}"), e))?;

    tx.batch_execute(&sql::drop_table_if_exists_sql(&target.schema, staging))
        .await
        .map_err(|e| SyncError::load(&format!("drop staging table {staging}"), e))?;

    Ok(merged)
}
