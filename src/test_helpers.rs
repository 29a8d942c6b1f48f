//! In-memory fakes shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::loader::{LoadStrategy, LoadStrategyKind, StoreFactory, TableStore, TargetTable};
use crate::remote::{ExecutionState, PollResult, QueryService, RemoteQuerySpec};
use crate::rows::{RowSet, Scalar};

pub fn rowset(columns: &[&str], rows: Vec<Vec<Scalar>>) -> RowSet {
    RowSet::new(columns.iter().map(|c| c.to_string()).collect(), rows).unwrap()
}

// ── Scripted remote service ─────────────────────────────────────────────

/// One scripted poll response.
#[derive(Debug, Clone)]
pub enum Step {
    Pending,
    Complete(RowSet),
    Fail(String),
}

#[derive(Default)]
struct ServiceState {
    scripts: HashMap<i64, VecDeque<Step>>,
    rejected: HashMap<i64, String>,
    submitted: Vec<RemoteQuerySpec>,
    poll_latency: Duration,
}

/// A [`QueryService`] replaying scripted poll responses per query id.
/// The last step of a script repeats forever.
#[derive(Clone, Default)]
pub struct ScriptedService {
    state: Arc<Mutex<ServiceState>>,
    polls: Arc<AtomicUsize>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, query_id: i64, steps: Vec<Step>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(query_id, steps.into());
    }

    pub fn reject_submission(&self, query_id: i64, message: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected
            .insert(query_id, message.to_string());
    }

    pub fn set_poll_latency(&self, latency: Duration) {
        self.state.lock().unwrap().poll_latency = latency;
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn submitted(&self) -> Vec<RemoteQuerySpec> {
        self.state.lock().unwrap().submitted.clone()
    }
}

#[async_trait]
impl QueryService for ScriptedService {
    async fn submit(&self, spec: &RemoteQuerySpec) -> Result<String, SyncError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.rejected.get(&spec.query_id) {
            return Err(SyncError::Submission(message.clone()));
        }
        state.submitted.push(spec.clone());
        Ok(format!("exec-{}", spec.query_id))
    }

    async fn poll(&self, execution_id: &str) -> Result<PollResult, SyncError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let query_id: i64 = execution_id
            .trim_start_matches("exec-")
            .parse()
            .map_err(|_| SyncError::Submission(format!("unknown execution {execution_id}")))?;

        let (step, latency) = {
            let mut state = self.state.lock().unwrap();
            let latency = state.poll_latency;
            let script = state
                .scripts
                .get_mut(&query_id)
                .ok_or_else(|| SyncError::Submission(format!("no script for {query_id}")))?;
            let step = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            (step.unwrap_or(Step::Pending), latency)
        };

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        Ok(match step {
            Step::Pending => PollResult::Pending(ExecutionState::Executing),
            Step::Complete(rows) => PollResult::Completed(rows),
            Step::Fail(reason) => PollResult::Failed(reason),
        })
    }
}

// ── In-memory table store ───────────────────────────────────────────────

/// Observable state of one in-memory table.
#[derive(Debug, Default)]
pub struct MemoryTable {
    pub exists: bool,
    pub rows: Vec<Vec<Scalar>>,
    pub max_value: Option<Scalar>,
    pub loads: Vec<LoadStrategyKind>,
    pub fail_with: Option<SyncError>,
}

pub struct MemoryStore {
    target: TargetTable,
    table: Arc<Mutex<MemoryTable>>,
}

#[async_trait]
impl TableStore for MemoryStore {
    fn target(&self) -> &TargetTable {
        &self.target
    }

    async fn table_exists(&mut self) -> Result<bool, SyncError> {
        Ok(self.table.lock().unwrap().exists)
    }

    async fn current_max_value(&mut self, _column: &str) -> Result<Option<Scalar>, SyncError> {
        let table = self.table.lock().unwrap();
        Ok(if table.exists {
            table.max_value.clone()
        } else {
            None
        })
    }

    async fn load(&mut self, rows: &RowSet, strategy: &LoadStrategy) -> Result<u64, SyncError> {
        let mut table = self.table.lock().unwrap();
        if let Some(err) = table.fail_with.clone() {
            return Err(err);
        }
        table.loads.push(strategy.kind());
        if matches!(strategy, LoadStrategy::FullRefresh) {
            table.rows.clear();
        }
        table.exists = true;
        table.rows.extend(rows.rows().iter().cloned());
        Ok(rows.len() as u64)
    }
}

/// Hands out [`MemoryStore`]s sharing per-table state.
#[derive(Clone, Default)]
pub struct MemoryStores {
    tables: Arc<Mutex<HashMap<String, Arc<Mutex<MemoryTable>>>>>,
    opened: Arc<AtomicUsize>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Arc<Mutex<MemoryTable>> {
        self.tables
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn store(&self, schema: &str, name: &str) -> MemoryStore {
        MemoryStore {
            target: TargetTable::new(schema, name),
            table: self.table(name),
        }
    }
}

#[async_trait]
impl StoreFactory for MemoryStores {
    async fn open(&self, target: TargetTable) -> Result<Box<dyn TableStore>, SyncError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.store(&target.schema, &target.table)))
    }
}
