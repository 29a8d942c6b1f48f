//! Remote query execution: submit, poll, fetch.
//!
//! [`QueryService`] is the transport seam (one HTTP round-trip per call);
//! [`QueryExecutor`] owns the poll state machine on top of it:
//!
//! ```text
//! SUBMITTED ──poll──▶ PENDING ──▶ RUNNING ──▶ COMPLETED ─▶ RowSet
//!                        ▲    sleep  │            └──▶ FAILED ─▶ ExecutionFailed
//!                        └───────────┘   deadline ──▶ ExecutionTimeout
//! ```
//!
//! The deadline is measured from submission. Every poll is raced against it
//! and the sleep between polls is clipped to the time remaining, so a wait
//! never overshoots `max_wait` by more than one poll interval.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::rows::RowSet;

/// An immutable request to run one saved remote query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteQuerySpec {
    pub query_id: i64,
    pub parameters: BTreeMap<String, Value>,
}

impl RemoteQuerySpec {
    pub fn new(query_id: i64) -> Self {
        Self {
            query_id,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// One submitted execution. The deadline of its poll loop is anchored at
/// `created_at`.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    pub execution_id: String,
    pub created_at: Instant,
    pub submitted_at: DateTime<Utc>,
}

/// Execution state as reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Executing,
    Completed,
    /// Completed with truncated results.
    CompletedPartial,
    Failed,
    Cancelled,
    Expired,
    Other(String),
}

impl ExecutionState {
    pub fn from_api(state: &str) -> Self {
        match state {
            "QUERY_STATE_PENDING" => ExecutionState::Pending,
            "QUERY_STATE_EXECUTING" => ExecutionState::Executing,
            "QUERY_STATE_COMPLETED" => ExecutionState::Completed,
            "QUERY_STATE_COMPLETED_PARTIAL" => ExecutionState::CompletedPartial,
            "QUERY_STATE_FAILED" => ExecutionState::Failed,
            "QUERY_STATE_CANCELLED" => ExecutionState::Cancelled,
            "QUERY_STATE_EXPIRED" => ExecutionState::Expired,
            other => ExecutionState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ExecutionState::Pending => "QUERY_STATE_PENDING",
            ExecutionState::Executing => "QUERY_STATE_EXECUTING",
            ExecutionState::Completed => "QUERY_STATE_COMPLETED",
            ExecutionState::CompletedPartial => "QUERY_STATE_COMPLETED_PARTIAL",
            ExecutionState::Failed => "QUERY_STATE_FAILED",
            ExecutionState::Cancelled => "QUERY_STATE_CANCELLED",
            ExecutionState::Expired => "QUERY_STATE_EXPIRED",
            ExecutionState::Other(s) => s,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::CompletedPartial
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ExecutionState::Failed | ExecutionState::Cancelled | ExecutionState::Expired
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_completed() || self.is_failed()
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single status poll.
#[derive(Debug, Clone)]
pub enum PollResult {
    Pending(ExecutionState),
    Completed(RowSet),
    Failed(String),
}

/// Transport to a remote query service.
#[async_trait]
pub trait QueryService: Send + Sync {
    /// Submit an execution and return its identifier.
    async fn submit(&self, spec: &RemoteQuerySpec) -> Result<String, SyncError>;

    /// Fetch the current status (and rows, once completed) of an execution.
    async fn poll(&self, execution_id: &str) -> Result<PollResult, SyncError>;
}

// ── Poll state machine ──────────────────────────────────────────────────

/// Drives one execution from submission to a row set or a typed failure.
#[derive(Clone)]
pub struct QueryExecutor {
    service: Arc<dyn QueryService>,
    poll_interval: Duration,
}

impl QueryExecutor {
    pub fn new(service: Arc<dyn QueryService>, poll_interval: Duration) -> Self {
        Self {
            service,
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn submit(&self, spec: &RemoteQuerySpec) -> Result<ExecutionHandle, SyncError> {
        let created_at = Instant::now();
        let execution_id = self.service.submit(spec).await?;
        info!(
            query_id = spec.query_id,
            execution_id = %execution_id,
            "submitted remote query"
        );
        Ok(ExecutionHandle {
            execution_id,
            created_at,
            submitted_at: Utc::now(),
        })
    }

    /// Poll until the execution completes, fails, or `max_wait` has elapsed
    /// since submission.
    pub async fn await_result(
        &self,
        handle: &ExecutionHandle,
        max_wait: Duration,
    ) -> Result<RowSet, SyncError> {
        self.await_until(handle, handle.created_at + max_wait).await
    }

    /// Poll until the execution completes, fails, or `deadline` passes.
    pub async fn await_until(
        &self,
        handle: &ExecutionHandle,
        deadline: Instant,
    ) -> Result<RowSet, SyncError> {
        let id = handle.execution_id.as_str();
        let mut polls = 0u32;
        loop {
            if Instant::now() >= deadline {
                return Err(timed_out(handle));
            }

            polls += 1;
            let polled = match timeout_at(deadline, self.service.poll(id)).await {
                Ok(result) => result?,
                Err(_) => return Err(timed_out(handle)),
            };

            match polled {
                PollResult::Completed(rows) => {
                    info!(
                        execution_id = id,
                        rows = rows.len(),
                        polls,
                        "remote execution completed"
                    );
                    return Ok(rows);
                }
                PollResult::Failed(reason) => {
                    warn!(execution_id = id, reason = %reason, "remote execution failed");
                    return Err(SyncError::ExecutionFailed {
                        execution_id: id.to_string(),
                        reason,
                    });
                }
                PollResult::Pending(state) => {
                    debug!(execution_id = id, state = %state, polls, "execution not finished");
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out(handle));
            }
            sleep(self.poll_interval.min(remaining)).await;
        }
    }

    /// Submit and wait. The effective deadline is the earlier of
    /// `submission + max_wait` and `batch_deadline`.
    pub async fn run(
        &self,
        spec: &RemoteQuerySpec,
        max_wait: Duration,
        batch_deadline: Option<Instant>,
    ) -> Result<RowSet, SyncError> {
        let handle = self.submit(spec).await?;
        let job_deadline = handle.created_at + max_wait;
        let deadline = batch_deadline.map_or(job_deadline, |b| b.min(job_deadline));
        self.await_until(&handle, deadline).await
    }
}

fn timed_out(handle: &ExecutionHandle) -> SyncError {
    SyncError::ExecutionTimeout {
        execution_id: handle.execution_id.clone(),
        waited: handle.created_at.elapsed(),
    }
}

// ── Dune HTTP client ────────────────────────────────────────────────────

pub const DEFAULT_API_BASE_URL: &str = "https://api.dune.com/api/v1";
const API_KEY_HEADER: &str = "X-Dune-API-Key";

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    execution_id: String,
}

#[derive(Debug, Deserialize)]
struct ResultsResponse {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    result: Option<ResultPayload>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ResultPayload {
    #[serde(default)]
    rows: Vec<Map<String, Value>>,
    #[serde(default)]
    metadata: Option<ResultMetadata>,
}

#[derive(Debug, Deserialize)]
struct ResultMetadata {
    #[serde(default)]
    column_names: Vec<String>,
}

/// [`QueryService`] over the Dune HTTP API.
pub struct DuneClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl DuneClient {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| SyncError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<String, SyncError> {
        let response = request
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| SyncError::submission(context, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::submission(context, e))?;
        if !status.is_success() {
            return Err(SyncError::Submission(format!(
                "{context}: HTTP {status}: {}",
                error_reason(&serde_json::from_str(&body).unwrap_or(Value::String(body.clone())))
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl QueryService for DuneClient {
    async fn submit(&self, spec: &RemoteQuerySpec) -> Result<String, SyncError> {
        let context = format!("POST /query/{}/execute", spec.query_id);
        let body = if spec.parameters.is_empty() {
            json!({})
        } else {
            json!({ "query_parameters": spec.parameters })
        };
        let url = format!("{}/query/{}/execute", self.base_url, spec.query_id);
        let text = self.send(self.http.post(url).json(&body), &context).await?;
        let parsed: ExecuteResponse = serde_json::from_str(&text)
            .map_err(|e| SyncError::submission(&format!("{context}: malformed response"), e))?;
        Ok(parsed.execution_id)
    }

    async fn poll(&self, execution_id: &str) -> Result<PollResult, SyncError> {
        let context = format!("GET /execution/{execution_id}/results");
        let url = format!("{}/execution/{execution_id}/results", self.base_url);
        let text = self.send(self.http.get(url), &context).await?;
        let parsed: ResultsResponse = serde_json::from_str(&text)
            .map_err(|e| SyncError::submission(&format!("{context}: malformed response"), e))?;
        interpret_results(parsed, &context)
    }
}

fn interpret_results(parsed: ResultsResponse, context: &str) -> Result<PollResult, SyncError> {
    let Some(raw_state) = parsed.state else {
        return Err(SyncError::Submission(format!(
            "{context}: response has no state"
        )));
    };
    let state = ExecutionState::from_api(&raw_state);

    if state.is_completed() {
        if state == ExecutionState::CompletedPartial {
            warn!(state = %state, "remote result was truncated");
        }
        let payload = parsed.result.ok_or_else(|| {
            SyncError::Submission(format!("{context}: completed execution has no result"))
        })?;
        let columns = payload
            .metadata
            .map(|m| m.column_names)
            .unwrap_or_default();
        return Ok(PollResult::Completed(RowSet::from_json_records(
            &payload.rows,
            &columns,
        )));
    }

    if state.is_failed() {
        let reason = parsed
            .error
            .as_ref()
            .map(error_reason)
            .unwrap_or_else(|| state.to_string());
        return Ok(PollResult::Failed(reason));
    }

    Ok(PollResult::Pending(state))
}

/// The `error` field is either a string or an object with a `message`.
fn error_reason(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => match obj.get("message") {
            Some(Value::String(m)) => m.clone(),
            _ => error.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::Scalar;
    use crate::test_helpers::{ScriptedService, Step, rowset};

    fn executor(service: ScriptedService, interval_secs: u64) -> QueryExecutor {
        QueryExecutor::new(Arc::new(service), Duration::from_secs(interval_secs))
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!(
            ExecutionState::from_api("QUERY_STATE_COMPLETED"),
            ExecutionState::Completed
        );
        assert!(ExecutionState::from_api("QUERY_STATE_FAILED").is_failed());
        assert!(ExecutionState::from_api("QUERY_STATE_EXPIRED").is_terminal());
        assert!(!ExecutionState::from_api("QUERY_STATE_PENDING").is_terminal());
        let other = ExecutionState::from_api("QUERY_STATE_SOMETHING_NEW");
        assert!(!other.is_terminal());
        assert_eq!(other.to_string(), "QUERY_STATE_SOMETHING_NEW");
    }

    #[test]
    fn test_error_reason_shapes() {
        assert_eq!(error_reason(&json!("boom")), "boom");
        assert_eq!(
            error_reason(&json!({"type": "FAILED", "message": "syntax error"})),
            "syntax error"
        );
        assert_eq!(error_reason(&json!({"code": 7})), "{\"code\":7}");
    }

    #[test]
    fn test_interpret_completed_results() {
        let parsed: ResultsResponse = serde_json::from_value(json!({
            "state": "QUERY_STATE_COMPLETED",
            "result": {
                "rows": [{"id": 1, "price": 2.5}],
                "metadata": {"column_names": ["price", "id"]}
            }
        }))
        .unwrap();
        let PollResult::Completed(rows) = interpret_results(parsed, "ctx").unwrap() else {
            panic!("expected completed");
        };
        assert_eq!(rows.columns(), &["price", "id"]);
        assert_eq!(rows.rows()[0], vec![Scalar::Float(2.5), Scalar::Int(1)]);
    }

    #[test]
    fn test_interpret_missing_state_is_submission_error() {
        let parsed: ResultsResponse = serde_json::from_value(json!({"foo": 1})).unwrap();
        let err = interpret_results(parsed, "ctx").unwrap_err();
        assert!(matches!(err, SyncError::Submission(_)));
    }

    #[test]
    fn test_interpret_failed_without_error_uses_state() {
        let parsed: ResultsResponse =
            serde_json::from_value(json!({"state": "QUERY_STATE_CANCELLED"})).unwrap();
        let PollResult::Failed(reason) = interpret_results(parsed, "ctx").unwrap() else {
            panic!("expected failed");
        };
        assert_eq!(reason, "QUERY_STATE_CANCELLED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_completes_after_pending_polls() {
        let service = ScriptedService::new();
        service.script(
            7,
            vec![
                Step::Pending,
                Step::Pending,
                Step::Complete(rowset(&["id"], vec![vec![Scalar::Int(1)]])),
            ],
        );
        let exec = executor(service.clone(), 5);
        let started = Instant::now();
        let rows = exec
            .run(&RemoteQuerySpec::new(7), Duration::from_secs(300), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(service.poll_count(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bound_never_terminal() {
        let service = ScriptedService::new();
        service.script(1, vec![Step::Pending]);
        let exec = executor(service, 7);
        let max_wait = Duration::from_secs(30);
        let started = Instant::now();

        let err = exec
            .run(&RemoteQuerySpec::new(1), max_wait, None)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() <= max_wait + exec.poll_interval());
        let SyncError::ExecutionTimeout { waited, .. } = err else {
            unreachable!()
        };
        assert!(waited >= max_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_poll_is_cut_at_deadline() {
        let service = ScriptedService::new();
        service.script(1, vec![Step::Pending]);
        service.set_poll_latency(Duration::from_secs(1_000));
        let exec = executor(service, 5);
        let started = Instant::now();
        let err = exec
            .run(&RemoteQuerySpec::new(1), Duration::from_secs(60), None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_deadline_caps_wait() {
        let service = ScriptedService::new();
        service.script(1, vec![Step::Pending]);
        let exec = executor(service, 5);
        let started = Instant::now();
        let batch_deadline = started + Duration::from_secs(12);
        let err = exec
            .run(
                &RemoteQuerySpec::new(1),
                Duration::from_secs(300),
                Some(batch_deadline),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(started.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_failure_is_not_retried() {
        let service = ScriptedService::new();
        service.script(
            3,
            vec![
                Step::Pending,
                Step::Fail("division by zero".into()),
                Step::Complete(rowset(&["id"], vec![])),
            ],
        );
        let exec = executor(service.clone(), 5);
        let err = exec
            .run(&RemoteQuerySpec::new(3), Duration::from_secs(300), None)
            .await
            .unwrap_err();
        match err {
            SyncError::ExecutionFailed { reason, .. } => assert_eq!(reason, "division by zero"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(service.poll_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_error_surfaces() {
        let service = ScriptedService::new();
        service.reject_submission(9, "HTTP 401 Unauthorized");
        let exec = executor(service.clone(), 5);
        let err = exec
            .run(&RemoteQuerySpec::new(9), Duration::from_secs(300), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Submission(_)));
        assert_eq!(service.poll_count(), 0);
    }

    #[test]
    fn test_spec_builder() {
        let spec = RemoteQuerySpec::new(42).with_parameter("date", json!("2024-01-01"));
        assert_eq!(spec.query_id, 42);
        assert_eq!(spec.parameters["date"], json!("2024-01-01"));
    }
}
