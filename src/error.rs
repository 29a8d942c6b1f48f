//! Error types for pg_dunesync.
//!
//! Every fallible operation in the sync core returns `Result<T, SyncError>`.
//! At the sync-job boundary the error is wrapped in a [`SyncJobError`] that
//! names the table, which is the only error the orchestrator catches per job.
//!
//! # Error Classification
//!
//! Errors fall into three categories, used for log fields and the batch
//! report. None of them are retried by the core:
//! - **Remote** — submission/transport failures, poll timeouts, and terminal
//!   failures reported by the remote query service.
//! - **Load** — DDL, insert, or upsert failures in the warehouse. The load
//!   transaction is always rolled back before the error surfaces.
//! - **Config** — invalid settings or descriptors (unknown sync type, unique
//!   keys missing from the result set, unreadable descriptor file).

use std::error::Error;
use std::fmt::{self, Write};
use std::time::Duration;

/// Primary error type for the sync core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    // ── Remote errors ────────────────────────────────────────────────────
    /// The remote service could not be reached, rejected the request, or
    /// answered with something that is not a valid response body.
    #[error("submission error: {0}")]
    Submission(String),

    /// Completion was not observed before the deadline.
    #[error("execution {execution_id} timed out after {}s", .waited.as_secs())]
    ExecutionTimeout {
        execution_id: String,
        waited: Duration,
    },

    /// The remote service reported a terminal failure state.
    #[error("execution {execution_id} failed: {reason}")]
    ExecutionFailed {
        execution_id: String,
        reason: String,
    },

    // ── Load errors ──────────────────────────────────────────────────────
    /// Schema/table DDL, insert, upsert, or transaction control failed.
    #[error("load error: {0}")]
    Load(String),

    // ── Configuration errors ─────────────────────────────────────────────
    /// Invalid settings, descriptors, or descriptor source.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Classification of an error for logging and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    Remote,
    Load,
    Config,
}

impl fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncErrorKind::Remote => write!(f, "REMOTE"),
            SyncErrorKind::Load => write!(f, "LOAD"),
            SyncErrorKind::Config => write!(f, "CONFIG"),
        }
    }
}

impl SyncError {
    /// Classify the error for logging and the batch report.
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::Submission(_)
            | SyncError::ExecutionTimeout { .. }
            | SyncError::ExecutionFailed { .. } => SyncErrorKind::Remote,

            SyncError::Load(_) => SyncErrorKind::Load,

            SyncError::Configuration(_) => SyncErrorKind::Config,
        }
    }

    /// Whether the error is a deadline expiry (per-job wait or batch deadline).
    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::ExecutionTimeout { .. })
    }

    /// Build a [`SyncError::Load`] from a store error and a short context.
    pub(crate) fn load(context: &str, err: impl Error + 'static) -> Self {
        SyncError::Load(format!("{context}: {}", describe(&err)))
    }

    /// Build a [`SyncError::Submission`] from a transport error and a short context.
    pub(crate) fn submission(context: &str, err: impl Error + 'static) -> Self {
        SyncError::Submission(format!("{context}: {}", describe(&err)))
    }
}

/// Render an error with its causes.
///
/// A server-side PostgreSQL error shows its message, SQLSTATE, detail and
/// hint; the driver's own `Display` for it is only "db error". Any other
/// error is followed by each distinct message of its `source()` chain.
pub(crate) fn describe(err: &(dyn Error + 'static)) -> String {
    if let Some(db) = err
        .downcast_ref::<tokio_postgres::Error>()
        .and_then(tokio_postgres::Error::as_db_error)
    {
        let mut out = format!("{} (SQLSTATE {})", db.message(), db.code().code());
        if let Some(detail) = db.detail() {
            let _ = write!(out, "; detail: {detail}");
        }
        if let Some(hint) = db.hint() {
            let _ = write!(out, "; hint: {hint}");
        }
        return out;
    }

    let mut out = err.to_string();
    let mut cause = err.source();
    while let Some(inner) = cause {
        let text = inner.to_string();
        if !out.contains(&text) {
            let _ = write!(out, ": {text}");
        }
        cause = inner.source();
    }
    out
}

/// A failed sync job: the table it was syncing and the underlying cause.
#[derive(Debug, Clone, thiserror::Error)]
#[error("sync of table {table_name} failed: {cause}")]
pub struct SyncJobError {
    pub table_name: String,
    #[source]
    pub cause: SyncError,
}

impl SyncJobError {
    pub fn new(table_name: impl Into<String>, cause: SyncError) -> Self {
        Self {
            table_name: table_name.into(),
            cause,
        }
    }

    pub fn kind(&self) -> SyncErrorKind {
        self.cause.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            SyncError::Submission("x".into()).kind(),
            SyncErrorKind::Remote
        );
        assert_eq!(
            SyncError::ExecutionTimeout {
                execution_id: "e".into(),
                waited: Duration::from_secs(1),
            }
            .kind(),
            SyncErrorKind::Remote
        );
        assert_eq!(
            SyncError::ExecutionFailed {
                execution_id: "e".into(),
                reason: "boom".into(),
            }
            .kind(),
            SyncErrorKind::Remote
        );
        assert_eq!(SyncError::Load("x".into()).kind(), SyncErrorKind::Load);
        assert_eq!(
            SyncError::Configuration("x".into()).kind(),
            SyncErrorKind::Config
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(SyncErrorKind::Remote.to_string(), "REMOTE");
        assert_eq!(SyncErrorKind::Load.to_string(), "LOAD");
        assert_eq!(SyncErrorKind::Config.to_string(), "CONFIG");
    }

    #[test]
    fn test_timeout_message_includes_seconds() {
        let err = SyncError::ExecutionTimeout {
            execution_id: "01HX".into(),
            waited: Duration::from_secs(300),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "execution 01HX timed out after 300s");
    }

    #[test]
    fn test_job_error_wraps_cause() {
        let err = SyncJobError::new(
            "prices",
            SyncError::ExecutionFailed {
                execution_id: "e1".into(),
                reason: "line 3: syntax error".into(),
            },
        );
        assert_eq!(err.table_name, "prices");
        assert_eq!(err.kind(), SyncErrorKind::Remote);
        assert_eq!(
            err.to_string(),
            "sync of table prices failed: execution e1 failed: line 3: syntax error"
        );
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("execution e1 failed: line 3: syntax error")
        );
    }

    #[test]
    fn test_context_helpers() {
        let err = SyncError::load(
            "truncate \"public\".\"t\"",
            std::io::Error::other("permission denied"),
        );
        assert_eq!(
            err.to_string(),
            "load error: truncate \"public\".\"t\": permission denied"
        );
        let err = SyncError::submission(
            "POST /query/1/execute",
            std::io::Error::other("connection refused"),
        );
        assert_eq!(err.kind(), SyncErrorKind::Remote);
    }

    #[derive(Debug)]
    struct Wrapped {
        msg: &'static str,
        cause: Option<Box<Wrapped>>,
    }

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.msg)
        }
    }

    impl Error for Wrapped {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            self.cause.as_deref().map(|c| c as &(dyn Error + 'static))
        }
    }

    #[test]
    fn test_describe_walks_source_chain() {
        let err = Wrapped {
            msg: "db error",
            cause: Some(Box::new(Wrapped {
                msg: "connection reset by peer",
                cause: None,
            })),
        };
        assert_eq!(describe(&err), "db error: connection reset by peer");
        assert_eq!(
            SyncError::load("insert into \"public\".\"t\"", err).to_string(),
            "load error: insert into \"public\".\"t\": db error: connection reset by peer"
        );
    }

    #[test]
    fn test_describe_skips_repeated_cause_text() {
        let err = Wrapped {
            msg: "request failed: timed out",
            cause: Some(Box::new(Wrapped {
                msg: "timed out",
                cause: None,
            })),
        };
        assert_eq!(describe(&err), "request failed: timed out");
    }
}
