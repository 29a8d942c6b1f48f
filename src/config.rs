//! Runtime settings for pg_dunesync.
//!
//! Settings are read from a TOML file (every key optional), then overridden
//! from the environment, then from the command line. Per-run flags that only
//! shape one batch live in [`RunOverrides`].

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::SyncError;
use crate::remote::DEFAULT_API_BASE_URL;

/// Schema that target tables are created in.
pub const DEFAULT_TARGET_SCHEMA: &str = "public";

/// Upper bound on one remote execution, measured from submission.
pub const DEFAULT_MAX_WAIT_SECONDS: u64 = 300;

/// Sleep between status polls of a running execution.
pub const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;

/// Timeout of a single HTTP request to the remote service.
///
/// Independent of `max_wait_seconds`: a hung request is also cut short by
/// the execution deadline.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Name of the remote query parameter that receives the watermark on the
/// incremental path.
pub const DEFAULT_WATERMARK_PARAMETER: &str = "date";

/// Jobs in flight at once. 1 keeps the batch strictly sequential.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Control table read when `source = "control_table"`.
pub const DEFAULT_CONTROL_TABLE: &str = "etl.etl_job";

/// Where job descriptors are read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// `[[tables]]` in the settings file.
    File,
    /// Active rows of the control table.
    ControlTable,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_base_url: String,
    pub api_key: Option<String>,
    pub database_url: Option<String>,
    pub target_schema: String,
    pub max_wait_seconds: u64,
    pub poll_interval_seconds: u64,
    pub request_timeout_seconds: u64,
    pub watermark_parameter: String,
    pub concurrency: usize,
    /// Abort polls still running this long after the batch started.
    pub batch_deadline_seconds: Option<u64>,
    pub source: SourceKind,
    pub control_table: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_key: None,
            database_url: None,
            target_schema: DEFAULT_TARGET_SCHEMA.to_string(),
            max_wait_seconds: DEFAULT_MAX_WAIT_SECONDS,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            request_timeout_seconds: DEFAULT_REQUEST_TIMEOUT_SECONDS,
            watermark_parameter: DEFAULT_WATERMARK_PARAMETER.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            batch_deadline_seconds: None,
            source: SourceKind::File,
            control_table: DEFAULT_CONTROL_TABLE.to_string(),
        }
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self, SyncError> {
        toml::from_str(text)
            .map_err(|e| SyncError::Configuration(format!("invalid settings: {e}")))
    }

    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "settings file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(SyncError::Configuration(format!(
                "cannot read {}: {e}",
                path.display()
            ))),
        }
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DUNE_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("DUNE_API_KEY") {
            self.api_key = Some(v);
        }
        if let Some(v) = lookup("DATABASE_URL") {
            self.database_url = Some(v);
        }
        if let Some(v) = lookup("PG_DUNESYNC_SCHEMA") {
            self.target_schema = v;
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        let invalid = |msg: &str| Err(SyncError::Configuration(msg.to_string()));
        if self.poll_interval_seconds == 0 {
            return invalid("poll_interval_seconds must be greater than zero");
        }
        if self.max_wait_seconds == 0 {
            return invalid("max_wait_seconds must be greater than zero");
        }
        if self.concurrency == 0 {
            return invalid("concurrency must be at least 1");
        }
        if self.target_schema.trim().is_empty() {
            return invalid("target_schema must not be empty");
        }
        if self.watermark_parameter.trim().is_empty() {
            return invalid("watermark_parameter must not be empty");
        }
        if self.api_key.as_deref().is_none_or(str::is_empty) {
            return invalid("api_key is required (set DUNE_API_KEY)");
        }
        if self.database_url.as_deref().is_none_or(str::is_empty) {
            return invalid("database_url is required (set DATABASE_URL)");
        }
        Ok(())
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn batch_deadline(&self) -> Option<Duration> {
        self.batch_deadline_seconds.map(Duration::from_secs)
    }
}

/// Per-run flags from the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOverrides {
    /// Force every job onto the full-refresh path.
    pub full_refresh: bool,
    /// Fixed watermark replacing the one read from each target table.
    pub incremental_value: Option<String>,
    /// Table-name glob patterns; empty selects every table.
    pub select: Vec<String>,
}

impl RunOverrides {
    pub fn filter(&self) -> Result<TableFilter, SyncError> {
        TableFilter::new(&self.select)
    }
}

/// Restricts which descriptors run.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    patterns: Vec<glob::Pattern>,
}

impl TableFilter {
    pub fn new(patterns: &[String]) -> Result<Self, SyncError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| {
                    SyncError::Configuration(format!("invalid --select pattern {p:?}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, table_name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(table_name))
    }
}
