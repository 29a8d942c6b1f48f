use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use pg_dunesync::{
    BatchOptions, BatchReport, ControlTable, DuneClient, FileSource, Orchestrator, PgConnector,
    QueryExecutor, RunOverrides, Settings, SourceKind, SyncError,
};

/// Sync Dune query results into PostgreSQL tables.
#[derive(Debug, Parser)]
#[command(name = "pg_dunesync", version, about)]
struct Cli {
    /// Settings file; also holds `[[tables]]` when `source = "file"`.
    #[arg(long, env = "PG_DUNESYNC_CONFIG", default_value = "pg_dunesync.toml")]
    config: PathBuf,

    /// Replace every selected table instead of upserting.
    #[arg(long)]
    full_refresh: bool,

    /// Watermark to use instead of each table's current maximum.
    #[arg(long, value_name = "VALUE")]
    incremental_value: Option<String>,

    /// Only sync tables matching these glob patterns.
    #[arg(long, value_name = "PATTERN", num_args = 1..)]
    select: Vec<String>,

    /// Jobs to run at once (overrides the settings file).
    #[arg(long)]
    concurrency: Option<usize>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

const EXIT_PARTIAL_FAILURE: u8 = 2;
const EXIT_FATAL: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<BatchReport, SyncError> {
    let mut settings = Settings::load(&cli.config)?;
    settings.apply_env(|key| std::env::var(key).ok());
    if let Some(concurrency) = cli.concurrency {
        settings.concurrency = concurrency;
    }
    settings.validate()?;

    let api_key = settings.api_key.clone().unwrap_or_default();
    let database_url = settings.database_url.clone().unwrap_or_default();

    let dune = DuneClient::new(&settings.api_base_url, api_key, settings.request_timeout())?;
    let executor = QueryExecutor::new(Arc::new(dune), settings.poll_interval());
    let connector = Arc::new(PgConnector::new(database_url));

    let overrides = RunOverrides {
        full_refresh: cli.full_refresh,
        incremental_value: cli.incremental_value,
        select: cli.select,
    };
    let orchestrator = Orchestrator::new(
        executor,
        connector.clone(),
        BatchOptions::from_settings(&settings),
    )
    .with_overrides(overrides)?;

    match settings.source {
        SourceKind::File => orchestrator.run(&FileSource::new(&cli.config)).await,
        SourceKind::ControlTable => {
            let client = connector.connect().await?;
            let control = Arc::new(ControlTable::new(client, settings.control_table.clone()));
            orchestrator
                .with_ledger(control.clone())
                .run(control.as_ref())
                .await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    tokio::select! {
        result = run(cli) => match result {
            Ok(report) => {
                println!("{report}");
                if report.is_success() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::from(EXIT_PARTIAL_FAILURE)
                }
            }
            Err(e) => {
                error!(kind = %e.kind(), error = %e, "batch aborted");
                eprintln!("pg_dunesync: {e}");
                ExitCode::from(EXIT_FATAL)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            // Dropping the batch rolls back every open load transaction.
            warn!("interrupted, abandoning in-flight jobs");
            ExitCode::from(EXIT_INTERRUPTED)
        }
    }
}
