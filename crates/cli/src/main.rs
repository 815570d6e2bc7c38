// ledgerwatch CLI - scheduled invoice reconciliation runs
//
// stdout carries exactly one JSON value per command; logs go to stderr or
// --log-file.

mod exit_codes;
mod notify;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use ledgerwatch_io::{default_db_path, DropFolderSource, JsonReportRenderer, SqliteStore};
use ledgerwatch_recon::{Engine, EngineConfig, RunError, RunOptions, SnapshotStore};

use exit_codes::{
    run_error_exit_code, EXIT_CONFIG, EXIT_NOT_DUE, EXIT_PERSISTENCE, EXIT_SUCCESS, EXIT_USAGE,
};
use notify::LogNotifier;

const CONFIG_FILE: &str = "ledgerwatch.toml";

#[derive(Parser)]
#[command(name = "lwatch")]
#[command(about = "Incremental invoice reconciliation with rolling re-validation")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Engine config (TOML). Defaults to ./ledgerwatch.toml, then the user config dir
    #[arg(long, global = true, env = "LEDGERWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Snapshot database. Defaults to the platform data dir
    #[arg(long, global = true, env = "LEDGERWATCH_DB")]
    db: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "ledgerwatch_recon=debug". Overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Evaluate as of this date (YYYY-MM-DD) instead of the local date
    #[arg(long, global = true, value_parser = parse_date)]
    today: Option<NaiveDate>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report whether a run is due. Exits 0 when due, 3 when not
    #[command(after_help = "\
Examples:
  lwatch should-run && lwatch run
  lwatch should-run --today 2026-05-14")]
    ShouldRun,

    /// Execute one reconciliation run
    #[command(after_help = "\
Expects the day's extract as CSV files in <extract-dir>/<YYYY-MM-DD>/.

Examples:
  lwatch run --extract-dir /srv/ledger/drop
  lwatch run --force --today 2026-05-14")]
    Run {
        /// Folder holding one subfolder of CSV files per run date
        #[arg(long, env = "LEDGERWATCH_EXTRACT_DIR", default_value = "extracts")]
        extract_dir: PathBuf,

        /// Where JSON reports are written
        #[arg(long, env = "LEDGERWATCH_REPORT_DIR", default_value = "reports")]
        report_dir: PathBuf,

        /// Run even if the cadence has not elapsed (labelled manual)
        #[arg(long)]
        force: bool,

        /// Lease holder id. Defaults to pid-<process id>
        #[arg(long)]
        holder: Option<String>,
    },

    /// Archive snapshots and run windows older than the retention horizon
    Archive {
        /// Archive everything before this date instead
        #[arg(long, value_parser = parse_date)]
        before: Option<NaiveDate>,
    },

    /// Hard-delete archives older than the purge horizon
    Sweep,

    /// List persisted run windows as JSON
    Windows {
        /// Include archived windows
        #[arg(long)]
        all: bool,
    },
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {e}"))
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("GIT_COMMIT_HASH"),
        ")",
        "\nengine:  ledgerwatch-recon ",
        env!("CARGO_PKG_VERSION"),
        "\ntarget:  ",
        env!("TARGET"),
    )
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
    /// Set for run-level failures; printed as structured JSON.
    pub reason: Option<&'static str>,
}

impl CliError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None, reason: None }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self { code: EXIT_CONFIG, message: msg.into(), hint: None, reason: Some("config_error") }
    }

    pub fn not_due(msg: impl Into<String>) -> Self {
        Self { code: EXIT_NOT_DUE, message: msg.into(), hint: None, reason: None }
    }

    pub fn run(err: RunError) -> Self {
        let hint = match &err {
            RunError::SchedulingConflict { .. } => {
                Some("another run holds the lease for this date; it expires after run.lease_ttl_secs".to_string())
            }
            RunError::Acquisition(_) => Some("check that the extract for this run date was dropped".to_string()),
            _ => None,
        };
        Self {
            code: run_error_exit_code(&err),
            message: err.to_string(),
            hint,
            reason: Some(err.reason_code()),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl From<RunError> for CliError {
    fn from(err: RunError) -> Self {
        Self::run(err)
    }
}

#[derive(Serialize)]
struct FailureOutput<'a> {
    status: &'static str,
    reason: &'a str,
    message: &'a str,
}

// ============================================================================
// Setup
// ============================================================================

fn init_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).map_err(|e| CliError::usage(format!("bad --log-level: {e}")))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    if let Some(log_file) = &cli.log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| CliError::usage(format!("cannot open log file {}: {e}", log_file.display())))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(file).with_ansi(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
    }
    Ok(())
}

fn config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(p) = &cli.config {
        return Some(p.clone());
    }
    let local = PathBuf::from(CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|d| d.join("ledgerwatch").join(CONFIG_FILE))
        .filter(|p| p.is_file())
}

fn load_config(cli: &Cli) -> Result<EngineConfig, CliError> {
    let Some(path) = config_path(cli) else {
        debug!("no config file, using defaults");
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(&path)
        .map_err(|e| CliError::config(format!("cannot read {}: {e}", path.display())))?;
    let config = EngineConfig::from_toml(&text).map_err(|e| CliError::config(format!("{}: {e}", path.display())))?;
    debug!(path = %path.display(), "loaded config");
    Ok(config)
}

fn open_store(cli: &Cli) -> Result<Arc<SqliteStore>, CliError> {
    let path = match &cli.db {
        Some(p) => p.clone(),
        None => default_db_path().ok_or_else(|| {
            CliError::usage("no data directory on this platform").with_hint("pass --db or set LEDGERWATCH_DB")
        })?,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| CliError::usage(format!("cannot create {}: {e}", parent.display())))?;
    }
    let store = SqliteStore::open(&path).map_err(|e| CliError {
        code: EXIT_PERSISTENCE,
        message: format!("{}: {e}", path.display()),
        hint: None,
        reason: Some("persistence_error"),
    })?;
    Ok(Arc::new(store))
}

fn build_engine(cli: &Cli, extract_dir: &Path) -> Result<Engine, CliError> {
    let config = load_config(cli)?;
    let store = open_store(cli)?;
    let engine = Engine::new(config, store, Arc::new(DropFolderSource::new(extract_dir)))?
        .with_notifier(Arc::new(LogNotifier));
    Ok(engine)
}

fn today(cli: &Cli) -> NaiveDate {
    cli.today.unwrap_or_else(|| Local::now().date_naive())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| CliError::usage(e.to_string()))?;
    println!("{text}");
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_should_run(cli: &Cli) -> Result<(), CliError> {
    let engine = build_engine(cli, Path::new("."))?;
    let status = engine.schedule_status(today(cli))?;
    print_json(&status)?;
    if status.due {
        Ok(())
    } else {
        Err(CliError::not_due(format!("next run due {}", status.next_run_date)))
    }
}

fn cmd_run(
    cli: &Cli,
    extract_dir: &Path,
    report_dir: &Path,
    force: bool,
    holder: Option<String>,
) -> Result<(), CliError> {
    let today = today(cli);
    let engine = build_engine(cli, extract_dir)?.with_renderer(Arc::new(JsonReportRenderer::new(report_dir)));

    if !force {
        let status = engine.schedule_status(today)?;
        if !status.due {
            return Err(CliError::not_due(format!("not due until {}", status.next_run_date))
                .with_hint("pass --force to run anyway"));
        }
    }

    let outcome = engine.execute_run(today, &RunOptions { manual: force, holder })?;
    info!(report_dir = %report_dir.display(), "run finished");
    print_json(&serde_json::json!({
        "status": "ok",
        "summary": outcome.summary(),
        "archived": outcome.archived,
        "purged": outcome.purged,
    }))
}

fn cmd_archive(cli: &Cli, before: Option<NaiveDate>) -> Result<(), CliError> {
    let today = today(cli);
    let engine = build_engine(cli, Path::new("."))?;
    let cutoff = before.unwrap_or_else(|| engine.scheduler().archive_cutoff(today));
    let counts = engine.archive(cutoff, today)?;
    print_json(&serde_json::json!({ "cutoff": cutoff, "archived": counts }))
}

fn cmd_sweep(cli: &Cli) -> Result<(), CliError> {
    let today = today(cli);
    let engine = build_engine(cli, Path::new("."))?;
    let counts = engine.sweep(today)?;
    print_json(&serde_json::json!({
        "cutoff": engine.scheduler().purge_cutoff(today),
        "purged": counts,
    }))
}

fn cmd_windows(cli: &Cli, all: bool) -> Result<(), CliError> {
    let store = open_store(cli)?;
    let windows = store.run_windows(all).map_err(|e| CliError::run(e.into()))?;
    print_json(&windows)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = init_logging(&cli).and_then(|()| match &cli.command {
        Commands::ShouldRun => cmd_should_run(&cli),
        Commands::Run { extract_dir, report_dir, force, holder } => {
            cmd_run(&cli, extract_dir, report_dir, *force, holder.clone())
        }
        Commands::Archive { before } => cmd_archive(&cli, *before),
        Commands::Sweep => cmd_sweep(&cli),
        Commands::Windows { all } => cmd_windows(&cli, *all),
    });

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint, reason }) => {
            match reason {
                Some(reason) => {
                    let out = FailureOutput { status: "failed", reason, message: &message };
                    match serde_json::to_string(&out) {
                        Ok(line) => eprintln!("{line}"),
                        Err(_) => eprintln!("error: {message}"),
                    }
                }
                None if !message.is_empty() => eprintln!("error: {message}"),
                None => {}
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {hint}");
            }
            ExitCode::from(code)
        }
    }
}
