use chrono::NaiveDate;
use thiserror::Error;

/// Config parse / validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML parse / deserialization error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A value parsed but is out of range or inconsistent.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Snapshot store failures. Always fatal for the run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store holds invalid data: {0}")]
    Corrupt(String),
}

/// Ledger extract source failures.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source answered but has nothing for the range (or is offline).
    #[error("extract unavailable: {0}")]
    Unavailable(String),
    #[error("extract timed out after {secs}s")]
    Timeout { secs: u64 },
    #[error("extract failed: {0}")]
    Failed(String),
}

/// Renderer / notifier failures.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{target} timed out after {secs}s")]
    Timeout { target: String, secs: u64 },
    #[error("{target} failed: {message}")]
    Failed { target: String, message: String },
}

/// Run-level failures. Per-record problems never show up here.
#[derive(Debug, Error)]
pub enum RunError {
    /// Source unavailable or empty; nothing was written.
    #[error("acquisition failed: {0}")]
    Acquisition(#[from] SourceError),
    /// Store read/write failure; nothing was committed.
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    /// Another run holds the lease for this run date.
    #[error("run for {run_date} already in progress (lease held by {holder})")]
    SchedulingConflict { run_date: NaiveDate, holder: String },
    /// The report could not be handed to the renderer.
    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
    #[error("run cancelled after {processed} of {total} records")]
    Cancelled { processed: usize, total: usize },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RunError {
    /// Stable snake_case reason for structured failure output.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Acquisition(_) => "acquisition_error",
            Self::Persistence(_) => "persistence_error",
            Self::SchedulingConflict { .. } => "scheduling_conflict",
            Self::Delivery(_) => "delivery_error",
            Self::Cancelled { .. } => "cancelled",
            Self::Config(_) => "config_error",
        }
    }
}
