//! `ledgerwatch-recon`: incremental invoice reconciliation and scheduling.
//!
//! Pure engine crate: pulls rows through a [`LedgerSource`], persists through
//! a [`SnapshotStore`], hands reports to a [`ReportRenderer`]. No concrete IO.

pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod normalize;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod rules;
pub mod schedule;
pub mod source;
pub mod store;

pub use config::EngineConfig;
pub use engine::{Engine, RunOptions, RunOutcome, ScheduleStatus};
pub use error::{ConfigError, DeliveryError, RunError, SourceError, StoreError};
pub use model::{CanonicalField, CanonicalRecord, RunReport, RunSummary, RunWindow, Snapshot};
pub use report::{Notifier, ReportRenderer};
pub use retry::CancelToken;
pub use source::{LedgerExtract, LedgerSource};
pub use store::{MemoryStore, SnapshotStore};
