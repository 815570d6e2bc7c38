//! CLI Exit Code Registry
//!
//! Single source of truth for `lwatch` exit codes. Schedulers and wrapper
//! scripts branch on these, so they are part of the shell contract.
//!
//! | Code | Meaning                                               |
//! |------|-------------------------------------------------------|
//! | 0    | Success (a run with degraded identity still succeeds) |
//! | 2    | Usage error (bad arguments, unreadable paths)         |
//! | 3    | Not due (cadence has not elapsed)                     |
//! | 4    | Scheduling conflict (run lease held elsewhere)        |
//! | 5    | Acquisition failure (extract missing or failed)       |
//! | 6    | Persistence failure (snapshot database)               |
//! | 7    | Delivery failure (report renderer)                    |
//! | 8    | Configuration error                                   |
//! | 9    | Run cancelled before commit                           |
//!
//! # Adding New Exit Codes
//!
//! 1. Add the constant below
//! 2. Document what triggers it
//! 3. Update the table above
//! 4. Wire it into `run_error_exit_code` or the relevant command

use ledgerwatch_recon::RunError;

pub const EXIT_SUCCESS: u8 = 0;

/// Bad arguments, missing database location, unreadable files.
pub const EXIT_USAGE: u8 = 2;

/// `should-run` said no, or `run` without `--force` before the cadence elapsed.
pub const EXIT_NOT_DUE: u8 = 3;

/// Another process holds the run lease for this run date.
pub const EXIT_CONFLICT: u8 = 4;

/// Ledger extract unavailable, empty, or failed after retries.
pub const EXIT_ACQUISITION: u8 = 5;

/// Snapshot store read or write failed.
pub const EXIT_PERSISTENCE: u8 = 6;

/// Report could not be rendered.
pub const EXIT_DELIVERY: u8 = 7;

/// Config file unreadable, unparseable, or out of range.
pub const EXIT_CONFIG: u8 = 8;

/// Cancellation observed before the snapshot was committed.
pub const EXIT_CANCELLED: u8 = 9;

/// Map a run-level failure to its exit code.
pub fn run_error_exit_code(err: &RunError) -> u8 {
    match err {
        RunError::Acquisition(_) => EXIT_ACQUISITION,
        RunError::Persistence(_) => EXIT_PERSISTENCE,
        RunError::SchedulingConflict { .. } => EXIT_CONFLICT,
        RunError::Delivery(_) => EXIT_DELIVERY,
        RunError::Cancelled { .. } => EXIT_CANCELLED,
        RunError::Config(_) => EXIT_CONFIG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ledgerwatch_recon::{ConfigError, SourceError, StoreError};

    #[test]
    fn every_run_error_has_a_distinct_code() {
        let errors = [
            RunError::from(SourceError::Unavailable("x".into())),
            RunError::from(StoreError::Backend("x".into())),
            RunError::SchedulingConflict {
                run_date: NaiveDate::from_ymd_opt(2026, 5, 10).unwrap(),
                holder: "x".into(),
            },
            RunError::Delivery(ledgerwatch_recon::DeliveryError::Failed {
                target: "x".into(),
                message: "x".into(),
            }),
            RunError::Cancelled { processed: 0, total: 1 },
            RunError::from(ConfigError::Validation("x".into())),
        ];
        let mut codes: Vec<u8> = errors.iter().map(run_error_exit_code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes, vec![4, 5, 6, 7, 8, 9]);
    }
}
