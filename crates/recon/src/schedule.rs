use chrono::{Days, NaiveDate};

use crate::config::ScheduleConfig;
use crate::model::{DateRange, RunType, WindowMeta};

/// Persisted scheduling state, read from the store before planning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleState {
    pub last_run_date: Option<NaiveDate>,
    /// Earliest start of a non-archived run window.
    pub first_validation_date: Option<NaiveDate>,
}

fn minus_days(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_sub_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Cadence, batch, and cumulative-range arithmetic. Every method is a pure
/// function of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowScheduler {
    pub cadence_days: u32,
    pub batch_days: u32,
    pub retention_days: u32,
    pub purge_after_days: u32,
}

impl WindowScheduler {
    pub fn new(config: &ScheduleConfig) -> Self {
        Self {
            cadence_days: config.cadence_days,
            batch_days: config.batch_days,
            retention_days: config.retention_days,
            purge_after_days: config.purge_after_days,
        }
    }

    /// Due when nothing has run yet or at least `cadence_days` have passed.
    pub fn should_run_now(&self, today: NaiveDate, last_run_date: Option<NaiveDate>) -> bool {
        match last_run_date {
            None => true,
            Some(last) => (today - last).num_days() >= i64::from(self.cadence_days),
        }
    }

    pub fn next_run_date(&self, last_run_date: Option<NaiveDate>, today: NaiveDate) -> NaiveDate {
        match last_run_date {
            None => today,
            Some(last) => last
                .checked_add_days(Days::new(u64::from(self.cadence_days)))
                .unwrap_or(NaiveDate::MAX),
        }
    }

    /// `[today - batch_days, today - 1]`. Today is never included.
    pub fn current_batch(&self, today: NaiveDate) -> DateRange {
        DateRange::new(minus_days(today, self.batch_days), minus_days(today, 1))
    }

    /// Oldest date still eligible for re-validation.
    pub fn retention_start(&self, today: NaiveDate) -> NaiveDate {
        minus_days(today, self.retention_days)
    }

    /// Snapshots and windows before this date get archived.
    pub fn archive_cutoff(&self, today: NaiveDate) -> NaiveDate {
        self.retention_start(today)
    }

    /// Archived rows whose archive date is before this get purged.
    pub fn purge_cutoff(&self, today: NaiveDate) -> NaiveDate {
        minus_days(today, self.purge_after_days)
    }

    /// Range re-validated by a run today.
    ///
    /// Starts at the first validation date, clamped to the retention horizon,
    /// and never later than the current batch start. Ends with the batch.
    pub fn cumulative_range(&self, today: NaiveDate, first_validation_date: Option<NaiveDate>) -> DateRange {
        let batch = self.current_batch(today);
        let Some(first) = first_validation_date else {
            return batch;
        };
        let horizon = self.retention_start(today);
        let start = if (today - first).num_days() > i64::from(self.retention_days) {
            horizon
        } else {
            first
        };
        DateRange::new(start.min(batch.start), batch.end)
    }

    /// Window metadata for a run today. Call after archival so that
    /// `state.first_validation_date` reflects the post-archive horizon.
    pub fn plan(&self, today: NaiveDate, state: &ScheduleState, manual: bool) -> WindowMeta {
        let run_type = if manual {
            RunType::Manual
        } else if state.last_run_date.is_none() {
            RunType::Standard
        } else {
            RunType::Cumulative
        };
        WindowMeta {
            run_date: today,
            run_type,
            batch: self.current_batch(today),
            cumulative: self.cumulative_range(today, state.first_validation_date),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn scheduler() -> WindowScheduler {
        WindowScheduler::new(&ScheduleConfig::default())
    }

    #[test]
    fn cadence_boundary() {
        let today = d("2026-05-10");
        let s = scheduler();
        assert!(s.should_run_now(today, None));
        assert!(!s.should_run_now(today, Some(d("2026-05-07"))));
        assert!(s.should_run_now(today, Some(d("2026-05-06"))));
        assert_eq!(s.next_run_date(Some(d("2026-05-07")), today), d("2026-05-11"));
    }

    #[test]
    fn batch_excludes_today() {
        let b = scheduler().current_batch(d("2026-05-10"));
        assert_eq!(b, DateRange::new(d("2026-05-06"), d("2026-05-09")));
        assert_eq!(b.days(), 4);
    }

    #[test]
    fn cumulative_without_history_is_batch() {
        let s = scheduler();
        let today = d("2026-05-10");
        assert_eq!(s.cumulative_range(today, None), s.current_batch(today));
    }

    #[test]
    fn cumulative_from_first_validation() {
        let r = scheduler().cumulative_range(d("2026-05-10"), Some(d("2026-04-01")));
        assert_eq!(r, DateRange::new(d("2026-04-01"), d("2026-05-09")));
    }

    #[test]
    fn cumulative_clamped_to_retention() {
        let today = d("2026-05-10");
        let first = d("2026-01-30"); // today - 100
        let r = scheduler().cumulative_range(today, Some(first));
        assert_eq!(r.start, d("2026-02-09")); // today - 90
        assert_eq!(r.end, d("2026-05-09"));
    }

    #[test]
    fn cumulative_covers_batch_even_with_future_first_date() {
        let today = d("2026-05-10");
        let r = scheduler().cumulative_range(today, Some(d("2026-05-08")));
        assert_eq!(r.start, d("2026-05-06"));
    }

    #[test]
    fn plan_labels_run_type() {
        let s = scheduler();
        let today = d("2026-05-10");
        let first = s.plan(today, &ScheduleState::default(), false);
        assert_eq!(first.run_type, RunType::Standard);
        let state = ScheduleState {
            last_run_date: Some(d("2026-05-06")),
            first_validation_date: Some(d("2026-05-02")),
        };
        let next = s.plan(today, &state, false);
        assert_eq!(next.run_type, RunType::Cumulative);
        assert_eq!(next.cumulative.start, d("2026-05-02"));
        assert_eq!(s.plan(today, &state, true).run_type, RunType::Manual);
    }

    #[test]
    fn cutoffs() {
        let s = scheduler();
        let today = d("2026-05-10");
        assert_eq!(s.archive_cutoff(today), d("2026-02-09"));
        assert_eq!(s.purge_cutoff(today), d("2025-11-11"));
    }
}
