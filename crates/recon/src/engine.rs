//! Run orchestration: lease → archive → plan → fetch → normalize →
//! validate → reconcile → deliver → commit → purge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ConfigError, DeliveryError, RunError, SourceError};
use crate::fingerprint::stamp;
use crate::model::{
    CanonicalRecord, DateRange, IdentityState, Issue, ReportMeta, RunReport, RunSummary, RunWindow,
    Snapshot, WindowMeta,
};
use crate::normalize::{Normalizer, TableChoice};
use crate::reconcile::reconcile;
use crate::report::{compute_summary, Notifier, NullNotifier, NullRenderer, ReportRenderer};
use crate::retry::{call_with_retry, CancelToken};
use crate::rules::{find_duplicates, RuleContext, RuleSet};
use crate::schedule::WindowScheduler;
use crate::source::{ExtractRequest, LedgerExtract, LedgerSource};
use crate::store::{assign_record_keys, LeaseGuard, SnapshotStore, SweepCounts};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Label the run `manual`. Cadence is never checked by `execute_run`.
    pub manual: bool,
    /// Lease holder id. Defaults to `pid-<process id>`.
    pub holder: Option<String>,
}

/// Cadence view for callers deciding whether to trigger a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleStatus {
    pub today: NaiveDate,
    pub due: bool,
    pub last_run_date: Option<NaiveDate>,
    pub next_run_date: NaiveDate,
    pub batch: DateRange,
    pub cumulative: DateRange,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: Arc<RunReport>,
    pub window: RunWindow,
    pub archived: SweepCounts,
    pub purged: SweepCounts,
}

impl RunOutcome {
    pub fn summary(&self) -> &RunSummary {
        &self.report.summary
    }

    pub fn is_degraded(&self) -> bool {
        self.report.summary.identity_resolution == IdentityState::Degraded
    }
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn SnapshotStore>,
    source: Arc<dyn LedgerSource>,
    renderer: Arc<dyn ReportRenderer>,
    notifier: Arc<dyn Notifier>,
    rules: RuleSet,
    normalizer: Normalizer,
    scheduler: WindowScheduler,
    pool: rayon::ThreadPool,
    cancel: CancelToken,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SnapshotStore>,
        source: Arc<dyn LedgerSource>,
    ) -> Result<Self, RunError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.run.workers)
            .thread_name(|i| format!("lwatch-worker-{i}"))
            .build()
            .map_err(|e| ConfigError::Validation(format!("cannot start worker pool: {e}")))?;
        Ok(Self {
            normalizer: Normalizer::new(&config.normalize),
            scheduler: WindowScheduler::new(&config.schedule),
            config,
            store,
            source,
            renderer: Arc::new(NullRenderer),
            notifier: Arc::new(NullNotifier),
            rules: RuleSet::standard(),
            pool,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ReportRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &WindowScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &dyn SnapshotStore {
        self.store.as_ref()
    }

    // -----------------------------------------------------------------------
    // Schedule
    // -----------------------------------------------------------------------

    pub fn should_run_now(&self, today: NaiveDate) -> Result<bool, RunError> {
        Ok(self.schedule_status(today)?.due)
    }

    /// Includes runs made earlier today.
    pub fn schedule_status(&self, today: NaiveDate) -> Result<ScheduleStatus, RunError> {
        let through_today = today.succ_opt().unwrap_or(NaiveDate::MAX);
        let state = self.store.schedule_state(through_today)?;
        Ok(ScheduleStatus {
            today,
            due: self.scheduler.should_run_now(today, state.last_run_date),
            last_run_date: state.last_run_date,
            next_run_date: self.scheduler.next_run_date(state.last_run_date, today),
            batch: self.scheduler.current_batch(today),
            cumulative: self.scheduler.cumulative_range(today, state.first_validation_date),
        })
    }

    /// Archive snapshots and windows older than `cutoff`.
    pub fn archive(&self, cutoff: NaiveDate, today: NaiveDate) -> Result<SweepCounts, RunError> {
        let counts = self.store.archive_before(cutoff, today)?;
        info!(%cutoff, records = counts.records, windows = counts.windows, "archived");
        Ok(counts)
    }

    /// Hard-delete archives older than the purge horizon.
    pub fn sweep(&self, today: NaiveDate) -> Result<SweepCounts, RunError> {
        let cutoff = self.scheduler.purge_cutoff(today);
        let counts = self.store.purge_archived_before(cutoff)?;
        info!(%cutoff, records = counts.records, windows = counts.windows, "purged archives");
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Run
    // -----------------------------------------------------------------------

    /// Execute one run for `today`. Re-running the same day with the same
    /// source data replaces that day's snapshot and run window.
    pub fn execute_run(&self, today: NaiveDate, options: &RunOptions) -> Result<RunOutcome, RunError> {
        let started = Utc::now();
        let holder = options
            .holder
            .clone()
            .unwrap_or_else(|| format!("pid-{}", std::process::id()));
        let ttl = Duration::from_secs(self.config.run.lease_ttl_secs);
        let lease = LeaseGuard::acquire(self.store.as_ref(), today, &holder, started, ttl)?;

        let archived = self.archive(self.scheduler.archive_cutoff(today), today)?;
        let state = self.store.schedule_state(today)?;
        let window = self.scheduler.plan(today, &state, options.manual);
        info!(
            %today,
            run_type = %window.run_type,
            batch = %window.batch,
            cumulative = %window.cumulative,
            "run started"
        );

        let records = self.acquire_records(&window, started)?;
        let total = records.len();

        let previous = self.store.find_latest_before(today)?;
        match &previous {
            Some(p) => debug!(previous = %p.run_date(), records = p.records.len(), "comparing against snapshot"),
            None => debug!("no previous snapshot"),
        }
        let result = reconcile(
            &records,
            previous.as_ref().map(|s| s.records.as_slice()),
            &self.config.identity,
        );

        let summary = compute_summary(&window, &records, &result, self.config.run.max_urgent);
        let report = Arc::new(RunReport {
            meta: ReportMeta {
                engine_version: env!("CARGO_PKG_VERSION").to_string(),
                run_at: started.to_rfc3339(),
            },
            summary,
            reconciliation: result,
        });

        self.deliver(&report)?;

        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled { processed: total, total });
        }

        let snapshot = Snapshot::new(window, records, started);
        let run_window = RunWindow::from_meta(&window, started);
        self.store.commit_run(&snapshot, &run_window)?;
        info!(%today, records = total, "snapshot committed");

        let purged = match self.sweep(today) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "purge sweep failed; will retry next run");
                SweepCounts::default()
            }
        };

        if let Err(e) = lease.release() {
            warn!(error = %e, "failed to release run lease; it will expire");
        }

        let s = &report.summary;
        info!(
            %today,
            total = s.total_records,
            pass = s.status.pass,
            warning = s.status.warning,
            fail = s.status.fail,
            added = s.partitions.added,
            modified = s.partitions.modified,
            deleted = s.partitions.deleted,
            unchanged = s.partitions.unchanged,
            identity = %s.identity_resolution,
            "run complete"
        );

        Ok(RunOutcome {
            report,
            window: run_window,
            archived,
            purged,
        })
    }

    /// Fetch, normalize, fingerprint, key, and validate the current records.
    fn acquire_records(
        &self,
        window: &WindowMeta,
        captured_at: chrono::DateTime<Utc>,
    ) -> Result<Vec<CanonicalRecord>, RunError> {
        let request = ExtractRequest {
            range: window.cumulative,
            run_date: window.run_date,
        };
        let source = Arc::clone(&self.source);
        let fetch: Arc<dyn Fn() -> Result<LedgerExtract, SourceError> + Send + Sync> =
            Arc::new(move || source.fetch(&request));
        let extract = call_with_retry("ledger source", &self.config.source, &self.cancel, fetch)?;
        if extract.is_empty() {
            return Err(SourceError::Unavailable(format!("extract for {} has no rows", window.cumulative)).into());
        }

        let TableChoice { table, columns, .. } = self
            .normalizer
            .select_table(&extract)
            .ok_or_else(|| SourceError::Unavailable("no extract table has rows".into()))?;
        let total = table.rows.len();
        info!(table = %table.name, rows = total, resolved_fields = columns.len(), "extract received");

        let processed = AtomicUsize::new(0);
        let normalized: Vec<Option<CanonicalRecord>> = self.pool.install(|| {
            table
                .rows
                .par_iter()
                .enumerate()
                .map(|(i, row)| {
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    let mut record = self.normalizer.normalize_row(row, &columns, captured_at, i);
                    stamp(&mut record);
                    processed.fetch_add(1, Ordering::Relaxed);
                    Some(record)
                })
                .collect()
        });
        let mut records = match normalized.into_iter().collect::<Option<Vec<_>>>() {
            Some(r) => r,
            None => {
                return Err(RunError::Cancelled {
                    processed: processed.load(Ordering::Relaxed),
                    total,
                })
            }
        };

        assign_record_keys(&mut records, &self.config.identity.candidates);

        let duplicates = find_duplicates(&records);
        let ctx = RuleContext {
            today: window.run_date,
            config: &self.config.rules,
            duplicates: &duplicates,
        };
        let processed = AtomicUsize::new(0);
        let issues: Vec<Option<Vec<Issue>>> = self.pool.install(|| {
            records
                .par_iter()
                .map(|r| {
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    let found = self.rules.evaluate(r, &ctx);
                    processed.fetch_add(1, Ordering::Relaxed);
                    Some(found)
                })
                .collect()
        });
        let issues = match issues.into_iter().collect::<Option<Vec<_>>>() {
            Some(i) => i,
            None => {
                return Err(RunError::Cancelled {
                    processed: processed.load(Ordering::Relaxed),
                    total,
                })
            }
        };
        for (record, found) in records.iter_mut().zip(issues) {
            record.issues.extend(found);
        }
        debug!(records = records.len(), duplicates = duplicates.len(), "records validated");
        Ok(records)
    }

    /// Renderer failure is fatal for the run; notifier failure only warns.
    fn deliver(&self, report: &Arc<RunReport>) -> Result<(), RunError> {
        let renderer = Arc::clone(&self.renderer);
        let for_render = Arc::clone(report);
        let render: Arc<dyn Fn() -> Result<(), DeliveryError> + Send + Sync> =
            Arc::new(move || renderer.render(&for_render));
        call_with_retry("report renderer", &self.config.delivery, &self.cancel, render)?;

        let notifier = Arc::clone(&self.notifier);
        let for_notify = Arc::clone(report);
        let notify: Arc<dyn Fn() -> Result<(), DeliveryError> + Send + Sync> =
            Arc::new(move || notifier.notify(&for_notify.summary));
        if let Err(e) = call_with_retry("notifier", &self.config.delivery, &self.cancel, notify) {
            warn!(error = %e, "notification failed; run continues");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{RawRow, StaticSource};
    use crate::store::MemoryStore;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn row(no: &str, total: &str) -> RawRow {
        [
            ("Invoice No", no),
            ("Vendor Name", "Acme Traders"),
            ("Invoice Date", "2026-05-07"),
            ("Total", total),
            ("MOP", "NEFT"),
            ("Due Date", "2026-06-30"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn engine(store: Arc<MemoryStore>, rows: Vec<RawRow>) -> Engine {
        let mut config = EngineConfig::default();
        config.run.workers = 2;
        Engine::new(config, store, Arc::new(StaticSource::from_rows(rows))).unwrap()
    }

    #[test]
    fn first_run_is_standard_and_all_added() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(Arc::clone(&store), vec![row("INV1", "100"), row("INV2", "200")]);
        let out = e.execute_run(d("2026-05-10"), &RunOptions::default()).unwrap();
        assert_eq!(out.window.run_type, crate::model::RunType::Standard);
        assert_eq!(out.summary().partitions.added, 2);
        assert_eq!(out.summary().status.pass, 2);
        assert!(!e.should_run_now(d("2026-05-13")).unwrap());
        assert!(e.should_run_now(d("2026-05-14")).unwrap());
    }

    #[test]
    fn empty_extract_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(Arc::clone(&store), vec![]);
        let err = e.execute_run(d("2026-05-10"), &RunOptions::default()).unwrap_err();
        assert_eq!(err.reason_code(), "acquisition_error");
        assert!(store.run_windows(true).unwrap().is_empty());
        assert!(store.read_snapshot(d("2026-05-10")).unwrap().is_none());
    }

    struct FlagAll;

    impl crate::rules::Rule for FlagAll {
        fn code(&self) -> &'static str {
            "HOLD"
        }

        fn check(&self, _record: &crate::model::CanonicalRecord, _ctx: &RuleContext<'_>) -> Option<Issue> {
            Some(Issue::new(self.code(), crate::model::Severity::Fail, "on hold"))
        }
    }

    #[test]
    fn custom_rule_set_replaces_standard_rules() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(Arc::clone(&store), vec![row("INV1", "100"), row("INV2", "200")])
            .with_rules(RuleSet::new(vec![Box::new(FlagAll)]));
        let out = e.execute_run(d("2026-05-10"), &RunOptions::default()).unwrap();
        assert_eq!(out.summary().status.fail, 2);

        let snap = e.store().read_snapshot(d("2026-05-10")).unwrap().unwrap();
        assert!(snap
            .records
            .iter()
            .all(|r| r.issues.len() == 1 && r.issues[0].code == "HOLD"));
    }

    #[test]
    fn cancelled_before_start_commits_nothing() {
        let store = Arc::new(MemoryStore::new());
        let e = engine(Arc::clone(&store), vec![row("INV1", "100")]);
        e.cancel_token().cancel();
        let err = e.execute_run(d("2026-05-10"), &RunOptions::default()).unwrap_err();
        assert!(matches!(err, RunError::Cancelled { .. }));
        assert!(store.read_snapshot(d("2026-05-10")).unwrap().is_none());
    }
}
