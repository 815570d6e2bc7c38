//! Snapshot store contract, run lease, and the in-memory backend.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{RunError, StoreError};
use crate::model::{CanonicalField, CanonicalRecord, RunWindow, Snapshot};
use crate::schedule::ScheduleState;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Rows touched by an archive or purge sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepCounts {
    /// Snapshot records.
    pub records: usize,
    pub windows: usize,
}

impl SweepCounts {
    pub fn total(&self) -> usize {
        self.records + self.windows
    }
}

/// Advisory run lease, keyed by run date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub run_date: NaiveDate,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(run_date: NaiveDate, holder: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        Self {
            run_date,
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    Acquired,
    /// Someone else holds a live lease.
    Held(Lease),
}

/// Persistence for snapshots, run windows, and run leases.
///
/// Readers never see a partially written snapshot. Archived snapshots are
/// excluded from `read_snapshot` and `find_latest_before`.
pub trait SnapshotStore: Send + Sync {
    /// Atomically replace or create the snapshot for its run date.
    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    fn read_snapshot(&self, run_date: NaiveDate) -> Result<Option<Snapshot>, StoreError>;

    /// Most recent live snapshot with `run_date < date`.
    fn find_latest_before(&self, date: NaiveDate) -> Result<Option<Snapshot>, StoreError>;

    /// Soft-delete snapshots with `run_date < cutoff` and run windows with
    /// `start_date < cutoff`, stamping `archived_on`.
    fn archive_before(&self, cutoff: NaiveDate, archived_on: NaiveDate) -> Result<SweepCounts, StoreError>;

    /// Hard-delete archived rows whose archive date is before `cutoff`.
    fn purge_archived_before(&self, cutoff: NaiveDate) -> Result<SweepCounts, StoreError>;

    /// Insert, or replace the row with the same `(start_date, end_date, run_date)`.
    fn upsert_run_window(&self, window: &RunWindow) -> Result<(), StoreError>;

    /// Ordered by run date, then start date.
    fn run_windows(&self, include_archived: bool) -> Result<Vec<RunWindow>, StoreError>;

    /// Scheduling state from windows with `run_date < before`: last run date
    /// over all of them, first validation date over live ones.
    fn schedule_state(&self, before: NaiveDate) -> Result<ScheduleState, StoreError>;

    /// Snapshot write and window upsert in one all-or-nothing step.
    fn commit_run(&self, snapshot: &Snapshot, window: &RunWindow) -> Result<(), StoreError>;

    fn try_acquire_lease(
        &self,
        run_date: NaiveDate,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseStatus, StoreError>;

    /// No-op unless `holder` owns the lease.
    fn release_lease(&self, run_date: NaiveDate, holder: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Lease guard
// ---------------------------------------------------------------------------

/// Holds a run lease until released or dropped.
pub struct LeaseGuard<'s> {
    store: &'s dyn SnapshotStore,
    run_date: NaiveDate,
    holder: String,
    released: bool,
}

impl<'s> LeaseGuard<'s> {
    pub fn acquire(
        store: &'s dyn SnapshotStore,
        run_date: NaiveDate,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Self, RunError> {
        match store.try_acquire_lease(run_date, holder, now, ttl)? {
            LeaseStatus::Acquired => {
                debug!(%run_date, holder, "run lease acquired");
                Ok(Self {
                    store,
                    run_date,
                    holder: holder.to_string(),
                    released: false,
                })
            }
            LeaseStatus::Held(lease) => Err(RunError::SchedulingConflict {
                run_date,
                holder: lease.holder,
            }),
        }
    }

    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.store.release_lease(self.run_date, &self.holder)
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.release_lease(self.run_date, &self.holder) {
            warn!(run_date = %self.run_date, error = %e, "failed to release run lease; it will expire");
        }
    }
}

// ---------------------------------------------------------------------------
// Record keys
// ---------------------------------------------------------------------------

/// Give every record a snapshot-unique `record_key`.
///
/// The base is the first non-empty identity candidate, else the content
/// hash. Records sharing a base are ordered by content hash and get `#2`,
/// `#3`, ... after the first.
pub fn assign_record_keys(records: &mut [CanonicalRecord], candidates: &[CanonicalField]) {
    let base = |r: &CanonicalRecord| {
        candidates
            .iter()
            .find_map(|f| r.canonical(*f))
            .unwrap_or_else(|| r.content_hash.clone())
    };
    let mut order: Vec<(String, usize)> = records.iter().enumerate().map(|(i, r)| (base(r), i)).collect();
    order.sort_by(|(ka, ia), (kb, ib)| {
        let (a, b) = (&records[*ia], &records[*ib]);
        (ka, &a.content_hash, a.source_row).cmp(&(kb, &b.content_hash, b.source_row))
    });

    let mut prev: Option<&str> = None;
    let mut n = 0usize;
    let mut keys = vec![String::new(); records.len()];
    for (key, idx) in &order {
        if prev == Some(key.as_str()) {
            n += 1;
            keys[*idx] = format!("{key}#{n}");
        } else {
            n = 1;
            keys[*idx] = key.clone();
        }
        prev = Some(key.as_str());
    }
    for (r, k) in records.iter_mut().zip(keys) {
        r.record_key = k;
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

type WindowKey = (NaiveDate, NaiveDate, NaiveDate);

fn window_key(w: &RunWindow) -> WindowKey {
    (w.start_date, w.end_date, w.run_date)
}

#[derive(Debug, Default)]
struct MemoryState {
    snapshots: BTreeMap<NaiveDate, Snapshot>,
    windows: BTreeMap<WindowKey, RunWindow>,
    leases: BTreeMap<NaiveDate, Lease>,
}

impl MemoryState {
    fn upsert_window(&mut self, window: &RunWindow) {
        let key = window_key(window);
        let mut window = window.clone();
        if let Some(existing) = self.windows.get(&key) {
            window.created_at = existing.created_at;
        }
        self.windows.insert(key, window);
    }
}

/// Store backed by process memory. Reads share a `RwLock`; every write
/// takes it exclusively, so commits are atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemoryStore {
    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.state
            .write()
            .snapshots
            .insert(snapshot.run_date(), snapshot.clone());
        Ok(())
    }

    fn read_snapshot(&self, run_date: NaiveDate) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .state
            .read()
            .snapshots
            .get(&run_date)
            .filter(|s| !s.archived)
            .cloned())
    }

    fn find_latest_before(&self, date: NaiveDate) -> Result<Option<Snapshot>, StoreError> {
        Ok(self
            .state
            .read()
            .snapshots
            .range(..date)
            .rev()
            .map(|(_, s)| s)
            .find(|s| !s.archived)
            .cloned())
    }

    fn archive_before(&self, cutoff: NaiveDate, archived_on: NaiveDate) -> Result<SweepCounts, StoreError> {
        let mut state = self.state.write();
        let mut counts = SweepCounts::default();
        for snap in state.snapshots.range_mut(..cutoff).map(|(_, s)| s) {
            if !snap.archived {
                snap.archived = true;
                snap.archived_date = Some(archived_on);
                counts.records += snap.records.len();
            }
        }
        for w in state.windows.values_mut() {
            if !w.archived && w.start_date < cutoff {
                w.archived = true;
                w.archived_date = Some(archived_on);
                counts.windows += 1;
            }
        }
        Ok(counts)
    }

    fn purge_archived_before(&self, cutoff: NaiveDate) -> Result<SweepCounts, StoreError> {
        let mut state = self.state.write();
        let mut counts = SweepCounts::default();
        let expired = |archived: bool, date: Option<NaiveDate>| archived && date.map_or(false, |d| d < cutoff);
        state.snapshots.retain(|_, s| {
            let purge = expired(s.archived, s.archived_date);
            if purge {
                counts.records += s.records.len();
            }
            !purge
        });
        state.windows.retain(|_, w| {
            let purge = expired(w.archived, w.archived_date);
            if purge {
                counts.windows += 1;
            }
            !purge
        });
        Ok(counts)
    }

    fn upsert_run_window(&self, window: &RunWindow) -> Result<(), StoreError> {
        self.state.write().upsert_window(window);
        Ok(())
    }

    fn run_windows(&self, include_archived: bool) -> Result<Vec<RunWindow>, StoreError> {
        let mut out: Vec<RunWindow> = self
            .state
            .read()
            .windows
            .values()
            .filter(|w| include_archived || !w.archived)
            .cloned()
            .collect();
        out.sort_by_key(|w| (w.run_date, w.start_date, w.end_date));
        Ok(out)
    }

    fn schedule_state(&self, before: NaiveDate) -> Result<ScheduleState, StoreError> {
        let state = self.state.read();
        let prior: Vec<&RunWindow> = state.windows.values().filter(|w| w.run_date < before).collect();
        Ok(ScheduleState {
            last_run_date: prior.iter().map(|w| w.run_date).max(),
            first_validation_date: prior.iter().filter(|w| !w.archived).map(|w| w.start_date).min(),
        })
    }

    fn commit_run(&self, snapshot: &Snapshot, window: &RunWindow) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.snapshots.insert(snapshot.run_date(), snapshot.clone());
        state.upsert_window(window);
        Ok(())
    }

    fn try_acquire_lease(
        &self,
        run_date: NaiveDate,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseStatus, StoreError> {
        let mut state = self.state.write();
        if let Some(existing) = state.leases.get(&run_date) {
            if existing.holder != holder && existing.is_live(now) {
                return Ok(LeaseStatus::Held(existing.clone()));
            }
        }
        state.leases.insert(run_date, Lease::new(run_date, holder, now, ttl));
        Ok(LeaseStatus::Acquired)
    }

    fn release_lease(&self, run_date: NaiveDate, holder: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.leases.get(&run_date).map_or(false, |l| l.holder == holder) {
            state.leases.remove(&run_date);
        }
        Ok(())
    }
}
