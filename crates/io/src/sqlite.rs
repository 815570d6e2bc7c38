// SQLite snapshot store

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use ledgerwatch_recon::model::{
    CanonicalField, CanonicalRecord, DateRange, FieldKind, FieldValue, Issue, RunType, RunWindow, Snapshot,
    WindowMeta,
};
use ledgerwatch_recon::schedule::ScheduleState;
use ledgerwatch_recon::store::{Lease, LeaseStatus, SnapshotStore, SweepCounts};
use ledgerwatch_recon::StoreError;

/// Bump when the schema changes in a way older binaries can't read.
pub const SCHEMA_VERSION: u32 = 2;

// One column per canonical field, named by `CanonicalField::as_str`.
// Amounts are integer minor units, dates ISO-8601 text. Every record row
// carries its run window and archive state; `snapshots` mirrors them per
// run date for lookups.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshots (
    run_date TEXT PRIMARY KEY,
    run_type TEXT NOT NULL,
    batch_start TEXT NOT NULL,
    batch_end TEXT NOT NULL,
    cumulative_start TEXT NOT NULL,
    cumulative_end TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    archived_date TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS invoice_snapshots (
    record_key TEXT NOT NULL,
    run_date TEXT NOT NULL,
    invoice_no TEXT,
    voucher_no TEXT,
    inv_id TEXT,
    vendor_name TEXT,
    invoice_date TEXT,
    gstin TEXT,
    pan TEXT,
    hsn_code TEXT,
    taxable_value INTEGER,
    cgst INTEGER,
    sgst INTEGER,
    igst INTEGER,
    total_amount INTEGER,
    currency TEXT,
    location TEXT,
    due_date TEXT,
    upload_date TEXT,
    mop TEXT,
    creator_name TEXT,
    content_hash TEXT NOT NULL,
    issues TEXT NOT NULL DEFAULT '[]',
    source_row INTEGER NOT NULL,
    run_type TEXT NOT NULL,
    batch_start TEXT NOT NULL,
    batch_end TEXT NOT NULL,
    cumulative_start TEXT NOT NULL,
    cumulative_end TEXT NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    archived_date TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (record_key, run_date)
);

CREATE INDEX IF NOT EXISTS idx_invoice_snapshots_run_date ON invoice_snapshots (run_date);
CREATE INDEX IF NOT EXISTS idx_invoice_snapshots_archived ON invoice_snapshots (archived, archived_date);

CREATE TABLE IF NOT EXISTS run_windows (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    run_date TEXT NOT NULL,
    run_type TEXT NOT NULL,
    cumulative_start TEXT NOT NULL,
    cumulative_end TEXT NOT NULL,
    total_days_validated INTEGER NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0,
    archived_date TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (start_date, end_date, run_date)
);

CREATE TABLE IF NOT EXISTS run_leases (
    run_date TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

const WINDOW_COLUMNS: &str = "start_date, end_date, run_date, run_type, cumulative_start, cumulative_end, \
     total_days_validated, archived, archived_date, created_at";

/// Default database location under the platform data dir.
pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("ledgerwatch").join("ledgerwatch.db"))
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_iso(s: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| StoreError::Corrupt(format!("bad date {s:?}: {e}")))
}

fn parse_opt_iso(s: Option<String>) -> Result<Option<NaiveDate>, StoreError> {
    s.as_deref().map(parse_iso).transpose()
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn parse_run_type(s: &str) -> Result<RunType, StoreError> {
    s.parse().map_err(StoreError::Corrupt)
}

fn to_sql(value: &FieldValue) -> Value {
    match value {
        FieldValue::Empty => Value::Null,
        FieldValue::Text(s) => Value::Text(s.clone()),
        FieldValue::Amount(v) => Value::Integer(*v),
        FieldValue::Date(d) => Value::Text(iso(*d)),
    }
}

fn from_sql(field: CanonicalField, value: Value) -> Result<FieldValue, StoreError> {
    match value {
        Value::Null => Ok(FieldValue::Empty),
        Value::Integer(v) => Ok(FieldValue::Amount(v)),
        Value::Text(s) => match field.kind() {
            FieldKind::Date => Ok(NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map(FieldValue::Date)
                .unwrap_or(FieldValue::Text(s))),
            _ => Ok(FieldValue::Text(s)),
        },
        other => Err(StoreError::Corrupt(format!("{field} holds unexpected {other:?}"))),
    }
}

fn field_columns() -> String {
    CanonicalField::ALL.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(", ")
}

// ---------------------------------------------------------------------------
// Row shapes
// ---------------------------------------------------------------------------

struct SnapshotRow {
    run_type: String,
    batch_start: String,
    batch_end: String,
    cumulative_start: String,
    cumulative_end: String,
    archived: bool,
    archived_date: Option<String>,
    created_at: String,
}

struct RecordRow {
    record_key: String,
    fields: Vec<Value>,
    content_hash: String,
    issues: String,
    source_row: i64,
    created_at: String,
}

struct WindowRow {
    start_date: String,
    end_date: String,
    run_date: String,
    run_type: String,
    cumulative_start: String,
    cumulative_end: String,
    total_days_validated: i64,
    archived: bool,
    archived_date: Option<String>,
    created_at: String,
}

impl WindowRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            start_date: row.get(0)?,
            end_date: row.get(1)?,
            run_date: row.get(2)?,
            run_type: row.get(3)?,
            cumulative_start: row.get(4)?,
            cumulative_end: row.get(5)?,
            total_days_validated: row.get(6)?,
            archived: row.get(7)?,
            archived_date: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_window(self) -> Result<RunWindow, StoreError> {
        Ok(RunWindow {
            start_date: parse_iso(&self.start_date)?,
            end_date: parse_iso(&self.end_date)?,
            run_date: parse_iso(&self.run_date)?,
            run_type: parse_run_type(&self.run_type)?,
            cumulative_start: parse_iso(&self.cumulative_start)?,
            cumulative_end: parse_iso(&self.cumulative_end)?,
            total_days_validated: u32::try_from(self.total_days_validated)
                .map_err(|_| StoreError::Corrupt(format!("bad day count {}", self.total_days_validated)))?,
            archived: self.archived,
            archived_date: parse_opt_iso(self.archived_date)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Snapshot store in a single SQLite file. One connection, serialized by a
/// mutex; every multi-statement write runs in a transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(backend)?;
        debug!(path = %path.display(), "opened snapshot database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        let version: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |r| r.get(0))
            .optional()
            .map_err(backend)?;
        match version {
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )
                .map_err(backend)?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(StoreError::Corrupt(format!(
                    "database schema version {v} is not supported (expected {SCHEMA_VERSION})"
                )))
            }
        }
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn write_snapshot_tx(tx: &Transaction<'_>, snapshot: &Snapshot) -> Result<(), StoreError> {
        let run_date = iso(snapshot.run_date());
        let w = &snapshot.window;
        tx.execute("DELETE FROM invoice_snapshots WHERE run_date = ?1", params![run_date])
            .map_err(backend)?;
        tx.execute(
            "INSERT OR REPLACE INTO snapshots (run_date, run_type, batch_start, batch_end, cumulative_start, \
             cumulative_end, archived, archived_date, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_date,
                w.run_type.as_str(),
                iso(w.batch.start),
                iso(w.batch.end),
                iso(w.cumulative.start),
                iso(w.cumulative.end),
                snapshot.archived,
                snapshot.archived_date.map(iso),
                snapshot.created_at.to_rfc3339(),
            ],
        )
        .map_err(backend)?;

        let n_fields = CanonicalField::ALL.len();
        let placeholders: Vec<String> = (1..=n_fields + 13).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO invoice_snapshots (record_key, run_date, {}, content_hash, issues, source_row, \
             run_type, batch_start, batch_end, cumulative_start, cumulative_end, archived, archived_date, \
             created_at) VALUES ({})",
            field_columns(),
            placeholders.join(", ")
        );
        let mut stmt = tx.prepare(&sql).map_err(backend)?;
        for r in &snapshot.records {
            let issues = serde_json::to_string(&r.issues)
                .map_err(|e| StoreError::Backend(format!("cannot encode issues: {e}")))?;
            let mut values = Vec::with_capacity(n_fields + 13);
            values.push(Value::Text(r.record_key.clone()));
            values.push(Value::Text(run_date.clone()));
            values.extend(CanonicalField::ALL.iter().map(|f| to_sql(r.get(*f))));
            values.push(Value::Text(r.content_hash.clone()));
            values.push(Value::Text(issues));
            values.push(Value::Integer(r.source_row as i64));
            values.push(Value::Text(w.run_type.as_str().to_string()));
            values.push(Value::Text(iso(w.batch.start)));
            values.push(Value::Text(iso(w.batch.end)));
            values.push(Value::Text(iso(w.cumulative.start)));
            values.push(Value::Text(iso(w.cumulative.end)));
            values.push(Value::Integer(i64::from(snapshot.archived)));
            values.push(snapshot.archived_date.map_or(Value::Null, |d| Value::Text(iso(d))));
            values.push(Value::Text(r.captured_at.to_rfc3339()));
            stmt.execute(params_from_iter(values.iter())).map_err(backend)?;
        }
        Ok(())
    }

    fn upsert_window_tx(conn: &Connection, window: &RunWindow) -> Result<(), StoreError> {
        conn.execute(
            &format!(
                "INSERT INTO run_windows ({WINDOW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT (start_date, end_date, run_date) DO UPDATE SET \
                 run_type = excluded.run_type, cumulative_start = excluded.cumulative_start, \
                 cumulative_end = excluded.cumulative_end, total_days_validated = excluded.total_days_validated, \
                 archived = excluded.archived, archived_date = excluded.archived_date"
            ),
            params![
                iso(window.start_date),
                iso(window.end_date),
                iso(window.run_date),
                window.run_type.as_str(),
                iso(window.cumulative_start),
                iso(window.cumulative_end),
                i64::from(window.total_days_validated),
                window.archived,
                window.archived_date.map(iso),
                window.created_at.to_rfc3339(),
            ],
        )
        .map_err(backend)?;
        Ok(())
    }

    /// Live snapshot for a run date, optionally including archived ones.
    fn load_snapshot(conn: &Connection, run_date: NaiveDate, include_archived: bool) -> Result<Option<Snapshot>, StoreError> {
        let key = iso(run_date);
        let header = conn
            .query_row(
                "SELECT run_type, batch_start, batch_end, cumulative_start, cumulative_end, archived, \
                 archived_date, created_at FROM snapshots WHERE run_date = ?1",
                params![key],
                |row| {
                    Ok(SnapshotRow {
                        run_type: row.get(0)?,
                        batch_start: row.get(1)?,
                        batch_end: row.get(2)?,
                        cumulative_start: row.get(3)?,
                        cumulative_end: row.get(4)?,
                        archived: row.get(5)?,
                        archived_date: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(backend)?;
        let Some(header) = header else { return Ok(None) };
        if header.archived && !include_archived {
            return Ok(None);
        }

        let window = WindowMeta {
            run_date,
            run_type: parse_run_type(&header.run_type)?,
            batch: DateRange::new(parse_iso(&header.batch_start)?, parse_iso(&header.batch_end)?),
            cumulative: DateRange::new(parse_iso(&header.cumulative_start)?, parse_iso(&header.cumulative_end)?),
        };

        let n_fields = CanonicalField::ALL.len();
        let sql = format!(
            "SELECT record_key, {}, content_hash, issues, source_row, created_at \
             FROM invoice_snapshots WHERE run_date = ?1 AND (archived = 0 OR ?2) \
             ORDER BY source_row, record_key",
            field_columns()
        );
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(params![key, include_archived], |row| {
                let mut fields = Vec::with_capacity(n_fields);
                for i in 0..n_fields {
                    fields.push(row.get::<_, Value>(i + 1)?);
                }
                Ok(RecordRow {
                    record_key: row.get(0)?,
                    fields,
                    content_hash: row.get(n_fields + 1)?,
                    issues: row.get(n_fields + 2)?,
                    source_row: row.get(n_fields + 3)?,
                    created_at: row.get(n_fields + 4)?,
                })
            })
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let mut record = CanonicalRecord::empty(parse_timestamp(&row.created_at)?);
            for (field, value) in CanonicalField::ALL.iter().zip(row.fields) {
                record.set(*field, from_sql(*field, value)?);
            }
            record.record_key = row.record_key;
            record.content_hash = row.content_hash;
            record.issues = serde_json::from_str::<Vec<Issue>>(&row.issues)
                .map_err(|e| StoreError::Corrupt(format!("bad issues for {}: {e}", record.record_key)))?;
            record.source_row = usize::try_from(row.source_row)
                .map_err(|_| StoreError::Corrupt(format!("bad source row {}", row.source_row)))?;
            record.window = Some(window);
            records.push(record);
        }

        Ok(Some(Snapshot {
            window,
            records,
            archived: header.archived,
            archived_date: parse_opt_iso(header.archived_date)?,
            created_at: parse_timestamp(&header.created_at)?,
        }))
    }
}

impl SnapshotStore for SqliteStore {
    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        Self::write_snapshot_tx(&tx, snapshot)?;
        tx.commit().map_err(backend)
    }

    fn read_snapshot(&self, run_date: NaiveDate) -> Result<Option<Snapshot>, StoreError> {
        Self::load_snapshot(&self.conn.lock(), run_date, false)
    }

    fn find_latest_before(&self, date: NaiveDate) -> Result<Option<Snapshot>, StoreError> {
        let conn = self.conn.lock();
        let latest: Option<String> = conn
            .query_row(
                "SELECT MAX(run_date) FROM snapshots WHERE archived = 0 AND run_date < ?1",
                params![iso(date)],
                |r| r.get(0),
            )
            .map_err(backend)?;
        match latest {
            Some(d) => Self::load_snapshot(&conn, parse_iso(&d)?, false),
            None => Ok(None),
        }
    }

    fn archive_before(&self, cutoff: NaiveDate, archived_on: NaiveDate) -> Result<SweepCounts, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        let records = tx
            .execute(
                "UPDATE invoice_snapshots SET archived = 1, archived_date = ?2 WHERE archived = 0 AND run_date < ?1",
                params![iso(cutoff), iso(archived_on)],
            )
            .map_err(backend)?;
        tx.execute(
            "UPDATE snapshots SET archived = 1, archived_date = ?2 WHERE archived = 0 AND run_date < ?1",
            params![iso(cutoff), iso(archived_on)],
        )
        .map_err(backend)?;
        let windows = tx
            .execute(
                "UPDATE run_windows SET archived = 1, archived_date = ?2 WHERE archived = 0 AND start_date < ?1",
                params![iso(cutoff), iso(archived_on)],
            )
            .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(SweepCounts { records, windows })
    }

    fn purge_archived_before(&self, cutoff: NaiveDate) -> Result<SweepCounts, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        let records = tx
            .execute(
                "DELETE FROM invoice_snapshots WHERE archived = 1 AND archived_date < ?1",
                params![iso(cutoff)],
            )
            .map_err(backend)?;
        tx.execute(
            "DELETE FROM snapshots WHERE archived = 1 AND archived_date < ?1",
            params![iso(cutoff)],
        )
        .map_err(backend)?;
        let windows = tx
            .execute(
                "DELETE FROM run_windows WHERE archived = 1 AND archived_date < ?1",
                params![iso(cutoff)],
            )
            .map_err(backend)?;
        tx.commit().map_err(backend)?;
        if records + windows > 0 {
            info!(%cutoff, records, windows, "purged archived rows");
        }
        Ok(SweepCounts { records, windows })
    }

    fn upsert_run_window(&self, window: &RunWindow) -> Result<(), StoreError> {
        Self::upsert_window_tx(&self.conn.lock(), window)
    }

    fn run_windows(&self, include_archived: bool) -> Result<Vec<RunWindow>, StoreError> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {WINDOW_COLUMNS} FROM run_windows WHERE archived = 0 OR ?1 \
             ORDER BY run_date, start_date, end_date"
        );
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(params![include_archived], WindowRow::from_row)
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(backend)?;
        rows.into_iter().map(WindowRow::into_window).collect()
    }

    fn schedule_state(&self, before: NaiveDate) -> Result<ScheduleState, StoreError> {
        let conn = self.conn.lock();
        let (last, first): (Option<String>, Option<String>) = conn
            .query_row(
                "SELECT MAX(run_date), MIN(CASE WHEN archived = 0 THEN start_date END) \
                 FROM run_windows WHERE run_date < ?1",
                params![iso(before)],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .map_err(backend)?;
        Ok(ScheduleState {
            last_run_date: parse_opt_iso(last)?,
            first_validation_date: parse_opt_iso(first)?,
        })
    }

    fn commit_run(&self, snapshot: &Snapshot, window: &RunWindow) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        Self::write_snapshot_tx(&tx, snapshot)?;
        Self::upsert_window_tx(&tx, window)?;
        tx.commit().map_err(backend)?;
        debug!(run_date = %snapshot.run_date(), records = snapshot.records.len(), "run committed");
        Ok(())
    }

    fn try_acquire_lease(
        &self,
        run_date: NaiveDate,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LeaseStatus, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(backend)?;
        let existing: Option<(String, String, String)> = tx
            .query_row(
                "SELECT holder, acquired_at, expires_at FROM run_leases WHERE run_date = ?1",
                params![iso(run_date)],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .map_err(backend)?;
        if let Some((other, acquired_at, expires_at)) = existing {
            let lease = Lease {
                run_date,
                holder: other,
                acquired_at: parse_timestamp(&acquired_at)?,
                expires_at: parse_timestamp(&expires_at)?,
            };
            if lease.holder != holder && lease.is_live(now) {
                return Ok(LeaseStatus::Held(lease));
            }
        }
        let lease = Lease::new(run_date, holder, now, ttl);
        tx.execute(
            "INSERT OR REPLACE INTO run_leases (run_date, holder, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                iso(run_date),
                lease.holder,
                lease.acquired_at.to_rfc3339(),
                lease.expires_at.to_rfc3339()
            ],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(LeaseStatus::Acquired)
    }

    fn release_lease(&self, run_date: NaiveDate, holder: &str) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM run_leases WHERE run_date = ?1 AND holder = ?2",
                params![iso(run_date), holder],
            )
            .map_err(backend)?;
        Ok(())
    }
}
