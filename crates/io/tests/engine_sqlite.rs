use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use tempfile::tempdir;

use ledgerwatch_io::{DropFolderSource, JsonReportRenderer, SqliteStore};
use ledgerwatch_recon::model::{CanonicalField, IdentityState, RunType};
use ledgerwatch_recon::{Engine, EngineConfig, RunError, RunOptions, SnapshotStore};

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn drop_extract(root: &Path, day: &str, body: &str) {
    let folder = root.join(day);
    fs::create_dir_all(&folder).unwrap();
    fs::write(folder.join("purchase_register.csv"), body).unwrap();
}

const HEADER: &str = "PurchaseInvNo;VendorName;PurchaseInvDate;GSTIN;Taxable Value;CGST;SGST;Total Amount;MOP;Due Date\n";

fn engine(db: &Path, extracts: &Path, reports: &Path) -> Engine {
    let mut config = EngineConfig::default();
    config.run.workers = 2;
    Engine::new(
        config,
        Arc::new(SqliteStore::open(db).unwrap()),
        Arc::new(DropFolderSource::new(extracts)),
    )
    .unwrap()
    .with_renderer(Arc::new(JsonReportRenderer::new(reports)))
}

#[test]
fn runs_persist_across_processes() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("lw.db");
    let extracts = dir.path().join("extracts");
    let reports = dir.path().join("reports");

    drop_extract(
        &extracts,
        "2026-05-10",
        &format!(
            "{HEADER}INV1;Acme Traders;07/05/2026;27AAPFU0939F1ZV;\"1,000.00\";90;90;1180;NEFT;30/06/2026\n\
             INV2;Beta Supplies;08/05/2026;29AAGCB7383J1Z4;2000;180;180;2360;RTGS;30/06/2026\n"
        ),
    );
    drop_extract(
        &extracts,
        "2026-05-14",
        &format!(
            "{HEADER}INV1;Acme Traders;07/05/2026;27AAPFU0939F1ZV;1000;90;90;1180;NEFT;30/06/2026\n\
             INV3;Gamma Ltd;12/05/2026;07AAACR5055K1Z9;500;45;45;590;NEFT;30/06/2026\n"
        ),
    );

    let first = engine(&db, &extracts, &reports)
        .execute_run(d("2026-05-10"), &RunOptions::default())
        .unwrap();
    assert_eq!(first.window.run_type, RunType::Standard);
    assert_eq!(first.summary().partitions.added, 2);
    assert_eq!(first.summary().identity_key, Some(CanonicalField::InvoiceNo));

    // fresh engine and connection, same database
    let e = engine(&db, &extracts, &reports);
    assert!(!e.should_run_now(d("2026-05-13")).unwrap());
    assert!(e.should_run_now(d("2026-05-14")).unwrap());

    let second = e.execute_run(d("2026-05-14"), &RunOptions::default()).unwrap();
    let s = second.summary();
    assert_eq!(s.identity_resolution, IdentityState::Resolved);
    assert_eq!(s.run_type, RunType::Cumulative);
    assert_eq!((s.partitions.added, s.partitions.deleted, s.partitions.unchanged), (1, 1, 1));
    assert_eq!(s.cumulative.start, d("2026-05-06"));

    assert!(reports.join("report-2026-05-10.json").exists());
    assert!(reports.join("report-2026-05-14.json").exists());

    let store = SqliteStore::open(&db).unwrap();
    assert_eq!(store.run_windows(false).unwrap().len(), 2);
    let snap = store.read_snapshot(d("2026-05-14")).unwrap().unwrap();
    let inv1 = snap.records.iter().find(|r| r.record_key == "INV1").unwrap();
    assert_eq!(inv1.amount(CanonicalField::TaxableValue), Some(100_000));
    assert_eq!(inv1.date(CanonicalField::InvoiceDate), Some(d("2026-05-07")));
}

#[test]
fn rerun_same_day_replaces_snapshot() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("lw.db");
    let extracts = dir.path().join("extracts");
    let reports = dir.path().join("reports");
    drop_extract(
        &extracts,
        "2026-05-10",
        &format!("{HEADER}INV1;Acme Traders;07/05/2026;27AAPFU0939F1ZV;1000;90;90;1180;NEFT;30/06/2026\n"),
    );

    let e = engine(&db, &extracts, &reports);
    let a = e.execute_run(d("2026-05-10"), &RunOptions::default()).unwrap();
    let b = e
        .execute_run(
            d("2026-05-10"),
            &RunOptions {
                manual: true,
                holder: None,
            },
        )
        .unwrap();
    assert_eq!(a.summary().partitions, b.summary().partitions);
    assert_eq!(b.window.run_type, RunType::Manual);

    let store = SqliteStore::open(&db).unwrap();
    let windows = store.run_windows(true).unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].run_type, RunType::Manual);
    assert_eq!(store.read_snapshot(d("2026-05-10")).unwrap().unwrap().records.len(), 1);
}

#[test]
fn missing_drop_folder_writes_nothing() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("lw.db");
    let e = engine(&db, &dir.path().join("extracts"), &dir.path().join("reports"));

    let err = e.execute_run(d("2026-05-10"), &RunOptions::default()).unwrap_err();
    assert!(matches!(err, RunError::Acquisition(_)));
    let store = SqliteStore::open(&db).unwrap();
    assert!(store.run_windows(true).unwrap().is_empty());
    assert!(!dir.path().join("reports").exists());
}
