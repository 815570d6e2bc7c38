use crate::error::DeliveryError;
use crate::model::{
    CanonicalField, CanonicalRecord, ReconciliationResult, RunReport, RunSummary, Severity,
    StatusCounts, UrgentItem, WindowMeta,
};
use crate::rules::{DUE_SOON, OVERDUE};

/// Receives the full reconciliation result. Format is the implementor's business.
pub trait ReportRenderer: Send + Sync {
    fn render(&self, report: &RunReport) -> Result<(), DeliveryError>;
}

/// Receives the run summary. Transport is the implementor's business.
pub trait Notifier: Send + Sync {
    fn notify(&self, summary: &RunSummary) -> Result<(), DeliveryError>;
}

/// Discards reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRenderer;

impl ReportRenderer for NullRenderer {
    fn render(&self, _report: &RunReport) -> Result<(), DeliveryError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _summary: &RunSummary) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Lower ranks are more urgent.
fn urgency(record: &CanonicalRecord) -> Option<(u8, String)> {
    if let Some(issue) = record.issues.iter().find(|i| i.severity == Severity::Fail) {
        return Some((0, issue.message.clone()));
    }
    for (rank, code) in [(1, OVERDUE), (2, DUE_SOON)] {
        if let Some(issue) = record.issues.iter().find(|i| i.code == code) {
            return Some((rank, issue.message.clone()));
        }
    }
    None
}

/// Status counts, partition counts, and a bounded urgent list for `current`.
pub fn compute_summary(
    window: &WindowMeta,
    current: &[CanonicalRecord],
    result: &ReconciliationResult,
    max_urgent: usize,
) -> RunSummary {
    let mut status = StatusCounts::default();
    let mut urgent: Vec<(u8, UrgentItem)> = Vec::new();

    for r in current {
        let s = r.status();
        match s {
            Severity::Pass => status.pass += 1,
            Severity::Warning => status.warning += 1,
            Severity::Fail => status.fail += 1,
        }
        if let Some((rank, reason)) = urgency(r) {
            urgent.push((
                rank,
                UrgentItem {
                    record_key: r.record_key.clone(),
                    invoice_no: r.text(CanonicalField::InvoiceNo).to_string(),
                    vendor_name: r.text(CanonicalField::VendorName).to_string(),
                    status: s,
                    reason,
                },
            ));
        }
    }

    urgent.sort_by(|(ra, a), (rb, b)| (ra, &a.record_key).cmp(&(rb, &b.record_key)));
    let urgent_truncated = urgent.len().saturating_sub(max_urgent);
    let urgent = urgent.into_iter().take(max_urgent).map(|(_, item)| item).collect();

    RunSummary {
        run_date: window.run_date,
        run_type: window.run_type,
        batch: window.batch,
        cumulative: window.cumulative,
        total_records: current.len(),
        status,
        partitions: result.counts,
        identity_resolution: result.identity.state,
        identity_key: result.identity.key,
        urgent,
        urgent_truncated,
    }
}
