// Run summary notifier that writes to the log

use tracing::{info, warn};

use ledgerwatch_recon::model::IdentityState;
use ledgerwatch_recon::report::Notifier;
use ledgerwatch_recon::{DeliveryError, RunSummary};

/// Logs the summary and each urgent item. Mail/chat delivery plugs in
/// behind the same trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, summary: &RunSummary) -> Result<(), DeliveryError> {
        info!(
            run_date = %summary.run_date,
            run_type = %summary.run_type,
            total = summary.total_records,
            fail = summary.status.fail,
            warning = summary.status.warning,
            added = summary.partitions.added,
            modified = summary.partitions.modified,
            deleted = summary.partitions.deleted,
            "run summary"
        );
        if summary.identity_resolution == IdentityState::Degraded {
            warn!("no stable invoice identity this run; all records reported as added");
        }
        for item in &summary.urgent {
            warn!(
                invoice = %item.invoice_no,
                vendor = %item.vendor_name,
                status = %item.status,
                reason = %item.reason,
                "needs attention"
            );
        }
        if summary.urgent_truncated > 0 {
            warn!(more = summary.urgent_truncated, "urgent list truncated");
        }
        Ok(())
    }
}
