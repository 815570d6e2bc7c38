// JSON report renderer

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use ledgerwatch_recon::report::ReportRenderer;
use ledgerwatch_recon::{DeliveryError, RunReport};

const TARGET: &str = "json report";

/// Writes each run's report to `<dir>/report-<run_date>.json`, replacing
/// a report from an earlier run on the same day.
#[derive(Debug, Clone)]
pub struct JsonReportRenderer {
    dir: PathBuf,
}

impl JsonReportRenderer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, report: &RunReport) -> PathBuf {
        self.dir
            .join(format!("report-{}.json", report.summary.run_date.format("%Y-%m-%d")))
    }
}

fn failed(message: String) -> DeliveryError {
    DeliveryError::Failed {
        target: TARGET.to_string(),
        message,
    }
}

/// Write to a sibling temp file, then rename over `path`.
fn write_atomic(path: &Path, report: &RunReport) -> Result<(), DeliveryError> {
    let tmp = path.with_extension("json.tmp");
    {
        let file = File::create(&tmp).map_err(|e| failed(format!("cannot create {}: {e}", tmp.display())))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, report).map_err(|e| failed(e.to_string()))?;
        writer.write_all(b"\n").map_err(|e| failed(e.to_string()))?;
        writer.flush().map_err(|e| failed(e.to_string()))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| failed(format!("cannot move report into place: {e}")))
}

impl ReportRenderer for JsonReportRenderer {
    fn render(&self, report: &RunReport) -> Result<(), DeliveryError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| failed(format!("cannot create {}: {e}", self.dir.display())))?;
        let path = self.path_for(report);
        write_atomic(&path, report)?;
        info!(path = %path.display(), "report written");
        Ok(())
    }
}
