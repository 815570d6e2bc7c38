// CSV drop-folder ledger source

use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use ledgerwatch_recon::source::{ExtractRequest, ExtractTable, LedgerExtract, LedgerSource, RawRow};
use ledgerwatch_recon::SourceError;

const DELIMITERS: [u8; 4] = [b',', b'\t', b';', b'|'];

/// Reads `<root>/<run_date>/*.csv`, one table per file, in file-name order.
///
/// Whatever acquires the extract (export job, browser automation, a person)
/// drops files there before the run.
#[derive(Debug, Clone)]
pub struct DropFolderSource {
    root: PathBuf,
}

impl DropFolderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn folder_for(&self, request: &ExtractRequest) -> PathBuf {
        self.root.join(request.run_date.format("%Y-%m-%d").to_string())
    }
}

impl LedgerSource for DropFolderSource {
    fn fetch(&self, request: &ExtractRequest) -> Result<LedgerExtract, SourceError> {
        let folder = self.folder_for(request);
        if !folder.is_dir() {
            return Err(SourceError::Unavailable(format!("no extract folder at {}", folder.display())));
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&folder)
            .map_err(|e| SourceError::Failed(format!("cannot list {}: {e}", folder.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|x| x.to_str())
                        .map_or(false, |x| x.eq_ignore_ascii_case("csv"))
            })
            .collect();
        files.sort();

        let mut extract = LedgerExtract::default();
        for path in &files {
            let table = read_table(path)?;
            debug!(file = %path.display(), rows = table.rows.len(), "read extract file");
            extract.tables.push(table);
        }

        if extract.row_count() == 0 {
            return Err(SourceError::Unavailable(format!(
                "{} has no data rows ({} csv files)",
                folder.display(),
                files.len()
            )));
        }
        info!(
            folder = %folder.display(),
            tables = extract.tables.len(),
            rows = extract.row_count(),
            range = %request.range,
            "loaded drop-folder extract"
        );
        Ok(extract)
    }
}

/// Parse one CSV file into a table named after the file stem.
pub fn read_table(path: &Path) -> Result<ExtractTable, SourceError> {
    let content = read_file_as_utf8(path)
        .map_err(|e| SourceError::Failed(format!("cannot read {}: {e}", path.display())))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    parse_table(&name, &content).map_err(|e| SourceError::Failed(format!("{}: {e}", path.display())))
}

/// Parse CSV text with a header row. Blank lines and rows with no values are skipped.
pub fn parse_table(name: &str, content: &str) -> Result<ExtractTable, String> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(content))
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| e.to_string())?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| e.to_string())?;
        if record.iter().all(|v| v.trim().is_empty()) {
            continue;
        }
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .filter(|(h, _)| !h.is_empty())
            .map(|(h, v)| (h.clone(), v.to_string()))
            .collect();
        rows.push(row);
    }
    Ok(ExtractTable::new(name, headers, rows))
}

/// Pick the delimiter that splits the header line into the most fields.
/// Ties keep the earlier candidate; a single-column file gets a comma.
fn sniff_delimiter(content: &str) -> u8 {
    let Some(header) = content.lines().find(|l| !l.trim().is_empty()) else {
        return b',';
    };
    let mut best = b',';
    let mut widest = 1usize;
    for &delim in &DELIMITERS {
        let width = csv::ReaderBuilder::new()
            .delimiter(delim)
            .has_headers(false)
            .flexible(true)
            .from_reader(header.as_bytes())
            .records()
            .next()
            .and_then(|r| r.ok())
            .map_or(1, |r| r.len());
        if width > widest {
            widest = width;
            best = delim;
        }
    }
    best
}

/// Read a file as UTF-8, falling back to Windows-1252 (common for Excel-exported CSVs).
pub fn read_file_as_utf8(path: &Path) -> Result<String, std::io::Error> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;
    match String::from_utf8(bytes) {
        Ok(s) => Ok(s),
        Err(e) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(e.as_bytes());
            Ok(decoded.into_owned())
        }
    }
}
