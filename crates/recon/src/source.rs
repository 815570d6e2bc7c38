use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::model::DateRange;

/// One raw row: header string to raw cell text.
pub type RawRow = BTreeMap<String, String>;

/// What the engine asks the extract source for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractRequest {
    /// Cumulative range being validated.
    pub range: DateRange,
    pub run_date: NaiveDate,
}

/// One sheet / file of an extract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractTable {
    pub name: String,
    /// Header row as found in the source, in source order.
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl ExtractTable {
    pub fn new(name: impl Into<String>, headers: Vec<String>, rows: Vec<RawRow>) -> Self {
        Self {
            name: name.into(),
            headers,
            rows,
        }
    }

    /// Build a table from rows alone; headers become the union of row keys.
    pub fn from_rows(name: impl Into<String>, rows: Vec<RawRow>) -> Self {
        let headers = rows
            .iter()
            .flat_map(|r| r.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self::new(name, headers, rows)
    }

    /// Declared headers plus any extra keys rows carry, sorted and deduplicated.
    pub fn header_union(&self) -> Vec<String> {
        let mut all: BTreeSet<String> = self.headers.iter().cloned().collect();
        for row in &self.rows {
            all.extend(row.keys().cloned());
        }
        all.into_iter().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerExtract {
    pub tables: Vec<ExtractTable>,
}

impl LedgerExtract {
    pub fn single(table: ExtractTable) -> Self {
        Self {
            tables: vec![table],
        }
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}

/// Supplies raw ledger rows for a date range.
///
/// Implementations return `SourceError::Unavailable` when there is nothing
/// for the range; an empty `Ok` extract is treated the same way by the engine.
pub trait LedgerSource: Send + Sync {
    fn fetch(&self, request: &ExtractRequest) -> Result<LedgerExtract, SourceError>;
}

/// Fixed in-memory extract. Useful for tests and replays.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    extract: LedgerExtract,
}

impl StaticSource {
    pub fn new(extract: LedgerExtract) -> Self {
        Self { extract }
    }

    pub fn from_rows(rows: Vec<RawRow>) -> Self {
        Self::new(LedgerExtract::single(ExtractTable::from_rows("rows", rows)))
    }
}

impl LedgerSource for StaticSource {
    fn fetch(&self, _request: &ExtractRequest) -> Result<LedgerExtract, SourceError> {
        Ok(self.extract.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn header_union_covers_ragged_rows() {
        let table = ExtractTable::new(
            "t",
            vec!["B".into(), "A".into()],
            vec![row(&[("A", "1")]), row(&[("C", "2")])],
        );
        assert_eq!(table.header_union(), vec!["A", "B", "C"]);
    }

    #[test]
    fn empty_extract_has_no_rows() {
        let extract = LedgerExtract::single(ExtractTable::new("t", vec!["A".into()], vec![]));
        assert!(extract.is_empty());
        assert_eq!(StaticSource::from_rows(vec![row(&[("A", "1")])])
            .fetch(&ExtractRequest {
                range: DateRange::new(
                    NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
                    NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
                ),
                run_date: NaiveDate::from_ymd_opt(2026, 1, 3).unwrap(),
            })
            .unwrap()
            .row_count(), 1);
    }
}
