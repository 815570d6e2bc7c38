use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Canonical fields
// ---------------------------------------------------------------------------

/// The fixed set of fields every normalized invoice carries.
///
/// The snake_case name is also the persisted column name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    InvoiceNo,
    VoucherNo,
    InvId,
    VendorName,
    InvoiceDate,
    Gstin,
    Pan,
    HsnCode,
    TaxableValue,
    Cgst,
    Sgst,
    Igst,
    TotalAmount,
    Currency,
    Location,
    DueDate,
    UploadDate,
    Mop,
    CreatorName,
}

/// How a field's value is typed, compared, and rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Identifier-like: trimmed, upper-cased.
    Code,
    /// Free text: trimmed, whitespace-collapsed, lower-cased.
    Text,
    /// Money in integer minor units (paise/cents).
    Amount,
    /// Calendar date.
    Date,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 19] = [
        Self::InvoiceNo,
        Self::VoucherNo,
        Self::InvId,
        Self::VendorName,
        Self::InvoiceDate,
        Self::Gstin,
        Self::Pan,
        Self::HsnCode,
        Self::TaxableValue,
        Self::Cgst,
        Self::Sgst,
        Self::Igst,
        Self::TotalAmount,
        Self::Currency,
        Self::Location,
        Self::DueDate,
        Self::UploadDate,
        Self::Mop,
        Self::CreatorName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvoiceNo => "invoice_no",
            Self::VoucherNo => "voucher_no",
            Self::InvId => "inv_id",
            Self::VendorName => "vendor_name",
            Self::InvoiceDate => "invoice_date",
            Self::Gstin => "gstin",
            Self::Pan => "pan",
            Self::HsnCode => "hsn_code",
            Self::TaxableValue => "taxable_value",
            Self::Cgst => "cgst",
            Self::Sgst => "sgst",
            Self::Igst => "igst",
            Self::TotalAmount => "total_amount",
            Self::Currency => "currency",
            Self::Location => "location",
            Self::DueDate => "due_date",
            Self::UploadDate => "upload_date",
            Self::Mop => "mop",
            Self::CreatorName => "creator_name",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Self::InvoiceNo
            | Self::VoucherNo
            | Self::InvId
            | Self::Gstin
            | Self::Pan
            | Self::HsnCode
            | Self::Currency => FieldKind::Code,
            Self::VendorName | Self::Location | Self::Mop | Self::CreatorName => FieldKind::Text,
            Self::TaxableValue | Self::Cgst | Self::Sgst | Self::Igst | Self::TotalAmount => {
                FieldKind::Amount
            }
            Self::InvoiceDate | Self::DueDate | Self::UploadDate => FieldKind::Date,
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("unknown canonical field: {s}"))
    }
}

/// Fields covered by the content hash, in hashing order.
/// Identity, monetary, and tax fields only.
pub const FINGERPRINT_FIELDS: [CanonicalField; 11] = [
    CanonicalField::InvoiceNo,
    CanonicalField::VendorName,
    CanonicalField::InvoiceDate,
    CanonicalField::Gstin,
    CanonicalField::Pan,
    CanonicalField::HsnCode,
    CanonicalField::TaxableValue,
    CanonicalField::Cgst,
    CanonicalField::Sgst,
    CanonicalField::Igst,
    CanonicalField::TotalAmount,
];

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Empty,
    Text(String),
    /// Integer minor units.
    Amount(i64),
    Date(NaiveDate),
}

static EMPTY: FieldValue = FieldValue::Empty;

impl FieldValue {
    /// Null and whitespace-only text are the same thing.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_amount(&self) -> Option<i64> {
        match self {
            Self::Amount(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Normalized representation used for hashing and comparison.
    pub fn canonical(&self, kind: FieldKind) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(s) => match kind {
                FieldKind::Code => s.trim().to_uppercase(),
                FieldKind::Text => collapse_whitespace(s).to_lowercase(),
                FieldKind::Amount | FieldKind::Date => s.trim().to_string(),
            },
            Self::Amount(v) => format_minor(*v),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Render minor units with exactly two decimals: `-1234` → `"-12.34"`.
pub fn format_minor(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// Ordered PASS < WARNING < FAIL so `max()` yields the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Pass,
    Warning,
    Fail,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Warning => write!(f, "WARNING"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<CanonicalField>,
}

impl Issue {
    pub fn new(code: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity,
            message: message.into(),
            field: None,
        }
    }

    pub fn on(mut self, field: CanonicalField) -> Self {
        self.field = Some(field);
        self
    }
}

// ---------------------------------------------------------------------------
// Run windows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    /// First run: nothing to re-validate yet.
    Standard,
    /// Re-validates the whole cumulative range.
    Cumulative,
    /// Explicitly forced outside the cadence.
    Manual,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Cumulative => "cumulative",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "cumulative" => Ok(Self::Cumulative),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown run type: {other}")),
        }
    }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Number of calendar days covered, both ends included.
    pub fn days(&self) -> u32 {
        let n = (self.end - self.start).num_days() + 1;
        n.max(0) as u32
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Run-window metadata stamped on a snapshot and each of its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowMeta {
    pub run_date: NaiveDate,
    pub run_type: RunType,
    pub batch: DateRange,
    pub cumulative: DateRange,
}

/// Persisted record of one validation run. Unique on `(start_date, end_date, run_date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub run_date: NaiveDate,
    pub run_type: RunType,
    pub cumulative_start: NaiveDate,
    pub cumulative_end: NaiveDate,
    pub total_days_validated: u32,
    pub archived: bool,
    pub archived_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl RunWindow {
    pub fn from_meta(meta: &WindowMeta, created_at: DateTime<Utc>) -> Self {
        Self {
            start_date: meta.batch.start,
            end_date: meta.batch.end,
            run_date: meta.run_date,
            run_type: meta.run_type,
            cumulative_start: meta.cumulative.start,
            cumulative_end: meta.cumulative.end,
            total_days_validated: meta.cumulative.days(),
            archived: false,
            archived_date: None,
            created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Records + snapshots
// ---------------------------------------------------------------------------

/// A normalized, fixed-shape invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Unique within a snapshot; assigned when the snapshot is built.
    #[serde(default)]
    pub record_key: String,
    pub fields: BTreeMap<CanonicalField, FieldValue>,
    pub content_hash: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowMeta>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    /// Position in the extract table (0-based).
    #[serde(default)]
    pub source_row: usize,
}

impl CanonicalRecord {
    /// Every canonical field present and empty.
    pub fn empty(captured_at: DateTime<Utc>) -> Self {
        Self {
            record_key: String::new(),
            fields: CanonicalField::ALL
                .iter()
                .map(|f| (*f, FieldValue::Empty))
                .collect(),
            content_hash: String::new(),
            captured_at,
            window: None,
            issues: Vec::new(),
            source_row: 0,
        }
    }

    pub fn get(&self, field: CanonicalField) -> &FieldValue {
        self.fields.get(&field).unwrap_or(&EMPTY)
    }

    pub fn set(&mut self, field: CanonicalField, value: FieldValue) {
        self.fields.insert(field, value);
    }

    /// Text value, or `""` when the field holds anything else.
    pub fn text(&self, field: CanonicalField) -> &str {
        self.get(field).as_text().unwrap_or("")
    }

    pub fn amount(&self, field: CanonicalField) -> Option<i64> {
        self.get(field).as_amount()
    }

    pub fn date(&self, field: CanonicalField) -> Option<NaiveDate> {
        self.get(field).as_date()
    }

    /// Normalized value of `field`, `None` when empty.
    pub fn canonical(&self, field: CanonicalField) -> Option<String> {
        let value = self.get(field);
        if value.is_empty() {
            return None;
        }
        Some(value.canonical(field.kind()))
    }

    /// Worst severity among attached issues.
    pub fn status(&self) -> Severity {
        self.issues
            .iter()
            .map(|i| i.severity)
            .max()
            .unwrap_or(Severity::Pass)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub window: WindowMeta,
    pub records: Vec<CanonicalRecord>,
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// A fresh, live snapshot; stamps the window onto every record.
    pub fn new(window: WindowMeta, mut records: Vec<CanonicalRecord>, created_at: DateTime<Utc>) -> Self {
        for r in &mut records {
            r.window = Some(window);
        }
        Self {
            window,
            records,
            archived: false,
            archived_date: None,
            created_at,
        }
    }

    pub fn run_date(&self) -> NaiveDate {
        self.window.run_date
    }
}

// ---------------------------------------------------------------------------
// Reconciliation output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: CanonicalField,
    pub previous: String,
    pub current: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModifiedRecord {
    pub key: String,
    pub previous: CanonicalRecord,
    pub current: CanonicalRecord,
    pub changes: Vec<FieldChange>,
}

impl ModifiedRecord {
    pub fn changed_fields(&self) -> Vec<CanonicalField> {
        self.changes.iter().map(|c| c.field).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    Resolved,
    Degraded,
}

impl fmt::Display for IdentityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub field: CanonicalField,
    pub uniqueness: f64,
    pub in_current: bool,
    pub in_previous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityResolution {
    pub state: IdentityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<CanonicalField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub candidates: Vec<CandidateScore>,
}

impl IdentityResolution {
    pub fn is_degraded(&self) -> bool {
        self.state == IdentityState::Degraded
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionCounts {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    pub identity: IdentityResolution,
    pub counts: PartitionCounts,
    pub added: Vec<CanonicalRecord>,
    pub modified: Vec<ModifiedRecord>,
    pub deleted: Vec<CanonicalRecord>,
    pub unchanged: Vec<CanonicalRecord>,
}

// ---------------------------------------------------------------------------
// Summary + report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pass: usize,
    pub warning: usize,
    pub fail: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrgentItem {
    pub record_key: String,
    pub invoice_no: String,
    pub vendor_name: String,
    pub status: Severity,
    pub reason: String,
}

/// What the notifier receives: counts plus a bounded urgent list.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_date: NaiveDate,
    pub run_type: RunType,
    pub batch: DateRange,
    pub cumulative: DateRange,
    pub total_records: usize,
    pub status: StatusCounts,
    pub partitions: PartitionCounts,
    pub identity_resolution: IdentityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_key: Option<CanonicalField>,
    pub urgent: Vec<UrgentItem>,
    /// Urgent items left off the list by the cap.
    pub urgent_truncated: usize,
}

/// What the renderer receives: the full reconciliation plus per-record status.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub meta: ReportMeta,
    pub summary: RunSummary,
    pub reconciliation: ReconciliationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportMeta {
    pub engine_version: String,
    pub run_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names_round_trip() {
        for f in CanonicalField::ALL {
            assert_eq!(f.as_str().parse::<CanonicalField>().unwrap(), f);
        }
        assert!("amount".parse::<CanonicalField>().is_err());
    }

    #[test]
    fn empty_text_is_empty() {
        assert!(FieldValue::Empty.is_empty());
        assert!(FieldValue::Text("   ".into()).is_empty());
        assert!(!FieldValue::Amount(0).is_empty());
    }

    #[test]
    fn canonical_rendering_per_kind() {
        let code = FieldValue::Text(" 07aaacr5055k1z9 ".into());
        assert_eq!(code.canonical(FieldKind::Code), "07AAACR5055K1Z9");
        let text = FieldValue::Text("  ABC   Technologies Pvt Ltd ".into());
        assert_eq!(text.canonical(FieldKind::Text), "abc technologies pvt ltd");
        assert_eq!(FieldValue::Amount(-1234).canonical(FieldKind::Amount), "-12.34");
        assert_eq!(FieldValue::Amount(5).canonical(FieldKind::Amount), "0.05");
    }

    #[test]
    fn status_is_worst_issue() {
        let mut r = CanonicalRecord::empty(Utc::now());
        assert_eq!(r.status(), Severity::Pass);
        r.issues.push(Issue::new("A", Severity::Warning, "w"));
        assert_eq!(r.status(), Severity::Warning);
        r.issues.push(Issue::new("B", Severity::Fail, "f"));
        r.issues.push(Issue::new("C", Severity::Warning, "w"));
        assert_eq!(r.status(), Severity::Fail);
    }

    #[test]
    fn date_range_days_inclusive() {
        let r = DateRange::new(
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2026, 1, 4).unwrap(),
        );
        assert_eq!(r.days(), 4);
        assert!(r.contains(NaiveDate::from_ymd_opt(2026, 1, 4).unwrap()));
    }
}
