//! Field-level validation rules.
//!
//! Every rule is a pure predicate over one record plus a read-only context;
//! it yields at most one issue. Rules do no IO, so any historical window can
//! be re-validated and produce the same result.

use std::collections::{BTreeMap, HashSet};

use chrono::{Months, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::RulesConfig;
use crate::model::{CanonicalField, CanonicalRecord, Issue, Severity};

use crate::model::CanonicalField as F;

static GSTIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9]{2}[A-Z]{5}[0-9]{4}[A-Z][1-9A-Z]Z[0-9A-Z]$").expect("GSTIN pattern compiles")
});
static PAN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{5}[0-9]{4}[A-Z]$").expect("PAN pattern compiles"));

// ---------------------------------------------------------------------------
// GSTIN / PAN helpers
// ---------------------------------------------------------------------------

const BASE36: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

pub fn is_valid_gstin_format(gstin: &str) -> bool {
    GSTIN_RE.is_match(gstin)
}

pub fn is_valid_pan_format(pan: &str) -> bool {
    PAN_RE.is_match(pan)
}

/// Mod-36 check character over the first 14 GSTIN characters.
pub fn gstin_check_char(first14: &str) -> Option<char> {
    if first14.len() != 14 {
        return None;
    }
    let mut sum = 0u32;
    for (i, b) in first14.bytes().enumerate() {
        let idx = BASE36.iter().position(|c| *c == b)? as u32;
        let product = idx * if i % 2 == 0 { 1 } else { 2 };
        sum += product / 36 + product % 36;
    }
    let check = (36 - sum % 36) % 36;
    Some(BASE36[check as usize] as char)
}

/// Characters 3..12 of a GSTIN are the holder's PAN.
pub fn pan_from_gstin(gstin: &str) -> Option<&str> {
    gstin.get(2..12)
}

// ---------------------------------------------------------------------------
// HSN / SAC rates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeType {
    Hsn,
    Sac,
}

/// (code, type, GST rate percent)
const HSN_RATES: [(&str, CodeType, u32); 12] = [
    ("998313", CodeType::Sac, 18),
    ("998596", CodeType::Sac, 18),
    ("997331", CodeType::Sac, 12),
    ("9992", CodeType::Sac, 0),
    ("2106", CodeType::Hsn, 18),
    ("3004", CodeType::Hsn, 12),
    ("8517", CodeType::Hsn, 18),
    ("8415", CodeType::Hsn, 28),
    ("8703", CodeType::Hsn, 28),
    ("8528", CodeType::Hsn, 18),
    ("9603", CodeType::Hsn, 12),
    ("0401", CodeType::Hsn, 5),
];

/// Expected rate for a code: exact entry, else the longest table entry the
/// code starts with (`21069099` falls under `2106`).
pub fn expected_gst_rate(code: &str) -> Option<(CodeType, u32)> {
    let code = code.trim();
    HSN_RATES
        .iter()
        .filter(|(c, _, _)| code.starts_with(c))
        .max_by_key(|(c, _, _)| c.len())
        .map(|(_, t, r)| (*t, *r))
}

// ---------------------------------------------------------------------------
// Rule plumbing
// ---------------------------------------------------------------------------

/// Read-only inputs shared by every rule in a run.
#[derive(Debug, Clone)]
pub struct RuleContext<'a> {
    pub today: NaiveDate,
    pub config: &'a RulesConfig,
    /// `(invoice_no, vendor_name)` pairs seen more than once in the batch.
    pub duplicates: &'a HashSet<(String, String)>,
}

pub trait Rule: Send + Sync {
    fn code(&self) -> &'static str;
    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue>;
}

fn duplicate_key(record: &CanonicalRecord) -> Option<(String, String)> {
    let no = record.canonical(F::InvoiceNo)?;
    let vendor = record.canonical(F::VendorName).unwrap_or_default();
    Some((no, vendor))
}

/// Invoice number + vendor pairs that occur more than once.
pub fn find_duplicates(records: &[CanonicalRecord]) -> HashSet<(String, String)> {
    let mut seen: BTreeMap<(String, String), usize> = BTreeMap::new();
    for key in records.iter().filter_map(duplicate_key) {
        *seen.entry(key).or_default() += 1;
    }
    seen.into_iter().filter(|(_, n)| *n > 1).map(|(k, _)| k).collect()
}

/// Ordered rule list.
pub struct RuleSet {
    rules: Vec<Box<dyn Rule>>,
}

impl std::fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.rules.iter().map(|r| r.code())).finish()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl RuleSet {
    pub fn new(rules: Vec<Box<dyn Rule>>) -> Self {
        Self { rules }
    }

    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(RequiredFields),
            Box::new(RecommendedFields),
            Box::new(GstinFormat),
            Box::new(GstinChecksum),
            Box::new(PanFormat),
            Box::new(PanMatchesGstin),
            Box::new(AmountSanity),
            Box::new(TotalConsistency),
            Box::new(DuplicateInvoice),
            Box::new(InvoiceDateNotFuture),
            Box::new(InvoiceDateAge),
            Box::new(TaxTypeConsistency),
            Box::new(HsnRate),
            Box::new(LateUpload),
            Box::new(PaymentDue),
        ])
    }

    pub fn codes(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.code()).collect()
    }

    pub fn evaluate(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Vec<Issue> {
        self.rules.iter().filter_map(|r| r.check(record, ctx)).collect()
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

fn missing(record: &CanonicalRecord, fields: &[CanonicalField]) -> Vec<CanonicalField> {
    fields.iter().copied().filter(|f| record.get(*f).is_empty()).collect()
}

fn join(fields: &[CanonicalField]) -> String {
    fields.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(", ")
}

pub struct RequiredFields;

impl Rule for RequiredFields {
    fn code(&self) -> &'static str {
        "MISSING_REQUIRED"
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        let gone = missing(record, &ctx.config.required);
        let first = *gone.first()?;
        Some(Issue::new(self.code(), Severity::Fail, format!("missing required field(s): {}", join(&gone))).on(first))
    }
}

pub struct RecommendedFields;

impl Rule for RecommendedFields {
    fn code(&self) -> &'static str {
        "MISSING_RECOMMENDED"
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        let gone = missing(record, &ctx.config.recommended);
        let first = *gone.first()?;
        Some(Issue::new(self.code(), Severity::Warning, format!("missing field(s): {}", join(&gone))).on(first))
    }
}

pub struct GstinFormat;

impl Rule for GstinFormat {
    fn code(&self) -> &'static str {
        "INVALID_GSTIN"
    }

    fn check(&self, record: &CanonicalRecord, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let gstin = record.canonical(F::Gstin)?;
        if is_valid_gstin_format(&gstin) {
            return None;
        }
        Some(Issue::new(self.code(), Severity::Fail, format!("GSTIN \"{gstin}\" is not well-formed")).on(F::Gstin))
    }
}

pub struct GstinChecksum;

impl Rule for GstinChecksum {
    fn code(&self) -> &'static str {
        "GSTIN_CHECKSUM"
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        if !ctx.config.verify_gstin_checksum {
            return None;
        }
        let gstin = record.canonical(F::Gstin)?;
        if !is_valid_gstin_format(&gstin) {
            return None;
        }
        let expected = gstin_check_char(&gstin[..14])?;
        let actual = gstin[14..].chars().next()?;
        if expected == actual {
            return None;
        }
        Some(
            Issue::new(
                self.code(),
                Severity::Warning,
                format!("GSTIN \"{gstin}\" check character is {actual}, expected {expected}"),
            )
            .on(F::Gstin),
        )
    }
}

pub struct PanFormat;

impl Rule for PanFormat {
    fn code(&self) -> &'static str {
        "INVALID_PAN"
    }

    fn check(&self, record: &CanonicalRecord, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let pan = record.canonical(F::Pan)?;
        if is_valid_pan_format(&pan) {
            return None;
        }
        Some(Issue::new(self.code(), Severity::Fail, format!("PAN \"{pan}\" is not well-formed")).on(F::Pan))
    }
}

pub struct PanMatchesGstin;

impl Rule for PanMatchesGstin {
    fn code(&self) -> &'static str {
        "PAN_GSTIN_MISMATCH"
    }

    fn check(&self, record: &CanonicalRecord, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let gstin = record.canonical(F::Gstin)?;
        let pan = record.canonical(F::Pan)?;
        if !is_valid_gstin_format(&gstin) {
            return None;
        }
        let embedded = pan_from_gstin(&gstin)?;
        if embedded == pan {
            return None;
        }
        Some(
            Issue::new(
                self.code(),
                Severity::Fail,
                format!("PAN {pan} does not match PAN {embedded} embedded in GSTIN"),
            )
            .on(F::Pan),
        )
    }
}

const AMOUNT_FIELDS: [CanonicalField; 5] = [F::TaxableValue, F::Cgst, F::Sgst, F::Igst, F::TotalAmount];

pub struct AmountSanity;

impl Rule for AmountSanity {
    fn code(&self) -> &'static str {
        "INVALID_AMOUNT"
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        if let Some(&field) = AMOUNT_FIELDS
            .iter()
            .find(|f| record.amount(**f).map_or(false, |v| v < 0))
        {
            return Some(Issue::new(self.code(), Severity::Fail, format!("{field} is negative")).on(field));
        }
        if ctx.config.require_positive_amount && record.amount(F::TotalAmount) == Some(0) {
            return Some(Issue::new(self.code(), Severity::Fail, "total_amount is zero").on(F::TotalAmount));
        }
        None
    }
}

/// Taxable value plus taxes should add up to the total, within one unit.
pub struct TotalConsistency;

impl Rule for TotalConsistency {
    fn code(&self) -> &'static str {
        "TOTAL_MISMATCH"
    }

    fn check(&self, record: &CanonicalRecord, _ctx: &RuleContext<'_>) -> Option<Issue> {
        let taxable = record.amount(F::TaxableValue)?;
        let total = record.amount(F::TotalAmount)?;
        let tax: i128 = [F::Cgst, F::Sgst, F::Igst]
            .iter()
            .filter_map(|f| record.amount(*f))
            .map(i128::from)
            .sum();
        let wide = i128::from(taxable) + tax;
        if (wide - i128::from(total)).abs() <= 100 {
            return None;
        }
        let Ok(expected) = i64::try_from(wide) else {
            return Some(
                Issue::new(self.code(), Severity::Warning, "taxable value + taxes is out of range")
                    .on(F::TotalAmount),
            );
        };
        Some(
            Issue::new(
                self.code(),
                Severity::Warning,
                format!(
                    "taxable value + taxes = {}, total_amount = {}",
                    crate::model::format_minor(expected),
                    crate::model::format_minor(total)
                ),
            )
            .on(F::TotalAmount),
        )
    }
}

pub struct DuplicateInvoice;

impl Rule for DuplicateInvoice {
    fn code(&self) -> &'static str {
        "DUPLICATE_INVOICE"
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        let key = duplicate_key(record)?;
        if !ctx.duplicates.contains(&key) {
            return None;
        }
        Some(
            Issue::new(
                self.code(),
                Severity::Warning,
                format!("invoice {} appears more than once for this vendor", key.0),
            )
            .on(F::InvoiceNo),
        )
    }
}

pub struct InvoiceDateNotFuture;

impl Rule for InvoiceDateNotFuture {
    fn code(&self) -> &'static str {
        "FUTURE_INVOICE_DATE"
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        let date = record.date(F::InvoiceDate)?;
        (date > ctx.today).then(|| {
            Issue::new(self.code(), Severity::Fail, format!("invoice date {date} is in the future")).on(F::InvoiceDate)
        })
    }
}

pub struct InvoiceDateAge;

impl Rule for InvoiceDateAge {
    fn code(&self) -> &'static str {
        "STALE_INVOICE_DATE"
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        let date = record.date(F::InvoiceDate)?;
        let limit = ctx
            .today
            .checked_sub_months(Months::new(12 * ctx.config.max_age_years))?;
        (date < limit).then(|| {
            Issue::new(
                self.code(),
                Severity::Warning,
                format!("invoice date {date} is more than {} year(s) old", ctx.config.max_age_years),
            )
            .on(F::InvoiceDate)
        })
    }
}

/// Intra-state supplies carry CGST + SGST in equal halves, inter-state
/// supplies carry IGST. With `home_state_code` set, the supplier's GSTIN
/// state decides which of the two is expected.
pub struct TaxTypeConsistency;

impl Rule for TaxTypeConsistency {
    fn code(&self) -> &'static str {
        "TAX_TYPE_MISMATCH"
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        let positive = |f: CanonicalField| record.amount(f).map_or(false, |v| v > 0);
        if positive(F::Igst) && (positive(F::Cgst) || positive(F::Sgst)) {
            return Some(
                Issue::new(self.code(), Severity::Fail, "both IGST and CGST/SGST charged").on(F::Igst),
            );
        }
        let cgst = i128::from(record.amount(F::Cgst).unwrap_or(0));
        let sgst = i128::from(record.amount(F::Sgst).unwrap_or(0));
        if (cgst - sgst).abs() > 100 {
            return Some(
                Issue::new(self.code(), Severity::Warning, "CGST and SGST are not equal halves").on(F::Sgst),
            );
        }

        let home = ctx.config.home_state_code.as_deref()?;
        let gstin = record.canonical(F::Gstin)?;
        if !is_valid_gstin_format(&gstin) {
            return None;
        }
        let intra = &gstin[..2] == home;
        if intra && positive(F::Igst) {
            return Some(
                Issue::new(self.code(), Severity::Fail, "IGST charged on an intra-state supply").on(F::Igst),
            );
        }
        if !intra && (positive(F::Cgst) || positive(F::Sgst)) {
            return Some(
                Issue::new(
                    self.code(),
                    Severity::Fail,
                    format!("CGST/SGST charged on a supply from state {}", &gstin[..2]),
                )
                .on(F::Cgst),
            );
        }
        None
    }
}

pub struct HsnRate;

impl Rule for HsnRate {
    fn code(&self) -> &'static str {
        "HSN_RATE_MISMATCH"
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        let code = record.canonical(F::HsnCode)?;
        let (_, expected) = expected_gst_rate(&code)?;
        let taxable = record.amount(F::TaxableValue).filter(|v| *v > 0)?;
        let taxes: Vec<i128> = [F::Cgst, F::Sgst, F::Igst]
            .iter()
            .filter_map(|f| record.amount(*f))
            .map(i128::from)
            .collect();
        if taxes.is_empty() {
            return None;
        }
        let effective = taxes.iter().sum::<i128>() as f64 * 100.0 / taxable as f64;
        if (effective - f64::from(expected)).abs() <= ctx.config.hsn_rate_tolerance_pct {
            return None;
        }
        Some(
            Issue::new(
                self.code(),
                Severity::Warning,
                format!("effective GST rate {effective:.2}% differs from {expected}% expected for {code}"),
            )
            .on(F::HsnCode),
        )
    }
}

pub struct LateUpload;

impl Rule for LateUpload {
    fn code(&self) -> &'static str {
        "LATE_UPLOAD"
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        let invoiced = record.date(F::InvoiceDate)?;
        let uploaded = record.date(F::UploadDate)?;
        let days = (uploaded - invoiced).num_days();
        let deadline = i64::from(ctx.config.upload_deadline_days);
        (days > deadline).then(|| {
            Issue::new(
                self.code(),
                Severity::Warning,
                format!("uploaded {days} days after invoice date ({} late)", days - deadline),
            )
            .on(F::UploadDate)
        })
    }
}

pub const OVERDUE: &str = "PAYMENT_OVERDUE";
pub const DUE_SOON: &str = "PAYMENT_DUE_SOON";

pub struct PaymentDue;

impl Rule for PaymentDue {
    fn code(&self) -> &'static str {
        OVERDUE
    }

    fn check(&self, record: &CanonicalRecord, ctx: &RuleContext<'_>) -> Option<Issue> {
        let due = record.date(F::DueDate)?;
        let days_left = (due - ctx.today).num_days();
        if days_left < 0 {
            return Some(
                Issue::new(OVERDUE, Severity::Warning, format!("payment was due {due}")).on(F::DueDate),
            );
        }
        (days_left <= i64::from(ctx.config.due_soon_days)).then(|| {
            Issue::new(DUE_SOON, Severity::Warning, format!("payment due {due} ({days_left} day(s) left)"))
                .on(F::DueDate)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldValue;
    use chrono::Utc;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn base() -> CanonicalRecord {
        let mut r = CanonicalRecord::empty(Utc::now());
        r.set(F::InvoiceNo, FieldValue::Text("INV-1".into()));
        r.set(F::VendorName, FieldValue::Text("Acme".into()));
        r.set(F::InvoiceDate, FieldValue::Date(d("2026-05-01")));
        r.set(F::TotalAmount, FieldValue::Amount(118_000));
        r.set(F::Mop, FieldValue::Text("NEFT".into()));
        r.set(F::DueDate, FieldValue::Date(d("2026-06-30")));
        r
    }

    fn run(record: &CanonicalRecord, config: &RulesConfig) -> Vec<Issue> {
        let dups = HashSet::new();
        let ctx = RuleContext {
            today: d("2026-05-10"),
            config,
            duplicates: &dups,
        };
        RuleSet::standard().evaluate(record, &ctx)
    }

    fn codes(issues: &[Issue]) -> Vec<&str> {
        issues.iter().map(|i| i.code.as_str()).collect()
    }

    #[test]
    fn standard_codes_are_distinct() {
        let codes = RuleSet::standard().codes();
        assert_eq!(codes.len(), 15);
        let unique: HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
        assert_eq!(codes[0], "MISSING_REQUIRED");
    }

    #[test]
    fn clean_record_passes() {
        assert!(run(&base(), &RulesConfig::default()).is_empty());
    }

    #[test]
    fn missing_required_is_single_fail() {
        let mut r = base();
        r.set(F::InvoiceNo, FieldValue::Empty);
        r.set(F::TotalAmount, FieldValue::Empty);
        let issues = run(&r, &RulesConfig::default());
        let req: Vec<_> = issues.iter().filter(|i| i.code == "MISSING_REQUIRED").collect();
        assert_eq!(req.len(), 1);
        assert_eq!(req[0].severity, Severity::Fail);
        assert!(req[0].message.contains("invoice_no, total_amount"));
    }

    #[test]
    fn missing_mop_warns() {
        let mut r = base();
        r.set(F::Mop, FieldValue::Empty);
        let issues = run(&r, &RulesConfig::default());
        assert_eq!(codes(&issues), vec!["MISSING_RECOMMENDED"]);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn gstin_checks() {
        assert_eq!(gstin_check_char("27AAPFU0939F1Z"), Some('V'));
        assert_eq!(gstin_check_char("29AAGCB7383J1Z"), Some('4'));
        assert_eq!(gstin_check_char("07ABCDE1234F1Z"), Some('2'));

        let mut r = base();
        r.set(F::Gstin, FieldValue::Text("07ABCDE1234F1Z5".into()));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec!["GSTIN_CHECKSUM"]);

        r.set(F::Gstin, FieldValue::Text("GSTIN-TBD".into()));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec!["INVALID_GSTIN"]);

        r.set(F::Gstin, FieldValue::Text("27aapfu0939f1zv".into()));
        assert!(run(&r, &RulesConfig::default()).is_empty());
    }

    #[test]
    fn pan_checks() {
        let mut r = base();
        r.set(F::Gstin, FieldValue::Text("07AAACR5055K1Z9".into()));
        r.set(F::Pan, FieldValue::Text("AAACR5055K".into()));
        assert!(run(&r, &RulesConfig::default()).is_empty());

        r.set(F::Pan, FieldValue::Text("AAPFU0939F".into()));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec!["PAN_GSTIN_MISMATCH"]);

        r.set(F::Pan, FieldValue::Text("12345".into()));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec!["INVALID_PAN", "PAN_GSTIN_MISMATCH"]);
    }

    #[test]
    fn amounts() {
        let mut r = base();
        r.set(F::TotalAmount, FieldValue::Amount(0));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec!["INVALID_AMOUNT"]);

        let lenient = RulesConfig {
            require_positive_amount: false,
            ..RulesConfig::default()
        };
        assert!(run(&r, &lenient).is_empty());

        r.set(F::Cgst, FieldValue::Amount(-5));
        assert_eq!(run(&r, &lenient)[0].field, Some(F::Cgst));
    }

    #[test]
    fn total_consistency() {
        let mut r = base();
        r.set(F::TaxableValue, FieldValue::Amount(100_000));
        r.set(F::Igst, FieldValue::Amount(18_000));
        assert!(run(&r, &RulesConfig::default()).is_empty());
        r.set(F::Igst, FieldValue::Amount(12_000));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec!["TOTAL_MISMATCH"]);
    }

    #[test]
    fn huge_amounts_warn_instead_of_overflowing() {
        let huge = crate::normalize::parse_amount("90000000000000000").unwrap().unwrap();
        let mut r = base();
        r.set(F::TaxableValue, FieldValue::Amount(huge));
        r.set(F::Igst, FieldValue::Amount(huge));
        r.set(F::TotalAmount, FieldValue::Amount(huge));
        r.set(F::HsnCode, FieldValue::Text("8471".into()));
        let issues = run(&r, &RulesConfig::default());
        let mismatch = issues.iter().find(|i| i.code == "TOTAL_MISMATCH").unwrap();
        assert_eq!(mismatch.severity, Severity::Warning);
        assert!(mismatch.message.contains("out of range"));
        assert!(issues.iter().all(|i| i.code != "HSN_RATE_MISMATCH" || i.severity == Severity::Warning));
    }

    #[test]
    fn duplicates_within_batch() {
        let a = base();
        let b = base();
        let mut c = base();
        c.set(F::VendorName, FieldValue::Text("Other".into()));
        let dups = find_duplicates(&[a.clone(), b, c.clone()]);
        assert_eq!(dups.len(), 1);
        let config = RulesConfig::default();
        let ctx = RuleContext {
            today: d("2026-05-10"),
            config: &config,
            duplicates: &dups,
        };
        assert_eq!(codes(&RuleSet::standard().evaluate(&a, &ctx)), vec!["DUPLICATE_INVOICE"]);
        assert!(RuleSet::standard().evaluate(&c, &ctx).is_empty());
    }

    #[test]
    fn invoice_dates() {
        let mut r = base();
        r.set(F::InvoiceDate, FieldValue::Date(d("2026-05-11")));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec!["FUTURE_INVOICE_DATE"]);
        r.set(F::InvoiceDate, FieldValue::Date(d("2024-05-09")));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec!["STALE_INVOICE_DATE"]);
        r.set(F::InvoiceDate, FieldValue::Date(d("2024-05-10")));
        assert!(run(&r, &RulesConfig::default()).is_empty());
    }

    #[test]
    fn tax_type_checked_without_home_state() {
        let mut r = base();
        r.set(F::TaxableValue, FieldValue::Amount(100_000));
        r.set(F::Cgst, FieldValue::Amount(9_000));
        r.set(F::Sgst, FieldValue::Amount(9_000));
        assert!(run(&r, &RulesConfig::default()).is_empty());

        r.set(F::Igst, FieldValue::Amount(18_000));
        r.set(F::TotalAmount, FieldValue::Amount(136_000));
        let issues = run(&r, &RulesConfig::default());
        assert_eq!(codes(&issues), vec!["TAX_TYPE_MISMATCH"]);
        assert_eq!(issues[0].severity, Severity::Fail);

        r.set(F::Igst, FieldValue::Empty);
        r.set(F::Sgst, FieldValue::Amount(4_000));
        r.set(F::TotalAmount, FieldValue::Amount(113_000));
        let issues = run(&r, &RulesConfig::default());
        assert_eq!(codes(&issues), vec!["TAX_TYPE_MISMATCH"]);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn tax_type_against_home_state() {
        let config = RulesConfig {
            home_state_code: Some("27".into()),
            ..RulesConfig::default()
        };
        let mut r = base();
        r.set(F::Gstin, FieldValue::Text("27AAPFU0939F1ZV".into()));
        r.set(F::Igst, FieldValue::Amount(18_000));
        assert_eq!(codes(&run(&r, &config)), vec!["TAX_TYPE_MISMATCH"]);

        r.set(F::Gstin, FieldValue::Text("29AAGCB7383J1Z4".into()));
        assert!(run(&r, &config).is_empty());

        r.set(F::Igst, FieldValue::Empty);
        r.set(F::Cgst, FieldValue::Amount(9_000));
        r.set(F::Sgst, FieldValue::Amount(9_000));
        assert_eq!(codes(&run(&r, &config)), vec!["TAX_TYPE_MISMATCH"]);
    }

    #[test]
    fn hsn_rate_lookup_and_rule() {
        assert_eq!(expected_gst_rate("8415"), Some((CodeType::Hsn, 28)));
        assert_eq!(expected_gst_rate("21069099"), Some((CodeType::Hsn, 18)));
        assert_eq!(expected_gst_rate("998313"), Some((CodeType::Sac, 18)));
        assert_eq!(expected_gst_rate("1234"), None);

        let mut r = base();
        r.set(F::HsnCode, FieldValue::Text("8415".into()));
        r.set(F::TaxableValue, FieldValue::Amount(100_000));
        r.set(F::Igst, FieldValue::Amount(18_000));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec!["HSN_RATE_MISMATCH"]);
        r.set(F::HsnCode, FieldValue::Text("8517".into()));
        assert!(run(&r, &RulesConfig::default()).is_empty());
    }

    #[test]
    fn late_upload() {
        let mut r = base();
        r.set(F::UploadDate, FieldValue::Date(d("2026-05-06")));
        assert!(run(&r, &RulesConfig::default()).is_empty());
        r.set(F::UploadDate, FieldValue::Date(d("2026-05-08")));
        let issues = run(&r, &RulesConfig::default());
        assert_eq!(codes(&issues), vec!["LATE_UPLOAD"]);
        assert!(issues[0].message.contains("2 late"));
    }

    #[test]
    fn payment_due() {
        let mut r = base();
        r.set(F::DueDate, FieldValue::Date(d("2026-05-09")));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec![OVERDUE]);
        r.set(F::DueDate, FieldValue::Date(d("2026-05-12")));
        assert_eq!(codes(&run(&r, &RulesConfig::default())), vec![DUE_SOON]);
        r.set(F::DueDate, FieldValue::Date(d("2026-05-13")));
        assert!(run(&r, &RulesConfig::default()).is_empty());
    }
}
