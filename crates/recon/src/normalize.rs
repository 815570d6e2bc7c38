//! Raw extract rows to canonical records.
//!
//! Header resolution is a pure function over an ordered alias table: exact
//! alias matches first, then keyword scoring with exclusion tokens. Value
//! coercion never fails the row; a value that cannot be parsed leaves the
//! field empty and attaches a WARNING issue.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, info};

use crate::config::{FieldAliases, NormalizeConfig};
use crate::model::{CanonicalField, CanonicalRecord, FieldKind, FieldValue, Issue, Severity};
use crate::source::{ExtractTable, LedgerExtract, RawRow};

pub const UNPARSEABLE_AMOUNT: &str = "UNPARSEABLE_AMOUNT";
pub const UNPARSEABLE_DATE: &str = "UNPARSEABLE_DATE";

/// Resolved source header per canonical field.
pub type ColumnMap = BTreeMap<CanonicalField, String>;

// ---------------------------------------------------------------------------
// Alias table
// ---------------------------------------------------------------------------

/// Ordered header aliases, match keywords, and exclusion tokens per field.
#[derive(Debug, Clone)]
pub struct AliasTable {
    entries: BTreeMap<CanonicalField, FieldAliases>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn entry(aliases: &[&str], keywords: &[&str], exclude: &[&str]) -> FieldAliases {
    FieldAliases {
        aliases: strings(aliases),
        keywords: strings(keywords),
        exclude: strings(exclude),
    }
}

impl AliasTable {
    /// Header names seen in ERP / portal invoice exports.
    pub fn builtin() -> Self {
        use CanonicalField::*;
        let entries = CanonicalField::ALL
            .iter()
            .map(|&field| {
                let e = match field {
                    InvoiceNo => entry(
                        &["PurchaseInvNo", "Invoice No", "Invoice Number", "Bill No"],
                        &["invoiceno", "invno", "invoicenumber", "billno"],
                        &["date", "amount", "value"],
                    ),
                    VoucherNo => entry(&["VoucherNo", "Voucher Number"], &["voucher"], &["date"]),
                    InvId => entry(&["InvID", "Invoice ID"], &["invid", "invoiceid"], &["date"]),
                    VendorName => entry(
                        &["VendorName", "Vendor", "Supplier Name", "Party Name"],
                        &["vendor", "supplier", "party"],
                        &["gstin", "pan", "code"],
                    ),
                    InvoiceDate => entry(
                        &["PurchaseInvDate", "Invoice Date", "Inv Date", "Bill Date", "Date"],
                        &["invdate", "invoicedate", "billdate"],
                        &["due", "upload"],
                    ),
                    Gstin => entry(&["GSTIN", "GST No", "GST Number"], &["gstin", "gstno"], &[]),
                    Pan => entry(&["PAN", "PAN No"], &["pan"], &["company"]),
                    HsnCode => entry(
                        &["HSN Code", "HSN", "SAC", "HSN/SAC", "SAC Code"],
                        &["hsn", "sac"],
                        &["transaction", "amount", "value", "rate"],
                    ),
                    TaxableValue => entry(
                        &["Taxable Value", "Taxable Amount", "Basic Amount"],
                        &["taxable"],
                        &[],
                    ),
                    Cgst => entry(&["CGST", "CGST Amount"], &["cgst"], &["rate"]),
                    Sgst => entry(&["SGST", "SGST Amount", "UTGST"], &["sgst", "utgst"], &["rate"]),
                    Igst => entry(&["IGST", "IGST Amount"], &["igst"], &["rate"]),
                    TotalAmount => entry(
                        &["Total Amount", "Total", "Invoice Amount", "Amount", "Total Invoice Value"],
                        &["total", "amount", "amt", "value"],
                        &["tax", "gst", "rate"],
                    ),
                    Currency => entry(&["Currency", "Curr"], &["currency"], &[]),
                    Location => entry(&["Location", "Branch", "Place of Supply"], &["location", "branch"], &[]),
                    DueDate => entry(&["Due Date", "Payment Due"], &["due"], &["amount"]),
                    UploadDate => entry(&["UploadDate", "Uploaded On"], &["upload"], &["by"]),
                    Mop => entry(
                        &["MOP", "Mode of Payment", "Payment Mode"],
                        &["mop", "paymentmode", "modeofpayment"],
                        &[],
                    ),
                    CreatorName => entry(
                        &["CreatorName", "Created By", "Uploaded By"],
                        &["creator", "createdby"],
                        &[],
                    ),
                };
                (field, e)
            })
            .collect();
        Self { entries }
    }

    /// Built-in table with configured fields replacing their built-in entry.
    pub fn with_overrides(overrides: &BTreeMap<CanonicalField, FieldAliases>) -> Self {
        let mut table = Self::builtin();
        for (field, aliases) in overrides {
            table.entries.insert(*field, aliases.clone());
        }
        table
    }

    pub fn get(&self, field: CanonicalField) -> Option<&FieldAliases> {
        self.entries.get(&field)
    }
}

// ---------------------------------------------------------------------------
// Header resolution
// ---------------------------------------------------------------------------

/// Lowercase alphanumerics only: "Invoice_No." and "invoice no" fold alike.
fn fold(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn exact_alias<'h>(aliases: &FieldAliases, headers: &'h [String], claimed: &HashSet<&str>) -> Option<&'h str> {
    for alias in &aliases.aliases {
        let want = fold(alias);
        if want.is_empty() {
            continue;
        }
        if let Some(h) = headers
            .iter()
            .find(|h| !claimed.contains(h.as_str()) && fold(h) == want)
        {
            return Some(h.as_str());
        }
    }
    None
}

fn keyword_score(aliases: &FieldAliases, header: &str) -> usize {
    let folded = fold(header);
    if aliases
        .exclude
        .iter()
        .map(|t| fold(t))
        .any(|t| !t.is_empty() && folded.contains(&t))
    {
        return 0;
    }
    aliases
        .keywords
        .iter()
        .map(|k| fold(k))
        .filter(|k| !k.is_empty() && folded.contains(k.as_str()))
        .map(|k| k.len())
        .sum()
}

/// Resolve one field against `headers` (which must be sorted).
///
/// Returns the first header equal to an alias (in alias order), otherwise the
/// highest keyword-scoring header with no exclusion token. Ties go to the
/// earliest header. Headers in `claimed` are skipped.
pub fn resolve_column<'h>(
    aliases: &FieldAliases,
    headers: &'h [String],
    claimed: &HashSet<&str>,
) -> Option<&'h str> {
    if let Some(h) = exact_alias(aliases, headers, claimed) {
        return Some(h);
    }
    let mut best: Option<(&'h str, usize)> = None;
    for h in headers.iter().filter(|h| !claimed.contains(h.as_str())) {
        let score = keyword_score(aliases, h);
        if score > 0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((h.as_str(), score));
        }
    }
    best.map(|(h, _)| h)
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Chosen extract table and its resolved columns.
#[derive(Debug, Clone)]
pub struct TableChoice<'a> {
    pub index: usize,
    pub table: &'a ExtractTable,
    pub columns: ColumnMap,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    table: AliasTable,
    min_resolved_fields: usize,
}

impl Normalizer {
    pub fn new(config: &NormalizeConfig) -> Self {
        Self {
            table: AliasTable::with_overrides(&config.fields),
            min_resolved_fields: config.min_resolved_fields,
        }
    }

    /// Map canonical fields to headers. Header order does not matter.
    ///
    /// Exact aliases are resolved for every field before any keyword scoring,
    /// so a fuzzy match never steals a header another field names exactly.
    pub fn map_headers(&self, headers: &[String]) -> ColumnMap {
        let mut sorted: Vec<String> = headers.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut claimed: HashSet<&str> = HashSet::new();
        let mut map = ColumnMap::new();

        for field in CanonicalField::ALL {
            let Some(aliases) = self.table.get(field) else { continue };
            if let Some(h) = exact_alias(aliases, &sorted, &claimed) {
                claimed.insert(h);
                map.insert(field, h.to_string());
            }
        }
        for field in CanonicalField::ALL {
            if map.contains_key(&field) {
                continue;
            }
            let Some(aliases) = self.table.get(field) else { continue };
            if let Some(h) = resolve_column(aliases, &sorted, &claimed) {
                claimed.insert(h);
                map.insert(field, h.to_string());
            }
        }
        map
    }

    /// Pick the table to normalize from a multi-table extract.
    ///
    /// The first table with rows that resolves at least `min_resolved_fields`
    /// wins; otherwise the one resolving the most (earlier on ties).
    pub fn select_table<'a>(&self, extract: &'a LedgerExtract) -> Option<TableChoice<'a>> {
        let mut best: Option<TableChoice<'a>> = None;
        for (index, table) in extract.tables.iter().enumerate() {
            if table.rows.is_empty() {
                continue;
            }
            let columns = self.map_headers(&table.header_union());
            debug!(table = %table.name, resolved = columns.len(), "mapped extract table");
            if columns.len() >= self.min_resolved_fields {
                info!(table = %table.name, resolved = columns.len(), "selected extract table");
                return Some(TableChoice { index, table, columns });
            }
            if best.as_ref().map_or(true, |b| columns.len() > b.columns.len()) {
                best = Some(TableChoice { index, table, columns });
            }
        }
        if let Some(b) = &best {
            info!(
                table = %b.table.name,
                resolved = b.columns.len(),
                min_resolved = self.min_resolved_fields,
                "no table met the resolved-field threshold, using best match"
            );
        }
        best
    }

    /// Build a fully shaped record from one row. Never fails.
    pub fn normalize_row(
        &self,
        row: &RawRow,
        columns: &ColumnMap,
        captured_at: DateTime<Utc>,
        source_row: usize,
    ) -> CanonicalRecord {
        let mut record = CanonicalRecord::empty(captured_at);
        record.source_row = source_row;

        for (&field, header) in columns {
            let raw = row.get(header).map(String::as_str).unwrap_or("");
            match coerce(field, raw) {
                Ok(value) => record.set(field, value),
                Err(issue) => {
                    debug!(row = source_row, field = %field, raw, "unparseable value");
                    record.issues.push(issue);
                }
            }
        }
        record
    }
}

fn coerce(field: CanonicalField, raw: &str) -> Result<FieldValue, Issue> {
    let trimmed = raw.trim();
    if is_blank(trimmed) {
        return Ok(FieldValue::Empty);
    }
    match field.kind() {
        FieldKind::Code | FieldKind::Text => Ok(FieldValue::Text(trimmed.to_string())),
        FieldKind::Amount => match parse_amount(trimmed) {
            Ok(Some(v)) => Ok(FieldValue::Amount(v)),
            Ok(None) => Ok(FieldValue::Empty),
            Err(e) => Err(Issue::new(
                UNPARSEABLE_AMOUNT,
                Severity::Warning,
                format!("{field}: cannot parse \"{trimmed}\" as an amount ({e})"),
            )
            .on(field)),
        },
        FieldKind::Date => match parse_date(trimmed) {
            Some(d) => Ok(FieldValue::Date(d)),
            None => Err(Issue::new(
                UNPARSEABLE_DATE,
                Severity::Warning,
                format!("{field}: cannot parse \"{trimmed}\" as a date"),
            )
            .on(field)),
        },
    }
}

/// Spreadsheet exports write missing cells as these.
fn is_blank(s: &str) -> bool {
    s.is_empty()
        || s.eq_ignore_ascii_case("nan")
        || s.eq_ignore_ascii_case("none")
        || s.eq_ignore_ascii_case("null")
}

// ---------------------------------------------------------------------------
// Value parsing
// ---------------------------------------------------------------------------

const CURRENCY_TOKENS: [&str; 6] = ["INR", "RS.", "RS", "USD", "EUR", "GBP"];

/// Parse a money string into integer minor units.
///
/// Accepts currency symbols and codes, thousands separators, a leading sign,
/// and parenthesized negatives. More than two decimals round half away from
/// zero. Blank input is `Ok(None)`.
pub fn parse_amount(raw: &str) -> Result<Option<i64>, String> {
    let mut s = raw.trim().to_uppercase();
    if is_blank(&s) {
        return Ok(None);
    }
    for token in CURRENCY_TOKENS {
        s = s.replace(token, "");
    }
    let s: String = s
        .chars()
        .filter(|c| !matches!(c, '₹' | '$' | '€' | '£' | ',') && !c.is_whitespace())
        .collect();
    if s.is_empty() {
        return Err("no digits".into());
    }

    let (paren_negative, s) = match s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, s.as_str()),
    };
    let (sign_negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if paren_negative && sign_negative {
        return Err("double negative".into());
    }

    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, f),
        None => (s, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err("no digits".into());
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("unexpected characters in \"{s}\""));
    }

    let whole: i64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().map_err(|e| format!("bad integer part: {e}"))?
    };
    let frac = frac_part.as_bytes();
    let digit = |i: usize| frac.get(i).map_or(0, |b| i64::from(b - b'0'));
    let mut cents = digit(0) * 10 + digit(1);
    if digit(2) >= 5 {
        cents += 1;
    }

    let minor = whole
        .checked_mul(100)
        .and_then(|v| v.checked_add(cents))
        .ok_or_else(|| "amount out of range".to_string())?;
    Ok(Some(if paren_negative || sign_negative { -minor } else { minor }))
}

const DATE_FORMATS: [&str; 10] = [
    "%Y-%m-%d",
    "%d-%m-%Y",
    "%d/%m/%Y",
    "%d.%m.%Y",
    "%Y/%m/%d",
    "%d-%b-%Y",
    "%d %b %Y",
    "%d-%b-%y",
    "%b %d, %Y",
    "%d %B %Y",
];

/// Parse the date formats invoice exports use. A trailing time part
/// (`2026-01-05 10:30:00`, `2026-01-05T10:30:00`) is ignored.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    let try_all = |s: &str| {
        DATE_FORMATS
            .iter()
            .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
    };
    if let Some(d) = try_all(s) {
        return Some(d);
    }
    let head = s.split(['T', ' ']).next().unwrap_or(s);
    if head != s {
        return try_all(head);
    }
    None
}
