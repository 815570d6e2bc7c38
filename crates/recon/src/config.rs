use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::CanonicalField;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Engine configuration, usually loaded from `ledgerwatch.toml`.
///
/// Every section has defaults, so an empty document is a valid config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub schedule: ScheduleConfig,
    pub identity: IdentityConfig,
    pub normalize: NormalizeConfig,
    pub rules: RulesConfig,
    pub run: RunConfig,
    pub source: RetryConfig,
    pub delivery: RetryConfig,
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Minimum days between two runs.
    pub cadence_days: u32,
    /// Length of the batch ending yesterday.
    pub batch_days: u32,
    /// Retention horizon: older data is archived and never re-validated.
    pub retention_days: u32,
    /// Archived rows older than this are hard-deleted by the sweep.
    pub purge_after_days: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cadence_days: 4,
            batch_days: 4,
            retention_days: 90,
            purge_after_days: 180,
        }
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    /// Key candidates in preference order.
    pub candidates: Vec<CanonicalField>,
    /// Minimum distinct-value ratio for a candidate to be usable.
    pub min_uniqueness: f64,
    /// Fields compared for keyed records. Defaults to every non-key field.
    pub compare_fields: Option<Vec<CanonicalField>>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            candidates: vec![
                CanonicalField::InvoiceNo,
                CanonicalField::VoucherNo,
                CanonicalField::InvId,
            ],
            min_uniqueness: 0.8,
            compare_fields: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Normalize
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormalizeConfig {
    /// A table resolving at least this many fields is accepted without
    /// looking at later tables.
    pub min_resolved_fields: usize,
    /// Per-field overrides of the built-in alias table.
    pub fields: BTreeMap<CanonicalField, FieldAliases>,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            min_resolved_fields: 5,
            fields: BTreeMap::new(),
        }
    }
}

/// Header matching rules for one canonical field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldAliases {
    /// Preferred header names, tried in order (case-insensitive, exact).
    pub aliases: Vec<String>,
    /// Substrings that score a header as a likely match.
    pub keywords: Vec<String>,
    /// Tokens that disqualify a header from keyword scoring.
    pub exclude: Vec<String>,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RulesConfig {
    /// Missing any of these fails the record.
    pub required: Vec<CanonicalField>,
    /// Missing any of these only warns.
    pub recommended: Vec<CanonicalField>,
    /// Total amount must be strictly positive (not just non-negative).
    pub require_positive_amount: bool,
    /// Invoices dated further back than this are flagged.
    pub max_age_years: u32,
    /// Two-digit GST state code of the buying entity. Without it the tax
    /// type check only catches mixed IGST + CGST/SGST and unequal halves;
    /// set it to also check intra- vs inter-state tax against the
    /// supplier's GSTIN.
    pub home_state_code: Option<String>,
    pub upload_deadline_days: u32,
    pub due_soon_days: u32,
    /// Allowed gap, in percentage points, between the effective tax rate
    /// and the HSN/SAC table rate.
    pub hsn_rate_tolerance_pct: f64,
    pub verify_gstin_checksum: bool,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            required: vec![
                CanonicalField::InvoiceNo,
                CanonicalField::VendorName,
                CanonicalField::InvoiceDate,
                CanonicalField::TotalAmount,
            ],
            recommended: vec![CanonicalField::Mop, CanonicalField::DueDate],
            require_positive_amount: true,
            max_age_years: 2,
            home_state_code: None,
            upload_deadline_days: 5,
            due_soon_days: 2,
            hsn_rate_tolerance_pct: 0.5,
            verify_gstin_checksum: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Run + retry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Worker threads for per-record normalization and validation.
    pub workers: usize,
    /// Cap on urgent items handed to the notifier.
    pub max_urgent: usize,
    /// Lease expiry; a crashed run stops blocking after this long.
    pub lease_ttl_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_urgent: 20,
            lease_ttl_secs: 6 * 60 * 60,
        }
    }
}

/// Timeout + bounded retry for calls to external collaborators.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff_ms: 1_000,
            timeout_secs: 300,
        }
    }
}

impl RetryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

impl EngineConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.schedule;
        if s.cadence_days == 0 {
            return Err(ConfigError::Validation("schedule.cadence_days must be > 0".into()));
        }
        if s.batch_days == 0 {
            return Err(ConfigError::Validation("schedule.batch_days must be > 0".into()));
        }
        if s.retention_days < s.batch_days {
            return Err(ConfigError::Validation(format!(
                "schedule.retention_days ({}) must be >= batch_days ({})",
                s.retention_days, s.batch_days
            )));
        }

        let id = &self.identity;
        if !(id.min_uniqueness > 0.0 && id.min_uniqueness <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "identity.min_uniqueness must be in (0, 1], got {}",
                id.min_uniqueness
            )));
        }
        if id.candidates.is_empty() {
            return Err(ConfigError::Validation(
                "identity.candidates must name at least one field".into(),
            ));
        }

        if let Some(code) = &self.rules.home_state_code {
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_digit()) {
                return Err(ConfigError::Validation(format!(
                    "rules.home_state_code must be two digits, got \"{code}\""
                )));
            }
        }

        if self.run.workers == 0 {
            return Err(ConfigError::Validation("run.workers must be > 0".into()));
        }
        for (name, retry) in [("source", &self.source), ("delivery", &self.delivery)] {
            if retry.attempts == 0 {
                return Err(ConfigError::Validation(format!("{name}.attempts must be > 0")));
            }
            if retry.timeout_secs == 0 {
                return Err(ConfigError::Validation(format!("{name}.timeout_secs must be > 0")));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
