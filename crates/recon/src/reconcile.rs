//! Current records vs. the previous snapshot → Added / Modified / Deleted / Unchanged.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::config::IdentityConfig;
use crate::model::{
    CandidateScore, CanonicalField, CanonicalRecord, FieldChange, IdentityResolution,
    IdentityState, ModifiedRecord, PartitionCounts, ReconciliationResult,
};

// ---------------------------------------------------------------------------
// Identity resolution
// ---------------------------------------------------------------------------

/// Distinct non-empty values over total records. Empty input scores 0.
pub fn uniqueness_ratio(records: &[CanonicalRecord], field: CanonicalField) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let distinct: BTreeSet<String> = records.iter().filter_map(|r| r.canonical(field)).collect();
    distinct.len() as f64 / records.len() as f64
}

fn has_values(records: &[CanonicalRecord], field: CanonicalField) -> bool {
    records.iter().any(|r| !r.get(field).is_empty())
}

/// Pick the identity key for this run.
///
/// The first candidate that has values in both sets (only the current set
/// when there is no previous snapshot) and reaches `min_uniqueness` in the
/// current set wins. Otherwise the result is degraded.
pub fn resolve_identity(
    current: &[CanonicalRecord],
    previous: Option<&[CanonicalRecord]>,
    config: &IdentityConfig,
) -> IdentityResolution {
    let previous = previous.filter(|p| !p.is_empty());

    let candidates: Vec<CandidateScore> = config
        .candidates
        .iter()
        .map(|&field| CandidateScore {
            field,
            uniqueness: uniqueness_ratio(current, field),
            in_current: has_values(current, field),
            in_previous: previous.map_or(false, |p| has_values(p, field)),
        })
        .collect();

    let chosen = candidates.iter().find(|c| {
        c.in_current && (previous.is_none() || c.in_previous) && c.uniqueness >= config.min_uniqueness
    });

    if let Some(c) = chosen {
        return IdentityResolution {
            state: IdentityState::Resolved,
            key: Some(c.field),
            reason: None,
            candidates,
        };
    }

    let reason = match candidates
        .iter()
        .filter(|c| c.in_current && (previous.is_none() || c.in_previous))
        .max_by(|a, b| a.uniqueness.total_cmp(&b.uniqueness))
    {
        Some(best) => format!(
            "best candidate {} has uniqueness {:.2}, below {:.2}",
            best.field, best.uniqueness, config.min_uniqueness
        ),
        None => "no key candidate has values in both snapshots".to_string(),
    };
    IdentityResolution {
        state: IdentityState::Degraded,
        key: None,
        reason: Some(reason),
        candidates,
    }
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

/// Fields compared for keyed pairs: configured list or every field, minus the key.
pub fn compare_fields(config: &IdentityConfig, key: CanonicalField) -> Vec<CanonicalField> {
    let base: &[CanonicalField] = match &config.compare_fields {
        Some(fields) => fields,
        None => &CanonicalField::ALL,
    };
    base.iter().copied().filter(|f| *f != key).collect()
}

fn diff_fields(
    previous: &CanonicalRecord,
    current: &CanonicalRecord,
    fields: &[CanonicalField],
) -> Vec<FieldChange> {
    fields
        .iter()
        .filter_map(|&field| {
            let p = previous.canonical(field).unwrap_or_default();
            let c = current.canonical(field).unwrap_or_default();
            (p != c).then(|| FieldChange {
                field,
                previous: p,
                current: c,
            })
        })
        .collect()
}

fn sort_key(r: &CanonicalRecord) -> (&str, &str, usize) {
    (r.record_key.as_str(), r.content_hash.as_str(), r.source_row)
}

fn sorted<'a>(mut records: Vec<&'a CanonicalRecord>) -> Vec<&'a CanonicalRecord> {
    records.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    records
}

/// Pair records with identical content hashes; returns the pairs and both
/// sides' leftovers, all in deterministic order.
#[allow(clippy::type_complexity)]
fn pair_by_hash<'a>(
    current: Vec<&'a CanonicalRecord>,
    previous: Vec<&'a CanonicalRecord>,
) -> (
    Vec<(&'a CanonicalRecord, &'a CanonicalRecord)>,
    Vec<&'a CanonicalRecord>,
    Vec<&'a CanonicalRecord>,
) {
    let mut pool: BTreeMap<&str, Vec<&'a CanonicalRecord>> = BTreeMap::new();
    for p in sorted(previous).into_iter().rev() {
        pool.entry(p.content_hash.as_str()).or_default().push(p);
    }
    let mut pairs = Vec::new();
    let mut cur_left = Vec::new();
    for c in sorted(current) {
        match pool.get_mut(c.content_hash.as_str()).and_then(Vec::pop) {
            Some(p) => pairs.push((c, p)),
            None => cur_left.push(c),
        }
    }
    let prev_left = sorted(pool.into_values().flatten().collect());
    (pairs, cur_left, prev_left)
}

#[derive(Default)]
struct Partitions<'a> {
    added: Vec<&'a CanonicalRecord>,
    modified: Vec<ModifiedRecord>,
    deleted: Vec<&'a CanonicalRecord>,
    unchanged: Vec<&'a CanonicalRecord>,
}

impl<'a> Partitions<'a> {
    fn classify_pair(
        &mut self,
        key: &str,
        current: &'a CanonicalRecord,
        previous: &'a CanonicalRecord,
        fields: &[CanonicalField],
    ) {
        let changes = diff_fields(previous, current, fields);
        if changes.is_empty() {
            self.unchanged.push(current);
        } else {
            self.modified.push(ModifiedRecord {
                key: key.to_string(),
                previous: previous.clone(),
                current: current.clone(),
                changes,
            });
        }
    }

    fn finish(self, identity: IdentityResolution) -> ReconciliationResult {
        let owned = |v: Vec<&CanonicalRecord>| -> Vec<CanonicalRecord> {
            sorted(v).into_iter().cloned().collect()
        };
        let mut modified = self.modified;
        modified.sort_by(|a, b| (a.key.as_str(), sort_key(&a.current)).cmp(&(b.key.as_str(), sort_key(&b.current))));

        let result = ReconciliationResult {
            identity,
            counts: PartitionCounts {
                added: self.added.len(),
                modified: modified.len(),
                deleted: self.deleted.len(),
                unchanged: self.unchanged.len(),
            },
            added: owned(self.added),
            modified,
            deleted: owned(self.deleted),
            unchanged: owned(self.unchanged),
        };
        info!(
            added = result.counts.added,
            modified = result.counts.modified,
            deleted = result.counts.deleted,
            unchanged = result.counts.unchanged,
            identity = %result.identity.state,
            "reconciliation complete"
        );
        result
    }
}

/// Diff `current` against `previous`.
///
/// Output does not depend on input order. `added + modified + unchanged`
/// always equals `current.len()`; `deleted + modified + unchanged` equals
/// `previous.len()` unless identity resolution degraded, in which case every
/// current record is Added and nothing is Deleted.
pub fn reconcile(
    current: &[CanonicalRecord],
    previous: Option<&[CanonicalRecord]>,
    config: &IdentityConfig,
) -> ReconciliationResult {
    let identity = resolve_identity(current, previous, config);
    let mut parts = Partitions::default();

    let Some(key) = identity.key else {
        warn!(
            reason = identity.reason.as_deref().unwrap_or(""),
            "identity resolution degraded, reconciling append-only"
        );
        parts.added = current.iter().collect();
        return parts.finish(identity);
    };

    let fields = compare_fields(config, key);
    let previous = previous.unwrap_or(&[]);

    let mut groups: BTreeMap<String, (Vec<&CanonicalRecord>, Vec<&CanonicalRecord>)> = BTreeMap::new();
    let mut keyless_cur = Vec::new();
    let mut keyless_prev = Vec::new();
    for r in current {
        match r.canonical(key) {
            Some(k) => groups.entry(k).or_default().0.push(r),
            None => keyless_cur.push(r),
        }
    }
    for r in previous {
        match r.canonical(key) {
            Some(k) => groups.entry(k).or_default().1.push(r),
            None => keyless_prev.push(r),
        }
    }

    for (k, (cur, prev)) in groups {
        // Duplicate keys: identical content pairs first, then the rest in order.
        let (pairs, cur_left, prev_left) = pair_by_hash(cur, prev);
        for (c, p) in pairs {
            parts.classify_pair(&k, c, p, &fields);
        }
        let n = cur_left.len().min(prev_left.len());
        for (c, p) in cur_left.iter().copied().zip(prev_left.iter().copied()) {
            parts.classify_pair(&k, c, p, &fields);
        }
        parts.added.extend(cur_left.into_iter().skip(n));
        parts.deleted.extend(prev_left.into_iter().skip(n));
    }

    let (pairs, cur_left, prev_left) = pair_by_hash(keyless_cur, keyless_prev);
    parts.unchanged.extend(pairs.into_iter().map(|(c, _)| c));
    parts.added.extend(cur_left);
    parts.deleted.extend(prev_left);

    parts.finish(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::stamp;
    use crate::model::FieldValue;
    use chrono::Utc;

    fn inv(no: &str, amount: i64) -> CanonicalRecord {
        let mut r = CanonicalRecord::empty(Utc::now());
        if !no.is_empty() {
            r.set(CanonicalField::InvoiceNo, FieldValue::Text(no.into()));
        }
        r.set(CanonicalField::TotalAmount, FieldValue::Amount(amount));
        stamp(&mut r);
        r.record_key = if no.is_empty() { r.content_hash.clone() } else { no.to_string() };
        r
    }

    fn keys(records: &[CanonicalRecord]) -> Vec<&str> {
        records.iter().map(|r| r.text(CanonicalField::InvoiceNo)).collect()
    }

    #[test]
    fn added_deleted_unchanged() {
        let prev = vec![inv("INV1", 10_000), inv("INV2", 20_000)];
        let cur = vec![inv("INV1", 10_000), inv("INV3", 30_000)];
        let r = reconcile(&cur, Some(&prev), &IdentityConfig::default());
        assert_eq!(r.identity.key, Some(CanonicalField::InvoiceNo));
        assert_eq!(keys(&r.added), vec!["INV3"]);
        assert_eq!(keys(&r.deleted), vec!["INV2"]);
        assert_eq!(keys(&r.unchanged), vec!["INV1"]);
        assert!(r.modified.is_empty());
    }

    #[test]
    fn amount_change_is_modified() {
        let prev = vec![inv("INV1", 10_000)];
        let cur = vec![inv("INV1", 15_000)];
        let r = reconcile(&cur, Some(&prev), &IdentityConfig::default());
        assert_eq!(r.modified.len(), 1);
        let m = &r.modified[0];
        assert_eq!(m.key, "INV1");
        assert_eq!(m.changed_fields(), vec![CanonicalField::TotalAmount]);
        assert_eq!(m.changes[0].previous, "100.00");
        assert_eq!(m.changes[0].current, "150.00");
    }

    #[test]
    fn key_comparison_ignores_case_and_padding() {
        let prev = vec![inv("inv1", 10_000)];
        let cur = vec![inv(" INV1 ", 10_000)];
        let r = reconcile(&cur, Some(&prev), &IdentityConfig::default());
        assert_eq!(r.counts.unchanged, 1);
    }

    #[test]
    fn compare_fields_limit_what_counts_as_change() {
        let mut prev = inv("INV1", 10_000);
        prev.set(CanonicalField::Mop, FieldValue::Text("NEFT".into()));
        let mut cur = inv("INV1", 10_000);
        cur.set(CanonicalField::Mop, FieldValue::Text("Cheque".into()));

        let all = reconcile(&[cur.clone()], Some(&[prev.clone()][..]), &IdentityConfig::default());
        assert_eq!(all.modified[0].changed_fields(), vec![CanonicalField::Mop]);

        let config = IdentityConfig {
            compare_fields: Some(vec![CanonicalField::TotalAmount]),
            ..IdentityConfig::default()
        };
        let narrow = reconcile(&[cur], Some(&[prev][..]), &config);
        assert_eq!(narrow.counts.unchanged, 1);
    }

    #[test]
    fn low_uniqueness_degrades_to_append_only() {
        let prev = vec![inv("A", 1), inv("B", 2)];
        let cur = vec![inv("A", 1), inv("A", 2), inv("B", 3), inv("B", 4)];
        let r = reconcile(&cur, Some(&prev), &IdentityConfig::default());
        assert!(r.identity.is_degraded());
        assert_eq!(r.counts.added, 4);
        assert_eq!(r.counts.deleted, 0);
        assert!(r.identity.reason.as_deref().unwrap().contains("0.50"));
    }

    #[test]
    fn candidate_missing_from_previous_falls_through() {
        let mut prev = inv("", 100);
        prev.set(CanonicalField::VoucherNo, FieldValue::Text("V1".into()));
        let mut cur = inv("INV1", 100);
        cur.set(CanonicalField::VoucherNo, FieldValue::Text("V1".into()));
        let r = reconcile(&[cur], Some(&[prev][..]), &IdentityConfig::default());
        assert_eq!(r.identity.key, Some(CanonicalField::VoucherNo));
    }

    #[test]
    fn no_previous_makes_everything_added() {
        let cur = vec![inv("INV1", 1), inv("INV2", 2)];
        let r = reconcile(&cur, None, &IdentityConfig::default());
        assert_eq!(r.identity.state, IdentityState::Resolved);
        assert_eq!(r.counts.added, 2);
    }

    #[test]
    fn keyless_records_match_by_hash() {
        let mut config = IdentityConfig::default();
        config.min_uniqueness = 0.3;
        let prev = vec![inv("INV1", 1), inv("", 500), inv("", 700)];
        let cur = vec![inv("INV1", 1), inv("", 500), inv("", 900)];
        let r = reconcile(&cur, Some(&prev), &config);
        assert_eq!(r.counts.unchanged, 2);
        assert_eq!(r.counts.added, 1);
        assert_eq!(r.counts.deleted, 1);
        assert_eq!(r.added[0].amount(CanonicalField::TotalAmount), Some(900));
    }

    #[test]
    fn duplicate_keys_pair_identical_content_first() {
        let mut config = IdentityConfig::default();
        config.min_uniqueness = 0.3;
        let prev = vec![inv("INV1", 100), inv("INV1", 200)];
        let cur = vec![inv("INV1", 200), inv("INV1", 300), inv("INV1", 100)];
        let r = reconcile(&cur, Some(&prev), &config);
        assert_eq!(r.counts.unchanged, 2);
        assert_eq!(r.counts.added, 1);
        assert_eq!(r.counts.deleted, 0);
    }

    #[test]
    fn input_order_does_not_change_output() {
        let prev = vec![inv("INV1", 1), inv("INV2", 2), inv("INV3", 3)];
        let cur = vec![inv("INV4", 4), inv("INV2", 5), inv("INV1", 1)];
        let a = reconcile(&cur, Some(&prev), &IdentityConfig::default());
        let mut cur_rev = cur.clone();
        cur_rev.reverse();
        let mut prev_rev = prev.clone();
        prev_rev.reverse();
        let b = reconcile(&cur_rev, Some(&prev_rev), &IdentityConfig::default());
        assert_eq!(keys(&a.added), keys(&b.added));
        assert_eq!(keys(&a.deleted), keys(&b.deleted));
        assert_eq!(keys(&a.unchanged), keys(&b.unchanged));
        assert_eq!(a.modified[0].key, b.modified[0].key);
    }
}
