use sha2::{Digest, Sha256};

use crate::model::{CanonicalRecord, FINGERPRINT_FIELDS};

/// Content hash over the tracked fields → `"sha256:<64 hex>"`.
///
/// Each field contributes `name=<len>:<canonical value>\n` in
/// `FINGERPRINT_FIELDS` order. Empty and missing values hash the same, and
/// the length prefix keeps adjacent values from running together.
pub fn compute_content_hash(record: &CanonicalRecord) -> String {
    let mut hasher = Sha256::new();
    for field in FINGERPRINT_FIELDS {
        let value = record.canonical(field).unwrap_or_default();
        hasher.update(field.as_str().as_bytes());
        hasher.update(b"=");
        hasher.update(value.len().to_string().as_bytes());
        hasher.update(b":");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    format!("sha256:{:x}", hasher.finalize())
}

/// Compute and store the hash on the record.
pub fn stamp(record: &mut CanonicalRecord) {
    record.content_hash = compute_content_hash(record);
}
