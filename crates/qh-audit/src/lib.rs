//! Timeline hash chaining.
//!
//! Each (entity, resource) pair carries its own chain: every timeline entry
//! records the previous entry's hash (`hash_prev`) and its own (`hash_self`),
//! computed over canonical JSON. Tampering with any stored entry breaks the
//! chain from that point on, which [`verify_chain`] detects offline.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};

use qh_schemas::TimelineEntry;

/// Canonicalize by sorting keys recursively and emitting compact JSON.
fn canonical_json<T: serde::Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize timeline entry failed")?;
    let sorted = sort_keys(&raw);
    serde_json::to_string(&sorted).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash of one entry's content.
///
/// `hash_self` is excluded to avoid self-reference; `id` is excluded because
/// it is assigned by the store after the hash is computed.
pub fn compute_entry_hash(entry: &TimelineEntry) -> Result<String> {
    let mut clone = entry.clone();
    clone.hash_self = None;
    clone.id = 0;

    let canonical = canonical_json(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Seal an entry into the chain: set `hash_prev` from the predecessor and
/// compute `hash_self`. Returns the new chain head hash.
pub fn seal_entry(entry: &mut TimelineEntry, prev_hash: Option<String>) -> Result<String> {
    entry.hash_prev = prev_hash;
    let h = compute_entry_hash(entry)?;
    entry.hash_self = Some(h.clone());
    Ok(h)
}

/// Result of chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    /// The entire chain is valid.
    Valid { entries: usize },
    /// The chain is broken at the entry with this timeline id.
    Broken { id: i64, reason: String },
}

impl VerifyResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }
}

/// Verify one (entity, resource) chain, oldest entry first.
///
/// Checks that every `hash_prev` matches the predecessor's `hash_self` and
/// that every `hash_self` matches the recomputed content hash. The first
/// entry's `hash_prev` is taken on trust: retention pruning may have removed
/// the original chain head.
pub fn verify_chain(entries: &[TimelineEntry]) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = entries.first().and_then(|e| e.hash_prev.clone());

    for entry in entries {
        if entry.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                id: entry.id,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, entry.hash_prev
                ),
            });
        }

        if let Some(ref claimed) = entry.hash_self {
            let recomputed = compute_entry_hash(entry)?;
            if *claimed != recomputed {
                return Ok(VerifyResult::Broken {
                    id: entry.id,
                    reason: format!("hash_self mismatch: claimed {claimed}, recomputed {recomputed}"),
                });
            }
        }

        prev_hash = entry.hash_self.clone();
    }

    Ok(VerifyResult::Valid {
        entries: entries.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use qh_schemas::EntityName;

    fn entry(id: i64, delta: i64, resulting: i64) -> TimelineEntry {
        TimelineEntry {
            id,
            entity: EntityName::parse("system/users/alice").unwrap(),
            resource: "vm".to_string(),
            delta,
            commission: Some(1),
            resulting_quantity: resulting,
            reason: "issue".to_string(),
            hash_prev: None,
            hash_self: None,
            ts: Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap(),
        }
    }

    fn sealed_chain() -> Vec<TimelineEntry> {
        let mut e1 = entry(1, 2, 2);
        let mut e2 = entry(2, 2, 4);
        let mut e3 = entry(3, -2, 2);
        let h1 = seal_entry(&mut e1, None).unwrap();
        let h2 = seal_entry(&mut e2, Some(h1)).unwrap();
        seal_entry(&mut e3, Some(h2)).unwrap();
        vec![e1, e2, e3]
    }

    #[test]
    fn intact_chain_verifies() {
        let chain = sealed_chain();
        assert_eq!(
            verify_chain(&chain).unwrap(),
            VerifyResult::Valid { entries: 3 }
        );
    }

    #[test]
    fn empty_chain_is_valid() {
        assert!(verify_chain(&[]).unwrap().is_valid());
    }

    #[test]
    fn tampered_content_is_detected() {
        let mut chain = sealed_chain();
        chain[1].resulting_quantity = 999;
        match verify_chain(&chain).unwrap() {
            VerifyResult::Broken { id, reason } => {
                assert_eq!(id, 2);
                assert!(reason.contains("hash_self mismatch"));
            }
            other => panic!("expected broken chain, got {other:?}"),
        }
    }

    #[test]
    fn dropped_entry_breaks_link() {
        let chain = sealed_chain();
        let truncated = vec![chain[0].clone(), chain[2].clone()];
        match verify_chain(&truncated).unwrap() {
            VerifyResult::Broken { id, reason } => {
                assert_eq!(id, 3);
                assert!(reason.contains("hash_prev mismatch"));
            }
            other => panic!("expected broken chain, got {other:?}"),
        }
    }

    #[test]
    fn pruned_chain_tail_still_verifies() {
        // Retention may drop the oldest entries; the remaining tail is a
        // valid chain whose first hash_prev points at a pruned entry.
        let chain = sealed_chain();
        let tail = chain[1..].to_vec();
        assert!(verify_chain(&tail).unwrap().is_valid());
    }

    #[test]
    fn id_does_not_participate_in_hash() {
        // The store assigns ids after sealing, so renumbering must not break
        // content verification.
        let mut a = entry(1, 2, 2);
        let mut b = entry(42, 2, 2);
        let ha = seal_entry(&mut a, None).unwrap();
        let hb = seal_entry(&mut b, None).unwrap();
        assert_eq!(ha, hb);
    }
}
