//! Canonical provision ordering.
//!
//! Every call site that locks holdings must lock them in the same order, or
//! two concurrent commissions touching overlapping holdings can deadlock.
//! The canonical order is the `(entity, resource)` sort; this module is the
//! single place it is computed.

use qh_schemas::{Provision, QuotaError};

/// Return the provisions sorted into canonical `(entity, resource)` order.
///
/// # Errors
/// - `InvalidData` if the list is empty, a resource name is empty, or the
///   same `(entity, resource)` pair appears twice. Duplicates are rejected
///   rather than merged so each holding is locked exactly once and rejection
///   reports stay unambiguous.
pub fn canonical_order(provisions: &[Provision]) -> Result<Vec<Provision>, QuotaError> {
    if provisions.is_empty() {
        return Err(QuotaError::InvalidData {
            reason: "commission must contain at least one provision".to_string(),
        });
    }
    for p in provisions {
        if p.resource.is_empty() {
            return Err(QuotaError::InvalidData {
                reason: format!("provision for {} has an empty resource", p.entity),
            });
        }
    }

    let mut ordered = provisions.to_vec();
    ordered.sort_by(|a, b| a.holding_key().cmp(&b.holding_key()));

    for pair in ordered.windows(2) {
        if pair[0].holding_key() == pair[1].holding_key() {
            return Err(QuotaError::InvalidData {
                reason: format!(
                    "duplicate provision for ({}, {})",
                    pair[0].entity, pair[0].resource
                ),
            });
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qh_schemas::EntityName;

    fn prov(entity: &str, resource: &str, delta: i64) -> Provision {
        Provision::new(EntityName::parse(entity).unwrap(), resource, delta)
    }

    #[test]
    fn sorts_by_entity_then_resource() {
        let out = canonical_order(&[
            prov("system/b", "vm", 1),
            prov("system/a", "vm", 1),
            prov("system/a", "ram", 1),
        ])
        .unwrap();
        let keys: Vec<(String, String)> = out
            .iter()
            .map(|p| (p.entity.to_string(), p.resource.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("system/a".to_string(), "ram".to_string()),
                ("system/a".to_string(), "vm".to_string()),
                ("system/b".to_string(), "vm".to_string()),
            ]
        );
    }

    #[test]
    fn opposite_input_orders_converge() {
        // Two callers listing the same holdings in opposite order must end up
        // locking in the same sequence.
        let forward = canonical_order(&[prov("system/a", "vm", 1), prov("system/b", "vm", 1)]);
        let backward = canonical_order(&[prov("system/b", "vm", 1), prov("system/a", "vm", 1)]);
        assert_eq!(forward.unwrap(), backward.unwrap());
    }

    #[test]
    fn rejects_empty_list() {
        assert!(matches!(
            canonical_order(&[]),
            Err(QuotaError::InvalidData { .. })
        ));
    }

    #[test]
    fn rejects_empty_resource() {
        assert!(canonical_order(&[prov("system/a", "", 1)]).is_err());
    }

    #[test]
    fn rejects_duplicate_pair() {
        let err = canonical_order(&[prov("system/a", "vm", 1), prov("system/a", "vm", 2)])
            .unwrap_err();
        assert!(err.to_string().contains("duplicate provision"));
    }

    #[test]
    fn preserves_deltas() {
        let out = canonical_order(&[prov("system/a", "vm", -3)]).unwrap();
        assert_eq!(out[0].delta, -3);
    }
}
