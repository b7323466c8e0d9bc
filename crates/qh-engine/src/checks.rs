//! Delta validation against a holding's capacity and floor.

use qh_schemas::{EntityName, Limit, QuotaError};

/// The minimal slice of a holding the checks need: current quantity plus the
/// capacity of the policy it is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldingView {
    pub quantity: i64,
    pub capacity: i64,
}

/// Validate applying `delta` to a holding and return the new quantity.
///
/// Rules, checked in order:
/// - arithmetic overflow is `InvalidData` (a delta of that magnitude is
///   malformed, not a capacity question);
/// - `new_quantity < 0` is `NoQuantity` with `available = quantity`;
/// - `new_quantity > capacity` is `NoCapacity` with
///   `available = capacity - quantity`.
///
/// The holding itself is not mutated here; the caller applies the returned
/// value inside its transaction.
pub fn check_delta(
    entity: &EntityName,
    resource: &str,
    view: HoldingView,
    delta: i64,
) -> Result<i64, QuotaError> {
    let new_quantity = view.quantity.checked_add(delta).ok_or_else(|| {
        QuotaError::InvalidData {
            reason: format!("delta {delta} overflows quantity {}", view.quantity),
        }
    })?;

    if new_quantity < 0 {
        return Err(QuotaError::NoQuantity {
            entity: entity.to_string(),
            resource: resource.to_string(),
            requested: delta,
            available: view.quantity,
        });
    }
    if new_quantity > view.capacity {
        return Err(QuotaError::NoCapacity {
            entity: entity.to_string(),
            resource: resource.to_string(),
            requested: delta,
            available: view.capacity - view.quantity,
        });
    }
    Ok(new_quantity)
}

/// Validate reversing a recorded provision delta and return the restored
/// quantity.
///
/// A reversal that would leave the holding outside `[0, capacity]` means the
/// stored quantity contradicts the delta the commission recorded at issuance.
/// That is a `Corrupted` invariant breach, never a quota refusal.
pub fn check_reversal(
    serial: i64,
    view: HoldingView,
    recorded_delta: i64,
) -> Result<i64, QuotaError> {
    let corrupted = |detail: String| QuotaError::Corrupted { serial, detail };

    let restored = view
        .quantity
        .checked_sub(recorded_delta)
        .ok_or_else(|| corrupted(format!("reversal of {recorded_delta} overflows")))?;

    if restored < 0 {
        return Err(corrupted(format!(
            "reversing delta {recorded_delta} from quantity {} underflows",
            view.quantity
        )));
    }
    if restored > view.capacity {
        return Err(corrupted(format!(
            "reversing delta {recorded_delta} from quantity {} exceeds capacity {}",
            view.quantity, view.capacity
        )));
    }
    Ok(restored)
}

/// Validate a limits policy: `0 <= quantity <= capacity`, non-negative
/// import/export limits.
pub fn validate_limit(limit: &Limit) -> Result<(), QuotaError> {
    if limit.quantity < 0 {
        return Err(QuotaError::InvalidData {
            reason: format!("policy quantity must be >= 0, got {}", limit.quantity),
        });
    }
    if limit.capacity < limit.quantity {
        return Err(QuotaError::InvalidData {
            reason: format!(
                "policy capacity {} must be >= quantity {}",
                limit.capacity, limit.quantity
            ),
        });
    }
    if limit.import_limit < 0 || limit.export_limit < 0 {
        return Err(QuotaError::InvalidData {
            reason: "import/export limits must be >= 0".to_string(),
        });
    }
    Ok(())
}
