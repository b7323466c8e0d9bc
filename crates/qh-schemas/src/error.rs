//! The closed error taxonomy every operation reports against.
//!
//! Variants carry structured fields, not string-keyed maps, and serialize with
//! a `kind` tag so callers can dispatch without parsing messages.

use serde::{Deserialize, Serialize};

/// Every failure the quota holder surfaces to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaError {
    /// Malformed request (bad name, empty provision list, duplicate pair...).
    InvalidData { reason: String },
    /// Unknown commission serial.
    NoCommission { serial: i64 },
    /// Applying the delta would push quantity above the holding's capacity.
    NoCapacity {
        entity: String,
        resource: String,
        requested: i64,
        available: i64,
    },
    /// Applying the delta would push quantity below zero.
    NoQuantity {
        entity: String,
        resource: String,
        requested: i64,
        available: i64,
    },
    /// No holding exists for (entity, resource) and this path does not
    /// auto-create one.
    NoHolding { entity: String, resource: String },
    /// An entity with this full name already exists.
    DuplicateEntity { entity: String },
    /// Entity not found.
    NoEntity { entity: String },
    /// Policy not found.
    NoPolicy { policy: String },
    /// The presented key does not match the entity's current key.
    Unauthorized { entity: String },
    /// Stored state contradicts a recorded commission delta. Always fatal to
    /// the request, logged loudly, never auto-repaired.
    Corrupted { serial: i64, detail: String },
    /// Lock timeout or store unreachable; safe to retry later.
    ServiceUnavailable { detail: String },
}

impl QuotaError {
    /// Stable machine-readable kind tag, mirroring the serde tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidData { .. } => "invalid_data",
            Self::NoCommission { .. } => "no_commission",
            Self::NoCapacity { .. } => "no_capacity",
            Self::NoQuantity { .. } => "no_quantity",
            Self::NoHolding { .. } => "no_holding",
            Self::DuplicateEntity { .. } => "duplicate_entity",
            Self::NoEntity { .. } => "no_entity",
            Self::NoPolicy { .. } => "no_policy",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Corrupted { .. } => "corrupted",
            Self::ServiceUnavailable { .. } => "service_unavailable",
        }
    }
}

impl std::fmt::Display for QuotaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidData { reason } => write!(f, "invalid request: {reason}"),
            Self::NoCommission { serial } => write!(f, "no commission with serial {serial}"),
            Self::NoCapacity {
                entity,
                resource,
                requested,
                available,
            } => write!(
                f,
                "no capacity on ({entity}, {resource}): requested {requested}, available {available}"
            ),
            Self::NoQuantity {
                entity,
                resource,
                requested,
                available,
            } => write!(
                f,
                "no quantity on ({entity}, {resource}): requested {requested}, available {available}"
            ),
            Self::NoHolding { entity, resource } => {
                write!(f, "no holding for ({entity}, {resource})")
            }
            Self::DuplicateEntity { entity } => write!(f, "entity {entity} already exists"),
            Self::NoEntity { entity } => write!(f, "no entity {entity}"),
            Self::NoPolicy { policy } => write!(f, "no policy {policy}"),
            Self::Unauthorized { entity } => write!(f, "key mismatch for entity {entity}"),
            Self::Corrupted { serial, detail } => write!(
                f,
                "CORRUPTED: commission {serial} contradicts stored state: {detail}"
            ),
            Self::ServiceUnavailable { detail } => write!(f, "service unavailable: {detail}"),
        }
    }
}

impl std::error::Error for QuotaError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kind_tag() {
        let e = QuotaError::NoCapacity {
            entity: "system/users/alice".to_string(),
            resource: "vm".to_string(),
            requested: 2,
            available: 1,
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["kind"], "no_capacity");
        assert_eq!(v["requested"], 2);
        assert_eq!(e.kind(), "no_capacity");
    }

    #[test]
    fn round_trips() {
        let e = QuotaError::Unauthorized {
            entity: "system/users/bob".to_string(),
        };
        let js = serde_json::to_string(&e).unwrap();
        let back: QuotaError = serde_json::from_str(&js).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn corrupted_display_is_loud() {
        let e = QuotaError::Corrupted {
            serial: 7,
            detail: "reversal underflow".to_string(),
        };
        assert!(e.to_string().contains("CORRUPTED"));
    }
}
