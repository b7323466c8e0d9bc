//! Commission, holding, limit and wire types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityName, QuotaError};

// ---------------------------------------------------------------------------
// Provision
// ---------------------------------------------------------------------------

/// One (entity, resource, delta) line item within a commission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    pub entity: EntityName,
    pub resource: String,
    pub delta: i64,
}

impl Provision {
    pub fn new(entity: EntityName, resource: impl Into<String>, delta: i64) -> Self {
        Self {
            entity,
            resource: resource.into(),
            delta,
        }
    }

    /// The canonical ordering key shared by every lock site.
    pub fn holding_key(&self) -> HoldingKey {
        HoldingKey {
            entity: self.entity.clone(),
            resource: self.resource.clone(),
        }
    }
}

/// Identity of a holding: the (entity, resource) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HoldingKey {
    pub entity: EntityName,
    pub resource: String,
}

// ---------------------------------------------------------------------------
// Commission state
// ---------------------------------------------------------------------------

/// The commission state machine: PENDING is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommissionState {
    Pending,
    Accepted,
    Rejected,
}

impl CommissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QuotaError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACCEPTED" => Ok(Self::Accepted),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(QuotaError::InvalidData {
                reason: format!("invalid commission state: {other}"),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

// ---------------------------------------------------------------------------
// Limits / holdings
// ---------------------------------------------------------------------------

/// A named limits policy. `quantity` is the initial quantity a holding bound
/// to this policy starts from; `capacity` is the hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limit {
    pub quantity: i64,
    pub capacity: i64,
    pub import_limit: i64,
    pub export_limit: i64,
}

/// Read-only view of one holding row plus its policy's capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingSnapshot {
    pub entity: EntityName,
    pub resource: String,
    pub policy: String,
    pub quantity: i64,
    pub capacity: i64,
    pub imported: i64,
    pub exported: i64,
    pub flags: i64,
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// One append-only audit record of a holding mutation.
///
/// `hash_prev`/`hash_self` form a per-(entity, resource) hash chain; `id` is
/// the global append order and is excluded from the hashed content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: i64,
    pub entity: EntityName,
    pub resource: String,
    pub delta: i64,
    /// Issuing/rejecting commission; `None` for entries written by a holding
    /// release.
    pub commission: Option<i64>,
    pub resulting_quantity: i64,
    /// "issue" | "reject" | "release"
    pub reason: String,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
    pub ts: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Batch request items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntityRequest {
    pub entity: EntityName,
    pub key: String,
    pub parent_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntityRequest {
    pub entity: EntityName,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseHoldingRequest {
    pub entity: EntityName,
    pub resource: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLimitsRequest {
    pub policy: String,
    #[serde(flatten)]
    pub limit: Limit,
}

/// One rejected item from a batch operation, paired with the reason.
/// Batch operations partially succeed; the rejected list names the failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejected<T> {
    pub item: T,
    pub error: QuotaError,
}

// ---------------------------------------------------------------------------
// Commission outcomes
// ---------------------------------------------------------------------------

/// One provision that failed validation during issuance, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRejection {
    pub provision: Provision,
    pub error: QuotaError,
}

/// Result of `issue_commission`: either a serial or the complete, itemized
/// rejection list. Never a partial application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IssueOutcome {
    Issued { serial: i64 },
    Rejected { rejections: Vec<ProvisionRejection> },
}

impl IssueOutcome {
    pub fn serial(&self) -> Option<i64> {
        match self {
            Self::Issued { serial } => Some(*serial),
            Self::Rejected { .. } => None,
        }
    }
}

/// Per-id outcome from the batch resolve path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Resolved { state: CommissionState },
    Failed { error: QuotaError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveResult {
    pub serial: i64,
    #[serde(flatten)]
    pub outcome: ResolveOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commission_state_round_trips() {
        for s in [
            CommissionState::Pending,
            CommissionState::Accepted,
            CommissionState::Rejected,
        ] {
            assert_eq!(CommissionState::parse(s.as_str()).unwrap(), s);
        }
        assert!(CommissionState::parse("DONE").is_err());
        assert!(!CommissionState::Pending.is_terminal());
        assert!(CommissionState::Accepted.is_terminal());
    }

    #[test]
    fn issue_outcome_serde_tags() {
        let issued = IssueOutcome::Issued { serial: 42 };
        let v = serde_json::to_value(&issued).unwrap();
        assert_eq!(v["outcome"], "issued");
        assert_eq!(v["serial"], 42);
        assert_eq!(issued.serial(), Some(42));
    }

    #[test]
    fn holding_key_orders_by_entity_then_resource() {
        let a = HoldingKey {
            entity: EntityName::parse("system/a").unwrap(),
            resource: "vm".to_string(),
        };
        let b = HoldingKey {
            entity: EntityName::parse("system/a").unwrap(),
            resource: "ram".to_string(),
        };
        let c = HoldingKey {
            entity: EntityName::parse("system/b").unwrap(),
            resource: "aa".to_string(),
        };
        assert!(b < a); // "ram" < "vm"
        assert!(a < c);
    }
}
