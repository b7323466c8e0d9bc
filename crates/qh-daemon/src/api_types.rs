//! Request and response types for all qh-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests.  No business logic lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use qh_schemas::{
    CommissionState, CreateEntityRequest, EntityName, HoldingKey, HoldingSnapshot, Provision,
    QuotaError, Rejected, ReleaseEntityRequest, ReleaseHoldingRequest, ResolveResult,
    SetLimitsRequest, TimelineEntry,
};

// ---------------------------------------------------------------------------
// /v1/health  /v1/status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub ok: bool,
    pub uptime_secs: u64,
    pub db_ok: bool,
    pub has_schema: bool,
    pub pending_commissions: i64,
    pub config_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Domain refusal body
// ---------------------------------------------------------------------------

/// Body returned with a non-2xx status when the failure is a domain error.
/// The `error` field carries the tagged [`QuotaError`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: QuotaError,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEntitiesBody {
    pub entities: Vec<CreateEntityRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEntitiesResponse {
    pub rejected: Vec<Rejected<CreateEntityRequest>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseEntitiesBody {
    pub entities: Vec<ReleaseEntityRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseEntitiesResponse {
    pub rejected: Vec<Rejected<ReleaseEntityRequest>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetEntityKeyBody {
    pub entity: EntityName,
    pub old_key: String,
    pub new_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLimitsBody {
    pub limits: Vec<SetLimitsRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLimitsResponse {
    pub rejected: Vec<Rejected<SetLimitsRequest>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLimitsBody {
    pub policies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLimitsResponse {
    pub policies: Vec<qh_db::PolicyRow>,
    pub rejected: Vec<Rejected<String>>,
}

// ---------------------------------------------------------------------------
// Holdings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHoldingsBody {
    pub holdings: Vec<HoldingKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHoldingsResponse {
    pub holdings: Vec<HoldingSnapshot>,
    pub rejected: Vec<Rejected<HoldingKey>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseHoldingsBody {
    pub holdings: Vec<ReleaseHoldingRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseHoldingsResponse {
    pub rejected: Vec<Rejected<ReleaseHoldingRequest>>,
}

// ---------------------------------------------------------------------------
// Commissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueCommissionBody {
    pub caller_id: String,
    pub client_key: String,
    pub provisions: Vec<Provision>,
}

/// GET /v1/commissions/:serial
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionResponse {
    pub serial: i64,
    pub caller_id: String,
    pub client_key: String,
    pub state: CommissionState,
    pub quarantined: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub provisions: Vec<Provision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingQuery {
    /// Restrict to commissions touching this entity or its descendants.
    pub entity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingResponse {
    pub serials: Vec<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveVerb {
    Accept,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveItem {
    pub serial: i64,
    pub action: ResolveVerb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveBatchBody {
    pub resolutions: Vec<ResolveItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveBatchResponse {
    pub results: Vec<ResolveResult>,
}

/// Response for the single accept / reject endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionResponse {
    pub serial: i64,
    pub state: CommissionState,
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineQuery {
    pub entity: String,
    pub resource: String,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineResponse {
    pub entries: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyQuery {
    pub entity: String,
    pub resource: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
    /// Entries checked when valid.
    pub entries: Option<usize>,
    /// Timeline id at the break, when invalid.
    pub broken_id: Option<i64>,
    pub reason: Option<String>,
}
