//! Shared domain types for the quota holder.
//!
//! Everything that crosses a crate boundary lives here: hierarchical entity
//! names, the closed error taxonomy, commission/holding/limit types, and the
//! wire request/response shapes the daemon and CLI serialize.

mod error;
mod name;
mod types;

pub use error::QuotaError;
pub use name::{EntityName, PATH_SEPARATOR, ROOT_NAME};
pub use types::{
    CommissionState, CreateEntityRequest, HoldingKey, HoldingSnapshot, IssueOutcome, Limit,
    Provision, ProvisionRejection, Rejected, ReleaseEntityRequest, ReleaseHoldingRequest,
    ResolveOutcome, ResolveResult, SetLimitsRequest, TimelineEntry,
};
