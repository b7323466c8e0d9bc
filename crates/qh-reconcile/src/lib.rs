//! Reconciliation planning for long-pending commissions.
//!
//! This crate is pure decision logic: given the set of pending commissions
//! and a probe into the caller's system-of-record, it classifies each one and
//! plans resolutions. It never touches the store itself — the daemon scans
//! pending rows, calls [`plan`], and executes the returned actions through
//! the batch resolve path in its own short transaction.
//!
//! The conservative rule is deliberate: a commission whose intended outcome
//! cannot be confirmed stays pending and is reported. Auto-resolving an
//! unconfirmed commission could corrupt a caller mid-flight.

mod engine;
mod types;

pub use engine::plan;
pub use types::{
    CallerProbe, CallerVerdict, NeverConfirm, PendingCommission, ReconcileAction, ReconcileReport,
};
