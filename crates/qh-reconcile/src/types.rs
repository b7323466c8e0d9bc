use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One pending commission as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommission {
    pub serial: i64,
    pub caller_id: String,
    pub client_key: String,
    pub created_at: DateTime<Utc>,
    /// Quarantined commissions are excluded from reconciliation until an
    /// operator has inspected them.
    pub quarantined: bool,
}

/// What the caller's system-of-record says about a commission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerVerdict {
    Accept,
    Reject,
    /// Unreachable or undecided. The commission stays pending.
    Unknown,
}

/// Probe into the caller's system-of-record for the intended outcome of a
/// commission. Wire a real client in production; use stubs in tests.
///
/// # Contract
/// The planner only calls the probe for overdue commissions, and the daemon
/// never holds a row lock while the probe runs. `verdict` is called directly
/// on the daemon's async runtime, so implementations must not block: fetch
/// verdicts ahead of the pass (or behind `tokio::task::spawn_blocking`) and
/// answer here from the cached snapshot.
pub trait CallerProbe {
    fn verdict(&self, caller_id: &str, client_key: &str) -> CallerVerdict;
}

/// Probe that never confirms anything. The safe default when no
/// system-of-record integration is configured: every overdue commission is
/// reported, none resolved.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverConfirm;

impl CallerProbe for NeverConfirm {
    fn verdict(&self, _caller_id: &str, _client_key: &str) -> CallerVerdict {
        CallerVerdict::Unknown
    }
}

/// A confirmed resolution the executor should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileAction {
    Accept { serial: i64 },
    Reject { serial: i64 },
}

impl ReconcileAction {
    pub fn serial(&self) -> i64 {
        match self {
            Self::Accept { serial } | Self::Reject { serial } => *serial,
        }
    }
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Tags this pass in logs and on the event bus.
    pub run_id: Uuid,
    pub scanned: usize,
    /// Serials pending longer than the age threshold.
    pub overdue: Vec<i64>,
    /// Confirmed resolutions to execute.
    pub actions: Vec<ReconcileAction>,
    /// Overdue serials with no confirmation; left pending, reported only.
    pub unconfirmed: Vec<i64>,
    /// Quarantined serials, skipped entirely.
    pub quarantined: Vec<i64>,
}

impl ReconcileReport {
    /// True when nothing is overdue or quarantined.
    pub fn is_clean(&self) -> bool {
        self.overdue.is_empty() && self.quarantined.is_empty()
    }
}
