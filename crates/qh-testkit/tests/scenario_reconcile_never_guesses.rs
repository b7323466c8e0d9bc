//! Reconciliation conservatism: without a confirmed verdict from the
//! caller's system-of-record, an overdue commission stays pending. The
//! planner only turns confirmed verdicts into actions.

use chrono::{Duration, TimeZone, Utc};
use qh_reconcile::{
    plan, CallerProbe, CallerVerdict, NeverConfirm, PendingCommission, ReconcileAction,
};

struct Always(CallerVerdict);

impl CallerProbe for Always {
    fn verdict(&self, _caller_id: &str, _client_key: &str) -> CallerVerdict {
        self.0
    }
}

fn pending(serial: i64, age_hours: i64, quarantined: bool) -> PendingCommission {
    let now = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
    PendingCommission {
        serial,
        caller_id: "compute".to_string(),
        client_key: format!("tx-{serial}"),
        created_at: now - Duration::hours(age_hours),
        quarantined,
    }
}

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap()
}

#[test]
fn unconfirmed_overdue_commissions_stay_pending() {
    let rows = vec![pending(1, 5, false), pending(2, 0, false)];
    let report = plan(&rows, now(), Duration::hours(1), &NeverConfirm);

    assert_eq!(report.scanned, 2);
    assert_eq!(report.overdue, vec![1]);
    assert!(report.actions.is_empty(), "no confirmation, no action");
    assert_eq!(report.unconfirmed, vec![1]);
    assert!(!report.is_clean());
}

#[test]
fn confirmed_verdicts_become_actions_only_for_overdue_rows() {
    let rows = vec![pending(1, 5, false), pending(2, 0, false), pending(3, 7, false)];
    let report = plan(&rows, now(), Duration::hours(1), &Always(CallerVerdict::Reject));

    // Serial 2 is young: the probe is not even consulted for it.
    assert_eq!(report.overdue, vec![1, 3]);
    assert_eq!(
        report.actions,
        vec![
            ReconcileAction::Reject { serial: 1 },
            ReconcileAction::Reject { serial: 3 },
        ]
    );
    assert!(report.unconfirmed.is_empty());
}

#[test]
fn quarantined_commissions_are_skipped_and_listed() {
    let rows = vec![pending(1, 5, true), pending(2, 5, false)];
    let report = plan(&rows, now(), Duration::hours(1), &Always(CallerVerdict::Accept));

    assert_eq!(report.quarantined, vec![1]);
    assert_eq!(report.overdue, vec![2]);
    assert_eq!(report.actions, vec![ReconcileAction::Accept { serial: 2 }]);
    assert!(!report.is_clean(), "quarantine always needs an operator");
}

#[test]
fn empty_scan_is_clean() {
    let report = plan(&[], now(), Duration::hours(1), &NeverConfirm);
    assert_eq!(report.scanned, 0);
    assert!(report.is_clean());
}
