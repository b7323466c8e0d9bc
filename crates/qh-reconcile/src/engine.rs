use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    CallerProbe, CallerVerdict, PendingCommission, ReconcileAction, ReconcileReport,
};

/// Classify pending commissions and plan confirmed resolutions.
///
/// - Quarantined rows are listed and skipped; the probe is never consulted
///   for them.
/// - Rows younger than `age_threshold` are left alone (the caller is assumed
///   to still be in flight).
/// - Overdue rows are checked against the probe: a confirmed verdict becomes
///   a [`ReconcileAction`], `Unknown` lands in `unconfirmed`.
///
/// Output vectors are sorted by serial for deterministic reports.
pub fn plan<P: CallerProbe + ?Sized>(
    pending: &[PendingCommission],
    now: DateTime<Utc>,
    age_threshold: Duration,
    probe: &P,
) -> ReconcileReport {
    let mut overdue = Vec::new();
    let mut actions = Vec::new();
    let mut unconfirmed = Vec::new();
    let mut quarantined = Vec::new();

    for c in pending {
        if c.quarantined {
            quarantined.push(c.serial);
            continue;
        }
        if now.signed_duration_since(c.created_at) < age_threshold {
            continue;
        }
        overdue.push(c.serial);
        match probe.verdict(&c.caller_id, &c.client_key) {
            CallerVerdict::Accept => actions.push(ReconcileAction::Accept { serial: c.serial }),
            CallerVerdict::Reject => actions.push(ReconcileAction::Reject { serial: c.serial }),
            CallerVerdict::Unknown => unconfirmed.push(c.serial),
        }
    }

    overdue.sort_unstable();
    unconfirmed.sort_unstable();
    quarantined.sort_unstable();
    actions.sort_by_key(ReconcileAction::serial);

    ReconcileReport {
        run_id: Uuid::new_v4(),
        scanned: pending.len(),
        overdue,
        actions,
        unconfirmed,
        quarantined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NeverConfirm;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, hour, 0, 0).unwrap()
    }

    fn pending(serial: i64, created_hour: u32) -> PendingCommission {
        PendingCommission {
            serial,
            caller_id: "cyclades".to_string(),
            client_key: format!("tx-{serial}"),
            created_at: at(created_hour),
            quarantined: false,
        }
    }

    /// Probe that confirms a fixed verdict for every commission.
    struct Always(CallerVerdict);

    impl CallerProbe for Always {
        fn verdict(&self, _caller_id: &str, _client_key: &str) -> CallerVerdict {
            self.0
        }
    }

    #[test]
    fn fresh_commissions_are_left_alone() {
        let report = plan(
            &[pending(1, 11)],
            at(12),
            Duration::hours(2),
            &NeverConfirm,
        );
        assert_eq!(report.scanned, 1);
        assert!(report.overdue.is_empty());
        assert!(report.actions.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn overdue_without_confirmation_stays_pending() {
        let report = plan(&[pending(1, 8)], at(12), Duration::hours(2), &NeverConfirm);
        assert_eq!(report.overdue, vec![1]);
        assert_eq!(report.unconfirmed, vec![1]);
        // Never auto-resolve: no actions planned.
        assert!(report.actions.is_empty());
        assert!(!report.is_clean());
    }

    #[test]
    fn confirmed_verdicts_become_actions() {
        let report = plan(
            &[pending(1, 8), pending(2, 8)],
            at(12),
            Duration::hours(2),
            &Always(CallerVerdict::Reject),
        );
        assert_eq!(
            report.actions,
            vec![
                ReconcileAction::Reject { serial: 1 },
                ReconcileAction::Reject { serial: 2 },
            ]
        );
        assert!(report.unconfirmed.is_empty());
    }

    #[test]
    fn quarantined_rows_are_skipped_even_when_overdue() {
        let mut c = pending(7, 1);
        c.quarantined = true;
        let report = plan(
            &[c],
            at(12),
            Duration::hours(2),
            &Always(CallerVerdict::Accept),
        );
        assert_eq!(report.quarantined, vec![7]);
        assert!(report.overdue.is_empty());
        assert!(report.actions.is_empty());
    }

    #[test]
    fn threshold_boundary_is_overdue() {
        // Exactly at the threshold counts as overdue.
        let report = plan(&[pending(1, 10)], at(12), Duration::hours(2), &NeverConfirm);
        assert_eq!(report.overdue, vec![1]);
    }

    #[test]
    fn report_is_deterministic_apart_from_run_id() {
        let rows = [pending(3, 8), pending(1, 8), pending(2, 8)];
        let a = plan(&rows, at(12), Duration::hours(2), &NeverConfirm);
        let b = plan(&rows, at(12), Duration::hours(2), &NeverConfirm);
        assert_eq!(a.overdue, b.overdue);
        assert_eq!(a.unconfirmed, vec![1, 2, 3]);
    }
}
