//! Issuance invariants: retransmissions dedupe on (caller_id, client_key),
//! and a commission with any refused provision reserves nothing at all.

use qh_schemas::{IssueOutcome, QuotaError};
use qh_testkit::{key, prov, MemLedger};

#[test]
fn retransmission_returns_the_same_serial_without_re_reserving() -> anyhow::Result<()> {
    let mut ledger = MemLedger::new();
    let vm = key("system/users/alice", "vm");
    ledger.set_capacity(vm.clone(), 10);

    let provisions = [prov("system/users/alice", "vm", 3)];
    let first = ledger.issue("compute", "tx-1", &provisions)?.serial().unwrap();
    let second = ledger.issue("compute", "tx-1", &provisions)?.serial().unwrap();

    assert_eq!(first, second);
    assert_eq!(ledger.quantity(&vm), 3, "only one reservation may land");

    // Still deduped after the commission turns terminal.
    ledger.accept(first)?;
    let third = ledger.issue("compute", "tx-1", &provisions)?.serial().unwrap();
    assert_eq!(first, third);
    assert_eq!(ledger.quantity(&vm), 3);

    Ok(())
}

#[test]
fn distinct_client_keys_are_distinct_commissions() -> anyhow::Result<()> {
    let mut ledger = MemLedger::new();
    let vm = key("system/users/alice", "vm");
    ledger.set_capacity(vm.clone(), 10);

    let a = ledger
        .issue("compute", "tx-a", &[prov("system/users/alice", "vm", 2)])?
        .serial()
        .unwrap();
    let b = ledger
        .issue("compute", "tx-b", &[prov("system/users/alice", "vm", 2)])?
        .serial()
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(ledger.quantity(&vm), 4);

    // Same client_key from a different caller is also distinct.
    let c = ledger
        .issue("network", "tx-a", &[prov("system/users/alice", "vm", 2)])?
        .serial()
        .unwrap();
    assert_ne!(a, c);
    assert_eq!(ledger.quantity(&vm), 6);

    Ok(())
}

#[test]
fn one_refused_provision_rejects_the_whole_commission() -> anyhow::Result<()> {
    let mut ledger = MemLedger::new();
    let vm = key("system/users/bob", "vm");
    let ram = key("system/users/bob", "ram");
    ledger.set_capacity(vm.clone(), 1);
    ledger.set_capacity(ram.clone(), 1024);

    // ram fits, vm does not: neither lands, the list itemizes the refusal.
    let outcome = ledger.issue(
        "compute",
        "tx-mixed",
        &[
            prov("system/users/bob", "ram", 512),
            prov("system/users/bob", "vm", 2),
        ],
    )?;
    let rejections = match outcome {
        IssueOutcome::Rejected { rejections } => rejections,
        other => panic!("expected rejection, got {other:?}"),
    };
    assert_eq!(rejections.len(), 1);
    assert!(matches!(rejections[0].error, QuotaError::NoCapacity { .. }));

    assert_eq!(ledger.quantity(&vm), 0);
    assert_eq!(ledger.quantity(&ram), 0);

    // A failed issuance reserves no serial either: the same client key can
    // retry with a corrected request.
    let retry = ledger.issue(
        "compute",
        "tx-mixed",
        &[prov("system/users/bob", "ram", 512)],
    )?;
    assert!(retry.serial().is_some());
    assert_eq!(ledger.quantity(&ram), 512);

    Ok(())
}

#[test]
fn duplicate_pairs_in_one_request_are_malformed() {
    let mut ledger = MemLedger::new();
    let err = ledger
        .issue(
            "compute",
            "tx-dup",
            &[
                prov("system/users/bob", "vm", 1),
                prov("system/users/bob", "vm", 2),
            ],
        )
        .expect_err("duplicate pair must be an error");
    let qe = err.downcast_ref::<QuotaError>().expect("domain error");
    assert!(matches!(qe, QuotaError::InvalidData { .. }));
}
