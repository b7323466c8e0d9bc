//! The timeline hash chain detects tampering after the fact: editing a
//! recorded quantity, dropping an entry, or splicing chains all break
//! verification, while honest lifecycles verify end to end.

use qh_audit::{verify_chain, VerifyResult};
use qh_testkit::{key, prov, MemLedger};

fn ledger_with_history() -> anyhow::Result<MemLedger> {
    let mut ledger = MemLedger::new();
    let vm = key("system/users/alice", "vm");
    ledger.set_capacity(vm, 10);

    let a = ledger
        .issue("compute", "tx-a", &[prov("system/users/alice", "vm", 4)])?
        .serial()
        .unwrap();
    ledger.accept(a)?;

    let b = ledger
        .issue("compute", "tx-b", &[prov("system/users/alice", "vm", 2)])?
        .serial()
        .unwrap();
    ledger.reject(b)?;

    Ok(ledger)
}

#[test]
fn honest_history_verifies() -> anyhow::Result<()> {
    let ledger = ledger_with_history()?;
    let chain = ledger.timeline(&key("system/users/alice", "vm"));

    assert_eq!(chain.len(), 3); // issue, issue, reject
    assert_eq!(verify_chain(&chain)?, VerifyResult::Valid { entries: 3 });
    Ok(())
}

#[test]
fn edited_quantity_is_detected_at_the_edited_entry() -> anyhow::Result<()> {
    let mut ledger = ledger_with_history()?;
    ledger.timeline_mut()[1].resulting_quantity += 100;

    let chain = ledger.timeline(&key("system/users/alice", "vm"));
    match verify_chain(&chain)? {
        VerifyResult::Broken { id, .. } => assert_eq!(id, chain[1].id),
        other => panic!("expected broken chain, got {other:?}"),
    }
    Ok(())
}

#[test]
fn dropped_middle_entry_breaks_the_link() -> anyhow::Result<()> {
    let ledger = ledger_with_history()?;
    let chain = ledger.timeline(&key("system/users/alice", "vm"));
    let spliced = vec![chain[0].clone(), chain[2].clone()];

    match verify_chain(&spliced)? {
        VerifyResult::Broken { id, reason } => {
            assert_eq!(id, chain[2].id);
            assert!(reason.contains("hash_prev"));
        }
        other => panic!("expected broken chain, got {other:?}"),
    }
    Ok(())
}

#[test]
fn chains_are_per_pair() -> anyhow::Result<()> {
    let mut ledger = MemLedger::new();
    ledger.set_capacity(key("system/a", "vm"), 10);
    ledger.set_capacity(key("system/a", "ram"), 10);

    ledger.issue(
        "compute",
        "tx-1",
        &[prov("system/a", "vm", 1), prov("system/a", "ram", 1)],
    )?;
    ledger.issue(
        "compute",
        "tx-2",
        &[prov("system/a", "vm", 1), prov("system/a", "ram", 1)],
    )?;

    // Each pair's chain verifies independently of the interleaving.
    for k in [key("system/a", "vm"), key("system/a", "ram")] {
        let chain = ledger.timeline(&k);
        assert_eq!(chain.len(), 2);
        assert!(verify_chain(&chain)?.is_valid());
        assert!(chain[0].hash_prev.is_none());
        assert_eq!(chain[1].hash_prev, chain[0].hash_self);
    }
    Ok(())
}
