//! Deadlock freedom rests on every path locking holdings in the same
//! canonical (entity, resource) order. These tests pin the convergence
//! property and check that the ledger's outcome is independent of the
//! order provisions arrive in.

use qh_engine::canonical_order;
use qh_testkit::{key, prov, MemLedger};

#[test]
fn every_permutation_locks_in_the_same_order() -> anyhow::Result<()> {
    let a = prov("system/a", "vm", 1);
    let b = prov("system/a", "ram", 2);
    let c = prov("system/b", "vm", 3);

    let reference = canonical_order(&[a.clone(), b.clone(), c.clone()])?;

    let permutations = [
        vec![a.clone(), c.clone(), b.clone()],
        vec![b.clone(), a.clone(), c.clone()],
        vec![b.clone(), c.clone(), a.clone()],
        vec![c.clone(), a.clone(), b.clone()],
        vec![c.clone(), b.clone(), a.clone()],
    ];
    for perm in permutations {
        assert_eq!(canonical_order(&perm)?, reference);
    }

    // Entity sorts before resource within the key.
    assert_eq!(reference[0].resource, "ram");
    assert_eq!(reference[0].entity.as_str(), "system/a");
    assert_eq!(reference[2].entity.as_str(), "system/b");

    Ok(())
}

#[test]
fn issue_outcome_is_independent_of_provision_order() -> anyhow::Result<()> {
    let build = |provisions: &[qh_schemas::Provision]| -> anyhow::Result<(i64, i64)> {
        let mut ledger = MemLedger::new();
        let vm = key("system/users/alice", "vm");
        let ram = key("system/users/alice", "ram");
        ledger.set_capacity(vm.clone(), 10);
        ledger.set_capacity(ram.clone(), 1024);
        ledger.issue("compute", "tx", provisions)?;
        Ok((ledger.quantity(&vm), ledger.quantity(&ram)))
    };

    let forward = build(&[
        prov("system/users/alice", "vm", 2),
        prov("system/users/alice", "ram", 256),
    ])?;
    let backward = build(&[
        prov("system/users/alice", "ram", 256),
        prov("system/users/alice", "vm", 2),
    ])?;
    assert_eq!(forward, backward);
    assert_eq!(forward, (2, 256));

    Ok(())
}
