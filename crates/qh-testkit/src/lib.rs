//! In-memory reference ledger and shared builders for scenario tests.
//!
//! [`MemLedger`] mirrors the store semantics using only the pure crates:
//! canonical ordering and delta checks from `qh-engine`, sealed timeline
//! entries from `qh-audit`. Scenario tests in `tests/` drive it to pin down
//! cross-component properties (conservation, idempotence, atomicity) without
//! a database; the `qh-db` scenario tests cover the same properties against
//! real Postgres.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::Utc;

use qh_engine::{canonical_order, check_delta, check_reversal, resolve, HoldingView, Resolution, Transition};
use qh_schemas::{
    CommissionState, EntityName, HoldingKey, IssueOutcome, Provision, ProvisionRejection,
    TimelineEntry,
};

/// Capacity a pair gets when no explicit capacity was set, matching the
/// seeded default policy.
pub const DEFAULT_CAPACITY: i64 = 1 << 62;

pub fn entity(name: &str) -> EntityName {
    EntityName::parse(name).expect("valid entity name")
}

pub fn prov(entity_name: &str, resource: &str, delta: i64) -> Provision {
    Provision::new(entity(entity_name), resource, delta)
}

pub fn key(entity_name: &str, resource: &str) -> HoldingKey {
    HoldingKey {
        entity: entity(entity_name),
        resource: resource.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct CommissionRecord {
    pub state: CommissionState,
    pub provisions: Vec<Provision>,
}

/// The in-memory quota ledger.
#[derive(Debug, Default)]
pub struct MemLedger {
    capacities: HashMap<HoldingKey, i64>,
    quantities: HashMap<HoldingKey, i64>,
    commissions: BTreeMap<i64, CommissionRecord>,
    by_client: HashMap<(String, String), i64>,
    timeline: Vec<TimelineEntry>,
    next_serial: i64,
}

impl MemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_capacity(&mut self, k: HoldingKey, capacity: i64) {
        self.capacities.insert(k, capacity);
    }

    pub fn quantity(&self, k: &HoldingKey) -> i64 {
        self.quantities.get(k).copied().unwrap_or(0)
    }

    pub fn state_of(&self, serial: i64) -> Option<CommissionState> {
        self.commissions.get(&serial).map(|c| c.state)
    }

    fn view(&self, k: &HoldingKey) -> HoldingView {
        HoldingView {
            quantity: self.quantity(k),
            capacity: self.capacities.get(k).copied().unwrap_or(DEFAULT_CAPACITY),
        }
    }

    /// Issue a commission: all-or-nothing, idempotent on (caller, client_key).
    pub fn issue(
        &mut self,
        caller_id: &str,
        client_key: &str,
        provisions: &[Provision],
    ) -> Result<IssueOutcome> {
        let ordered = canonical_order(provisions).map_err(anyhow::Error::new)?;

        let client = (caller_id.to_string(), client_key.to_string());
        if let Some(serial) = self.by_client.get(&client) {
            return Ok(IssueOutcome::Issued { serial: *serial });
        }

        let mut rejections = Vec::new();
        let mut applied = Vec::new();
        for p in &ordered {
            let k = p.holding_key();
            match check_delta(&p.entity, &p.resource, self.view(&k), p.delta) {
                Ok(new_quantity) => applied.push((k, p.clone(), new_quantity)),
                Err(e) => rejections.push(ProvisionRejection {
                    provision: p.clone(),
                    error: e,
                }),
            }
        }
        if !rejections.is_empty() {
            return Ok(IssueOutcome::Rejected { rejections });
        }

        self.next_serial += 1;
        let serial = self.next_serial;
        for (k, p, new_quantity) in applied {
            self.quantities.insert(k, new_quantity);
            self.append_timeline(&p.entity, &p.resource, p.delta, serial, new_quantity, "issue")?;
        }
        self.commissions.insert(
            serial,
            CommissionRecord {
                state: CommissionState::Pending,
                provisions: ordered,
            },
        );
        self.by_client.insert(client, serial);
        Ok(IssueOutcome::Issued { serial })
    }

    /// Accept a commission: debits stay. Idempotent on terminal states.
    pub fn accept(&mut self, serial: i64) -> Result<CommissionState> {
        let rec = self
            .commissions
            .get_mut(&serial)
            .ok_or_else(|| anyhow::anyhow!("no commission {serial}"))?;
        match resolve(rec.state, Resolution::Accept) {
            Transition::AlreadyTerminal(s) => Ok(s),
            Transition::Apply(s) => {
                rec.state = s;
                Ok(s)
            }
        }
    }

    /// Reject a commission: every provision is reversed.
    pub fn reject(&mut self, serial: i64) -> Result<CommissionState> {
        let rec = self
            .commissions
            .get(&serial)
            .ok_or_else(|| anyhow::anyhow!("no commission {serial}"))?
            .clone();
        let target = match resolve(rec.state, Resolution::Reject) {
            Transition::AlreadyTerminal(s) => return Ok(s),
            Transition::Apply(s) => s,
        };

        let mut restored_quantities = Vec::new();
        for p in &rec.provisions {
            let k = p.holding_key();
            let restored = check_reversal(serial, self.view(&k), p.delta)
                .map_err(anyhow::Error::new)?;
            restored_quantities.push((k, p.clone(), restored));
        }
        for (k, p, restored) in restored_quantities {
            self.quantities.insert(k, restored);
            self.append_timeline(&p.entity, &p.resource, -p.delta, serial, restored, "reject")?;
        }
        self.commissions
            .get_mut(&serial)
            .expect("checked above")
            .state = target;
        Ok(target)
    }

    /// One pair's timeline, oldest first.
    pub fn timeline(&self, k: &HoldingKey) -> Vec<TimelineEntry> {
        self.timeline
            .iter()
            .filter(|e| e.entity == k.entity && e.resource == k.resource)
            .cloned()
            .collect()
    }

    /// Mutable access for tamper scenarios.
    pub fn timeline_mut(&mut self) -> &mut Vec<TimelineEntry> {
        &mut self.timeline
    }

    fn append_timeline(
        &mut self,
        entity: &EntityName,
        resource: &str,
        delta: i64,
        commission: i64,
        resulting_quantity: i64,
        reason: &str,
    ) -> Result<()> {
        let prev_hash = self
            .timeline
            .iter()
            .rev()
            .find(|e| e.entity == *entity && e.resource == resource)
            .and_then(|e| e.hash_self.clone());

        let mut entry = TimelineEntry {
            id: self.timeline.len() as i64 + 1,
            entity: entity.clone(),
            resource: resource.to_string(),
            delta,
            commission: Some(commission),
            resulting_quantity,
            reason: reason.to_string(),
            hash_prev: None,
            hash_self: None,
            ts: Utc::now(),
        };
        qh_audit::seal_entry(&mut entry, prev_hash)?;
        self.timeline.push(entry);
        Ok(())
    }
}
