//! Holding rows: the ledger.
//!
//! A holding is created implicitly on first commission against its
//! (entity, resource) pair, bound to the resource-named policy if one exists
//! and to `default` otherwise. All mutations happen under a row-level
//! `FOR UPDATE` lock inside the caller's transaction, and every mutation
//! appends one timeline entry in the same transaction.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use qh_schemas::{
    EntityName, HoldingKey, HoldingSnapshot, QuotaError, Rejected, ReleaseHoldingRequest,
};

use crate::timeline;

/// One holding row joined with its policy's capacity.
#[derive(Debug, Clone)]
pub(crate) struct HoldingRow {
    pub entity: EntityName,
    pub resource: String,
    pub policy: String,
    pub quantity: i64,
    pub imported: i64,
    pub exported: i64,
    pub flags: i64,
    pub capacity: i64,
}

impl HoldingRow {
    pub(crate) fn view(&self) -> qh_engine::HoldingView {
        qh_engine::HoldingView {
            quantity: self.quantity,
            capacity: self.capacity,
        }
    }

    fn snapshot(&self) -> HoldingSnapshot {
        HoldingSnapshot {
            entity: self.entity.clone(),
            resource: self.resource.clone(),
            policy: self.policy.clone(),
            quantity: self.quantity,
            capacity: self.capacity,
            imported: self.imported,
            exported: self.exported,
            flags: self.flags,
        }
    }
}

fn row_to_holding(row: sqlx::postgres::PgRow) -> Result<HoldingRow> {
    let entity: String = row.try_get("entity")?;
    Ok(HoldingRow {
        entity: EntityName::parse(&entity)?,
        resource: row.try_get("resource")?,
        policy: row.try_get("policy")?,
        quantity: row.try_get("quantity")?,
        imported: row.try_get("imported")?,
        exported: row.try_get("exported")?,
        flags: row.try_get("flags")?,
        capacity: row.try_get("capacity")?,
    })
}

/// Lock one holding row (`FOR UPDATE OF h`; the policy row stays unlocked).
pub(crate) async fn lock_holding(
    tx: &mut Transaction<'_, Postgres>,
    entity: &EntityName,
    resource: &str,
) -> Result<Option<HoldingRow>> {
    let row = sqlx::query(
        "select h.entity, h.resource, h.policy, h.quantity, h.imported, h.exported, \
                h.flags, p.capacity \
         from holdings h join policies p on p.name = h.policy \
         where h.entity = $1 and h.resource = $2 \
         for update of h",
    )
    .bind(entity.as_str())
    .bind(resource)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| crate::map_tx_error(e, "holding lock"))?;

    row.map(row_to_holding).transpose()
}

/// Lock a holding, creating it first-touch if absent.
///
/// The insert uses `ON CONFLICT DO NOTHING` followed by a re-lock so that two
/// concurrent first-touchers converge on the same row instead of failing.
pub(crate) async fn lock_or_create_holding(
    tx: &mut Transaction<'_, Postgres>,
    entity: &EntityName,
    resource: &str,
) -> Result<HoldingRow> {
    if let Some(h) = lock_holding(tx, entity, resource).await? {
        return Ok(h);
    }

    let exists: Option<(String,)> =
        sqlx::query_as("select full_name from entities where full_name = $1")
            .bind(entity.as_str())
            .fetch_optional(&mut **tx)
            .await
            .context("first-touch entity check failed")?;
    if exists.is_none() {
        return Err(QuotaError::NoEntity {
            entity: entity.to_string(),
        }
        .into());
    }

    // Resource-named policy wins; `default` (seeded by migration) otherwise.
    let policy: Option<(String, i64)> =
        sqlx::query_as("select name, quantity from policies where name = $1")
            .bind(resource)
            .fetch_optional(&mut **tx)
            .await
            .context("first-touch policy lookup failed")?;
    let (policy_name, initial_quantity) =
        policy.unwrap_or_else(|| ("default".to_string(), 0));

    sqlx::query(
        "insert into holdings (entity, resource, policy, quantity) values ($1, $2, $3, $4) \
         on conflict (entity, resource) do nothing",
    )
    .bind(entity.as_str())
    .bind(resource)
    .bind(&policy_name)
    .bind(initial_quantity)
    .execute(&mut **tx)
    .await
    .map_err(|e| crate::map_tx_error(e, "first-touch holding insert"))?;

    lock_holding(tx, entity, resource)
        .await?
        .ok_or_else(|| anyhow::anyhow!("holding vanished after first-touch insert"))
}

/// Apply a validated new quantity to a locked holding.
pub(crate) async fn update_quantity(
    tx: &mut Transaction<'_, Postgres>,
    entity: &EntityName,
    resource: &str,
    new_quantity: i64,
) -> Result<()> {
    sqlx::query(
        "update holdings set quantity = $3 where entity = $1 and resource = $2",
    )
    .bind(entity.as_str())
    .bind(resource)
    .bind(new_quantity)
    .execute(&mut **tx)
    .await
    .context("holding quantity update failed")?;
    Ok(())
}

/// Snapshot a batch of holdings. Missing pairs land in the rejected list with
/// `NoHolding` (reads never auto-create).
pub async fn get_holdings(
    pool: &PgPool,
    keys: &[HoldingKey],
) -> Result<(Vec<HoldingSnapshot>, Vec<Rejected<HoldingKey>>)> {
    let mut found = Vec::new();
    let mut rejected = Vec::new();

    for key in keys {
        let row = sqlx::query(
            "select h.entity, h.resource, h.policy, h.quantity, h.imported, h.exported, \
                    h.flags, p.capacity \
             from holdings h join policies p on p.name = h.policy \
             where h.entity = $1 and h.resource = $2",
        )
        .bind(key.entity.as_str())
        .bind(&key.resource)
        .fetch_optional(pool)
        .await
        .context("get_holdings query failed")?;

        match row.map(row_to_holding).transpose()? {
            Some(h) => found.push(h.snapshot()),
            None => rejected.push(Rejected {
                item: key.clone(),
                error: QuotaError::NoHolding {
                    entity: key.entity.to_string(),
                    resource: key.resource.clone(),
                },
            }),
        }
    }
    Ok((found, rejected))
}

/// Release a batch of holdings. A holding cannot be released while a pending
/// commission references it.
pub async fn release_holdings(
    pool: &PgPool,
    items: &[ReleaseHoldingRequest],
) -> Result<Vec<Rejected<ReleaseHoldingRequest>>> {
    let mut rejected = Vec::new();

    for item in items {
        match release_one(pool, item).await {
            Ok(()) => {}
            Err(e) => match crate::as_quota_error(&e) {
                Some(qe) => rejected.push(Rejected {
                    item: item.clone(),
                    error: qe.clone(),
                }),
                None => return Err(e),
            },
        }
    }
    Ok(rejected)
}

async fn release_one(pool: &PgPool, item: &ReleaseHoldingRequest) -> Result<()> {
    let mut tx = pool.begin().await.context("begin release_holding tx")?;

    let entity_key: Option<(String,)> =
        sqlx::query_as("select key from entities where full_name = $1")
            .bind(item.entity.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context("release_holding entity lookup failed")?;
    let Some((key,)) = entity_key else {
        return Err(QuotaError::NoEntity {
            entity: item.entity.to_string(),
        }
        .into());
    };
    if key != item.key {
        return Err(QuotaError::Unauthorized {
            entity: item.entity.to_string(),
        }
        .into());
    }

    let holding = lock_holding(&mut tx, &item.entity, &item.resource)
        .await?
        .ok_or_else(|| {
            anyhow::Error::new(QuotaError::NoHolding {
                entity: item.entity.to_string(),
                resource: item.resource.clone(),
            })
        })?;

    let pending: Option<(i64,)> = sqlx::query_as(
        "select c.serial from provisions p \
         join commissions c on c.serial = p.commission \
         where p.entity = $1 and p.resource = $2 and c.state = 'PENDING' \
         limit 1",
    )
    .bind(item.entity.as_str())
    .bind(&item.resource)
    .fetch_optional(&mut *tx)
    .await
    .context("release_holding pending scan failed")?;
    if let Some((serial,)) = pending {
        return Err(QuotaError::InvalidData {
            reason: format!("pending commission {serial} references this holding"),
        }
        .into());
    }

    sqlx::query("delete from holdings where entity = $1 and resource = $2")
        .bind(item.entity.as_str())
        .bind(&item.resource)
        .execute(&mut *tx)
        .await
        .context("release_holding delete failed")?;

    timeline::append_entry(
        &mut tx,
        &item.entity,
        &item.resource,
        -holding.quantity,
        None,
        0,
        "release",
    )
    .await?;

    tx.commit().await.context("commit release_holding tx")?;
    info!(entity = %item.entity, resource = %item.resource, "holding released");
    Ok(())
}
