//! Named limits policies.
//!
//! Policies are upserted whole: set_limits either installs all four bounds of
//! a policy or rejects that item. A policy can only be tightened as far as
//! its dependent holdings allow: a new bound below a currently-held quantity
//! rejects the item, because applying it would strand the holding outside
//! `[0, capacity]` and turn later reversals into false corruption. Deleting a
//! policy is not supported; holdings reference policies by name and a
//! dangling reference would poison every capacity check.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

use qh_schemas::{Limit, QuotaError, Rejected, SetLimitsRequest};

/// A policy row as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRow {
    pub name: String,
    #[serde(flatten)]
    pub limit: Limit,
}

/// Upsert a batch of policies. Each item is validated first; invalid bounds
/// or bounds below a dependent holding's current quantities reject the item
/// without touching the store.
pub async fn set_limits(
    pool: &PgPool,
    items: &[SetLimitsRequest],
) -> Result<Vec<Rejected<SetLimitsRequest>>> {
    let mut rejected = Vec::new();

    for item in items {
        if let Err(e) = qh_engine::validate_limit(&item.limit) {
            rejected.push(Rejected {
                item: item.clone(),
                error: e,
            });
            continue;
        }
        if item.policy.is_empty() {
            rejected.push(Rejected {
                item: item.clone(),
                error: QuotaError::InvalidData {
                    reason: "policy name must not be empty".to_string(),
                },
            });
            continue;
        }

        match set_one(pool, item).await {
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

async fn set_one(pool: &PgPool, item: &SetLimitsRequest) -> Result<()> {
    let mut tx = pool.begin().await.context("begin set_limits tx")?;

    // Lock every dependent holding so no commission can move a quantity
    // between this check and the upsert.
    let holdings: Vec<(String, String, i64, i64, i64)> = sqlx::query_as(
        "select entity, resource, quantity, imported, exported \
         from holdings where policy = $1 for update",
    )
    .bind(&item.policy)
    .fetch_all(&mut *tx)
    .await
    .map_err(|e| crate::map_tx_error(e, "dependent holdings lock"))?;

    for (entity, resource, quantity, imported, exported) in &holdings {
        if *quantity > item.limit.capacity {
            return Err(QuotaError::InvalidData {
                reason: format!(
                    "holding ({entity}, {resource}) holds {quantity}, above the new capacity {}",
                    item.limit.capacity
                ),
            }
            .into());
        }
        if *imported > item.limit.import_limit {
            return Err(QuotaError::InvalidData {
                reason: format!(
                    "holding ({entity}, {resource}) imported {imported}, above the new import limit {}",
                    item.limit.import_limit
                ),
            }
            .into());
        }
        if *exported > item.limit.export_limit {
            return Err(QuotaError::InvalidData {
                reason: format!(
                    "holding ({entity}, {resource}) exported {exported}, above the new export limit {}",
                    item.limit.export_limit
                ),
            }
            .into());
        }
    }

    sqlx::query(
        "insert into policies (name, quantity, capacity, import_limit, export_limit) \
         values ($1, $2, $3, $4, $5) \
         on conflict (name) do update set \
           quantity = excluded.quantity, \
           capacity = excluded.capacity, \
           import_limit = excluded.import_limit, \
           export_limit = excluded.export_limit",
    )
    .bind(&item.policy)
    .bind(item.limit.quantity)
    .bind(item.limit.capacity)
    .bind(item.limit.import_limit)
    .bind(item.limit.export_limit)
    .execute(&mut *tx)
    .await
    .context("set_limits upsert failed")?;

    tx.commit().await.context("commit set_limits tx")?;
    info!(policy = %item.policy, capacity = item.limit.capacity, "policy set");
    Ok(())
}

/// Fetch a batch of policies by name. Unknown names land in the rejected
/// list with `NoPolicy`.
pub async fn get_limits(
    pool: &PgPool,
    names: &[String],
) -> Result<(Vec<PolicyRow>, Vec<Rejected<String>>)> {
    let mut found = Vec::new();
    let mut rejected = Vec::new();

    for name in names {
        let row: Option<(i64, i64, i64, i64)> = sqlx::query_as(
            "select quantity, capacity, import_limit, export_limit \
             from policies where name = $1",
        )
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("get_limits query failed")?;

        match row {
            Some((quantity, capacity, import_limit, export_limit)) => found.push(PolicyRow {
                name: name.clone(),
                limit: Limit {
                    quantity,
                    capacity,
                    import_limit,
                    export_limit,
                },
            }),
            None => rejected.push(Rejected {
                item: name.clone(),
                error: QuotaError::NoPolicy {
                    policy: name.clone(),
                },
            }),
        }
    }
    Ok((found, rejected))
}
