//! Commission issuance and resolution.
//!
//! Issuance is all-or-nothing: every provision is validated against its
//! locked holding and either the whole commission is written or the complete
//! rejection list comes back. Holdings are locked in canonical
//! (entity, resource) order on every path that locks more than one, so two
//! commissions over the same holdings cannot deadlock. Retries cover
//! serialization failures and detected deadlocks only; lock-wait expiry
//! surfaces as `ServiceUnavailable`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{error, info, warn};

use qh_engine::{canonical_order, check_delta, check_reversal, resolve, Resolution, Transition};
use qh_schemas::{
    CommissionState, EntityName, IssueOutcome, Provision, ProvisionRejection, QuotaError,
    ResolveOutcome, ResolveResult,
};

use crate::holdings::{lock_holding, lock_or_create_holding, update_quantity};
use crate::{timeline, TxOptions};

/// A stored commission with its provision lines.
#[derive(Debug, Clone)]
pub struct CommissionRow {
    pub serial: i64,
    pub caller_id: String,
    pub client_key: String,
    pub state: CommissionState,
    pub quarantined: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub provisions: Vec<Provision>,
}

/// The slice of a pending commission the reconciler needs.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub serial: i64,
    pub caller_id: String,
    pub client_key: String,
    pub created_at: DateTime<Utc>,
    pub quarantined: bool,
}

fn is_retryable_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<sqlx::Error>()
        .map(crate::is_retryable)
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Issue
// ---------------------------------------------------------------------------

/// Issue a commission: reserve `provisions` atomically and return its serial,
/// or the complete per-provision rejection list.
///
/// Idempotent on (caller_id, client_key): a retransmission returns the serial
/// the first delivery produced, whatever state the commission is in by now.
pub async fn issue_commission(
    pool: &PgPool,
    opts: TxOptions,
    caller_id: &str,
    client_key: &str,
    provisions: &[Provision],
) -> Result<IssueOutcome> {
    let ordered = canonical_order(provisions).map_err(anyhow::Error::new)?;

    let mut attempt = 0;
    loop {
        match issue_once(pool, opts, caller_id, client_key, &ordered).await {
            Ok(outcome) => return Ok(outcome),
            Err(e) if is_retryable_failure(&e) && attempt < opts.retry_limit => {
                attempt += 1;
                warn!(caller_id, client_key, attempt, "retrying commission issue");
            }
            Err(e) => return Err(e),
        }
    }
}

async fn issue_once(
    pool: &PgPool,
    opts: TxOptions,
    caller_id: &str,
    client_key: &str,
    ordered: &[Provision],
) -> Result<IssueOutcome> {
    let mut tx = pool.begin().await.context("begin issue tx")?;
    crate::set_local_lock_timeout(&mut tx, opts.lock_timeout_ms)
        .await
        .map_err(|e| crate::map_tx_error(e, "lock timeout setup"))?;

    if let Some(serial) = existing_serial(&mut tx, caller_id, client_key).await? {
        return Ok(IssueOutcome::Issued { serial });
    }

    // Lock every holding in canonical order, then validate every delta.
    // All failures are collected so the caller sees the full picture at once.
    let mut rejections: Vec<ProvisionRejection> = Vec::new();
    let mut applied: Vec<(Provision, i64)> = Vec::new();

    for p in ordered {
        let holding = match lock_or_create_holding(&mut tx, &p.entity, &p.resource).await {
            Ok(h) => h,
            Err(e) => match crate::as_quota_error(&e) {
                Some(qe) => {
                    rejections.push(ProvisionRejection {
                        provision: p.clone(),
                        error: qe.clone(),
                    });
                    continue;
                }
                None => return Err(e),
            },
        };

        match check_delta(&p.entity, &p.resource, holding.view(), p.delta) {
            Ok(new_quantity) => applied.push((p.clone(), new_quantity)),
            Err(e) => rejections.push(ProvisionRejection {
                provision: p.clone(),
                error: e,
            }),
        }
    }

    if !rejections.is_empty() {
        tx.rollback().await.context("rollback rejected issue tx")?;
        return Ok(IssueOutcome::Rejected { rejections });
    }

    let res = sqlx::query_as::<_, (i64,)>(
        "insert into commissions (caller_id, client_key) values ($1, $2) returning serial",
    )
    .bind(caller_id)
    .bind(client_key)
    .fetch_one(&mut *tx)
    .await;

    let serial = match res {
        Ok((serial,)) => serial,
        Err(e) if crate::is_unique_violation(&e, "uq_commission_caller_tx") => {
            // Lost a race to a concurrent retransmission: its serial wins.
            tx.rollback().await.context("rollback raced issue tx")?;
            let mut tx2 = pool.begin().await.context("begin refetch tx")?;
            let serial = existing_serial(&mut tx2, caller_id, client_key)
                .await?
                .ok_or_else(|| anyhow::anyhow!("raced commission vanished"))?;
            return Ok(IssueOutcome::Issued { serial });
        }
        Err(e) => return Err(crate::map_tx_error(e, "commission insert")),
    };

    for (ordinal, (p, new_quantity)) in applied.iter().enumerate() {
        sqlx::query(
            "insert into provisions (commission, ordinal, entity, resource, delta) \
             values ($1, $2, $3, $4, $5)",
        )
        .bind(serial)
        .bind(ordinal as i32)
        .bind(p.entity.as_str())
        .bind(&p.resource)
        .bind(p.delta)
        .execute(&mut *tx)
        .await
        .context("provision insert failed")?;

        update_quantity(&mut tx, &p.entity, &p.resource, *new_quantity).await?;
        timeline::append_entry(
            &mut tx,
            &p.entity,
            &p.resource,
            p.delta,
            Some(serial),
            *new_quantity,
            "issue",
        )
        .await?;
    }

    tx.commit().await.context("commit issue tx")?;
    info!(serial, caller_id, provisions = ordered.len(), "commission issued");
    Ok(IssueOutcome::Issued { serial })
}

async fn existing_serial(
    tx: &mut Transaction<'_, Postgres>,
    caller_id: &str,
    client_key: &str,
) -> Result<Option<i64>> {
    let row: Option<(i64,)> = sqlx::query_as(
        "select serial from commissions where caller_id = $1 and client_key = $2",
    )
    .bind(caller_id)
    .bind(client_key)
    .fetch_optional(&mut **tx)
    .await
    .context("idempotency lookup failed")?;
    Ok(row.map(|(s,)| s))
}

// ---------------------------------------------------------------------------
// Resolve
// ---------------------------------------------------------------------------

/// Accept a pending commission: the debits stay, the state becomes terminal.
/// Re-delivery on a terminal commission reports the terminal state unchanged.
pub async fn accept_commission(
    pool: &PgPool,
    opts: TxOptions,
    serial: i64,
) -> Result<CommissionState> {
    let mut attempt = 0;
    loop {
        match accept_once(pool, opts, serial).await {
            Ok(state) => return Ok(state),
            Err(e) if is_retryable_failure(&e) && attempt < opts.retry_limit => {
                attempt += 1;
                warn!(serial, attempt, "retrying commission accept");
            }
            Err(e) => return Err(e),
        }
    }
}

async fn accept_once(pool: &PgPool, opts: TxOptions, serial: i64) -> Result<CommissionState> {
    let mut tx = pool.begin().await.context("begin accept tx")?;
    crate::set_local_lock_timeout(&mut tx, opts.lock_timeout_ms)
        .await
        .map_err(|e| crate::map_tx_error(e, "lock timeout setup"))?;

    let (state, quarantined) = lock_commission(&mut tx, serial).await?;
    if quarantined {
        return Err(QuotaError::Corrupted {
            serial,
            detail: "commission is quarantined".to_string(),
        }
        .into());
    }

    match resolve(state, Resolution::Accept) {
        Transition::AlreadyTerminal(s) => Ok(s),
        Transition::Apply(s) => {
            mark_resolved(&mut tx, serial, s).await?;
            tx.commit().await.context("commit accept tx")?;
            info!(serial, "commission accepted");
            Ok(s)
        }
    }
}

/// Reject a pending commission: every provision is reversed under the same
/// canonical lock order issuance used, then the state becomes terminal.
///
/// A reversal that contradicts the stored quantities quarantines the
/// commission (no quantities are touched) and surfaces `Corrupted`.
pub async fn reject_commission(
    pool: &PgPool,
    opts: TxOptions,
    serial: i64,
) -> Result<CommissionState> {
    let mut attempt = 0;
    loop {
        match reject_once(pool, opts, serial).await {
            Ok(state) => return Ok(state),
            Err(e) if is_retryable_failure(&e) && attempt < opts.retry_limit => {
                attempt += 1;
                warn!(serial, attempt, "retrying commission reject");
            }
            Err(e) => return Err(e),
        }
    }
}

async fn reject_once(pool: &PgPool, opts: TxOptions, serial: i64) -> Result<CommissionState> {
    let mut tx = pool.begin().await.context("begin reject tx")?;
    crate::set_local_lock_timeout(&mut tx, opts.lock_timeout_ms)
        .await
        .map_err(|e| crate::map_tx_error(e, "lock timeout setup"))?;

    let (state, quarantined) = lock_commission(&mut tx, serial).await?;
    if quarantined {
        return Err(QuotaError::Corrupted {
            serial,
            detail: "commission is quarantined".to_string(),
        }
        .into());
    }

    let target = match resolve(state, Resolution::Reject) {
        Transition::AlreadyTerminal(s) => return Ok(s),
        Transition::Apply(s) => s,
    };

    // Provisions were stored in canonical order; ordinal preserves it.
    let provisions = commission_provisions(&mut tx, serial).await?;

    let mut reversals: Vec<(Provision, i64)> = Vec::new();
    for p in &provisions {
        let holding = lock_holding(&mut tx, &p.entity, &p.resource).await?;
        let view = match holding {
            Some(h) => h.view(),
            None => {
                return quarantine_and_fail(
                    pool,
                    tx,
                    serial,
                    format!("holding {}/{} missing at reversal", p.entity, p.resource),
                )
                .await;
            }
        };
        match check_reversal(serial, view, p.delta) {
            Ok(restored) => reversals.push((p.clone(), restored)),
            Err(QuotaError::Corrupted { detail, .. }) => {
                return quarantine_and_fail(pool, tx, serial, detail).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    for (p, restored) in &reversals {
        update_quantity(&mut tx, &p.entity, &p.resource, *restored).await?;
        timeline::append_entry(
            &mut tx,
            &p.entity,
            &p.resource,
            -p.delta,
            Some(serial),
            *restored,
            "reject",
        )
        .await?;
    }

    mark_resolved(&mut tx, serial, target).await?;
    tx.commit().await.context("commit reject tx")?;
    info!(serial, "commission rejected");
    Ok(target)
}

/// Abandon the reversal, flag the commission and report corruption. The flag
/// is written in its own short transaction so it survives the rollback.
async fn quarantine_and_fail(
    pool: &PgPool,
    tx: Transaction<'_, Postgres>,
    serial: i64,
    detail: String,
) -> Result<CommissionState> {
    tx.rollback().await.context("rollback corrupted reject tx")?;

    sqlx::query("update commissions set quarantined = true where serial = $1")
        .bind(serial)
        .execute(pool)
        .await
        .context("quarantine update failed")?;

    error!(serial, detail = %detail, "commission quarantined: stored state contradicts provisions");
    Err(QuotaError::Corrupted { serial, detail }.into())
}

async fn lock_commission(
    tx: &mut Transaction<'_, Postgres>,
    serial: i64,
) -> Result<(CommissionState, bool)> {
    let row: Option<(String, bool)> = sqlx::query_as(
        "select state, quarantined from commissions where serial = $1 for update",
    )
    .bind(serial)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| crate::map_tx_error(e, "commission lock"))?;

    let Some((state, quarantined)) = row else {
        return Err(QuotaError::NoCommission { serial }.into());
    };
    Ok((CommissionState::parse(&state)?, quarantined))
}

async fn mark_resolved(
    tx: &mut Transaction<'_, Postgres>,
    serial: i64,
    state: CommissionState,
) -> Result<()> {
    sqlx::query("update commissions set state = $2, resolved_at = now() where serial = $1")
        .bind(serial)
        .bind(state.as_str())
        .execute(&mut **tx)
        .await
        .context("commission state update failed")?;
    Ok(())
}

async fn commission_provisions(
    tx: &mut Transaction<'_, Postgres>,
    serial: i64,
) -> Result<Vec<Provision>> {
    let rows = sqlx::query(
        "select entity, resource, delta from provisions \
         where commission = $1 order by ordinal",
    )
    .bind(serial)
    .fetch_all(&mut **tx)
    .await
    .context("provision fetch failed")?;

    rows.into_iter()
        .map(|row| {
            let entity: String = row.try_get("entity")?;
            Ok(Provision {
                entity: EntityName::parse(&entity)?,
                resource: row.try_get("resource")?,
                delta: row.try_get("delta")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Load one commission with its provision lines.
pub async fn fetch_commission(pool: &PgPool, serial: i64) -> Result<Option<CommissionRow>> {
    let row = sqlx::query(
        "select serial, caller_id, client_key, state, quarantined, created_at, resolved_at \
         from commissions where serial = $1",
    )
    .bind(serial)
    .fetch_optional(pool)
    .await
    .context("fetch_commission query failed")?;

    let Some(row) = row else { return Ok(None) };
    let state: String = row.try_get("state")?;

    let prov_rows = sqlx::query(
        "select entity, resource, delta from provisions \
         where commission = $1 order by ordinal",
    )
    .bind(serial)
    .fetch_all(pool)
    .await
    .context("fetch_commission provisions query failed")?;
    let provisions = prov_rows
        .into_iter()
        .map(|row| {
            let entity: String = row.try_get("entity")?;
            Ok(Provision {
                entity: EntityName::parse(&entity)?,
                resource: row.try_get("resource")?,
                delta: row.try_get("delta")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Some(CommissionRow {
        serial: row.try_get("serial")?,
        caller_id: row.try_get("caller_id")?,
        client_key: row.try_get("client_key")?,
        state: CommissionState::parse(&state)?,
        quarantined: row.try_get("quarantined")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
        provisions,
    }))
}

/// Serials of pending commissions, optionally scoped to those touching an
/// entity or any of its descendants.
pub async fn get_pending_commissions(
    pool: &PgPool,
    scope: Option<&EntityName>,
) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = match scope {
        None => {
            sqlx::query_as(
                "select serial from commissions where state = 'PENDING' order by serial",
            )
            .fetch_all(pool)
            .await
        }
        Some(entity) => {
            sqlx::query_as(
                "select distinct c.serial from commissions c \
                 join provisions p on p.commission = c.serial \
                 where c.state = 'PENDING' \
                   and (p.entity = $1 or p.entity like $2) \
                 order by c.serial",
            )
            .bind(entity.as_str())
            .bind(entity.descendants_pattern())
            .fetch_all(pool)
            .await
        }
    }
    .context("get_pending_commissions query failed")?;

    Ok(rows.into_iter().map(|(s,)| s).collect())
}

/// Every pending commission row, quarantined ones included. The reconciler
/// decides what to do with each.
pub async fn pending_rows(pool: &PgPool) -> Result<Vec<PendingRow>> {
    let rows = sqlx::query(
        "select serial, caller_id, client_key, created_at, quarantined \
         from commissions where state = 'PENDING' order by serial",
    )
    .fetch_all(pool)
    .await
    .context("pending_rows query failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(PendingRow {
                serial: row.try_get("serial")?,
                caller_id: row.try_get("caller_id")?,
                client_key: row.try_get("client_key")?,
                created_at: row.try_get("created_at")?,
                quarantined: row.try_get("quarantined")?,
            })
        })
        .collect()
}

/// Apply a batch of resolutions. Each item resolves independently; domain
/// failures are reported per item, infrastructure failures abort the batch.
pub async fn resolve_pending_commissions(
    pool: &PgPool,
    opts: TxOptions,
    items: &[(i64, Resolution)],
) -> Result<Vec<ResolveResult>> {
    let mut results = Vec::with_capacity(items.len());

    for &(serial, resolution) in items {
        let res = match resolution {
            Resolution::Accept => accept_commission(pool, opts, serial).await,
            Resolution::Reject => reject_commission(pool, opts, serial).await,
        };
        let outcome = match res {
            Ok(state) => ResolveOutcome::Resolved { state },
            Err(e) => match crate::as_quota_error(&e) {
                Some(qe) => ResolveOutcome::Failed { error: qe.clone() },
                None => return Err(e),
            },
        };
        results.push(ResolveResult { serial, outcome });
    }
    Ok(results)
}
