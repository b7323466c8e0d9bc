//! Append-only timeline of holding mutations.
//!
//! Every quantity change writes exactly one entry in the same transaction
//! that changed the holding. Entries for one (entity, resource) pair form a
//! hash chain (see `qh-audit`); appending reads the current chain head under
//! the holding row lock the caller already holds, so heads never fork.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};

use qh_audit::VerifyResult;
use qh_schemas::{EntityName, TimelineEntry};

/// Postgres stores `timestamptz` at microsecond precision. The hash must be
/// computed over the timestamp exactly as verification will read it back, so
/// sub-microsecond nanos are dropped before sealing.
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Append one sealed entry. The caller must already hold the row lock on the
/// (entity, resource) holding, or be deleting it in this same transaction.
pub(crate) async fn append_entry(
    tx: &mut Transaction<'_, Postgres>,
    entity: &EntityName,
    resource: &str,
    delta: i64,
    commission: Option<i64>,
    resulting_quantity: i64,
    reason: &str,
) -> Result<i64> {
    let prev: Option<(Option<String>,)> = sqlx::query_as(
        "select hash_self from timeline \
         where entity = $1 and resource = $2 \
         order by id desc limit 1",
    )
    .bind(entity.as_str())
    .bind(resource)
    .fetch_optional(&mut **tx)
    .await
    .context("timeline head lookup failed")?;
    let prev_hash = prev.and_then(|(h,)| h);

    let mut entry = TimelineEntry {
        id: 0,
        entity: entity.clone(),
        resource: resource.to_string(),
        delta,
        commission,
        resulting_quantity,
        reason: reason.to_string(),
        hash_prev: None,
        hash_self: None,
        ts: now_micros(),
    };
    qh_audit::seal_entry(&mut entry, prev_hash)?;

    let (id,): (i64,) = sqlx::query_as(
        "insert into timeline \
           (entity, resource, delta, commission, resulting_quantity, reason, \
            hash_prev, hash_self, ts) \
         values ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         returning id",
    )
    .bind(entity.as_str())
    .bind(resource)
    .bind(delta)
    .bind(commission)
    .bind(resulting_quantity)
    .bind(reason)
    .bind(&entry.hash_prev)
    .bind(&entry.hash_self)
    .bind(entry.ts)
    .fetch_one(&mut **tx)
    .await
    .context("timeline insert failed")?;

    Ok(id)
}

fn row_to_entry(row: sqlx::postgres::PgRow) -> Result<TimelineEntry> {
    let entity: String = row.try_get("entity")?;
    Ok(TimelineEntry {
        id: row.try_get("id")?,
        entity: EntityName::parse(&entity)?,
        resource: row.try_get("resource")?,
        delta: row.try_get("delta")?,
        commission: row.try_get("commission")?,
        resulting_quantity: row.try_get("resulting_quantity")?,
        reason: row.try_get("reason")?,
        hash_prev: row.try_get("hash_prev")?,
        hash_self: row.try_get("hash_self")?,
        ts: row.try_get("ts")?,
    })
}

/// Read one pair's timeline, oldest first, optionally bounded by timestamps.
pub async fn get_timeline(
    pool: &PgPool,
    entity: &EntityName,
    resource: &str,
    after: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
) -> Result<Vec<TimelineEntry>> {
    let rows = sqlx::query(
        "select id, entity, resource, delta, commission, resulting_quantity, \
                reason, hash_prev, hash_self, ts \
         from timeline \
         where entity = $1 and resource = $2 \
           and ($3::timestamptz is null or ts >= $3) \
           and ($4::timestamptz is null or ts <= $4) \
         order by id",
    )
    .bind(entity.as_str())
    .bind(resource)
    .bind(after)
    .bind(before)
    .fetch_all(pool)
    .await
    .context("get_timeline query failed")?;

    rows.into_iter().map(row_to_entry).collect()
}

/// Recheck one pair's hash chain from the store.
pub async fn verify_timeline(
    pool: &PgPool,
    entity: &EntityName,
    resource: &str,
) -> Result<VerifyResult> {
    let entries = get_timeline(pool, entity, resource, None, None).await?;
    qh_audit::verify_chain(&entries)
}

/// Delete entries older than the cutoff. Returns the number removed.
///
/// Verification stays possible afterwards because chains tolerate a pruned
/// head (the oldest surviving entry's hash_prev is taken on trust).
pub async fn prune_timeline(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query("delete from timeline where ts < $1")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("prune_timeline delete failed")?;
    Ok(res.rows_affected())
}
