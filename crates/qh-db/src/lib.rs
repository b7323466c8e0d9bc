//! Postgres persistence for the quota holder.
//!
//! Every public operation here executes inside one database transaction.
//! Holdings are locked with `SELECT ... FOR UPDATE` in canonical
//! `(entity, resource)` order (see `qh-engine`); lock waits are bounded with
//! `SET LOCAL lock_timeout` and surface as `ServiceUnavailable`;
//! serialization/deadlock failures are retried a bounded number of times.
//!
//! Domain failures travel as [`QuotaError`] values inside `anyhow` errors;
//! callers that need to dispatch on the kind use [`as_quota_error`].

use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use qh_schemas::QuotaError;

pub mod commissions;
pub mod entities;
pub mod holdings;
pub mod limits;
pub mod timeline;

pub use commissions::{
    accept_commission, fetch_commission, get_pending_commissions, issue_commission, pending_rows,
    reject_commission, resolve_pending_commissions, CommissionRow, PendingRow,
};
pub use entities::{
    create_entities, release_entities, resolve_entity, set_entity_key, EntityRow,
};
pub use holdings::{get_holdings, release_holdings};
pub use limits::{get_limits, set_limits, PolicyRow};
pub use timeline::{get_timeline, prune_timeline, verify_timeline};

pub const ENV_DB_URL: &str = "QH_DATABASE_URL";

/// Connect to Postgres using QH_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence + pending backlog).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='entities'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    let pending = if exists {
        let (n,): (i64,) = sqlx::query_as::<_, (i64,)>(
            "select count(*)::bigint from commissions where state = 'PENDING'",
        )
        .fetch_one(pool)
        .await
        .context("status pending-count query failed")?;
        n
    } else {
        0
    };

    Ok(DbStatus {
        ok,
        has_entities_table: exists,
        pending_commissions: pending,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_entities_table: bool,
    pub pending_commissions: i64,
}

// ---------------------------------------------------------------------------
// Transaction options
// ---------------------------------------------------------------------------

/// Per-transaction knobs: how long a row-lock wait may take and how many
/// times a serialization/deadlock failure is retried before surfacing.
#[derive(Debug, Clone, Copy)]
pub struct TxOptions {
    pub lock_timeout_ms: u64,
    pub retry_limit: u32,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5_000,
            retry_limit: 3,
        }
    }
}

/// Bound every row-lock wait in this transaction.
///
/// `lock_timeout` cannot be bound as a parameter; the value is an integer we
/// format ourselves, so no injection surface exists.
pub(crate) async fn set_local_lock_timeout(
    tx: &mut Transaction<'_, Postgres>,
    ms: u64,
) -> Result<(), sqlx::Error> {
    let stmt = format!("set local lock_timeout = '{ms}ms'");
    sqlx::query(&stmt).execute(&mut **tx).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.to_string()),
        _ => None,
    }
}

/// Serialization failure (40001) or deadlock detected (40P01): the
/// transaction may be retried transparently.
pub(crate) fn is_retryable(err: &sqlx::Error) -> bool {
    matches!(sqlstate(err).as_deref(), Some("40001") | Some("40P01"))
}

/// lock_not_available (55P03): the bounded lock wait expired.
pub(crate) fn is_lock_timeout(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("55P03")
}

/// Detect a Postgres unique constraint violation by name.
pub(crate) fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.constraint() == Some(constraint),
        _ => false,
    }
}

/// Map an sqlx error out of a transactional section: lock timeouts become
/// `ServiceUnavailable`, everything else is wrapped with context.
pub(crate) fn map_tx_error(err: sqlx::Error, what: &str) -> anyhow::Error {
    if is_lock_timeout(&err) {
        return anyhow::Error::new(QuotaError::ServiceUnavailable {
            detail: format!("lock timeout during {what}"),
        });
    }
    anyhow::Error::new(err).context(format!("{what} failed"))
}

/// Extract the domain error from an `anyhow` chain, if this failure is one.
pub fn as_quota_error(err: &anyhow::Error) -> Option<&QuotaError> {
    err.downcast_ref::<QuotaError>()
}
