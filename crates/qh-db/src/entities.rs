//! Entity tree persistence.
//!
//! Entities form a tree rooted at `system`. Children are discovered by name
//! prefix; a parent row never enumerates them. Every mutating call must
//! present the entity's current key; a mismatch is `Unauthorized` and
//! performs no mutation. Creation races on the same full name are resolved
//! by the primary-key constraint: the loser gets `DuplicateEntity`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use qh_schemas::{
    CreateEntityRequest, EntityName, QuotaError, Rejected, ReleaseEntityRequest,
};

#[derive(Debug, Clone)]
pub struct EntityRow {
    pub full_name: EntityName,
    pub parent_name: Option<String>,
    pub key: String,
    pub created_at: DateTime<Utc>,
}

/// Look up one entity by full name.
pub async fn resolve_entity(pool: &PgPool, name: &EntityName) -> Result<Option<EntityRow>> {
    let row = sqlx::query(
        "select full_name, parent_name, key, created_at from entities where full_name = $1",
    )
    .bind(name.as_str())
    .fetch_optional(pool)
    .await
    .context("resolve_entity failed")?;

    row.map(row_to_entity).transpose()
}

fn row_to_entity(row: sqlx::postgres::PgRow) -> Result<EntityRow> {
    let full_name: String = row.try_get("full_name")?;
    Ok(EntityRow {
        full_name: EntityName::parse(&full_name)?,
        parent_name: row.try_get("parent_name")?,
        key: row.try_get("key")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Create a batch of entities. Partial success: each item commits or is
/// rejected independently; the returned list names the failures.
pub async fn create_entities(
    pool: &PgPool,
    items: &[CreateEntityRequest],
) -> Result<Vec<Rejected<CreateEntityRequest>>> {
    let mut rejected = Vec::new();

    for item in items {
        match create_one(pool, item).await {
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

async fn create_one(pool: &PgPool, item: &CreateEntityRequest) -> Result<()> {
    let parent = item.entity.parent().ok_or_else(|| {
        anyhow::Error::new(QuotaError::InvalidData {
            reason: "cannot create the root entity".to_string(),
        })
    })?;

    let mut tx = pool.begin().await.context("begin create_entity tx")?;

    let parent_row = fetch_for_update(&mut tx, &parent)
        .await?
        .ok_or_else(|| {
            anyhow::Error::new(QuotaError::NoEntity {
                entity: parent.to_string(),
            })
        })?;
    if parent_row.key != item.parent_key {
        return Err(QuotaError::Unauthorized {
            entity: parent.to_string(),
        }
        .into());
    }

    let res = sqlx::query(
        "insert into entities (full_name, parent_name, key) values ($1, $2, $3)",
    )
    .bind(item.entity.as_str())
    .bind(parent.as_str())
    .bind(&item.key)
    .execute(&mut *tx)
    .await;

    match res {
        Ok(_) => {}
        Err(e) if crate::is_unique_violation(&e, "entities_pkey") => {
            return Err(QuotaError::DuplicateEntity {
                entity: item.entity.to_string(),
            }
            .into());
        }
        Err(e) => return Err(crate::map_tx_error(e, "create_entity insert")),
    }

    tx.commit().await.context("commit create_entity tx")?;
    info!(entity = %item.entity, "entity created");
    Ok(())
}

/// Release a batch of entities. An entity can only be released when its key
/// matches, it has no children, and all its holdings were released first.
pub async fn release_entities(
    pool: &PgPool,
    items: &[ReleaseEntityRequest],
) -> Result<Vec<Rejected<ReleaseEntityRequest>>> {
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

async fn release_one(pool: &PgPool, item: &ReleaseEntityRequest) -> Result<()> {
    if item.entity.is_root() {
        return Err(QuotaError::InvalidData {
            reason: "cannot release the root entity".to_string(),
        }
        .into());
    }

    let mut tx = pool.begin().await.context("begin release_entity tx")?;

    let row = fetch_for_update(&mut tx, &item.entity)
        .await?
        .ok_or_else(|| {
            anyhow::Error::new(QuotaError::NoEntity {
                entity: item.entity.to_string(),
            })
        })?;
    if row.key != item.key {
        return Err(QuotaError::Unauthorized {
            entity: item.entity.to_string(),
        }
        .into());
    }

    let child: Option<(String,)> = sqlx::query_as(
        "select full_name from entities where full_name like $1 limit 1",
    )
    .bind(item.entity.descendants_pattern())
    .fetch_optional(&mut *tx)
    .await
    .context("release_entity child scan failed")?;
    if let Some((child_name,)) = child {
        return Err(QuotaError::InvalidData {
            reason: format!("entity has children (e.g. {child_name})"),
        }
        .into());
    }

    let holding: Option<(String,)> = sqlx::query_as(
        "select resource from holdings where entity = $1 limit 1",
    )
    .bind(item.entity.as_str())
    .fetch_optional(&mut *tx)
    .await
    .context("release_entity holding scan failed")?;
    if let Some((resource,)) = holding {
        return Err(QuotaError::InvalidData {
            reason: format!("entity still holds resource {resource}; release holdings first"),
        }
        .into());
    }

    sqlx::query("delete from entities where full_name = $1")
        .bind(item.entity.as_str())
        .execute(&mut *tx)
        .await
        .context("release_entity delete failed")?;

    tx.commit().await.context("commit release_entity tx")?;
    info!(entity = %item.entity, "entity released");
    Ok(())
}

/// Rotate an entity's key. The only mutation an entity row ever sees.
pub async fn set_entity_key(
    pool: &PgPool,
    name: &EntityName,
    old_key: &str,
    new_key: &str,
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin set_entity_key tx")?;

    let row = fetch_for_update(&mut tx, name).await?.ok_or_else(|| {
        anyhow::Error::new(QuotaError::NoEntity {
            entity: name.to_string(),
        })
    })?;
    if row.key != old_key {
        return Err(QuotaError::Unauthorized {
            entity: name.to_string(),
        }
        .into());
    }

    sqlx::query("update entities set key = $2 where full_name = $1")
        .bind(name.as_str())
        .bind(new_key)
        .execute(&mut *tx)
        .await
        .context("set_entity_key update failed")?;

    tx.commit().await.context("commit set_entity_key tx")?;
    info!(entity = %name, "entity key rotated");
    Ok(())
}

async fn fetch_for_update(
    tx: &mut Transaction<'_, Postgres>,
    name: &EntityName,
) -> Result<Option<EntityRow>> {
    let row = sqlx::query(
        "select full_name, parent_name, key, created_at from entities \
         where full_name = $1 for update",
    )
    .bind(name.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| crate::map_tx_error(e, "entity lock"))?;

    row.map(row_to_entity).transpose()
}
