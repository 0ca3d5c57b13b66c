//! Persistent cache tier operations.
//!
//! Free functions over a [`DatabaseConnection`] managing the
//! `cache_record` table. This tier survives restarts; every write carries
//! its own expiry, enforced at read time rather than with a background
//! sweeper.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
    sea_query::OnConflict,
};

use crate::entity::cache_record::{ActiveModel, Column, Entity as CacheRecord, Model};
use crate::error::Result;

/// Load a cache entry that is still live at `now`.
///
/// Expired entries are treated as misses and left in place; the next
/// `store` for the same fingerprint overwrites them.
pub async fn load(
    db: &DatabaseConnection,
    fingerprint: &str,
    now: DateTime<Utc>,
) -> Result<Option<serde_json::Value>> {
    let entry = CacheRecord::find()
        .filter(Column::Fingerprint.eq(fingerprint))
        .filter(Column::ExpiresAt.gt(now.fixed_offset()))
        .one(db)
        .await?;

    match entry {
        Some(model) => Ok(serde_json::from_str(&model.payload).ok()),
        None => Ok(None),
    }
}

/// Load the live entries among `fingerprints`. Used for targeted preloads.
pub async fn load_many(
    db: &DatabaseConnection,
    fingerprints: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<Model>> {
    if fingerprints.is_empty() {
        return Ok(Vec::new());
    }
    let entries = CacheRecord::find()
        .filter(Column::Fingerprint.is_in(fingerprints.iter().map(String::as_str)))
        .filter(Column::ExpiresAt.gt(now.fixed_offset()))
        .all(db)
        .await?;

    Ok(entries)
}

/// Store or replace a cache entry, live for `ttl` from now.
pub async fn store(
    db: &DatabaseConnection,
    fingerprint: &str,
    source: &str,
    payload: &serde_json::Value,
    ttl: Duration,
) -> Result<()> {
    let now = Utc::now();
    let model = ActiveModel {
        fingerprint: Set(fingerprint.to_string()),
        source: Set(source.to_string()),
        payload: Set(payload.to_string()),
        cached_at: Set(now.fixed_offset()),
        expires_at: Set((now + ttl).fixed_offset()),
    };

    CacheRecord::insert(model)
        .on_conflict(
            OnConflict::column(Column::Fingerprint)
                .update_columns([
                    Column::Source,
                    Column::Payload,
                    Column::CachedAt,
                    Column::ExpiresAt,
                ])
                .to_owned(),
        )
        .exec(db)
        .await?;

    Ok(())
}

/// Most recently written entries still live at `now`, newest first.
/// Used to warm the memory tier on startup.
pub async fn recent(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
    limit: u64,
) -> Result<Vec<Model>> {
    let entries = CacheRecord::find()
        .filter(Column::ExpiresAt.gt(now.fixed_offset()))
        .order_by_desc(Column::CachedAt)
        .limit(limit)
        .all(db)
        .await?;

    Ok(entries)
}

/// Delete one entry by fingerprint. Returns rows removed (0 or 1).
pub async fn delete(db: &DatabaseConnection, fingerprint: &str) -> Result<u64> {
    let result = CacheRecord::delete_many()
        .filter(Column::Fingerprint.eq(fingerprint))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}

/// Delete entries already expired at `now`. Returns rows removed.
pub async fn delete_expired(db: &DatabaseConnection, now: DateTime<Utc>) -> Result<u64> {
    let result = CacheRecord::delete_many()
        .filter(Column::ExpiresAt.lt(now.fixed_offset()))
        .exec(db)
        .await?;

    Ok(result.rows_affected)
}
