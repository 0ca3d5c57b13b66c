//! CacheRecord entity - the persistent tier of the response cache.
//!
//! Each row stores one serialized remote response keyed by its request
//! fingerprint. Rows survive process restarts; the memory tier is rebuilt
//! from here on startup.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// CacheRecord model - one cached remote response.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cache_record")]
pub struct Model {
    /// SHA-256 request fingerprint, hex-encoded.
    #[sea_orm(primary_key, auto_increment = false)]
    pub fingerprint: String,

    /// Source the response came from.
    pub source: String,

    /// Serialized response payload.
    #[sea_orm(column_type = "Text")]
    pub payload: String,

    /// When this entry was written.
    pub cached_at: DateTimeWithTimeZone,

    /// When this entry stops being served. Each write carries its own TTL;
    /// expired rows are treated as misses and lazily replaced.
    pub expires_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
