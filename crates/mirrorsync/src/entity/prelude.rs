//! Re-exports of all entity types for convenient glob imports.

pub use super::cache_record::Entity as CacheRecord;
pub use super::sync_task::Entity as SyncTask;
