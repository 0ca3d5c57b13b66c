//! Local store abstraction.
//!
//! [`LocalStore`] is the write side of the pipeline: normalized records go
//! in, the search index gets refreshed at the end of a run. Per-item write
//! failures surface as `SyncError::Persistence` so the persist loop can
//! record them and keep going; only store-level failures (connection lost,
//! disk full) should map to `Fatal`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A record after content processing, ready to persist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub remote_id: String,
    /// Content fingerprint; unchanged fingerprints let incremental runs
    /// skip the write.
    pub fingerprint: String,
    pub content: serde_json::Value,
    /// Asset bytes downloaded during the asset step, if the record had one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset: Option<Vec<u8>>,
    pub synced_at: DateTime<Utc>,
}

/// Destination for mirrored records.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert or update one record. Keyed on `remote_id`.
    async fn upsert(&self, record: &NormalizedRecord) -> Result<()>;

    /// Remove a record that disappeared from the remote.
    async fn delete(&self, remote_id: &str) -> Result<()>;

    /// Fingerprints currently stored, keyed by remote id. Incremental runs
    /// diff against this to skip unchanged records.
    async fn known_fingerprints(&self) -> Result<std::collections::HashMap<String, String>>;

    /// Rebuild derived structures (search index) after a run's writes.
    async fn refresh_index(&self) -> Result<()>;
}
