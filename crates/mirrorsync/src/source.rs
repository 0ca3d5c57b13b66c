//! Remote source abstraction.
//!
//! The pipeline is written against [`RemoteSource`] so the fetch, cache and
//! limiter machinery never depends on a concrete backend. Implementations
//! translate their wire errors into [`SyncError`](crate::SyncError) variants:
//! timeouts and resets become `TransientFetch`, quota rejections become
//! `RateLimited`, everything unrecoverable becomes `Fatal`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One record as delivered by the remote source, before normalization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Stable identifier on the remote side.
    pub remote_id: String,
    /// Raw payload; [`LocalStore`](crate::store::LocalStore) consumers
    /// normalize this before persisting.
    pub payload: serde_json::Value,
    /// Opaque reference to a binary asset attached to this record, if any.
    /// Fetched concurrently during the asset step.
    pub asset_ref: Option<String>,
    /// Remote-side last modification time, when the source reports one.
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// One page of records plus the cursor for the next page.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    pub items: Vec<RemoteRecord>,
    /// Cursor for the following page; `None` means this page is the last.
    pub next_cursor: Option<String>,
    /// Grand total reported by the remote, when it reports one. Sources
    /// that page blind leave this `None` and the total grows as pages land.
    pub total_hint: Option<usize>,
}

impl RecordPage {
    /// A terminal empty page.
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            next_cursor: None,
            total_hint: None,
        }
    }
}

/// A paginated, rate-limited remote dataset.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Name used in logs and cache keys. Must be stable across runs.
    fn name(&self) -> &str;

    /// Fetch one page. `cursor` is `None` for the first page; afterwards it
    /// is the `next_cursor` of the previous page, verbatim.
    async fn fetch_page(&self, cursor: Option<&str>, page_size: usize) -> Result<RecordPage>;

    /// Fetch the binary asset behind `asset_ref`.
    async fn fetch_asset(&self, asset_ref: &str) -> Result<Vec<u8>>;
}
