//! Two-tier response cache.
//!
//! Lookups check the memory tier first, then the persistent tier. A
//! persistent hit is promoted into the memory tier so repeated lookups stay
//! cheap. Writes go to both tiers; persistent-tier failures degrade the
//! cache to memory-only instead of failing the caller.

pub mod memory;
pub mod persistent;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sea_orm::DatabaseConnection;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use memory::MemoryTier;

/// Rows warmed by an untargeted preload when the memory tier is unbounded.
const UNBOUNDED_PRELOAD_LIMIT: u64 = 1_024;

/// Hit/miss counters, readable at any time.
#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    preload_failures: AtomicU64,
}

/// Point-in-time view of cache effectiveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub preload_failures: u64,
}

/// Memory + persistent response cache keyed by request fingerprint.
pub struct ResponseCache {
    memory: Mutex<MemoryTier>,
    db: Option<DatabaseConnection>,
    config: CacheConfig,
    counters: Counters,
}

impl ResponseCache {
    /// Create a cache. Passing `None` for `db` gives a memory-only cache;
    /// every persistent-tier operation becomes a no-op.
    pub fn new(config: CacheConfig, db: Option<DatabaseConnection>) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::new(config.memory_max_entries)),
            db,
            config,
            counters: Counters::default(),
        }
    }

    /// Look up a fingerprint across both tiers.
    pub async fn get(&self, fingerprint: &str) -> Option<serde_json::Value> {
        if let Some(hit) = self.memory_get(fingerprint) {
            self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit);
        }

        if let Some(db) = &self.db {
            match persistent::load(db, fingerprint, Utc::now()).await {
                Ok(Some(payload)) => {
                    self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
                    // Promote so the next lookup stays off the database.
                    self.memory_put(fingerprint.to_string(), payload.clone(), self.config.memory_ttl());
                    return Some(payload);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(fingerprint, error = %e, "persistent cache read failed, treating as miss");
                }
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Write a response to both tiers. The persistent write is best-effort.
    ///
    /// Each write carries its own TTL; `None` applies the configured
    /// per-tier defaults.
    pub async fn put(
        &self,
        fingerprint: &str,
        source: &str,
        payload: serde_json::Value,
        ttl: Option<Duration>,
    ) {
        self.memory_put(
            fingerprint.to_string(),
            payload.clone(),
            ttl.unwrap_or_else(|| self.config.memory_ttl()),
        );

        if let Some(db) = &self.db {
            let persistent_ttl = ttl.unwrap_or_else(|| self.config.persistent_ttl());
            if let Err(e) = persistent::store(db, fingerprint, source, &payload, persistent_ttl).await {
                warn!(fingerprint, error = %e, "persistent cache write failed");
            }
        }
    }

    /// Evict a fingerprint from both tiers.
    ///
    /// The next `get` for it is a miss even if its TTL had time left. The
    /// persistent delete is best-effort, like `put`.
    pub async fn invalidate(&self, fingerprint: &str) {
        self.lock_memory().remove(fingerprint);

        if let Some(db) = &self.db {
            if let Err(e) = persistent::delete(db, fingerprint).await {
                warn!(fingerprint, error = %e, "persistent cache invalidation failed");
            }
        }
    }

    /// Warm the memory tier from the persistent tier without blocking the
    /// caller.
    ///
    /// With an empty `fingerprints` list the most recent live entries are
    /// warmed; otherwise only the listed fingerprints. The work runs on a
    /// spawned task (the returned handle is awaitable but can be dropped);
    /// failures are counted and logged, never surfaced. Live entries
    /// already in memory are preserved.
    pub fn preload(self: &Arc<Self>, fingerprints: Vec<String>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.warm_memory(fingerprints).await })
    }

    async fn warm_memory(&self, fingerprints: Vec<String>) {
        let Some(db) = &self.db else {
            return;
        };
        let now = Utc::now();

        let rows = if fingerprints.is_empty() {
            // Startup warming doubles as housekeeping for dead rows.
            if let Err(e) = persistent::delete_expired(db, now).await {
                warn!(error = %e, "expired cache row sweep failed");
            }
            let limit = match self.config.memory_max_entries {
                0 => UNBOUNDED_PRELOAD_LIMIT,
                bound => bound as u64,
            };
            persistent::recent(db, now, limit).await
        } else {
            persistent::load_many(db, &fingerprints, now).await
        };

        match rows {
            Ok(rows) => {
                let mut loaded = 0usize;
                let mut memory = self.lock_memory();
                for row in rows {
                    // Cap the warmed entry at its remaining persistent life.
                    let remaining = (row.expires_at.with_timezone(&Utc) - now)
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    let ttl = remaining.min(self.config.memory_ttl());
                    match serde_json::from_str(&row.payload) {
                        Ok(payload) => {
                            memory.put_if_absent(row.fingerprint, payload, ttl);
                            loaded += 1;
                        }
                        Err(_) => {
                            self.counters.preload_failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                debug!(loaded, "cache preload finished");
            }
            Err(e) => {
                self.counters.preload_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "cache preload failed, continuing with cold cache");
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            persistent_hits: self.counters.persistent_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            preload_failures: self.counters.preload_failures.load(Ordering::Relaxed),
        }
    }

    fn memory_get(&self, fingerprint: &str) -> Option<serde_json::Value> {
        self.lock_memory().get(fingerprint)
    }

    fn memory_put(&self, fingerprint: String, payload: serde_json::Value, ttl: Duration) {
        self.lock_memory().put(fingerprint, payload, ttl);
    }

    fn lock_memory(&self) -> std::sync::MutexGuard<'_, MemoryTier> {
        // A poisoned mutex means a panic mid-insert; the map itself is
        // still structurally valid, so keep serving.
        match self.memory.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
