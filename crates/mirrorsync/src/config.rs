//! Validated tunables for the sync pipeline.
//!
//! Every knob named by the pipeline components lives here as a typed field
//! with a default and a validated range. Loose key/value maps are
//! deliberately not supported: an out-of-range value is rejected at load
//! time, not discovered mid-sync.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Adaptive concurrency limiter tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Starting number of simultaneous outbound requests.
    pub initial_limit: usize,
    /// Hard upper bound for the adaptive limit.
    pub max_limit: usize,
    /// Latency the limiter steers toward.
    pub target_response_ms: u64,
    /// Fractional band around the target before the limit moves.
    pub adjust_threshold: f64,
    /// Completed requests per adjustment cycle (also the rolling window).
    pub adjust_window: usize,
    /// Failure rate over the window that trips the circuit breaker.
    pub error_rate_ceiling: f64,
    /// Failure rate the window must drop below before the breaker resets.
    pub error_rate_recovery: f64,
    /// Error rate above which the limit will not be raised.
    pub raise_error_ceiling: f64,
    /// Fixed requests-per-second cap in front of the adaptive limit.
    pub requests_per_second: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            initial_limit: 20,
            max_limit: 30,
            target_response_ms: 800,
            adjust_threshold: 0.15,
            adjust_window: 20,
            error_rate_ceiling: 0.5,
            error_rate_recovery: 0.25,
            raise_error_ceiling: 0.05,
            requests_per_second: 10,
        }
    }
}

/// Response cache tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL for the in-memory tier, seconds. Valid range 300–7200.
    pub memory_ttl_secs: u64,
    /// TTL for the persistent tier, seconds. Valid range 600–86400.
    pub persistent_ttl_secs: u64,
    /// Entry ceiling for the memory tier; LRU eviction past this. 0 = unbounded.
    pub memory_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_ttl_secs: 1_800,
            persistent_ttl_secs: 21_600,
            memory_max_entries: 1_024,
        }
    }
}

impl CacheConfig {
    /// Memory-tier TTL as a `Duration`.
    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    /// Persistent-tier TTL as a `Duration`.
    pub fn persistent_ttl(&self) -> Duration {
        Duration::from_secs(self.persistent_ttl_secs)
    }
}

/// Batch planner tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Batch size used when memory pressure is nominal.
    pub default_size: usize,
    /// Floor for shrunken batches.
    pub min_size: usize,
    /// Ceiling for grown batches.
    pub max_size: usize,
    /// Maximum fractional size change between consecutive batches.
    pub smoothing: f64,
    /// Memory utilization above which batches shrink.
    pub memory_high_watermark: f64,
    /// Memory utilization below which batches may grow back.
    pub memory_low_watermark: f64,
    /// Utilization that forces a single-item batch and a gc pause request.
    pub memory_emergency_ceiling: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_size: 20,
            min_size: 5,
            max_size: 60,
            smoothing: 0.25,
            memory_high_watermark: 0.70,
            memory_low_watermark: 0.50,
            memory_emergency_ceiling: 0.92,
        }
    }
}

/// Fetch retry tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts for a single page fetch before the page's items
    /// are recorded as failed.
    pub max_fetch_attempts: usize,
    /// Initial backoff delay, milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling, milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_fetch_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

/// Progress channel and follower tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Cap on the per-snapshot error list; oldest entries drop past it.
    pub error_cap: usize,
    /// Broadcast capacity per task; lagging observers lose events, never
    /// stall the producer.
    pub channel_capacity: usize,
    /// Push reconnect attempts before falling back to polling.
    pub push_retry_attempts: u32,
    /// Fixed delay between push reconnect attempts, milliseconds.
    pub push_retry_delay_ms: u64,
    /// Poll interval while the observer is actively watching, milliseconds.
    pub poll_fast_ms: u64,
    /// Poll interval while the observer is idle, milliseconds.
    pub poll_slow_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            error_cap: 50,
            channel_capacity: 256,
            push_retry_attempts: 3,
            push_retry_delay_ms: 2_000,
            poll_fast_ms: 1_000,
            poll_slow_ms: 5_000,
        }
    }
}

/// All pipeline tunables, validated at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTunables {
    pub limiter: LimiterConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub progress: ProgressConfig,
    /// Items requested per remote page.
    pub page_size: usize,
    /// Import-concurrency lock expiry, seconds. Expiry while a task is
    /// genuinely still running releases the lock with a warning; it is
    /// never silently extended.
    pub import_lock_secs: u64,
    /// How long terminal task rows are retained for reconnecting observers.
    pub task_retention_secs: u64,
}

impl Default for SyncTunables {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTunables {
    /// Construct the reference configuration.
    pub fn new() -> Self {
        Self {
            limiter: LimiterConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            progress: ProgressConfig::default(),
            page_size: 100,
            import_lock_secs: 120,
            task_retention_secs: 3_600,
        }
    }

    /// Validate every tunable against its documented range.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let l = &self.limiter;
        if l.max_limit < 1 {
            return Err(SyncError::config("limiter.max_limit must be at least 1"));
        }
        if l.initial_limit < 1 || l.initial_limit > l.max_limit {
            return Err(SyncError::config(format!(
                "limiter.initial_limit must be in [1, {}]",
                l.max_limit
            )));
        }
        if l.target_response_ms == 0 {
            return Err(SyncError::config("limiter.target_response_ms must be > 0"));
        }
        if !(0.0..1.0).contains(&l.adjust_threshold) {
            return Err(SyncError::config("limiter.adjust_threshold must be in [0, 1)"));
        }
        if l.adjust_window == 0 {
            return Err(SyncError::config("limiter.adjust_window must be > 0"));
        }
        if !(0.0..=1.0).contains(&l.error_rate_ceiling)
            || !(0.0..=1.0).contains(&l.error_rate_recovery)
            || l.error_rate_recovery > l.error_rate_ceiling
        {
            return Err(SyncError::config(
                "limiter error rates must be in [0, 1] with recovery <= ceiling",
            ));
        }
        if l.requests_per_second == 0 {
            return Err(SyncError::config("limiter.requests_per_second must be > 0"));
        }

        let c = &self.cache;
        if !(300..=7_200).contains(&c.memory_ttl_secs) {
            return Err(SyncError::config(
                "cache.memory_ttl_secs must be in [300, 7200]",
            ));
        }
        if !(600..=86_400).contains(&c.persistent_ttl_secs) {
            return Err(SyncError::config(
                "cache.persistent_ttl_secs must be in [600, 86400]",
            ));
        }

        let b = &self.batch;
        if b.min_size == 0 || b.min_size > b.default_size || b.default_size > b.max_size {
            return Err(SyncError::config(
                "batch sizes must satisfy 0 < min_size <= default_size <= max_size",
            ));
        }
        if !(0.0..=1.0).contains(&b.smoothing) || b.smoothing == 0.0 {
            return Err(SyncError::config("batch.smoothing must be in (0, 1]"));
        }
        if !(b.memory_low_watermark < b.memory_high_watermark
            && b.memory_high_watermark < b.memory_emergency_ceiling
            && b.memory_emergency_ceiling <= 1.0
            && b.memory_low_watermark > 0.0)
        {
            return Err(SyncError::config(
                "batch memory thresholds must satisfy 0 < low < high < emergency <= 1",
            ));
        }

        if self.retry.max_fetch_attempts == 0 {
            return Err(SyncError::config("retry.max_fetch_attempts must be > 0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(SyncError::config(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }

        let p = &self.progress;
        if p.error_cap == 0 || p.channel_capacity == 0 {
            return Err(SyncError::config(
                "progress.error_cap and progress.channel_capacity must be > 0",
            ));
        }
        if p.poll_fast_ms == 0 || p.poll_slow_ms < p.poll_fast_ms {
            return Err(SyncError::config(
                "progress poll intervals must satisfy 0 < poll_fast_ms <= poll_slow_ms",
            ));
        }

        if self.page_size == 0 {
            return Err(SyncError::config("page_size must be > 0"));
        }
        if self.import_lock_secs == 0 {
            return Err(SyncError::config("import_lock_secs must be > 0"));
        }

        Ok(())
    }

    /// Import lock expiry as a `Duration`.
    pub fn import_lock_expiry(&self) -> Duration {
        Duration::from_secs(self.import_lock_secs)
    }
}
