//! Mirrorsync - incremental mirroring of paginated remote datasets.
//!
//! This library syncs records from a rate-limited remote source into a local
//! content store: pages are fetched through a two-tier response cache behind
//! an adaptive concurrency limiter, normalized, and streamed to a persist
//! task whose batch sizes follow memory pressure. Progress is observable
//! over a push stream or by polling, with automatic fallback between the
//! two.
//!
//! # Features
//!
//! - `sqlite` - SQLite-backed persistence for task rows and the persistent
//!   cache tier (default).
//! - `migrate` - Schema migration support; enables [`connect_and_migrate`].
//! - `server` - The axum HTTP surface: control endpoints, poll endpoint and
//!   the server-sent-events push stream.
//! - `mock` - Mock database support for tests.
//!
//! # Example
//!
//! ```ignore
//! use mirrorsync::{SyncOrchestrator, SyncTunables, TaskKind, connect_and_migrate};
//!
//! let db = connect_and_migrate("sqlite://mirrorsync.db?mode=rwc").await?;
//! let orchestrator = SyncOrchestrator::new(source, store, cache, channel, SyncTunables::new(), Some(db))?;
//!
//! let task_id = orchestrator.start(TaskKind::Incremental, "catalog")?;
//! let status = orchestrator.status(&task_id).await?;
//! ```

pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod fingerprint;
pub mod follower;
pub mod limiter;
pub mod orchestrator;
pub mod persist;
pub mod progress;
pub mod retry;
pub mod source;
pub mod store;
pub mod task;
pub mod tasks;

#[cfg(feature = "migrate")]
pub mod migration;

#[cfg(feature = "server")]
pub mod server;

pub use batch::{BatchPlan, BatchPlanner, MemoryProbe, ProcessMemoryProbe};
pub use cache::{CacheStats, ResponseCache};
pub use config::SyncTunables;
pub use db::connect;
#[cfg(feature = "migrate")]
pub use db::connect_and_migrate;
pub use error::{Result, SyncError};
pub use follower::{ProgressFollower, PushConnection, PushTransport, SnapshotPoller};
pub use limiter::{AdaptiveLimiter, ConcurrencyStats, Outcome, Permit, RateCap};
pub use orchestrator::{ControlToken, SyncOrchestrator};
pub use progress::{MirrorUpdate, ProgressChannel, ProgressEvent, Subscription};
pub use source::{RecordPage, RemoteRecord, RemoteSource};
pub use store::{LocalStore, NormalizedRecord};
pub use task::{ProgressSnapshot, SyncStep, Task, TaskKind, TaskStatus};
