use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors produced by the sync pipeline.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient failure talking to the remote source (network, timeout).
    /// Retried with backoff up to a bounded attempt count.
    #[error("transient fetch error: {message}")]
    TransientFetch { message: String },

    /// The remote source rejected the request for rate reasons.
    /// Feeds the limiter's circuit breaker.
    #[error("remote rate limited{}", reset_at.map(|t| format!(", resets at {t}")).unwrap_or_default())]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// A single item failed to persist. Recorded against the item and
    /// skipped; the task continues.
    #[error("persistence error for {item_ref}: {message}")]
    Persistence { item_ref: String, message: String },

    /// Unrecoverable condition (store or config unreachable). Terminates
    /// the task as failed.
    #[error("fatal error: {message}")]
    Fatal { message: String },

    /// A progress transport broke. Handled at the channel boundary, never
    /// visible to the orchestrator.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A tunable was out of its valid range at load time.
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// Database error from sea-orm.
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl SyncError {
    /// Create a transient fetch error.
    #[inline]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientFetch {
            message: message.into(),
        }
    }

    /// Create a rate-limited error without a known reset time.
    #[inline]
    pub fn rate_limited() -> Self {
        Self::RateLimited { reset_at: None }
    }

    /// Create a per-item persistence error.
    #[inline]
    pub fn persistence(item_ref: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Persistence {
            item_ref: item_ref.into(),
            message: message.into(),
        }
    }

    /// Create a fatal error.
    #[inline]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Create a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error should be retried by the fetch backoff loop.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFetch { .. } | Self::RateLimited { .. })
    }

    /// Whether this error is a remote rate-limit rejection.
    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Whether this error terminates the whole task.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::Database(_))
    }
}

/// Extract a short error message suitable for snapshot error entries.
///
/// Takes the first line of the message, which keeps multi-line driver
/// errors out of progress payloads.
#[inline]
pub fn short_error_message(e: &impl std::error::Error) -> String {
    let full = e.to_string();
    full.lines().next().unwrap_or(&full).to_string()
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
