//! Adaptive outbound-concurrency limiter.
//!
//! [`AdaptiveLimiter`] bounds simultaneous remote requests to a limit that
//! moves with observed latency and error rate. A tokio `Semaphore` cannot
//! shrink its permit count, so the limiter keeps its own counter behind a
//! mutex and parks waiters on a [`Notify`].
//!
//! The limit and its statistics are process-wide: the constraint being
//! protected is the remote's rate tolerance, which is global, so all tasks
//! share one limiter.
//!
//! [`RateCap`] sits in front as a fixed requests-per-second ceiling using
//! the governor crate; the adaptive limit controls parallelism, the cap
//! controls request rate.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::LimiterConfig;

/// Type alias for the governor rate limiter.
type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Fixed requests-per-second ceiling in front of the adaptive limit.
#[derive(Clone)]
pub struct RateCap {
    inner: Arc<GovernorRateLimiter>,
}

impl RateCap {
    /// Create a cap allowing `requests_per_second` requests (minimum 1).
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            inner: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        }
    }

    /// Wait until the cap allows another request.
    pub async fn wait(&self) {
        self.inner.until_ready().await;
    }
}

/// How one permitted request ended.
#[derive(Clone, Copy, Debug)]
pub struct Outcome {
    pub success: bool,
    /// The remote explicitly rejected for rate reasons. Trips the breaker.
    pub rate_limited: bool,
    pub latency: Duration,
}

impl Outcome {
    pub fn success(latency: Duration) -> Self {
        Self {
            success: true,
            rate_limited: false,
            latency,
        }
    }

    pub fn failure(latency: Duration) -> Self {
        Self {
            success: false,
            rate_limited: false,
            latency,
        }
    }

    pub fn rate_limited(latency: Duration) -> Self {
        Self {
            success: false,
            rate_limited: true,
            latency,
        }
    }
}

/// Point-in-time limiter statistics.
///
/// Counters accumulate until [`AdaptiveLimiter::reset_stats`]; the average
/// latency is over the rolling adjustment window.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConcurrencyStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time_ms: f64,
    pub current_limit: usize,
    pub breaker_open: bool,
}

struct Sample {
    success: bool,
    latency: Duration,
}

struct LimiterState {
    current_limit: usize,
    in_flight: usize,
    window: VecDeque<Sample>,
    completed_since_adjust: usize,
    breaker_open: bool,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
}

impl LimiterState {
    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|s| !s.success).count();
        failures as f64 / self.window.len() as f64
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.window.iter().map(|s| s.latency.as_millis() as f64).sum();
        sum / self.window.len() as f64
    }
}

/// Shared adaptive concurrency limiter.
pub struct AdaptiveLimiter {
    state: Mutex<LimiterState>,
    notify: Notify,
    config: LimiterConfig,
}

impl AdaptiveLimiter {
    pub fn new(config: LimiterConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LimiterState {
                current_limit: config.initial_limit,
                in_flight: 0,
                window: VecDeque::with_capacity(config.adjust_window),
                completed_since_adjust: 0,
                breaker_open: false,
                total_requests: 0,
                successful_requests: 0,
                failed_requests: 0,
            }),
            notify: Notify::new(),
            config,
        })
    }

    /// Acquire a permit, suspending until a slot is free.
    ///
    /// Cancellation-safe: dropping the future before it resolves leaves no
    /// slot held.
    pub async fn acquire(self: &Arc<Self>) -> Permit {
        loop {
            // Register for wakeup before checking, so a release between the
            // check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.in_flight < state.current_limit {
                    state.in_flight += 1;
                    return Permit {
                        limiter: Arc::clone(self),
                        done: false,
                    };
                }
            }

            notified.await;
        }
    }

    /// Current adaptive limit.
    pub fn current_limit(&self) -> usize {
        self.lock().current_limit
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let state = self.lock();
        ConcurrencyStats {
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            avg_response_time_ms: state.avg_latency_ms(),
            current_limit: state.current_limit,
            breaker_open: state.breaker_open,
        }
    }

    /// Zero the cumulative counters. Operator action only; the adaptive
    /// limit and rolling window are left untouched.
    pub fn reset_stats(&self) {
        let mut state = self.lock();
        state.total_requests = 0;
        state.successful_requests = 0;
        state.failed_requests = 0;
    }

    fn finish(&self, outcome: Option<Outcome>) {
        {
            let mut state = self.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(outcome) = outcome {
                self.record(&mut state, outcome);
            }
        }
        self.notify.notify_waiters();
    }

    fn record(&self, state: &mut LimiterState, outcome: Outcome) {
        state.total_requests += 1;
        if outcome.success {
            state.successful_requests += 1;
        } else {
            state.failed_requests += 1;
        }

        state.window.push_back(Sample {
            success: outcome.success,
            latency: outcome.latency,
        });
        while state.window.len() > self.config.adjust_window {
            state.window.pop_front();
        }
        state.completed_since_adjust += 1;

        let failure_rate = state.failure_rate();

        if !state.breaker_open
            && (outcome.rate_limited || failure_rate >= self.config.error_rate_ceiling)
        {
            state.breaker_open = true;
            state.current_limit = 1;
            state.completed_since_adjust = 0;
            warn!(
                failure_rate,
                rate_limited = outcome.rate_limited,
                "circuit breaker open, concurrency forced to 1"
            );
            return;
        }

        if state.breaker_open {
            if failure_rate < self.config.error_rate_recovery {
                state.breaker_open = false;
                state.completed_since_adjust = 0;
                info!(failure_rate, "circuit breaker closed, resuming adaptive tuning");
            }
            return;
        }

        if state.completed_since_adjust >= self.config.adjust_window {
            state.completed_since_adjust = 0;
            self.retune(state, failure_rate);
        }
    }

    /// One adjustment cycle: move the limit one step against latency.
    fn retune(&self, state: &mut LimiterState, failure_rate: f64) {
        let avg = state.avg_latency_ms();
        let target = self.config.target_response_ms as f64;
        let high = target * (1.0 + self.config.adjust_threshold);
        let low = target * (1.0 - self.config.adjust_threshold);

        let before = state.current_limit;
        if avg > high {
            state.current_limit = (state.current_limit - 1).max(1);
        } else if avg < low && failure_rate <= self.config.raise_error_ceiling {
            state.current_limit = (state.current_limit + 1).min(self.config.max_limit);
        }

        if state.current_limit != before {
            debug!(
                avg_latency_ms = avg,
                failure_rate,
                from = before,
                to = state.current_limit,
                "concurrency limit adjusted"
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// One unit of outbound-request concurrency.
///
/// Release with [`Permit::release`] to feed the outcome back into the
/// limiter; dropping without releasing frees the slot but records nothing.
pub struct Permit {
    limiter: Arc<AdaptiveLimiter>,
    done: bool,
}

impl Permit {
    /// Free the slot and record how the request went.
    pub fn release(mut self, outcome: Outcome) {
        self.done = true;
        self.limiter.finish(Some(outcome));
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.done {
            self.limiter.finish(None);
        }
    }
}
