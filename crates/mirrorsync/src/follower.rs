//! Consumer-side progress following.
//!
//! [`ProgressFollower`] watches one task to its terminal state. The push
//! transport is primary; on transport errors it reconnects a bounded
//! number of times with a fixed delay, then falls back to polling for the
//! remainder of the task. The fallback is permanent: push and poll never
//! act as the system of record at the same time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ProgressConfig;
use crate::error::Result;
use crate::progress::ProgressEvent;
use crate::task::{ProgressSnapshot, TaskStatus};

/// An established push stream for one task.
#[async_trait]
pub trait PushConnection: Send {
    /// Next event from the stream. `Ok(None)` is a graceful server-side
    /// close; `Err` is a broken transport.
    async fn next_event(&mut self) -> Result<Option<ProgressEvent>>;
}

/// Factory for push streams.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, task_id: &str) -> Result<Box<dyn PushConnection>>;
}

/// Fallback transport: fetch the latest snapshot on demand.
#[async_trait]
pub trait SnapshotPoller: Send + Sync {
    /// `Ok(None)` means the task is unknown to the producer.
    async fn poll(&self, task_id: &str) -> Result<Option<(TaskStatus, ProgressSnapshot)>>;
}

/// Follows one task's progress across transports.
pub struct ProgressFollower<T, P> {
    transport: T,
    poller: P,
    config: ProgressConfig,
    /// Whether an observer is actively watching. Only affects the poll
    /// cadence, never correctness.
    active: AtomicBool,
}

impl<T: PushTransport, P: SnapshotPoller> ProgressFollower<T, P> {
    pub fn new(transport: T, poller: P, config: ProgressConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            poller,
            config,
            active: AtomicBool::new(true),
        })
    }

    /// Mark the observer as actively watching or idle.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Follow `task_id` until a terminal event, forwarding every observed
    /// event into `events`.
    ///
    /// With a `deadline`, a task that has not reached a terminal state in
    /// time yields a final `timeout` event instead.
    pub async fn follow(
        &self,
        task_id: &str,
        events: mpsc::Sender<ProgressEvent>,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let cutoff = deadline.map(|d| Instant::now() + d);

        let fell_back = self.push_phase(task_id, &events, cutoff).await?;
        if fell_back == PushOutcome::Terminal {
            return Ok(());
        }
        if fell_back == PushOutcome::Deadline {
            return self.send_timeout(task_id, &events).await;
        }

        debug!(task_id, "push transport exhausted, falling back to polling");
        self.poll_phase(task_id, &events, cutoff).await
    }

    async fn push_phase(
        &self,
        task_id: &str,
        events: &mpsc::Sender<ProgressEvent>,
        cutoff: Option<Instant>,
    ) -> Result<PushOutcome> {
        let mut attempts = 0u32;

        while attempts <= self.config.push_retry_attempts {
            if deadline_passed(cutoff) {
                return Ok(PushOutcome::Deadline);
            }

            let mut connection = match self.transport.connect(task_id).await {
                Ok(connection) => connection,
                Err(e) => {
                    attempts += 1;
                    warn!(task_id, attempts, error = %e, "push connect failed");
                    self.retry_delay().await;
                    continue;
                }
            };

            loop {
                if deadline_passed(cutoff) {
                    return Ok(PushOutcome::Deadline);
                }
                match connection.next_event().await {
                    Ok(Some(event)) => {
                        let terminal = event.is_terminal();
                        if events.send(event).await.is_err() {
                            // Consumer hung up; nothing left to follow for.
                            return Ok(PushOutcome::Terminal);
                        }
                        if terminal {
                            return Ok(PushOutcome::Terminal);
                        }
                    }
                    Ok(None) | Err(_) => {
                        attempts += 1;
                        warn!(task_id, attempts, "push stream broke");
                        self.retry_delay().await;
                        break;
                    }
                }
            }
        }

        Ok(PushOutcome::Exhausted)
    }

    async fn poll_phase(
        &self,
        task_id: &str,
        events: &mpsc::Sender<ProgressEvent>,
        cutoff: Option<Instant>,
    ) -> Result<()> {
        loop {
            if deadline_passed(cutoff) {
                return self.send_timeout(task_id, events).await;
            }

            match self.poller.poll(task_id).await {
                Ok(Some((status, progress))) => {
                    let event = poll_event(task_id, status, progress);
                    let terminal = event.is_terminal();
                    if events.send(event).await.is_err() || terminal {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    let _ = events
                        .send(ProgressEvent::NotFound {
                            task_id: task_id.to_string(),
                        })
                        .await;
                    return Ok(());
                }
                Err(e) => {
                    // Poll errors are transient by construction; keep going.
                    warn!(task_id, error = %e, "poll failed");
                }
            }

            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    async fn send_timeout(&self, task_id: &str, events: &mpsc::Sender<ProgressEvent>) -> Result<()> {
        let _ = events
            .send(ProgressEvent::Timeout {
                task_id: task_id.to_string(),
            })
            .await;
        Ok(())
    }

    fn poll_interval(&self) -> Duration {
        if self.active.load(Ordering::Relaxed) {
            Duration::from_millis(self.config.poll_fast_ms)
        } else {
            Duration::from_millis(self.config.poll_slow_ms)
        }
    }

    async fn retry_delay(&self) {
        tokio::time::sleep(Duration::from_millis(self.config.push_retry_delay_ms)).await;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PushOutcome {
    /// Stream delivered a terminal event (or the consumer went away).
    Terminal,
    /// Reconnect attempts exhausted; switch to polling.
    Exhausted,
    Deadline,
}

fn deadline_passed(cutoff: Option<Instant>) -> bool {
    cutoff.is_some_and(|c| Instant::now() >= c)
}

fn poll_event(task_id: &str, status: TaskStatus, progress: ProgressSnapshot) -> ProgressEvent {
    let task_id = task_id.to_string();
    match status {
        TaskStatus::Failed => ProgressEvent::Failed {
            task_id,
            status,
            progress,
        },
        TaskStatus::Completed | TaskStatus::Cancelled => ProgressEvent::Completed {
            task_id,
            status,
            progress,
        },
        _ => ProgressEvent::Progress {
            task_id,
            status,
            progress,
        },
    }
}
