//! Progress state and fan-out.
//!
//! The channel owns the latest [`ProgressSnapshot`] per task and fans
//! events out over a per-task broadcast channel. Emission never blocks:
//! a lagging observer loses intermediate events rather than stalling the
//! producer, and both push and poll consumers read the same stored
//! snapshot so either transport is consistent.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::config::ProgressConfig;
use crate::task::{ProgressSnapshot, TaskStatus};

/// One named event on the consumer stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// First event on every new subscription: the current state.
    Connected {
        task_id: String,
        status: TaskStatus,
        progress: ProgressSnapshot,
    },
    Progress {
        task_id: String,
        status: TaskStatus,
        progress: ProgressSnapshot,
    },
    Completed {
        task_id: String,
        status: TaskStatus,
        progress: ProgressSnapshot,
    },
    Failed {
        task_id: String,
        status: TaskStatus,
        progress: ProgressSnapshot,
    },
    NotFound { task_id: String },
    Timeout { task_id: String },
}

impl ProgressEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Connected { task_id, .. }
            | Self::Progress { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::NotFound { task_id }
            | Self::Timeout { task_id } => task_id,
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::NotFound { .. }
        )
    }
}

/// Update forwarded to the snapshot mirror task (durable store).
#[derive(Clone, Debug)]
pub struct MirrorUpdate {
    pub task_id: String,
    pub status: TaskStatus,
    pub snapshot: ProgressSnapshot,
}

struct TaskProgress {
    status: TaskStatus,
    snapshot: ProgressSnapshot,
    sender: broadcast::Sender<ProgressEvent>,
}

/// Result of subscribing to a task's event stream.
pub struct Subscription {
    /// The `connected` event carrying the state at subscription time.
    pub connected: ProgressEvent,
    /// Live events from here on; `None` when the task is unknown.
    pub receiver: Option<broadcast::Receiver<ProgressEvent>>,
}

/// Shared progress registry and event fan-out.
pub struct ProgressChannel {
    tasks: Mutex<HashMap<String, TaskProgress>>,
    config: ProgressConfig,
    /// Fire-and-forget mirror to the durable task store. `try_send`: a
    /// full queue drops the update, never blocks emission.
    mirror: Option<mpsc::Sender<MirrorUpdate>>,
}

impl ProgressChannel {
    pub fn new(config: ProgressConfig, mirror: Option<mpsc::Sender<MirrorUpdate>>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            config,
            mirror,
        }
    }

    /// Register a task before its first emission.
    pub fn register(&self, task_id: &str) {
        let (sender, _) = broadcast::channel(self.config.channel_capacity);
        self.lock().insert(
            task_id.to_string(),
            TaskProgress {
                status: TaskStatus::Pending,
                snapshot: ProgressSnapshot::initial(),
                sender,
            },
        );
    }

    /// Emit an updated snapshot for a running task.
    ///
    /// Percentage is clamped to be non-decreasing and the error list is
    /// truncated to the configured cap (oldest entries first).
    pub fn emit(&self, task_id: &str, status: TaskStatus, mut snapshot: ProgressSnapshot) {
        let event = {
            let mut tasks = self.lock();
            let Some(entry) = tasks.get_mut(task_id) else {
                warn!(task_id, "emit for unknown task dropped");
                return;
            };

            if status == TaskStatus::Running && snapshot.percentage < entry.snapshot.percentage {
                snapshot.percentage = entry.snapshot.percentage;
            }
            let cap = self.config.error_cap;
            if snapshot.errors.len() > cap {
                let excess = snapshot.errors.len() - cap;
                snapshot.errors.drain(..excess);
            }

            entry.status = status;
            entry.snapshot = snapshot.clone();

            let event = ProgressEvent::Progress {
                task_id: task_id.to_string(),
                status,
                progress: snapshot.clone(),
            };
            // Send fails only when no observer is subscribed.
            let _ = entry.sender.send(event.clone());
            event
        };
        self.forward_to_mirror(task_id, &event, status, snapshot);
    }

    /// Emit the terminal `completed` event.
    pub fn complete(&self, task_id: &str, snapshot: ProgressSnapshot) {
        self.finish(task_id, TaskStatus::Completed, snapshot);
    }

    /// Emit the terminal `failed` event.
    pub fn fail(&self, task_id: &str, snapshot: ProgressSnapshot) {
        self.finish(task_id, TaskStatus::Failed, snapshot);
    }

    /// Emit a terminal event for a cancelled task.
    pub fn cancelled(&self, task_id: &str, snapshot: ProgressSnapshot) {
        self.finish(task_id, TaskStatus::Cancelled, snapshot);
    }

    fn finish(&self, task_id: &str, status: TaskStatus, snapshot: ProgressSnapshot) {
        let sent = {
            let mut tasks = self.lock();
            let Some(entry) = tasks.get_mut(task_id) else {
                warn!(task_id, ?status, "terminal emit for unknown task dropped");
                return;
            };
            entry.status = status;
            entry.snapshot = snapshot.clone();

            let event = match status {
                TaskStatus::Failed => ProgressEvent::Failed {
                    task_id: task_id.to_string(),
                    status,
                    progress: snapshot.clone(),
                },
                _ => ProgressEvent::Completed {
                    task_id: task_id.to_string(),
                    status,
                    progress: snapshot.clone(),
                },
            };
            let _ = entry.sender.send(event.clone());
            event
        };
        debug!(task_id, ?status, "task reached terminal state");
        self.forward_to_mirror(task_id, &sent, status, snapshot);
    }

    /// Latest stored state, for the poll transport.
    pub fn latest(&self, task_id: &str) -> Option<(TaskStatus, ProgressSnapshot)> {
        self.lock()
            .get(task_id)
            .map(|entry| (entry.status, entry.snapshot.clone()))
    }

    /// Subscribe to a task's event stream.
    ///
    /// Always yields a first event: `connected` with the current state, or
    /// `not_found` (with no receiver) for an unknown task.
    pub fn subscribe(&self, task_id: &str) -> Subscription {
        let tasks = self.lock();
        match tasks.get(task_id) {
            Some(entry) => Subscription {
                connected: ProgressEvent::Connected {
                    task_id: task_id.to_string(),
                    status: entry.status,
                    progress: entry.snapshot.clone(),
                },
                receiver: Some(entry.sender.subscribe()),
            },
            None => Subscription {
                connected: ProgressEvent::NotFound {
                    task_id: task_id.to_string(),
                },
                receiver: None,
            },
        }
    }

    /// Drop a task's progress state after its retention period.
    pub fn remove(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    /// Task ids currently registered, terminal or not.
    pub fn task_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn forward_to_mirror(
        &self,
        task_id: &str,
        event: &ProgressEvent,
        status: TaskStatus,
        snapshot: ProgressSnapshot,
    ) {
        if let Some(mirror) = &self.mirror {
            let update = MirrorUpdate {
                task_id: task_id.to_string(),
                status,
                snapshot,
            };
            if mirror.try_send(update).is_err() && event.is_terminal() {
                // Terminal snapshots matter for reconnecting observers.
                warn!(task_id, "snapshot mirror queue full, terminal update dropped");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TaskProgress>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
