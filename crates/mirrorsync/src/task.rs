//! Task and progress snapshot types.
//!
//! A `Task` identifies one end-to-end sync run. Its progress is reported as
//! a sequence of immutable `ProgressSnapshot`s: each emission supersedes the
//! previous snapshot, so push and poll consumers always read a consistent
//! value.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// What kind of sync run a task performs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Mirror the entire remote dataset.
    #[sea_orm(string_value = "full")]
    Full,
    /// Mirror only records changed since the last run.
    #[sea_orm(string_value = "incremental")]
    Incremental,
}

/// Lifecycle state of a task.
///
/// `Pending → Running → {Completed | Failed | Cancelled}`, with
/// `Running ⇄ Paused` as a reversible sub-state. Terminal states are final.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "running")]
    Running,
    #[sea_orm(string_value = "paused")]
    Paused,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl TaskStatus {
    /// Whether this state admits no further transitions.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Paused, Cancelled) | (Paused, Failed) => true,
            _ => false,
        }
    }
}

/// Ordered pipeline steps a running task moves through.
///
/// Steps are monotonic: a consumer that has observed step N never sees a
/// smaller step for the same task, except through an error state on
/// retry-after-failure.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::None)")]
#[serde(rename_all = "snake_case")]
pub enum SyncStep {
    #[sea_orm(string_value = "validate")]
    Validate,
    #[sea_orm(string_value = "fetch_pages")]
    FetchPages,
    #[sea_orm(string_value = "process_content")]
    ProcessContent,
    #[sea_orm(string_value = "download_assets")]
    DownloadAssets,
    #[sea_orm(string_value = "save_records")]
    SaveRecords,
    #[sea_orm(string_value = "update_index")]
    UpdateIndex,
}

impl SyncStep {
    /// Percentage band `[start, end]` this step occupies in overall progress.
    ///
    /// Bands are contiguous and ordered so overall percentage inherits the
    /// step ordering.
    pub fn band(self) -> (f64, f64) {
        match self {
            Self::Validate => (0.0, 5.0),
            Self::FetchPages => (5.0, 45.0),
            Self::ProcessContent => (45.0, 55.0),
            Self::DownloadAssets => (55.0, 70.0),
            Self::SaveRecords => (70.0, 95.0),
            Self::UpdateIndex => (95.0, 100.0),
        }
    }

    /// Overall percentage for a fraction of this step completed.
    pub fn percentage(self, fraction: f64) -> f64 {
        let (start, end) = self.band();
        let f = fraction.clamp(0.0, 1.0);
        start + (end - start) * f
    }
}

/// Item counters carried by every snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    /// Total items known so far (grows while paging if the remote reports
    /// no grand total).
    pub total: usize,
    /// Items that have finished processing, in either direction.
    pub processed: usize,
    /// Items persisted successfully.
    pub succeeded: usize,
    /// Items recorded as failed.
    pub failed: usize,
}

/// Wall-clock timing carried by every snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub elapsed_ms: u64,
    /// Linear estimate from throughput so far; absent until enough items
    /// have been processed to extrapolate.
    pub estimated_remaining_ms: Option<u64>,
}

/// One recorded per-item error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub item_ref: String,
}

/// Immutable point-in-time progress value for a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// 0–100, monotonically non-decreasing while the task is running.
    pub percentage: f64,
    pub current_step: SyncStep,
    pub counts: Counts,
    pub timing: Timing,
    /// Bounded ordered error list; oldest entries drop once the cap is hit.
    pub errors: Vec<ErrorEntry>,
    /// Human-readable current activity.
    pub message: String,
}

impl ProgressSnapshot {
    /// Snapshot for a freshly started task.
    pub fn initial() -> Self {
        Self {
            percentage: 0.0,
            current_step: SyncStep::Validate,
            counts: Counts::default(),
            timing: Timing::default(),
            errors: Vec::new(),
            message: "validating".to_string(),
        }
    }

    /// Estimate remaining time from throughput so far.
    pub fn estimate_remaining(counts: &Counts, elapsed_ms: u64) -> Option<u64> {
        if counts.processed == 0 || counts.total <= counts.processed {
            return None;
        }
        let per_item = elapsed_ms as f64 / counts.processed as f64;
        let remaining = (counts.total - counts.processed) as f64 * per_item;
        Some(remaining as u64)
    }
}

/// One end-to-end sync run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    /// Opaque unique identifier.
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Logical target this task mirrors (the import lock key).
    pub target: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with a fresh v4 id.
    pub fn new(kind: TaskKind, target: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: TaskStatus::Pending,
            target: target.into(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Paused,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal:?} -> {next:?} must be illegal"
                );
            }
        }
    }

    #[test]
    fn running_pauses_and_resumes() {
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn pending_starts_or_cancels() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn steps_are_ordered() {
        assert!(SyncStep::Validate < SyncStep::FetchPages);
        assert!(SyncStep::FetchPages < SyncStep::SaveRecords);
        assert!(SyncStep::SaveRecords < SyncStep::UpdateIndex);
    }

    #[test]
    fn step_bands_are_contiguous_and_cover_0_to_100() {
        let steps = [
            SyncStep::Validate,
            SyncStep::FetchPages,
            SyncStep::ProcessContent,
            SyncStep::DownloadAssets,
            SyncStep::SaveRecords,
            SyncStep::UpdateIndex,
        ];
        assert_eq!(steps[0].band().0, 0.0);
        assert_eq!(steps.last().unwrap().band().1, 100.0);
        for pair in steps.windows(2) {
            assert_eq!(pair[0].band().1, pair[1].band().0);
        }
    }

    #[test]
    fn step_percentage_clamps_fraction() {
        assert_eq!(SyncStep::FetchPages.percentage(-1.0), 5.0);
        assert_eq!(SyncStep::FetchPages.percentage(2.0), 45.0);
        let mid = SyncStep::FetchPages.percentage(0.5);
        assert!((mid - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn estimate_remaining_extrapolates_linearly() {
        let counts = Counts {
            total: 100,
            processed: 25,
            succeeded: 25,
            failed: 0,
        };
        // 25 items in 5000ms => 200ms/item => 75 remaining => 15000ms.
        assert_eq!(ProgressSnapshot::estimate_remaining(&counts, 5_000), Some(15_000));
    }

    #[test]
    fn estimate_remaining_absent_without_throughput() {
        let counts = Counts::default();
        assert_eq!(ProgressSnapshot::estimate_remaining(&counts, 5_000), None);
        let done = Counts {
            total: 10,
            processed: 10,
            succeeded: 10,
            failed: 0,
        };
        assert_eq!(ProgressSnapshot::estimate_remaining(&done, 5_000), None);
    }

    #[test]
    fn new_task_is_pending_with_unique_id() {
        let a = Task::new(TaskKind::Full, "catalog");
        let b = Task::new(TaskKind::Full, "catalog");
        assert_eq!(a.status, TaskStatus::Pending);
        assert_ne!(a.task_id, b.task_id);
        assert!(a.started_at.is_none());
    }

    #[test]
    fn snapshot_serializes_with_snake_case_step() {
        let snap = ProgressSnapshot::initial();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["current_step"], "validate");
        assert_eq!(json["percentage"], 0.0);
    }
}
