//! SyncTask entity - durable record of a sync run and its latest snapshot.
//!
//! The in-memory task registry is authoritative while the process runs;
//! this table mirrors it so finished tasks survive restarts and the poll
//! endpoint can answer for tasks the registry has already dropped.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::task::{TaskKind, TaskStatus};

/// SyncTask model - one sync run.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_task")]
pub struct Model {
    /// Task id (UUID string).
    #[sea_orm(primary_key, auto_increment = false)]
    pub task_id: String,

    pub kind: TaskKind,

    pub status: TaskStatus,

    /// Logical target this task mirrors.
    pub target: String,

    /// Latest progress snapshot, JSON-serialized. Written on a cadence,
    /// not per-event; the live channel is the low-latency path.
    #[sea_orm(column_type = "Text", nullable)]
    pub snapshot: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub finished_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
