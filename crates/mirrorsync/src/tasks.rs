//! Durable task records.
//!
//! CRUD over the `sync_task` table plus the background mirror task that
//! applies [`MirrorUpdate`]s from the progress channel. The table exists so
//! observers reconnecting after a restart (or after the in-memory registry
//! dropped a finished task) can still read the latest snapshot.

use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, sea_query::OnConflict,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::entity::sync_task::{ActiveModel, Column, Entity as SyncTask, Model};
use crate::error::Result;
use crate::progress::MirrorUpdate;
use crate::task::{ProgressSnapshot, Task, TaskStatus};

/// Insert or update a task row with its latest snapshot.
pub async fn upsert(
    db: &DatabaseConnection,
    task: &Task,
    snapshot: Option<&ProgressSnapshot>,
) -> Result<()> {
    let snapshot_json = match snapshot {
        Some(snapshot) => serde_json::to_string(snapshot).ok(),
        None => None,
    };

    let model = ActiveModel {
        task_id: Set(task.task_id.clone()),
        kind: Set(task.kind),
        status: Set(task.status),
        target: Set(task.target.clone()),
        snapshot: Set(snapshot_json),
        created_at: Set(task.created_at.fixed_offset()),
        finished_at: Set(task.finished_at.map(|t| t.fixed_offset())),
    };

    SyncTask::insert(model)
        .on_conflict(
            OnConflict::column(Column::TaskId)
                .update_columns([Column::Status, Column::Snapshot, Column::FinishedAt])
                .to_owned(),
        )
        .exec(db)
        .await?;

    Ok(())
}

/// Load a task row with its snapshot, if present.
pub async fn get(
    db: &DatabaseConnection,
    task_id: &str,
) -> Result<Option<(Model, Option<ProgressSnapshot>)>> {
    let row = SyncTask::find_by_id(task_id).one(db).await?;
    Ok(row.map(|model| {
        let snapshot = model
            .snapshot
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok());
        (model, snapshot)
    }))
}

/// Update only the status and snapshot columns for a running task.
pub async fn update_progress(
    db: &DatabaseConnection,
    task_id: &str,
    status: TaskStatus,
    snapshot: &ProgressSnapshot,
) -> Result<()> {
    let finished_at = status.is_terminal().then(|| Utc::now().fixed_offset());
    let model = ActiveModel {
        task_id: Set(task_id.to_string()),
        status: Set(status),
        snapshot: Set(serde_json::to_string(snapshot).ok()),
        finished_at: Set(finished_at),
        ..Default::default()
    };
    SyncTask::update(model).exec(db).await?;
    Ok(())
}

/// Delete terminal task rows finished before `cutoff`. Returns rows removed.
pub async fn purge_finished_before(
    db: &DatabaseConnection,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let result = SyncTask::delete_many()
        .filter(Column::FinishedAt.lt(cutoff.fixed_offset()))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Spawn the snapshot mirror task.
///
/// Applies progress updates to the durable store as they arrive; a failed
/// write is logged and dropped rather than retried, since the next update
/// supersedes it anyway.
pub fn spawn_mirror_task(
    db: DatabaseConnection,
    mut rx: mpsc::Receiver<MirrorUpdate>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        debug!("snapshot mirror task started");
        while let Some(update) = rx.recv().await {
            if let Err(e) = update_progress(&db, &update.task_id, update.status, &update.snapshot).await
            {
                warn!(task_id = %update.task_id, error = %e, "snapshot mirror write failed");
            }
        }
        debug!("snapshot mirror task finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    use crate::task::TaskKind;

    fn row(task_id: &str, status: TaskStatus, snapshot: Option<String>) -> Model {
        Model {
            task_id: task_id.to_string(),
            kind: TaskKind::Full,
            status,
            target: "catalog".to_string(),
            snapshot,
            created_at: Utc::now().fixed_offset(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn get_parses_stored_snapshot() {
        let snapshot = ProgressSnapshot::initial();
        let json = serde_json::to_string(&snapshot).unwrap();
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_query_results([vec![row("t-1", TaskStatus::Running, Some(json))]])
            .into_connection();

        let (model, parsed) = get(&db, "t-1").await.unwrap().unwrap();
        assert_eq!(model.status, TaskStatus::Running);
        assert_eq!(parsed.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn get_tolerates_corrupt_snapshot() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_query_results([vec![row(
                "t-1",
                TaskStatus::Completed,
                Some("not json".to_string()),
            )]])
            .into_connection();

        let (_, parsed) = get(&db, "t-1").await.unwrap().unwrap();
        assert!(parsed.is_none());
    }

    #[tokio::test]
    async fn get_unknown_task_is_none() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_query_results([Vec::<Model>::new()])
            .into_connection();
        assert!(get(&db, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_writes_one_row() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .into_connection();

        let task = Task::new(TaskKind::Incremental, "catalog");
        upsert(&db, &task, Some(&ProgressSnapshot::initial()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn purge_reports_rows_removed() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 3,
            }])
            .into_connection();

        let removed = purge_finished_before(&db, Utc::now()).await.unwrap();
        assert_eq!(removed, 3);
    }
}
