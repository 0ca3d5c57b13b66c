//! The `tasks` command: inspect and prune durable task records.

use chrono::{Duration, Utc};
use mirrorsync::{db, tasks as task_store};

use crate::TasksAction;

pub(crate) async fn handle_tasks(
    action: TasksAction,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = db::connect(database_url).await?;

    match action {
        TasksAction::Status { task_id } => {
            let Some((model, snapshot)) = task_store::get(&db, &task_id).await? else {
                eprintln!("No record of task {task_id}.");
                std::process::exit(1);
            };
            let doc = serde_json::json!({
                "task_id": model.task_id,
                "kind": model.kind,
                "status": model.status,
                "target": model.target,
                "created_at": model.created_at,
                "finished_at": model.finished_at,
                "snapshot": snapshot,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        TasksAction::Purge { older_than_hours } => {
            let cutoff = Utc::now() - Duration::hours(older_than_hours);
            let removed = task_store::purge_finished_before(&db, cutoff).await?;
            println!("Purged {removed} finished task record(s) older than {older_than_hours}h.");
        }
    }

    Ok(())
}
