//! The `migrate` command: manage the task/cache schema by hand.
//!
//! `run` and `serve` migrate automatically on startup; these verbs exist
//! for operators who want to inspect or rebuild the schema explicitly.

use mirrorsync::db;
use mirrorsync::migration::{Migrator, MigratorTrait};

use crate::MigrateAction;

pub(crate) async fn handle_migrate(
    action: MigrateAction,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = db::connect(database_url).await?;

    match action {
        MigrateAction::Up => {
            let pending = Migrator::get_pending_migrations(&db).await?.len();
            if pending == 0 {
                println!("Schema is already up to date.");
            } else {
                println!("Applying {pending} pending migration(s)...");
                Migrator::up(&db, None).await?;
                println!("Schema is up to date.");
            }
        }
        MigrateAction::Down => {
            println!("Reverting the most recent migration...");
            Migrator::down(&db, Some(1)).await?;
            println!("Reverted.");
        }
        MigrateAction::Status => {
            Migrator::status(&db).await?;
        }
        MigrateAction::Fresh => {
            println!("Rebuilding the schema from scratch; all task and cache rows are dropped...");
            Migrator::fresh(&db).await?;
            println!("Schema rebuilt.");
        }
    }

    Ok(())
}
