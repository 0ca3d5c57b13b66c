pub(crate) mod migrate;
pub(crate) mod run;
pub(crate) mod serve;
pub(crate) mod tasks;

use std::sync::Arc;

use mirrorsync::{
    ProgressChannel, RemoteSource, ResponseCache, SyncOrchestrator, tasks as task_store,
};
use tokio::sync::mpsc;

use crate::backend::{DirStore, JsonFileSource};
use crate::config::Config;

/// Capacity of the snapshot mirror queue; overflow drops updates.
const MIRROR_QUEUE_CAPACITY: usize = 256;

/// Assemble the orchestrator over a manifest source and a directory store.
///
/// Shared by `run` and `serve`: connects the database, migrates the
/// schema, preloads the response cache and wires the snapshot mirror.
pub(crate) async fn build_orchestrator(
    manifest: &std::path::Path,
    dest: &std::path::Path,
    config: &Config,
    database_url: &str,
) -> Result<(Arc<SyncOrchestrator>, String), Box<dyn std::error::Error>> {
    let db = mirrorsync::db::connect_and_migrate(database_url).await?;

    let source = JsonFileSource::load(manifest).await?;
    let target = source.name().to_string();
    tracing::info!(
        target = %target,
        records = source.len(),
        dest = %dest.display(),
        "manifest loaded"
    );

    let cache = Arc::new(ResponseCache::new(
        config.sync.cache.clone(),
        Some(db.clone()),
    ));
    // Warming runs in the background; the first fetches race it at worst.
    cache.preload(Vec::new());

    let (mirror_tx, mirror_rx) = mpsc::channel(MIRROR_QUEUE_CAPACITY);
    task_store::spawn_mirror_task(db.clone(), mirror_rx);

    let channel = Arc::new(ProgressChannel::new(
        config.sync.progress.clone(),
        Some(mirror_tx),
    ));

    let orchestrator = SyncOrchestrator::new(
        Arc::new(source),
        Arc::new(DirStore::new(dest)),
        cache,
        channel,
        config.sync.clone(),
        Some(db),
    )?;

    Ok((orchestrator, target))
}
