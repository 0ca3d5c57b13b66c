//! The `run` command: one sync task, watched to completion.

use std::path::Path;
use std::time::Duration;

use mirrorsync::{ProgressEvent, TaskKind, TaskStatus};
use tokio::sync::broadcast::error::RecvError;

use crate::config::Config;
use crate::progress::ProgressReporter;
use crate::shutdown;

/// Interval at which the event loop checks for a requested shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

pub(crate) async fn handle_run(
    manifest: &Path,
    dest: &Path,
    incremental: bool,
    config: &Config,
    database_url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let (orchestrator, target) =
        super::build_orchestrator(manifest, dest, config, database_url).await?;

    let kind = if incremental {
        TaskKind::Incremental
    } else {
        TaskKind::Full
    };
    let task_id = orchestrator.start(kind, &target)?;
    println!("Task {task_id}");

    let subscription = orchestrator.channel().subscribe(&task_id);
    let reporter = ProgressReporter::new();
    reporter.handle(&subscription.connected);

    let Some(mut rx) = subscription.receiver else {
        return Err(format!("task {task_id} vanished before it produced events").into());
    };

    // The task may already be terminal if it was trivially small.
    let already_terminal = match subscription.connected {
        ProgressEvent::Connected { status, .. } if status.is_terminal() => Some(status),
        _ => None,
    };

    let mut cancel_sent = false;
    let mut ticker = tokio::time::interval(SHUTDOWN_POLL);
    let final_status = if let Some(status) = already_terminal {
        status
    } else {
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => {
                        reporter.handle(&event);
                        match event {
                            ProgressEvent::Completed { status, .. } => break status,
                            ProgressEvent::Failed { .. } => break TaskStatus::Failed,
                            _ => {}
                        }
                    }
                    // A lagging reader resumes at newer events; the terminal
                    // event is always the last one sent, so nothing is lost.
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break TaskStatus::Failed,
                },
                _ = ticker.tick() => {
                    if shutdown::is_shutdown_requested() && !cancel_sent {
                        orchestrator.cancel(&task_id).ok();
                        cancel_sent = true;
                    }
                }
            }
        }
    };
    reporter.finish();

    match final_status {
        TaskStatus::Completed | TaskStatus::Cancelled => Ok(()),
        _ => {
            let detail = orchestrator
                .status(&task_id)
                .await
                .ok()
                .flatten()
                .map(|(_, snapshot)| snapshot.message)
                .unwrap_or_else(|| "no diagnostic snapshot available".to_string());
            Err(format!("sync task {task_id} failed: {detail}").into())
        }
    }
}
