//! Streaming persistence task.
//!
//! A background task receives normalized records over a channel and writes
//! them to the local store in planner-sized batches:
//!
//! - **Immediate close detection**: remaining items flush as soon as the
//!   channel closes, without waiting for a timeout
//! - **Time-based flushing**: partial batches flush after a timeout so a
//!   blocked upstream never deadlocks the pipeline
//! - **Per-item errors**: a failed upsert is recorded against the item and
//!   the batch continues; only store-level failures stop the task
//!
//! Batches are written sequentially per task to preserve ordering on the
//! local store; the upstream fetch phase overlaps with them through the
//! channel buffer.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, warn};

use crate::batch::{BatchPlanner, MemoryProbe};
use crate::error::short_error_message;
use crate::store::{LocalStore, NormalizedRecord};

/// Maximum time a partial batch waits mid-stream before flushing.
pub const FLUSH_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);

/// Maximum time to wait for the task after all senders are dropped. Not
/// finishing by then means a sender leak.
pub const PERSIST_TASK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Pause taken after the planner reports emergency memory pressure, giving
/// the allocator a window to return freed batches.
pub const MEMORY_PAUSE: std::time::Duration = std::time::Duration::from_millis(200);

/// Channel buffer for streaming records into the task.
pub const RECORD_CHANNEL_BUFFER_SIZE: usize = 256;

/// Outcome of a persist task run.
#[derive(Debug, Default)]
#[must_use = "PersistResult may contain errors that should be checked"]
pub struct PersistResult {
    /// Records written successfully.
    pub saved_count: usize,
    /// Per-item failures: (item_ref, error message).
    pub errors: Vec<(String, String)>,
    /// Set when the store became unreachable; the task stopped early and
    /// the whole sync must fail.
    pub fatal: Option<String>,
    /// Panic message if the task panicked.
    pub panic_info: Option<String>,
}

impl PersistResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty() || self.fatal.is_some() || self.panic_info.is_some()
    }

    pub fn failed_count(&self) -> usize {
        self.errors.len()
    }
}

/// Live counters shared with the orchestrator's progress loop.
#[derive(Clone, Default)]
pub struct PersistCounters {
    pub saved: Arc<AtomicUsize>,
    pub failed: Arc<AtomicUsize>,
}

/// Create the record channel with the recommended buffer size.
pub fn create_record_channel() -> (
    mpsc::Sender<NormalizedRecord>,
    mpsc::Receiver<NormalizedRecord>,
) {
    mpsc::channel(RECORD_CHANNEL_BUFFER_SIZE)
}

/// Write one batch, recording per-item failures.
///
/// Returns `Err` with a message only on a fatal store failure.
async fn flush_batch(
    store: &dyn LocalStore,
    batch: Vec<NormalizedRecord>,
    is_final: bool,
    result: &mut PersistResult,
    counters: &PersistCounters,
) -> std::result::Result<(), String> {
    if batch.is_empty() {
        return Ok(());
    }

    let batch_size = batch.len();
    debug!(batch_size, is_final, "flushing batch");
    let flush_start = std::time::Instant::now();

    for record in batch {
        match store.upsert(&record).await {
            Ok(()) => {
                result.saved_count += 1;
                counters.saved.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.is_fatal() => {
                let message = short_error_message(&e);
                error!(item_ref = %record.remote_id, error = %e, "store unreachable, stopping persist task");
                return Err(message);
            }
            Err(e) => {
                let message = short_error_message(&e);
                warn!(item_ref = %record.remote_id, error = %e, "record failed to persist");
                result.errors.push((record.remote_id.clone(), message));
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    debug!(
        batch_size,
        final_batch = is_final,
        elapsed_ms = flush_start.elapsed().as_millis(),
        "persisted batch"
    );
    Ok(())
}

/// Spawn the persist task.
///
/// Records stream in over `rx`; batch sizes come from `planner` so memory
/// pressure shrinks in-flight batches. The task drains the current batch
/// and exits when `cancel` flips, when the channel closes, or on a fatal
/// store failure.
pub fn spawn_persist_task<P>(
    store: Arc<dyn LocalStore>,
    mut rx: mpsc::Receiver<NormalizedRecord>,
    mut planner: BatchPlanner<P>,
    cancel: Option<Arc<AtomicBool>>,
) -> (tokio::task::JoinHandle<PersistResult>, PersistCounters)
where
    P: MemoryProbe + Send + 'static,
{
    let counters = PersistCounters::default();
    let shared = counters.clone();

    let handle = tokio::spawn(async move {
        let mut result = PersistResult::default();
        let task_start = std::time::Instant::now();

        debug!("persist task started, waiting for records");

        let mut plan = planner.next_batch(usize::MAX);
        let mut batch: Vec<NormalizedRecord> = Vec::with_capacity(plan.size.max(1));
        let mut batch_count = 0u64;

        // Start the flush interval in the future so it cannot fire before
        // the first record arrives.
        let mut flush_interval = interval_at(Instant::now() + FLUSH_TIMEOUT, FLUSH_TIMEOUT);

        loop {
            let cancelled = cancel.as_ref().is_some_and(|f| f.load(Ordering::Relaxed));
            if cancelled {
                debug!("cancel requested, flushing final batch");
                if let Err(fatal) =
                    flush_batch(store.as_ref(), batch, true, &mut result, &shared).await
                {
                    result.fatal = Some(fatal);
                }
                break;
            }

            tokio::select! {
                biased;

                item = rx.recv() => {
                    match item {
                        Some(record) => {
                            batch.push(record);
                            if batch.len() >= plan.size.max(1) {
                                batch_count += 1;
                                let full = std::mem::take(&mut batch);
                                if let Err(fatal) = flush_batch(store.as_ref(), full, false, &mut result, &shared).await {
                                    result.fatal = Some(fatal);
                                    break;
                                }
                                if plan.gc_pause_requested {
                                    warn!("memory pressure past emergency ceiling, pausing persistence");
                                    tokio::time::sleep(MEMORY_PAUSE).await;
                                }
                                plan = planner.next_batch(usize::MAX);
                                batch.reserve(plan.size.max(1));
                                flush_interval.reset();
                            }
                        }
                        None => {
                            debug!("channel closed, flushing final batch");
                            batch_count += 1;
                            if let Err(fatal) = flush_batch(store.as_ref(), batch, true, &mut result, &shared).await {
                                result.fatal = Some(fatal);
                            }
                            break;
                        }
                    }
                }

                _ = flush_interval.tick(), if !batch.is_empty() => {
                    debug!(batch_size = batch.len(), "timeout flush to prevent deadlock");
                    batch_count += 1;
                    let partial = std::mem::take(&mut batch);
                    if let Err(fatal) = flush_batch(store.as_ref(), partial, false, &mut result, &shared).await {
                        result.fatal = Some(fatal);
                        break;
                    }
                    plan = planner.next_batch(usize::MAX);
                }
            }
        }

        debug!(
            batch_count,
            saved = result.saved_count,
            errors = result.errors.len(),
            elapsed_ms = task_start.elapsed().as_millis(),
            "persist task completed"
        );
        result
    });

    (handle, counters)
}

/// Await the persist task, capturing panics and guarding against a hung
/// channel with a timeout.
pub async fn await_persist_task(
    mut handle: tokio::task::JoinHandle<PersistResult>,
) -> PersistResult {
    tokio::select! {
        result = &mut handle => {
            match result {
                Ok(persist_result) => persist_result,
                Err(e) => {
                    let panic_info = if e.is_panic() {
                        let payload = e.into_panic();
                        if let Some(s) = payload.downcast_ref::<&str>() {
                            Some((*s).to_string())
                        } else if let Some(s) = payload.downcast_ref::<String>() {
                            Some(s.clone())
                        } else {
                            Some("unknown panic".to_string())
                        }
                    } else {
                        Some(format!("persist task failed: {e}"))
                    };
                    error!(panic_info = ?panic_info, "persist task failed");
                    PersistResult {
                        panic_info,
                        ..PersistResult::default()
                    }
                }
            }
        }
        _ = tokio::time::sleep(PERSIST_TASK_TIMEOUT) => {
            handle.abort();
            let _ = tokio::time::timeout(std::time::Duration::from_secs(1), &mut handle).await;
            error!(
                timeout_secs = PERSIST_TASK_TIMEOUT.as_secs(),
                "persist task timed out, channel may not have closed"
            );
            PersistResult {
                panic_info: Some(format!(
                    "persist task timed out after {}s, channel may not have closed",
                    PERSIST_TASK_TIMEOUT.as_secs()
                )),
                ..PersistResult::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::batch::FixedProbe;
    use crate::config::BatchConfig;
    use crate::error::{Result, SyncError};

    /// Store recording upserts, with scripted per-item and fatal failures.
    #[derive(Default)]
    struct ScriptedStore {
        written: Mutex<Vec<String>>,
        fail_items: HashSet<String>,
        fatal_on: Option<String>,
    }

    #[async_trait]
    impl LocalStore for ScriptedStore {
        async fn upsert(&self, record: &NormalizedRecord) -> Result<()> {
            if self.fatal_on.as_deref() == Some(record.remote_id.as_str()) {
                return Err(SyncError::fatal("store unreachable"));
            }
            if self.fail_items.contains(&record.remote_id) {
                return Err(SyncError::persistence(&record.remote_id, "constraint violation"));
            }
            self.written.lock().unwrap().push(record.remote_id.clone());
            Ok(())
        }

        async fn delete(&self, _remote_id: &str) -> Result<()> {
            Ok(())
        }

        async fn known_fingerprints(&self) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }

        async fn refresh_index(&self) -> Result<()> {
            Ok(())
        }
    }

    fn record(id: &str) -> NormalizedRecord {
        NormalizedRecord {
            remote_id: id.to_string(),
            fingerprint: format!("fp-{id}"),
            content: serde_json::json!({"id": id}),
            asset: None,
            synced_at: Utc::now(),
        }
    }

    fn planner() -> BatchPlanner<FixedProbe> {
        BatchPlanner::new(BatchConfig::default(), FixedProbe(0.3))
    }

    #[tokio::test]
    async fn persists_all_records_and_flushes_on_close() {
        let store = Arc::new(ScriptedStore::default());
        let (tx, rx) = create_record_channel();
        let (handle, counters) = spawn_persist_task(store.clone(), rx, planner(), None);

        for i in 0..50 {
            tx.send(record(&format!("item-{i}"))).await.unwrap();
        }
        drop(tx);

        let result = await_persist_task(handle).await;
        assert_eq!(result.saved_count, 50);
        assert!(!result.has_errors());
        assert_eq!(counters.saved.load(Ordering::Relaxed), 50);
        assert_eq!(store.written.lock().unwrap().len(), 50);
    }

    #[tokio::test]
    async fn records_are_persisted_in_send_order() {
        let store = Arc::new(ScriptedStore::default());
        let (tx, rx) = create_record_channel();
        let (handle, _) = spawn_persist_task(store.clone(), rx, planner(), None);

        for i in 0..30 {
            tx.send(record(&format!("item-{i:02}"))).await.unwrap();
        }
        drop(tx);
        await_persist_task(handle).await;

        let written = store.written.lock().unwrap();
        let mut sorted = written.clone();
        sorted.sort();
        assert_eq!(*written, sorted);
    }

    #[tokio::test]
    async fn per_item_failures_are_recorded_and_skipped() {
        let store = Arc::new(ScriptedStore {
            fail_items: HashSet::from(["item-3".to_string(), "item-7".to_string()]),
            ..ScriptedStore::default()
        });
        let (tx, rx) = create_record_channel();
        let (handle, counters) = spawn_persist_task(store.clone(), rx, planner(), None);

        for i in 0..10 {
            tx.send(record(&format!("item-{i}"))).await.unwrap();
        }
        drop(tx);

        let result = await_persist_task(handle).await;
        assert_eq!(result.saved_count, 8);
        assert_eq!(result.failed_count(), 2);
        assert!(result.fatal.is_none());
        assert_eq!(counters.failed.load(Ordering::Relaxed), 2);
        let failed: Vec<&str> = result.errors.iter().map(|(r, _)| r.as_str()).collect();
        assert_eq!(failed, ["item-3", "item-7"]);
    }

    #[tokio::test]
    async fn fatal_store_failure_stops_the_task() {
        let store = Arc::new(ScriptedStore {
            fatal_on: Some("item-5".to_string()),
            ..ScriptedStore::default()
        });
        let (tx, rx) = create_record_channel();
        let (handle, _) = spawn_persist_task(store.clone(), rx, planner(), None);

        for i in 0..10 {
            tx.send(record(&format!("item-{i}"))).await.unwrap();
        }
        drop(tx);

        let result = await_persist_task(handle).await;
        assert!(result.fatal.is_some());
        assert_eq!(result.saved_count, 5);
    }

    #[tokio::test]
    async fn partial_batch_flushes_on_timeout() {
        let store = Arc::new(ScriptedStore::default());
        let (tx, rx) = create_record_channel();
        let (handle, counters) = spawn_persist_task(store.clone(), rx, planner(), None);

        // Far fewer than a batch; only the timeout can flush these.
        tx.send(record("item-0")).await.unwrap();
        tx.send(record("item-1")).await.unwrap();

        tokio::time::sleep(FLUSH_TIMEOUT + std::time::Duration::from_millis(100)).await;
        assert_eq!(counters.saved.load(Ordering::Relaxed), 2);

        drop(tx);
        let result = await_persist_task(handle).await;
        assert_eq!(result.saved_count, 2);
    }

    #[tokio::test]
    async fn cancel_flag_drains_current_batch_and_exits() {
        let store = Arc::new(ScriptedStore::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = create_record_channel();
        let (handle, _) =
            spawn_persist_task(store.clone(), rx, planner(), Some(Arc::clone(&cancel)));

        tx.send(record("item-0")).await.unwrap();
        tokio::task::yield_now().await;
        cancel.store(true, Ordering::Relaxed);

        // Sender stays alive; only the flag can stop the task.
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("task must notice the cancel flag")
            .unwrap();
        assert_eq!(result.saved_count, 1);
        drop(tx);
    }
}
