//! End-to-end sync task execution.
//!
//! One orchestrator instance owns the process-wide cache, limiter and
//! progress channel, and drives any number of concurrent tasks (at most
//! one active task per target, enforced by an import lock). A task walks
//! the pipeline steps in order: validate, fetch pages through the cache
//! and limiter, process content, download assets concurrently, stream
//! records to the persist task, refresh the index.
//!
//! Control is cooperative: every suspension point goes through a
//! [`ControlToken`] checkpoint, so pause blocks the loop between items and
//! cancel unwinds it to a terminal snapshot without leaving work half
//! applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backon::Retryable;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batch::{BatchPlanner, ProcessMemoryProbe};
use crate::cache::ResponseCache;
use crate::config::SyncTunables;
use crate::error::{Result, SyncError, short_error_message};
use crate::fingerprint::{content_fingerprint, request_fingerprint};
use crate::limiter::{AdaptiveLimiter, Outcome, RateCap};
use crate::persist::{await_persist_task, create_record_channel, spawn_persist_task};
use crate::progress::ProgressChannel;
use crate::source::{RecordPage, RemoteRecord, RemoteSource};
use crate::store::{LocalStore, NormalizedRecord};
use crate::task::{Counts, ErrorEntry, ProgressSnapshot, SyncStep, Task, TaskKind, TaskStatus, Timing};
use crate::tasks;

/// Cooperative pause/cancel signal shared with every suspension point.
pub struct ControlToken {
    paused: AtomicBool,
    cancelled: AtomicBool,
    notify: Notify,
}

impl ControlToken {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Block while paused; returns `true` if the task was cancelled.
    pub async fn checkpoint(&self) -> bool {
        loop {
            if self.is_cancelled() {
                return true;
            }
            if !self.is_paused() {
                return false;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() || !self.is_paused() {
                continue;
            }
            notified.await;
        }
    }
}

struct RunningTask {
    task: Task,
    token: Arc<ControlToken>,
    cancel_flag: Arc<AtomicBool>,
}

struct TerminalRecord {
    task: Task,
    /// Items that failed, kept for `retry_failed`.
    failed_items: Vec<RemoteRecord>,
    finished_at: Instant,
}

struct ImportLock {
    task_id: String,
    acquired_at: Instant,
}

/// Drives sync tasks and owns the shared pipeline components.
pub struct SyncOrchestrator {
    source: Arc<dyn RemoteSource>,
    store: Arc<dyn LocalStore>,
    cache: Arc<ResponseCache>,
    limiter: Arc<AdaptiveLimiter>,
    rate_cap: RateCap,
    channel: Arc<ProgressChannel>,
    tunables: SyncTunables,
    db: Option<DatabaseConnection>,
    running: Mutex<HashMap<String, RunningTask>>,
    terminal: Mutex<HashMap<String, TerminalRecord>>,
    import_locks: Mutex<HashMap<String, ImportLock>>,
}

impl SyncOrchestrator {
    /// Create an orchestrator.
    ///
    /// `db` backs the durable task rows; pass `None` for a purely
    /// in-memory deployment (snapshots then live only in the channel).
    pub fn new(
        source: Arc<dyn RemoteSource>,
        store: Arc<dyn LocalStore>,
        cache: Arc<ResponseCache>,
        channel: Arc<ProgressChannel>,
        tunables: SyncTunables,
        db: Option<DatabaseConnection>,
    ) -> Result<Arc<Self>> {
        tunables.validate()?;
        let limiter = AdaptiveLimiter::new(tunables.limiter.clone());
        let rate_cap = RateCap::new(tunables.limiter.requests_per_second);
        Ok(Arc::new(Self {
            source,
            store,
            cache,
            limiter,
            rate_cap,
            channel,
            tunables,
            db,
            running: Mutex::new(HashMap::new()),
            terminal: Mutex::new(HashMap::new()),
            import_locks: Mutex::new(HashMap::new()),
        }))
    }

    /// Shared limiter, for operator statistics.
    pub fn limiter(&self) -> &Arc<AdaptiveLimiter> {
        &self.limiter
    }

    /// Shared cache, for operator statistics.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Progress channel, for push/poll transports.
    pub fn channel(&self) -> &Arc<ProgressChannel> {
        &self.channel
    }

    /// Start a new task for `target` and return its id.
    ///
    /// Fails when another task currently holds the target's import lock.
    pub fn start(self: &Arc<Self>, kind: TaskKind, target: &str) -> Result<String> {
        self.purge_expired_terminal();

        let task = Task::new(kind, target);
        let task_id = task.task_id.clone();
        self.acquire_import_lock(target, &task_id)?;

        let token = ControlToken::new();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.channel.register(&task_id);
        self.lock_running().insert(
            task_id.clone(),
            RunningTask {
                task: task.clone(),
                token: Arc::clone(&token),
                cancel_flag: Arc::clone(&cancel_flag),
            },
        );

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.drive(task, token, cancel_flag, None).await;
        });

        Ok(task_id)
    }

    /// Re-run exactly the items recorded as failed in `task_id`'s terminal
    /// snapshot. Returns the id of the new task.
    pub fn retry_failed(self: &Arc<Self>, task_id: &str) -> Result<String> {
        let (parent, failed_items) = {
            let terminal = self.lock_terminal();
            let record = terminal.get(task_id).ok_or_else(|| {
                SyncError::config(format!("no terminal task {task_id} to retry"))
            })?;
            if record.failed_items.is_empty() {
                return Err(SyncError::config(format!(
                    "task {task_id} recorded no failed items"
                )));
            }
            (record.task.clone(), record.failed_items.clone())
        };

        let task = Task::new(parent.kind, &parent.target);
        let retry_id = task.task_id.clone();
        self.acquire_import_lock(&parent.target, &retry_id)?;

        info!(parent = %task_id, task_id = %retry_id, items = failed_items.len(), "retrying failed items");

        let token = ControlToken::new();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.channel.register(&retry_id);
        self.lock_running().insert(
            retry_id.clone(),
            RunningTask {
                task: task.clone(),
                token: Arc::clone(&token),
                cancel_flag: Arc::clone(&cancel_flag),
            },
        );

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator
                .drive(task, token, cancel_flag, Some(failed_items))
                .await;
        });

        Ok(retry_id)
    }

    /// Pause a running task at its next checkpoint.
    pub fn pause(&self, task_id: &str) -> Result<()> {
        let running = self.lock_running();
        let entry = running
            .get(task_id)
            .ok_or_else(|| SyncError::config(format!("no running task {task_id}")))?;
        entry.token.pause();
        info!(task_id, "pause requested");
        if let Some((_, snapshot)) = self.channel.latest(task_id) {
            self.channel.emit(task_id, TaskStatus::Paused, snapshot);
        }
        Ok(())
    }

    /// Resume a paused task.
    pub fn resume(&self, task_id: &str) -> Result<()> {
        let running = self.lock_running();
        let entry = running
            .get(task_id)
            .ok_or_else(|| SyncError::config(format!("no running task {task_id}")))?;
        entry.token.resume();
        info!(task_id, "resume requested");
        if let Some((_, snapshot)) = self.channel.latest(task_id) {
            self.channel.emit(task_id, TaskStatus::Running, snapshot);
        }
        Ok(())
    }

    /// Cancel a running task. The task reaches its `cancelled` terminal
    /// snapshot at the next checkpoint.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let running = self.lock_running();
        let entry = running
            .get(task_id)
            .ok_or_else(|| SyncError::config(format!("no running task {task_id}")))?;
        entry.token.cancel();
        entry.cancel_flag.store(true, Ordering::SeqCst);
        info!(task_id, "cancel requested");
        Ok(())
    }

    /// Latest status and snapshot for a task, falling back to the durable
    /// row for tasks the channel no longer tracks.
    pub async fn status(&self, task_id: &str) -> Result<Option<(TaskStatus, ProgressSnapshot)>> {
        if let Some(latest) = self.channel.latest(task_id) {
            return Ok(Some(latest));
        }
        let Some(db) = &self.db else {
            return Ok(None);
        };
        match tasks::get(db, task_id).await? {
            Some((model, Some(snapshot))) => Ok(Some((model.status, snapshot))),
            Some((model, None)) => Ok(Some((model.status, ProgressSnapshot::initial()))),
            None => Ok(None),
        }
    }

    async fn drive(
        self: Arc<Self>,
        mut task: Task,
        token: Arc<ControlToken>,
        cancel_flag: Arc<AtomicBool>,
        retry_items: Option<Vec<RemoteRecord>>,
    ) {
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        self.persist_task_row(&task, None).await;

        let outcome = self
            .run_pipeline(&task, &token, &cancel_flag, retry_items)
            .await;

        let (status, snapshot, failed_items) = outcome;
        task.status = status;
        task.finished_at = Some(Utc::now());

        match status {
            TaskStatus::Completed => self.channel.complete(&task.task_id, snapshot.clone()),
            TaskStatus::Failed => self.channel.fail(&task.task_id, snapshot.clone()),
            _ => self.channel.cancelled(&task.task_id, snapshot.clone()),
        }
        self.persist_task_row(&task, Some(&snapshot)).await;

        self.release_import_lock(&task.target, &task.task_id);
        self.lock_running().remove(&task.task_id);
        self.lock_terminal().insert(
            task.task_id.clone(),
            TerminalRecord {
                task,
                failed_items,
                finished_at: Instant::now(),
            },
        );
    }

    /// The pipeline proper. Returns terminal status, final snapshot and
    /// the failed items kept for retry.
    async fn run_pipeline(
        &self,
        task: &Task,
        token: &ControlToken,
        cancel_flag: &Arc<AtomicBool>,
        retry_items: Option<Vec<RemoteRecord>>,
    ) -> (TaskStatus, ProgressSnapshot, Vec<RemoteRecord>) {
        let mut state = TaskState::new(self.tunables.progress.error_cap);
        let task_id = task.task_id.as_str();

        // validate
        state.message = "validating".to_string();
        self.emit(task_id, &state, SyncStep::Validate, 0.5);
        if let Err(e) = self.tunables.validate() {
            state.message = short_error_message(&e);
            return (TaskStatus::Failed, state.snapshot(SyncStep::Validate, 1.0), Vec::new());
        }

        // fetch_pages (skipped for a retry run, which already has its items)
        let items = match retry_items {
            Some(items) => {
                state.counts.total = items.len();
                self.emit(task_id, &state, SyncStep::FetchPages, 1.0);
                items
            }
            None => match self.fetch_all_pages(task_id, token, &mut state).await {
                Ok(Some(items)) => items,
                Ok(None) => {
                    state.message = "cancelled".to_string();
                    return (
                        TaskStatus::Cancelled,
                        state.snapshot(SyncStep::FetchPages, 1.0),
                        Vec::new(),
                    );
                }
                Err(e) => {
                    state.message = short_error_message(&e);
                    return (
                        TaskStatus::Failed,
                        state.snapshot(SyncStep::FetchPages, 1.0),
                        Vec::new(),
                    );
                }
            },
        };

        // process_content
        let (mut records, skipped) = match self.process_content(task_id, task.kind, &items, &mut state).await {
            Ok(processed) => processed,
            Err(e) => {
                state.message = short_error_message(&e);
                return (
                    TaskStatus::Failed,
                    state.snapshot(SyncStep::ProcessContent, 1.0),
                    Vec::new(),
                );
            }
        };

        // download_assets
        if token.checkpoint().await {
            state.message = "cancelled".to_string();
            return (
                TaskStatus::Cancelled,
                state.snapshot(SyncStep::DownloadAssets, 0.0),
                Vec::new(),
            );
        }
        let asset_failures = self
            .download_assets(task_id, token, &items, &mut records, &mut state)
            .await;

        // save_records
        let persist = self
            .save_records(
                task_id,
                token,
                cancel_flag,
                records,
                skipped,
                asset_failures.len(),
                &mut state,
            )
            .await;
        let persist = match persist {
            Ok(result) => result,
            Err(e) => {
                state.message = short_error_message(&e);
                return (
                    TaskStatus::Failed,
                    state.snapshot(SyncStep::SaveRecords, 1.0),
                    Vec::new(),
                );
            }
        };

        // Collect every failed item ref for the retry path.
        let mut failed_refs: Vec<String> = persist.errors.iter().map(|(r, _)| r.clone()).collect();
        failed_refs.extend(asset_failures);
        let failed_items: Vec<RemoteRecord> = items
            .iter()
            .filter(|item| failed_refs.iter().any(|r| r == &item.remote_id))
            .cloned()
            .collect();

        state.counts.succeeded = persist.saved_count + skipped;
        state.counts.failed = failed_refs.len();
        state.counts.processed = state.counts.succeeded + state.counts.failed;

        if let Some(fatal) = persist.fatal.or(persist.panic_info) {
            state.message = fatal;
            return (
                TaskStatus::Failed,
                state.snapshot(SyncStep::SaveRecords, 1.0),
                failed_items,
            );
        }

        if token.checkpoint().await {
            state.message = "cancelled".to_string();
            return (
                TaskStatus::Cancelled,
                state.snapshot(SyncStep::SaveRecords, 1.0),
                failed_items,
            );
        }

        // update_index
        state.message = "refreshing index".to_string();
        self.emit(task_id, &state, SyncStep::UpdateIndex, 0.2);
        if let Err(e) = self.store.refresh_index().await {
            state.message = short_error_message(&e);
            return (
                TaskStatus::Failed,
                state.snapshot(SyncStep::UpdateIndex, 1.0),
                failed_items,
            );
        }

        state.message = format!(
            "synced {} of {} items ({} failed)",
            state.counts.succeeded, state.counts.total, state.counts.failed
        );
        (
            TaskStatus::Completed,
            state.snapshot(SyncStep::UpdateIndex, 1.0),
            failed_items,
        )
    }

    /// Walk the cursor chain. `Ok(None)` means the task was cancelled.
    async fn fetch_all_pages(
        &self,
        task_id: &str,
        token: &ControlToken,
        state: &mut TaskState,
    ) -> Result<Option<Vec<RemoteRecord>>> {
        let mut items: Vec<RemoteRecord> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages_fetched = 0usize;
        let mut total_pages_hint: Option<usize> = None;

        loop {
            if token.checkpoint().await {
                return Ok(None);
            }

            let page = self.fetch_page(cursor.as_deref()).await?;
            pages_fetched += 1;

            if let Some(total) = page.total_hint {
                state.counts.total = total;
                total_pages_hint =
                    Some(total.div_ceil(self.tunables.page_size.max(1)).max(1));
            } else {
                state.counts.total = items.len() + page.items.len();
            }
            items.extend(page.items);

            // Without a total the fraction creeps toward (not past) 1.
            let fraction = match total_pages_hint {
                Some(total_pages) => pages_fetched as f64 / total_pages as f64,
                None => 1.0 - 1.0 / (pages_fetched + 1) as f64,
            };
            state.message = format!("fetched page {pages_fetched} ({} items)", items.len());
            self.emit(task_id, state, SyncStep::FetchPages, fraction);

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        state.counts.total = items.len();
        debug!(task_id, pages = pages_fetched, items = items.len(), "pagination finished");
        Ok(Some(items))
    }

    /// One page through cache, rate cap, limiter and retry.
    async fn fetch_page(&self, cursor: Option<&str>) -> Result<RecordPage> {
        let page_size = self.tunables.page_size;
        let size_param = page_size.to_string();
        let fingerprint = request_fingerprint(
            &format!("{}/pages", self.source.name()),
            &[
                ("cursor", cursor.unwrap_or("")),
                ("page_size", &size_param),
            ],
        );

        if let Some(value) = self.cache.get(&fingerprint).await {
            if let Ok(page) = serde_json::from_value::<RecordPage>(value) {
                return Ok(page);
            }
        }

        let operation = || async {
            self.rate_cap.wait().await;
            let permit = self.limiter.acquire().await;
            let start = Instant::now();
            match self.source.fetch_page(cursor, page_size).await {
                Ok(page) => {
                    permit.release(Outcome::success(start.elapsed()));
                    Ok(page)
                }
                Err(e) => {
                    let elapsed = start.elapsed();
                    permit.release(if e.is_rate_limited() {
                        Outcome::rate_limited(elapsed)
                    } else {
                        Outcome::failure(elapsed)
                    });
                    Err(e)
                }
            }
        };

        let page = operation
            .retry(self.tunables.retry.backoff())
            .when(SyncError::is_retryable)
            .notify(|err, dur| {
                debug!(error = %short_error_message(err), retry_in = ?dur, "page fetch retrying");
            })
            .await?;

        if let Ok(value) = serde_json::to_value(&page) {
            self.cache
                .put(&fingerprint, self.source.name(), value, None)
                .await;
        }
        Ok(page)
    }

    /// Normalize payloads, skipping unchanged records on incremental runs.
    /// Returns the records to persist and the count of unchanged skips.
    async fn process_content(
        &self,
        task_id: &str,
        kind: TaskKind,
        items: &[RemoteRecord],
        state: &mut TaskState,
    ) -> Result<(Vec<NormalizedRecord>, usize)> {
        let known = match kind {
            TaskKind::Incremental => self.store.known_fingerprints().await?,
            TaskKind::Full => HashMap::new(),
        };

        let mut records = Vec::with_capacity(items.len());
        let mut skipped = 0usize;
        for (index, item) in items.iter().enumerate() {
            let fingerprint = content_fingerprint(&item.payload);
            if known.get(&item.remote_id) == Some(&fingerprint) {
                skipped += 1;
            } else {
                records.push(NormalizedRecord {
                    remote_id: item.remote_id.clone(),
                    fingerprint,
                    content: item.payload.clone(),
                    asset: None,
                    synced_at: Utc::now(),
                });
            }
            if (index + 1) % 50 == 0 {
                state.message = format!("processed {} of {} items", index + 1, items.len());
                self.emit(
                    task_id,
                    state,
                    SyncStep::ProcessContent,
                    (index + 1) as f64 / items.len() as f64,
                );
            }
        }

        state.message = format!("{} items to persist, {skipped} unchanged", records.len());
        self.emit(task_id, state, SyncStep::ProcessContent, 1.0);
        Ok((records, skipped))
    }

    /// Fetch assets concurrently under the shared limiter. Failed items are
    /// removed from the persist set and returned as failed refs.
    async fn download_assets(
        &self,
        task_id: &str,
        token: &ControlToken,
        items: &[RemoteRecord],
        records: &mut Vec<NormalizedRecord>,
        state: &mut TaskState,
    ) -> Vec<String> {
        let wanted: HashMap<&str, &str> = items
            .iter()
            .filter_map(|item| {
                item.asset_ref
                    .as_deref()
                    .map(|asset| (item.remote_id.as_str(), asset))
            })
            .collect();
        if wanted.is_empty() {
            self.emit(task_id, state, SyncStep::DownloadAssets, 1.0);
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(wanted.len());
        for record in records.iter() {
            let Some(asset_ref) = wanted.get(record.remote_id.as_str()) else {
                continue;
            };
            if token.checkpoint().await {
                break;
            }
            let source = Arc::clone(&self.source);
            let limiter = Arc::clone(&self.limiter);
            let rate_cap = self.rate_cap.clone();
            let backoff = self.tunables.retry.backoff();
            let remote_id = record.remote_id.clone();
            let asset_ref = asset_ref.to_string();

            handles.push(tokio::spawn(async move {
                let operation = || async {
                    rate_cap.wait().await;
                    let permit = limiter.acquire().await;
                    let start = Instant::now();
                    match source.fetch_asset(&asset_ref).await {
                        Ok(bytes) => {
                            permit.release(Outcome::success(start.elapsed()));
                            Ok(bytes)
                        }
                        Err(e) => {
                            let elapsed = start.elapsed();
                            permit.release(if e.is_rate_limited() {
                                Outcome::rate_limited(elapsed)
                            } else {
                                Outcome::failure(elapsed)
                            });
                            Err(e)
                        }
                    }
                };
                let result = operation.retry(backoff).when(SyncError::is_retryable).await;
                (remote_id, result)
            }));
        }

        let total_assets = handles.len();
        let mut failed = Vec::new();
        let mut assets: HashMap<String, Vec<u8>> = HashMap::new();
        for (done, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok((remote_id, Ok(bytes))) => {
                    assets.insert(remote_id, bytes);
                }
                Ok((remote_id, Err(e))) => {
                    state.record_error(&remote_id, &short_error_message(&e));
                    state.counts.failed += 1;
                    failed.push(remote_id);
                }
                Err(e) => {
                    warn!(task_id, error = %e, "asset download task panicked");
                }
            }
            state.message = format!("downloaded {} of {total_assets} assets", done + 1);
            self.emit(
                task_id,
                state,
                SyncStep::DownloadAssets,
                (done + 1) as f64 / total_assets as f64,
            );
        }

        records.retain(|record| !failed.contains(&record.remote_id));
        for record in records.iter_mut() {
            if let Some(bytes) = assets.remove(&record.remote_id) {
                record.asset = Some(bytes);
            }
        }
        failed
    }

    /// Stream records to the persist task, emitting progress on a cadence.
    ///
    /// `skipped` and `prior_failed` are results already decided by earlier
    /// steps; snapshots emitted here fold them in with the persist task's
    /// live counters so observers see running totals, not zeros.
    #[allow(clippy::too_many_arguments)]
    async fn save_records(
        &self,
        task_id: &str,
        token: &ControlToken,
        cancel_flag: &Arc<AtomicBool>,
        records: Vec<NormalizedRecord>,
        skipped: usize,
        prior_failed: usize,
        state: &mut TaskState,
    ) -> Result<crate::persist::PersistResult> {
        let to_save = records.len();
        let planner = BatchPlanner::new(self.tunables.batch.clone(), ProcessMemoryProbe);
        let (tx, rx) = create_record_channel();
        let (handle, counters) = spawn_persist_task(
            Arc::clone(&self.store),
            rx,
            planner,
            Some(Arc::clone(cancel_flag)),
        );

        let mut sent = 0usize;
        for record in records {
            if token.checkpoint().await {
                break;
            }
            if tx.send(record).await.is_err() {
                // Persist task stopped early; its result explains why.
                break;
            }
            sent += 1;
            if sent % 25 == 0 {
                let saved = counters.saved.load(Ordering::Relaxed);
                let failed = counters.failed.load(Ordering::Relaxed);
                state.counts.succeeded = skipped + saved;
                state.counts.failed = prior_failed + failed;
                state.counts.processed = state.counts.succeeded + state.counts.failed;
                state.message = format!("saved {} of {to_save} records", saved + failed);
                self.emit(
                    task_id,
                    state,
                    SyncStep::SaveRecords,
                    (saved + failed) as f64 / to_save.max(1) as f64,
                );
            }
        }
        drop(tx);

        let result = await_persist_task(handle).await;
        for (item_ref, message) in &result.errors {
            state.record_error(item_ref, message);
        }
        state.counts.succeeded = skipped + result.saved_count;
        state.counts.failed = prior_failed + result.errors.len();
        state.counts.processed = state.counts.succeeded + state.counts.failed;
        self.emit(task_id, state, SyncStep::SaveRecords, 1.0);
        Ok(result)
    }

    fn emit(&self, task_id: &str, state: &TaskState, step: SyncStep, fraction: f64) {
        self.channel
            .emit(task_id, TaskStatus::Running, state.snapshot(step, fraction));
    }

    async fn persist_task_row(&self, task: &Task, snapshot: Option<&ProgressSnapshot>) {
        if let Some(db) = &self.db {
            if let Err(e) = tasks::upsert(db, task, snapshot).await {
                warn!(task_id = %task.task_id, error = %e, "task row write failed");
            }
        }
    }

    fn acquire_import_lock(&self, target: &str, task_id: &str) -> Result<()> {
        let mut locks = self.lock_imports();
        if let Some(existing) = locks.get(target) {
            let age = existing.acquired_at.elapsed();
            if age < self.tunables.import_lock_expiry() {
                return Err(SyncError::config(format!(
                    "target {target} is locked by task {}",
                    existing.task_id
                )));
            }
            // Expired locks are released, never silently extended.
            warn!(
                target,
                holder = %existing.task_id,
                age_secs = age.as_secs(),
                "import lock expired, releasing"
            );
        }
        locks.insert(
            target.to_string(),
            ImportLock {
                task_id: task_id.to_string(),
                acquired_at: Instant::now(),
            },
        );
        Ok(())
    }

    fn release_import_lock(&self, target: &str, task_id: &str) {
        let mut locks = self.lock_imports();
        // Only the current holder may release; an expired-and-replaced
        // lock belongs to the newer task.
        if locks.get(target).is_some_and(|l| l.task_id == task_id) {
            locks.remove(target);
        }
    }

    /// Drop terminal records and channel state past the retention period.
    fn purge_expired_terminal(&self) {
        let retention = Duration::from_secs(self.tunables.task_retention_secs);
        let expired: Vec<String> = {
            let terminal = self.lock_terminal();
            terminal
                .iter()
                .filter(|(_, record)| record.finished_at.elapsed() >= retention)
                .map(|(id, _)| id.clone())
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        debug!(count = expired.len(), "purging expired terminal tasks");
        let mut terminal = self.lock_terminal();
        for task_id in &expired {
            terminal.remove(task_id);
            self.channel.remove(task_id);
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<String, RunningTask>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_terminal(&self) -> MutexGuard<'_, HashMap<String, TerminalRecord>> {
        match self.terminal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_imports(&self) -> MutexGuard<'_, HashMap<String, ImportLock>> {
        match self.import_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Mutable per-run progress state.
struct TaskState {
    counts: Counts,
    errors: Vec<ErrorEntry>,
    error_cap: usize,
    message: String,
    started: Instant,
}

impl TaskState {
    fn new(error_cap: usize) -> Self {
        Self {
            counts: Counts::default(),
            errors: Vec::new(),
            error_cap,
            message: String::new(),
            started: Instant::now(),
        }
    }

    fn record_error(&mut self, item_ref: &str, message: &str) {
        self.errors.push(ErrorEntry {
            timestamp: Utc::now(),
            message: message.to_string(),
            item_ref: item_ref.to_string(),
        });
        if self.errors.len() > self.error_cap {
            let excess = self.errors.len() - self.error_cap;
            self.errors.drain(..excess);
        }
    }

    fn snapshot(&self, step: SyncStep, fraction: f64) -> ProgressSnapshot {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        ProgressSnapshot {
            percentage: step.percentage(fraction),
            current_step: step,
            counts: self.counts,
            timing: Timing {
                elapsed_ms,
                estimated_remaining_ms: ProgressSnapshot::estimate_remaining(
                    &self.counts,
                    elapsed_ms,
                ),
            },
            errors: self.errors.clone(),
            message: self.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoint_passes_when_running() {
        let token = ControlToken::new();
        assert!(!token.checkpoint().await);
    }

    #[tokio::test]
    async fn checkpoint_reports_cancel_even_while_paused() {
        let token = ControlToken::new();
        token.pause();

        let waiter = {
            let token = Arc::clone(&token);
            tokio::spawn(async move { token.checkpoint().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        token.cancel();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn checkpoint_blocks_until_resume() {
        let token = ControlToken::new();
        token.pause();

        let waiter = {
            let token = Arc::clone(&token);
            tokio::spawn(async move { token.checkpoint().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        token.resume();
        assert!(!waiter.await.unwrap());
    }

    #[test]
    fn task_state_caps_error_list() {
        let mut state = TaskState::new(3);
        for i in 0..10 {
            state.record_error(&format!("item-{i}"), "boom");
        }
        assert_eq!(state.errors.len(), 3);
        assert_eq!(state.errors[0].item_ref, "item-7");
    }
}
