//! End-to-end pipeline tests against scripted source and store backends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mirrorsync::config::{LimiterConfig, RetryConfig, SyncTunables};
use mirrorsync::fingerprint::content_fingerprint;
use mirrorsync::progress::{ProgressChannel, ProgressEvent};
use mirrorsync::{
    LocalStore, NormalizedRecord, RecordPage, RemoteRecord, RemoteSource, ResponseCache, Result,
    SyncError, SyncOrchestrator, SyncStep, TaskKind, TaskStatus,
};

/// Source serving `total` items in fixed pages, with optional scripted
/// rate-limit rejections and per-page latency.
struct PagedSource {
    total: usize,
    per_page: usize,
    rate_limit_budget: AtomicUsize,
    page_delay: Duration,
    asset_refs: HashSet<String>,
    failing_assets: HashSet<String>,
}

impl PagedSource {
    fn new(total: usize, per_page: usize) -> Self {
        Self {
            total,
            per_page,
            rate_limit_budget: AtomicUsize::new(0),
            page_delay: Duration::ZERO,
            asset_refs: HashSet::new(),
            failing_assets: HashSet::new(),
        }
    }

    fn rate_limiting_first(mut self, rejections: usize) -> Self {
        self.rate_limit_budget = AtomicUsize::new(rejections);
        self
    }

    fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    fn item(&self, index: usize) -> RemoteRecord {
        let remote_id = format!("item-{index:03}");
        let asset_ref = self
            .asset_refs
            .contains(&remote_id)
            .then(|| format!("blob/{remote_id}"));
        RemoteRecord {
            remote_id,
            payload: serde_json::json!({"index": index, "title": format!("record {index}")}),
            asset_ref,
            updated_at: None,
        }
    }
}

#[async_trait]
impl RemoteSource for PagedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_page(&self, cursor: Option<&str>, _page_size: usize) -> Result<RecordPage> {
        if self
            .rate_limit_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::rate_limited());
        }
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }

        let start = match cursor {
            None => 0,
            Some(c) => c.parse::<usize>().map_err(|_| SyncError::fatal("bad cursor"))?,
        };
        let end = (start + self.per_page).min(self.total);
        let items = (start..end).map(|i| self.item(i)).collect();
        Ok(RecordPage {
            items,
            next_cursor: (end < self.total).then(|| end.to_string()),
            total_hint: Some(self.total),
        })
    }

    async fn fetch_asset(&self, asset_ref: &str) -> Result<Vec<u8>> {
        if self.failing_assets.contains(asset_ref) {
            return Err(SyncError::fatal("asset gone"));
        }
        Ok(asset_ref.as_bytes().to_vec())
    }
}

/// Store counting upserts per item, with scripted failures.
#[derive(Default)]
struct CountingStore {
    upserts: Mutex<HashMap<String, usize>>,
    /// Items that always fail to persist.
    fail_always: HashSet<String>,
    /// Items that fail once, then succeed.
    fail_once: Mutex<HashSet<String>>,
    known: HashMap<String, String>,
    index_refreshes: AtomicUsize,
}

impl CountingStore {
    fn saved_count(&self, remote_id: &str) -> usize {
        self.upserts
            .lock()
            .unwrap()
            .get(remote_id)
            .copied()
            .unwrap_or(0)
    }

    fn total_saved(&self) -> usize {
        self.upserts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl LocalStore for CountingStore {
    async fn upsert(&self, record: &NormalizedRecord) -> Result<()> {
        if self.fail_always.contains(&record.remote_id) {
            return Err(SyncError::persistence(&record.remote_id, "constraint violation"));
        }
        if self.fail_once.lock().unwrap().remove(&record.remote_id) {
            return Err(SyncError::persistence(&record.remote_id, "deadlock, retry"));
        }
        *self
            .upserts
            .lock()
            .unwrap()
            .entry(record.remote_id.clone())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn delete(&self, _remote_id: &str) -> Result<()> {
        Ok(())
    }

    async fn known_fingerprints(&self) -> Result<HashMap<String, String>> {
        Ok(self.known.clone())
    }

    async fn refresh_index(&self) -> Result<()> {
        self.index_refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn tunables() -> SyncTunables {
    SyncTunables {
        retry: RetryConfig {
            max_fetch_attempts: 8,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        limiter: LimiterConfig {
            initial_limit: 4,
            max_limit: 8,
            adjust_window: 4,
            requests_per_second: 10_000,
            ..LimiterConfig::default()
        },
        page_size: 25,
        ..SyncTunables::new()
    }
}

fn orchestrator(
    source: Arc<PagedSource>,
    store: Arc<CountingStore>,
    tunables: SyncTunables,
) -> Arc<SyncOrchestrator> {
    let cache = Arc::new(ResponseCache::new(tunables.cache.clone(), None));
    let channel = Arc::new(ProgressChannel::new(tunables.progress.clone(), None));
    SyncOrchestrator::new(source, store, cache, channel, tunables, None)
        .expect("tunables must validate")
}

async fn wait_terminal(
    orch: &Arc<SyncOrchestrator>,
    task_id: &str,
) -> (TaskStatus, mirrorsync::ProgressSnapshot) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some((status, snapshot)) = orch.status(task_id).await.unwrap() {
            if status.is_terminal() {
                return (status, snapshot);
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} did not reach a terminal state"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn full_sync_completes_with_partial_failures() {
    let failing: HashSet<String> = (0..10).map(|i| format!("item-{:03}", i * 10)).collect();
    let source = Arc::new(PagedSource::new(100, 25));
    let store = Arc::new(CountingStore {
        fail_always: failing.clone(),
        ..CountingStore::default()
    });
    let orch = orchestrator(source, Arc::clone(&store), tunables());

    let task_id = orch.start(TaskKind::Full, "catalog").unwrap();
    let (status, snapshot) = wait_terminal(&orch, &task_id).await;

    // Partial failure is still a completed run.
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(snapshot.counts.total, 100);
    assert_eq!(snapshot.counts.succeeded, 90);
    assert_eq!(snapshot.counts.failed, 10);
    assert_eq!(snapshot.counts.processed, 100);
    assert_eq!(snapshot.errors.len(), 10);
    for entry in &snapshot.errors {
        assert!(failing.contains(&entry.item_ref));
    }
    assert_eq!(store.total_saved(), 90);
    assert_eq!(store.index_refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn progress_percentage_is_monotone() {
    let source = Arc::new(PagedSource::new(60, 10));
    let store = Arc::new(CountingStore::default());
    let orch = orchestrator(source, store, tunables());

    let task_id = orch.start(TaskKind::Full, "catalog").unwrap();
    let subscription = orch.channel().subscribe(&task_id);
    let mut rx = subscription.receiver.expect("task must be registered");

    let mut last = match subscription.connected {
        ProgressEvent::Connected { progress, .. } => progress.percentage,
        other => panic!("unexpected first event {other:?}"),
    };
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event stream stalled");
        let event = match event {
            Ok(event) => event,
            // A lagging reader skips ahead; monotonicity must still hold.
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        match &event {
            ProgressEvent::Progress { progress, .. }
            | ProgressEvent::Completed { progress, .. }
            | ProgressEvent::Failed { progress, .. } => {
                assert!(
                    progress.percentage >= last,
                    "percentage went backwards: {last} -> {}",
                    progress.percentage
                );
                last = progress.percentage;
            }
            _ => {}
        }
        if event.is_terminal() {
            assert!((last - 100.0).abs() < f64::EPSILON);
            break;
        }
    }
}

#[tokio::test]
async fn pause_and_resume_loses_nothing() {
    let source = Arc::new(PagedSource::new(50, 10).with_page_delay(Duration::from_millis(20)));
    let store = Arc::new(CountingStore::default());
    let orch = orchestrator(source, Arc::clone(&store), tunables());

    let task_id = orch.start(TaskKind::Full, "catalog").unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    orch.pause(&task_id).unwrap();

    // Give the loop time to hit its checkpoint, then confirm it holds.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let frozen = store.total_saved();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.total_saved(), frozen, "store advanced while paused");

    orch.resume(&task_id).unwrap();
    let (status, snapshot) = wait_terminal(&orch, &task_id).await;

    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(snapshot.counts.succeeded, 50);
    assert_eq!(snapshot.counts.failed, 0);
    // Every item saved exactly once: no duplicates, no skips.
    for i in 0..50 {
        assert_eq!(store.saved_count(&format!("item-{i:03}")), 1, "item {i}");
    }
}

#[tokio::test]
async fn cancel_reaches_cancelled_terminal_state() {
    let source = Arc::new(PagedSource::new(500, 10).with_page_delay(Duration::from_millis(20)));
    let store = Arc::new(CountingStore::default());
    let orch = orchestrator(source, Arc::clone(&store), tunables());

    let task_id = orch.start(TaskKind::Full, "catalog").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    orch.cancel(&task_id).unwrap();

    let (status, _) = wait_terminal(&orch, &task_id).await;
    assert_eq!(status, TaskStatus::Cancelled);

    // Terminal means terminal: control calls now fail.
    assert!(orch.pause(&task_id).is_err());
    assert!(orch.cancel(&task_id).is_err());
}

#[tokio::test]
async fn retry_failed_reprocesses_exactly_the_failed_set() {
    let flaky: HashSet<String> = ["item-003", "item-017", "item-029"]
        .into_iter()
        .map(String::from)
        .collect();
    let source = Arc::new(PagedSource::new(30, 10));
    let store = Arc::new(CountingStore {
        fail_once: Mutex::new(flaky.clone()),
        ..CountingStore::default()
    });
    let orch = orchestrator(source, Arc::clone(&store), tunables());

    let task_id = orch.start(TaskKind::Full, "catalog").unwrap();
    let (status, snapshot) = wait_terminal(&orch, &task_id).await;
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(snapshot.counts.failed, 3);

    let retry_id = orch.retry_failed(&task_id).unwrap();
    assert_ne!(retry_id, task_id);
    let (status, snapshot) = wait_terminal(&orch, &retry_id).await;
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(snapshot.counts.total, 3);
    assert_eq!(snapshot.counts.succeeded, 3);
    assert_eq!(snapshot.counts.failed, 0);

    // Previously succeeded items were not touched again; the failed set
    // was saved exactly once by the retry.
    for i in 0..30 {
        assert_eq!(store.saved_count(&format!("item-{i:03}")), 1, "item {i}");
    }

    // Nothing failed the second time, so a further retry has no work.
    assert!(orch.retry_failed(&retry_id).is_err());
}

#[tokio::test]
async fn rate_limited_source_trips_the_breaker_and_recovers() {
    let source = Arc::new(PagedSource::new(100, 20).rate_limiting_first(5));
    let store = Arc::new(CountingStore::default());
    let orch = orchestrator(Arc::clone(&source), Arc::clone(&store), tunables());

    let task_id = orch.start(TaskKind::Full, "catalog").unwrap();
    let (status, snapshot) = wait_terminal(&orch, &task_id).await;

    // Retry with backoff absorbs the rejections and the task completes.
    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(snapshot.counts.succeeded, 100);

    let stats = orch.limiter().stats();
    assert_eq!(stats.failed_requests, 5);
    assert!(!stats.breaker_open, "breaker must have recovered");
    assert!(stats.current_limit >= 1);
}

#[tokio::test]
async fn incremental_run_skips_unchanged_items() {
    let source = Arc::new(PagedSource::new(40, 10));
    // The first 20 items are already stored with identical content.
    let mut known = HashMap::new();
    for i in 0..20 {
        let item = source.item(i);
        known.insert(item.remote_id.clone(), content_fingerprint(&item.payload));
    }
    let store = Arc::new(CountingStore {
        known,
        ..CountingStore::default()
    });
    let orch = orchestrator(Arc::clone(&source), Arc::clone(&store), tunables());

    let task_id = orch.start(TaskKind::Incremental, "catalog").unwrap();
    let (status, snapshot) = wait_terminal(&orch, &task_id).await;

    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(snapshot.counts.total, 40);
    // Skipped items count as succeeded without a store write.
    assert_eq!(snapshot.counts.succeeded, 40);
    assert_eq!(store.total_saved(), 20);
    for i in 0..20 {
        assert_eq!(store.saved_count(&format!("item-{i:03}")), 0);
    }
}

#[tokio::test]
async fn import_lock_rejects_concurrent_tasks_for_one_target() {
    let source = Arc::new(PagedSource::new(100, 10).with_page_delay(Duration::from_millis(20)));
    let store = Arc::new(CountingStore::default());
    let orch = orchestrator(source, store, tunables());

    let first = orch.start(TaskKind::Full, "catalog").unwrap();
    let err = orch
        .start(TaskKind::Full, "catalog")
        .expect_err("second task for the same target must be rejected");
    assert!(err.to_string().contains("locked"));

    // A different target is unaffected.
    let other = orch.start(TaskKind::Full, "archive").unwrap();
    assert_ne!(other, first);

    let (status, _) = wait_terminal(&orch, &first).await;
    assert_eq!(status, TaskStatus::Completed);

    // The lock releases with the terminal state.
    orch.start(TaskKind::Full, "catalog").unwrap();
}

#[tokio::test]
async fn failed_asset_download_marks_only_that_item() {
    let mut source = PagedSource::new(10, 10);
    source.asset_refs = (0..10).map(|i| format!("item-{i:03}")).collect();
    source.failing_assets = HashSet::from(["blob/item-004".to_string()]);
    let source = Arc::new(source);
    let store = Arc::new(CountingStore::default());
    let orch = orchestrator(source, Arc::clone(&store), tunables());

    let task_id = orch.start(TaskKind::Full, "catalog").unwrap();
    let (status, snapshot) = wait_terminal(&orch, &task_id).await;

    assert_eq!(status, TaskStatus::Completed);
    assert_eq!(snapshot.counts.succeeded, 9);
    assert_eq!(snapshot.counts.failed, 1);
    assert_eq!(snapshot.errors.len(), 1);
    assert_eq!(snapshot.errors[0].item_ref, "item-004");
    assert_eq!(store.saved_count("item-004"), 0);
}

#[tokio::test]
async fn second_run_is_served_from_the_response_cache() {
    let source = Arc::new(PagedSource::new(20, 10));
    let store = Arc::new(CountingStore::default());
    let orch = orchestrator(Arc::clone(&source), store, tunables());

    let first = orch.start(TaskKind::Full, "catalog").unwrap();
    wait_terminal(&orch, &first).await;
    let after_first = orch.limiter().stats().total_requests;

    let second = orch.start(TaskKind::Full, "catalog").unwrap();
    wait_terminal(&orch, &second).await;

    // Page responses came out of the cache; no new remote requests.
    assert_eq!(orch.limiter().stats().total_requests, after_first);
    assert!(orch.cache().stats().memory_hits >= 2);
}

#[tokio::test]
async fn save_phase_snapshots_carry_running_counts() {
    let source = Arc::new(PagedSource::new(100, 10));
    let store = Arc::new(CountingStore::default());
    let orch = orchestrator(source, store, tunables());

    let task_id = orch.start(TaskKind::Full, "catalog").unwrap();
    let mut rx = orch
        .channel()
        .subscribe(&task_id)
        .receiver
        .expect("running task must be subscribable");

    let mut save_snapshots = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("event stream stalled");
        let event = match event {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };
        if let ProgressEvent::Progress { progress, .. } = &event
            && progress.current_step == SyncStep::SaveRecords
        {
            save_snapshots.push(progress.clone());
        }
        if event.is_terminal() {
            break;
        }
    }

    // The save phase reports totals as it goes, not only at the end.
    let last = save_snapshots
        .last()
        .expect("save phase must emit progress");
    assert_eq!(last.counts.succeeded, 100);
    assert_eq!(
        last.counts.processed,
        last.counts.succeeded + last.counts.failed
    );
}
