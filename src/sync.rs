//! Background sync engine for the offline action queue.
//!
//! Drains pending actions against the backend one at a time, in queue
//! order, whenever the terminal is online. A drain is triggered by:
//! - a disconnected -> connected transition
//! - a fixed interval tick while online with a non-empty queue
//! - enqueueing an action while online
//! - a manual full sync or retry from the UI
//!
//! Only one drain runs at a time. Every per-action error is caught and
//! folded into the returned [`SyncSummary`]; a drain never fails as a whole.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{ApiError, FailureClass, HttpExecutor};
use crate::catalog::{self, RefreshSummary};
use crate::config::DEFAULT_MAX_RETRIES;
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::queue::{
    ActionKind, ActionMethod, ActionPriority, ActionQueue, FailureOutcome, NewAction,
    PendingAction,
};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainStatus {
    Completed,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionFailure {
    pub action_id: String,
    pub kind: String,
    pub message: String,
    /// True when the action now sits in the failed list.
    pub parked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub status: DrainStatus,
    pub processed: usize,
    pub failed: usize,
    /// Actions left untouched because the backend became unreachable.
    pub deferred: usize,
    pub errors: Vec<ActionFailure>,
}

impl SyncSummary {
    fn completed() -> Self {
        Self {
            status: DrainStatus::Completed,
            processed: 0,
            failed: 0,
            deferred: 0,
            errors: Vec::new(),
        }
    }

    fn skipped(reason: SkipReason) -> Self {
        Self {
            status: DrainStatus::Skipped(reason),
            ..Self::completed()
        }
    }

    pub fn was_skipped(&self) -> bool {
        matches!(self.status, DrainStatus::Skipped(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncSummary {
    /// `None` when the terminal was offline and nothing was fetched.
    pub reference: Option<RefreshSummary>,
    pub drain: SyncSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub pending_count: usize,
    pub failed_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub is_online: bool,
    pub can_sync: bool,
    pub sync_in_progress: bool,
}

/// An enqueued action plus the drain it kicked off, if the terminal was online.
#[derive(Debug)]
pub struct QueuedAction {
    pub action: PendingAction,
    pub drain: Option<JoinHandle<SyncSummary>>,
}

#[derive(Debug)]
pub struct RetryOutcome {
    /// False when the action has no retry budget left and stays failed.
    pub requeued: bool,
    pub drain: Option<JoinHandle<SyncSummary>>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Holds the syncing flag for the lifetime of one drain and releases it on
/// every exit path, including panics inside an action.
struct SyncGuard<'a>(&'a AtomicBool);

impl<'a> SyncGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard(flag))
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    queue: Mutex<ActionQueue>,
    executor: Arc<dyn HttpExecutor>,
    connectivity: ConnectivityMonitor,
    cache: Arc<DbState>,
    max_retries: u32,
    is_syncing: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    /// `queue` must already be loaded from durable storage.
    pub fn new(
        queue: ActionQueue,
        executor: Arc<dyn HttpExecutor>,
        connectivity: ConnectivityMonitor,
        cache: Arc<DbState>,
    ) -> Self {
        Self {
            queue: Mutex::new(queue),
            executor,
            connectivity,
            cache,
            max_retries: DEFAULT_MAX_RETRIES,
            is_syncing: AtomicBool::new(false),
            last_sync: Mutex::new(None),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    fn lock_queue(&self) -> Result<MutexGuard<'_, ActionQueue>, String> {
        self.queue
            .lock()
            .map_err(|e| format!("action queue lock poisoned: {e}"))
    }

    // -- Queue API ----------------------------------------------------------

    /// Enqueue a typed action and, when online, start a drain right away.
    pub fn enqueue(self: &Arc<Self>, action: NewAction) -> Result<QueuedAction, String> {
        let action = self.lock_queue()?.enqueue(action)?;
        Ok(QueuedAction {
            action,
            drain: self.spawn_drain(),
        })
    }

    /// Untyped entry point for UI code: the kind name and payload are
    /// validated here, so an unknown kind never reaches the queue.
    pub fn queue_action(
        self: &Arc<Self>,
        kind: &str,
        endpoint: &str,
        method: &str,
        payload: Value,
        priority: Option<&str>,
    ) -> Result<QueuedAction, String> {
        let kind = ActionKind::from_parts(kind, payload)?;
        let method = ActionMethod::parse(method)?;
        let priority = priority
            .map(ActionPriority::parse)
            .transpose()?
            .unwrap_or_default();

        let mut action = NewAction::new(kind, endpoint, method).with_priority(priority);
        action.max_retries = self.max_retries;
        self.enqueue(action)
    }

    pub fn pending_actions(&self) -> Vec<PendingAction> {
        self.lock_queue()
            .map(|q| q.pending().to_vec())
            .unwrap_or_default()
    }

    pub fn failed_actions(&self) -> Vec<PendingAction> {
        self.lock_queue()
            .map(|q| q.failed().to_vec())
            .unwrap_or_default()
    }

    pub fn get_sync_stats(&self) -> SyncStats {
        let (pending_count, failed_count) = self
            .lock_queue()
            .map(|q| (q.pending().len(), q.failed().len()))
            .unwrap_or((0, 0));
        let is_online = self.connectivity.is_connected();
        let sync_in_progress = self.is_syncing.load(Ordering::Acquire);
        SyncStats {
            pending_count,
            failed_count,
            last_sync: self.last_sync.lock().ok().and_then(|g| *g),
            is_online,
            can_sync: is_online && !sync_in_progress,
            sync_in_progress,
        }
    }

    /// Move a failed action back to pending and drain if online.
    pub fn retry_failed(self: &Arc<Self>, id: &str) -> Result<RetryOutcome, String> {
        let requeued = self.lock_queue()?.retry_failed(id)?;
        if !requeued {
            info!(action_id = %id, "Retry budget exhausted; action stays failed");
        }
        Ok(RetryOutcome {
            requeued,
            drain: if requeued { self.spawn_drain() } else { None },
        })
    }

    pub fn clear_failed(&self) -> Result<usize, String> {
        self.lock_queue()?.clear_failed()
    }

    // -- Draining -----------------------------------------------------------

    fn spawn_drain(self: &Arc<Self>) -> Option<JoinHandle<SyncSummary>> {
        if !self.connectivity.is_connected() {
            return None;
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let engine = Arc::clone(self);
        Some(runtime.spawn(async move { engine.drain().await }))
    }

    /// Reorder by priority and return the first pending action not yet tried
    /// in this pass. Actions enqueued mid-drain are picked up as well.
    fn next_action(&self, attempted: &HashSet<String>) -> Result<Option<PendingAction>, String> {
        let mut queue = self.lock_queue()?;
        queue.reorder_by_priority()?;
        Ok(queue
            .pending()
            .iter()
            .find(|a| !attempted.contains(&a.id))
            .cloned())
    }

    async fn dispatch(&self, action: &PendingAction) -> Result<Value, ApiError> {
        let body = action.kind.body().map_err(ApiError::InvalidRequest)?;
        self.executor
            .execute(
                action.http_method.as_http(),
                &action.endpoint,
                Some(&body),
                Some(&action.id),
            )
            .await
    }

    /// One pass over the pending list.
    pub async fn drain(&self) -> SyncSummary {
        if !self.connectivity.is_connected() {
            debug!("Drain skipped: offline");
            return SyncSummary::skipped(SkipReason::Offline);
        }
        let Some(_guard) = SyncGuard::acquire(&self.is_syncing) else {
            debug!("Drain skipped: another pass is running");
            return SyncSummary::skipped(SkipReason::AlreadyRunning);
        };

        let mut summary = SyncSummary::completed();
        let mut attempted: HashSet<String> = HashSet::new();
        info!("Drain started");

        loop {
            let action = match self.next_action(&attempted) {
                Ok(Some(action)) => action,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Drain aborted: queue unavailable");
                    break;
                }
            };
            attempted.insert(action.id.clone());

            match self.dispatch(&action).await {
                Ok(_) => match self.lock_queue().and_then(|mut q| q.remove(&action.id)) {
                    Ok(_) => {
                        summary.processed += 1;
                        debug!(action_id = %action.id, kind = action.kind.name(), "Action synced");
                    }
                    Err(e) => {
                        // Applied remotely but still queued locally; the
                        // idempotency key makes the next replay harmless.
                        error!(
                            action_id = %action.id,
                            error = %e,
                            "Failed to dequeue synced action"
                        );
                    }
                },
                Err(err) if err.class() == FailureClass::Connectivity => {
                    warn!(
                        action_id = %action.id,
                        error = %err,
                        "Backend unreachable; deferring remaining actions"
                    );
                    attempted.remove(&action.id);
                    summary.deferred = self
                        .lock_queue()
                        .map(|q| {
                            q.pending()
                                .iter()
                                .filter(|a| !attempted.contains(&a.id))
                                .count()
                        })
                        .unwrap_or(0);
                    break;
                }
                Err(err) => {
                    let retryable = err.class() == FailureClass::Retryable;
                    let message = err.to_string();
                    let outcome = self
                        .lock_queue()
                        .and_then(|mut q| q.record_failure(&action.id, &message, retryable));
                    let parked = matches!(outcome, Ok(FailureOutcome::Parked { .. }));
                    if let Err(e) = &outcome {
                        error!(
                            action_id = %action.id,
                            error = %e,
                            "Failed to record action failure"
                        );
                    }
                    warn!(
                        action_id = %action.id,
                        kind = action.kind.name(),
                        status = ?err.status(),
                        retryable,
                        parked,
                        error = %message,
                        "Action failed"
                    );
                    summary.failed += 1;
                    summary.errors.push(ActionFailure {
                        action_id: action.id.clone(),
                        kind: action.kind.name().to_string(),
                        message,
                        parked,
                    });
                }
            }
        }

        if let Ok(mut last) = self.last_sync.lock() {
            *last = Some(Utc::now());
        }
        info!(
            processed = summary.processed,
            failed = summary.failed,
            deferred = summary.deferred,
            "Drain finished"
        );
        summary
    }

    /// Refresh reference data, then drain. Used for manual pull-to-refresh.
    pub async fn force_full_sync(&self) -> FullSyncSummary {
        if !self.connectivity.is_connected() {
            info!("Full sync skipped: offline");
            return FullSyncSummary {
                reference: None,
                drain: SyncSummary::skipped(SkipReason::Offline),
            };
        }

        let reference = catalog::refresh_reference_data(self.executor.as_ref(), &self.cache).await;
        let drain = self.drain().await;
        FullSyncSummary {
            reference: Some(reference),
            drain,
        }
    }

    // -- Background loop ----------------------------------------------------

    /// Spawn the background loop: drains on every reconnect and on each
    /// interval tick while online with work pending.
    pub fn start(self: &Arc<Self>, interval: Duration) -> SyncLoopHandle {
        let engine = Arc::clone(self);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut rx = engine.connectivity.subscribe();
            let mut was_online = rx.borrow_and_update().is_connected;
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Sync loop started");

            if was_online && !engine.pending_actions().is_empty() {
                engine.drain().await;
            }

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = rx.borrow_and_update().is_connected;
                        if online && !was_online {
                            info!("Network restored; resuming queued sync");
                            engine.drain().await;
                        }
                        was_online = online;
                    }
                    _ = ticker.tick() => {
                        let has_work = engine
                            .lock_queue()
                            .map(|q| !q.pending().is_empty())
                            .unwrap_or(false);
                        if has_work && engine.connectivity.is_connected() {
                            engine.drain().await;
                        }
                    }
                }
            }
            info!("Sync loop stopped");
        });

        SyncLoopHandle { cancel, task }
    }
}

pub struct SyncLoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncLoopHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the loop and wait for an in-flight drain to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sync loop task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiClient;
    use crate::config::ClientConfig;
    use crate::connectivity::NetworkStatus;
    use crate::db;
    use crate::models::{CartItem, CheckoutRequest, NewCustomer, OrderData, Product};
    use crate::queue::{ActionQueueRepository, KvActionRepository};
    use crate::server;
    use crate::storage::MemoryKvStore;
    use async_trait::async_trait;
    use reqwest::Method;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};

    #[derive(Debug, Clone)]
    struct Call {
        endpoint: String,
        body: Option<Value>,
        idempotency_key: Option<String>,
    }

    /// Records every request and answers from a per-endpoint script,
    /// defaulting to `{ success: true }`.
    #[derive(Default)]
    struct ScriptedBackend {
        calls: Mutex<Vec<Call>>,
        script: Mutex<HashMap<String, VecDeque<Result<Value, ApiError>>>>,
    }

    impl ScriptedBackend {
        fn respond(&self, endpoint: &str, result: Result<Value, ApiError>) {
            self.script
                .lock()
                .unwrap()
                .entry(endpoint.to_string())
                .or_default()
                .push_back(result);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpExecutor for ScriptedBackend {
        async fn execute(
            &self,
            _method: Method,
            endpoint: &str,
            body: Option<&Value>,
            idempotency_key: Option<&str>,
        ) -> Result<Value, ApiError> {
            self.calls.lock().unwrap().push(Call {
                endpoint: endpoint.to_string(),
                body: body.cloned(),
                idempotency_key: idempotency_key.map(str::to_string),
            });
            self.script
                .lock()
                .unwrap()
                .get_mut(endpoint)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Ok(json!({ "success": true, "data": [] })))
        }

        async fn check_health(&self) -> bool {
            true
        }
    }

    fn sale(product_id: &str) -> ActionKind {
        ActionKind::CreateSale(CheckoutRequest {
            order_data: OrderData::default(),
            items: vec![CartItem {
                product_id: product_id.to_string(),
                quantity: 1,
                unit_price: 1000,
                serial_numbers: None,
            }],
        })
    }

    fn customer(name: &str) -> ActionKind {
        ActionKind::CreateCustomer(NewCustomer {
            name: name.to_string(),
            ..NewCustomer::default()
        })
    }

    fn engine_with(
        executor: Arc<dyn HttpExecutor>,
        online: bool,
    ) -> (Arc<SyncEngine>, Arc<dyn ActionQueueRepository>) {
        let repo: Arc<dyn ActionQueueRepository> =
            Arc::new(KvActionRepository::new(Arc::new(MemoryKvStore::new())));
        let queue = ActionQueue::load(repo.clone()).unwrap();
        let status = if online {
            NetworkStatus::online("wifi")
        } else {
            NetworkStatus::offline()
        };
        let engine = SyncEngine::new(
            queue,
            executor,
            ConnectivityMonitor::new(status),
            Arc::new(db::open_in_memory().unwrap()),
        );
        (Arc::new(engine), repo)
    }

    fn enqueue(engine: &Arc<SyncEngine>, action: NewAction) -> PendingAction {
        engine.enqueue(action).unwrap().action
    }

    #[tokio::test]
    async fn test_drain_skips_when_offline() {
        let backend = Arc::new(ScriptedBackend::default());
        let (engine, _) = engine_with(backend.clone(), false);

        let queued = engine
            .enqueue(NewAction::new(sale("p-1"), "/pos/orders", ActionMethod::Post))
            .unwrap();
        assert!(queued.drain.is_none());

        let summary = engine.drain().await;
        assert_eq!(summary.status, DrainStatus::Skipped(SkipReason::Offline));
        assert!(backend.calls().is_empty());
        assert_eq!(engine.get_sync_stats().pending_count, 1);
        assert!(engine.get_sync_stats().last_sync.is_none());
    }

    #[tokio::test]
    async fn test_drain_is_not_reentrant() {
        let backend = Arc::new(ScriptedBackend::default());
        let (engine, _) = engine_with(backend, true);

        let guard = SyncGuard::acquire(&engine.is_syncing).unwrap();
        assert!(engine.get_sync_stats().sync_in_progress);
        assert!(!engine.get_sync_stats().can_sync);
        let summary = engine.drain().await;
        assert_eq!(
            summary.status,
            DrainStatus::Skipped(SkipReason::AlreadyRunning)
        );
        drop(guard);
        assert!(!engine.get_sync_stats().sync_in_progress);
    }

    #[tokio::test]
    async fn test_reconnect_dispatches_in_priority_order() {
        let backend = Arc::new(ScriptedBackend::default());
        let (engine, repo) = engine_with(backend.clone(), false);

        let low = enqueue(
            &engine,
            NewAction::new(sale("low"), "/pos/orders", ActionMethod::Post)
                .with_priority(ActionPriority::Low),
        );
        let cust = enqueue(
            &engine,
            NewAction::new(customer("Ana"), "/pos/customers", ActionMethod::Post),
        );
        let high = enqueue(
            &engine,
            NewAction::new(sale("high"), "/pos/orders", ActionMethod::Post)
                .with_priority(ActionPriority::High),
        );
        let dependent = enqueue(
            &engine,
            NewAction::new(sale("p-1"), "/pos/orders", ActionMethod::Post),
        );

        engine.connectivity().publish(NetworkStatus::online("wifi"));
        let summary = engine.drain().await;
        assert_eq!(summary.status, DrainStatus::Completed);
        assert_eq!(summary.processed, 4);

        let keys: Vec<String> = backend
            .calls()
            .into_iter()
            .filter_map(|c| c.idempotency_key)
            .collect();
        assert_eq!(keys, vec![high.id, cust.id, dependent.id, low.id]);

        // nothing reappears in either list, in memory or on disk
        assert!(engine.pending_actions().is_empty());
        assert!(engine.failed_actions().is_empty());
        let stored = repo.load().unwrap();
        assert!(stored.pending.is_empty() && stored.failed.is_empty());
        assert!(engine.get_sync_stats().last_sync.is_some());
    }

    #[tokio::test]
    async fn test_rejected_action_is_parked_and_batch_continues() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(
            "/pos/customers",
            Err(ApiError::Rejected {
                status: 400,
                message: "Customer name is required".into(),
            }),
        );
        let (engine, _) = engine_with(backend.clone(), false);

        let bad = enqueue(
            &engine,
            NewAction::new(customer(""), "/pos/customers", ActionMethod::Post),
        );
        let good = enqueue(
            &engine,
            NewAction::new(sale("p-1"), "/pos/orders", ActionMethod::Post),
        );
        engine.connectivity().publish(NetworkStatus::online("wifi"));

        let summary = engine.drain().await;
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors[0].action_id, bad.id);
        assert!(summary.errors[0].parked);
        assert_eq!(backend.calls().len(), 2);

        let failed = engine.failed_actions();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 1);
        assert!(failed[0].last_error.as_deref().unwrap().contains("HTTP 400"));
        assert!(engine.pending_actions().iter().all(|a| a.id != good.id));
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_retry_budget() {
        let backend = Arc::new(ScriptedBackend::default());
        for _ in 0..3 {
            backend.respond(
                "/pos/orders",
                Err(ApiError::Server {
                    status: 503,
                    message: "Backend server error".into(),
                }),
            );
        }
        let (engine, repo) = engine_with(backend.clone(), true);
        let action = engine
            .lock_queue()
            .unwrap()
            .enqueue(NewAction::new(sale("p-1"), "/pos/orders", ActionMethod::Post))
            .unwrap();

        for attempt in 1..=2 {
            let summary = engine.drain().await;
            assert_eq!(summary.failed, 1);
            assert!(!summary.errors[0].parked);
            assert_eq!(engine.pending_actions()[0].retry_count, attempt);
        }
        let summary = engine.drain().await;
        assert!(summary.errors[0].parked);

        assert!(engine.pending_actions().is_empty());
        let failed = engine.failed_actions();
        assert_eq!(failed[0].id, action.id);
        assert_eq!(failed[0].retry_count, failed[0].max_retries);
        assert_eq!(repo.load().unwrap().failed[0].retry_count, 3);

        let retry = engine.retry_failed(&action.id).unwrap();
        assert!(!retry.requeued);
        assert!(retry.drain.is_none());
    }

    #[tokio::test]
    async fn test_connectivity_error_defers_without_counting() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(
            "/pos/orders",
            Err(ApiError::Connectivity("http://backend".into())),
        );
        let (engine, _) = engine_with(backend.clone(), false);
        enqueue(
            &engine,
            NewAction::new(sale("a"), "/pos/orders", ActionMethod::Post),
        );
        enqueue(
            &engine,
            NewAction::new(customer("Ana"), "/pos/customers", ActionMethod::Post),
        );
        engine.connectivity().publish(NetworkStatus::online("wifi"));

        let summary = engine.drain().await;
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.deferred, 2);
        assert_eq!(backend.calls().len(), 1);
        assert!(engine.pending_actions().iter().all(|a| a.retry_count == 0));

        let summary = engine.drain().await;
        assert_eq!(summary.processed, 2);
    }

    #[tokio::test]
    async fn test_queue_action_validates_and_drains_when_online() {
        let backend = Arc::new(ScriptedBackend::default());
        let (engine, _) = engine_with(backend.clone(), true);

        assert!(engine
            .queue_action("RefundEverything", "/pos/refunds", "POST", json!({}), None)
            .is_err());
        assert!(engine
            .queue_action("CreateCustomer", "/pos/customers", "GET", json!({"name": "A"}), None)
            .is_err());
        assert_eq!(engine.get_sync_stats().pending_count, 0);

        let queued = engine
            .queue_action(
                "CreateCustomer",
                "/pos/customers",
                "POST",
                json!({ "name": "Ana" }),
                Some("high"),
            )
            .unwrap();
        assert_eq!(queued.action.priority, ActionPriority::High);

        let summary = queued.drain.expect("online enqueue drains").await.unwrap();
        assert_eq!(summary.processed, 1);
        let call = &backend.calls()[0];
        assert_eq!(call.endpoint, "/pos/customers");
        assert_eq!(call.body.as_ref().unwrap()["name"], "Ana");

        let stats = engine.get_sync_stats();
        assert_eq!(stats.pending_count, 0);
        assert!(stats.last_sync.is_some());
        assert!(stats.can_sync);
    }

    #[tokio::test]
    async fn test_retry_failed_requeues_and_drains() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(
            "/pos/orders",
            Err(ApiError::Rejected {
                status: 404,
                message: "Unknown product".into(),
            }),
        );
        let (engine, _) = engine_with(backend, true);
        let action = engine
            .lock_queue()
            .unwrap()
            .enqueue(NewAction::new(sale("p-1"), "/pos/orders", ActionMethod::Post))
            .unwrap();
        engine.drain().await;
        assert_eq!(engine.get_sync_stats().failed_count, 1);

        let retry = engine.retry_failed(&action.id).unwrap();
        assert!(retry.requeued);
        let summary = retry.drain.unwrap().await.unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(engine.get_sync_stats().failed_count, 0);
        assert_eq!(engine.clear_failed().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_force_full_sync_refreshes_cache_first() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.respond(
            "/pos/products",
            Ok(json!({
                "success": true,
                "data": [{ "id": "p-1", "name": "Phone", "price": 100, "stock": 2 }]
            })),
        );
        let (engine, _) = engine_with(backend.clone(), true);
        engine
            .lock_queue()
            .unwrap()
            .enqueue(NewAction::new(sale("p-1"), "/pos/orders", ActionMethod::Post))
            .unwrap();

        let result = engine.force_full_sync().await;
        let reference = result.reference.unwrap();
        assert!(reference.all_ok());
        assert_eq!(result.drain.processed, 1);

        let endpoints: Vec<String> = backend.calls().into_iter().map(|c| c.endpoint).collect();
        assert_eq!(
            endpoints,
            vec!["/pos/products", "/pos/categories", "/pos/customers", "/pos/orders"]
        );
        assert_eq!(catalog::cached_products(&engine.cache)[0].stock, 2);
    }

    #[tokio::test]
    async fn test_loop_drains_on_reconnect() {
        let backend = Arc::new(ScriptedBackend::default());
        let (engine, _) = engine_with(backend.clone(), false);
        enqueue(
            &engine,
            NewAction::new(sale("p-1"), "/pos/orders", ActionMethod::Post),
        );

        let handle = engine.start(Duration::from_secs(3600));
        engine.connectivity().publish(NetworkStatus::online("wifi"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while engine.get_sync_stats().pending_count > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue drained after reconnect");
        assert_eq!(backend.calls().len(), 1);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_loop_interval_drains_pending_work() {
        let backend = Arc::new(ScriptedBackend::default());
        let (engine, _) = engine_with(backend.clone(), true);
        engine
            .lock_queue()
            .unwrap()
            .enqueue(NewAction::new(sale("p-1"), "/pos/orders", ActionMethod::Post))
            .unwrap();
        // startup drain takes the first action; the tick takes the next one
        let handle = engine.start(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(50)).await;
        engine
            .lock_queue()
            .unwrap()
            .enqueue(NewAction::new(sale("p-2"), "/pos/orders", ActionMethod::Post))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.calls().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("interval drain");
        assert_eq!(engine.get_sync_stats().pending_count, 0);
        handle.stop().await;
    }

    // -- End to end against the real backend --------------------------------

    async fn spawn_backend() -> (String, Arc<server::db::ServerDb>) {
        let db = Arc::new(server::db::ServerDb::open_in_memory().unwrap());
        {
            let mut conn = db.conn.lock().unwrap();
            server::inventory::upsert_product(
                &conn,
                &Product {
                    id: "p-1".into(),
                    name: "Phone".into(),
                    sku: Some("PH-1".into()),
                    category_id: None,
                    price: 49900,
                    stock: 0,
                },
            )
            .unwrap();
            let serials: Vec<String> = ["S1", "S2", "S3"].iter().map(|s| s.to_string()).collect();
            server::inventory::receive_stock(&mut conn, "p-1", &serials).unwrap();
        }

        let state = server::routes::AppState::new(db.clone(), 0.10);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, server::routes::app_router(state))
                .await
                .unwrap();
        });
        (format!("http://{addr}"), db)
    }

    #[tokio::test]
    async fn test_offline_sale_replays_against_backend() {
        let (base_url, server_db) = spawn_backend().await;
        let client = ApiClient::new(&ClientConfig::new(&base_url, "test-key")).unwrap();
        assert!(client.check_health().await);

        let (engine, _) = engine_with(Arc::new(client.clone()), false);
        let queued = engine
            .queue_action(
                "CreateSale",
                "/pos/orders",
                "POST",
                json!({
                    "orderData": { "discount": 0 },
                    "items": [{ "product_id": "p-1", "quantity": 2, "unit_price": 49900 }]
                }),
                None,
            )
            .unwrap();
        assert_eq!(engine.get_sync_stats().pending_count, 1);

        engine.connectivity().publish(NetworkStatus::online("wifi"));
        let summary = engine.drain().await;
        assert_eq!(summary.processed, 1, "errors: {:?}", summary.errors);
        assert_eq!(engine.get_sync_stats().pending_count, 0);

        {
            let conn = server_db.conn.lock().unwrap();
            let stock: i64 = conn
                .query_row("SELECT stock FROM products WHERE id = 'p-1'", [], |r| r.get(0))
                .unwrap();
            assert_eq!(stock, 1);
            let sold: Vec<String> = conn
                .prepare("SELECT serial_number FROM serial_units WHERE status = 'sold' ORDER BY serial_number")
                .unwrap()
                .query_map([], |r| r.get(0))
                .unwrap()
                .map(|r| r.unwrap())
                .collect();
            assert_eq!(sold, vec!["S1", "S2"]);
        }

        // a lost response replayed with the same key must not create a second order
        let body = queued.action.kind.body().unwrap();
        let replay = client
            .execute(Method::POST, "/pos/orders", Some(&body), Some(&queued.action.id))
            .await
            .unwrap();
        assert_eq!(replay["replayed"], true);
        let orders = client
            .execute(Method::GET, "/pos/orders?page=1&limit=10", None, None)
            .await
            .unwrap();
        assert_eq!(orders["pagination"]["total"], 1);
        assert_eq!(orders["data"][0]["items"][0]["serial_numbers"], json!(["S1", "S2"]));
    }
}
