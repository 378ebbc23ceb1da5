//! Offline action queue.
//!
//! Every mutating cashier action is recorded as a [`PendingAction`] and
//! persisted before the caller is told it succeeded. The queue keeps two
//! lists:
//!
//! - **pending**: waiting to be replayed against the backend, ordered by
//!   priority with enqueue order preserved inside each priority band
//! - **failed**: parked after a permanent rejection or an exhausted retry
//!   budget; only a manual retry moves an action back
//!
//! Persistence goes through [`ActionQueueRepository`] so the queue itself
//! never touches storage details.

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_MAX_RETRIES;
use crate::models::{CheckoutRequest, NewCustomer, ReceiveStockRequest, StockRecountRequest};
use crate::storage::KeyValueStore;

// ---------------------------------------------------------------------------
// Action model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl ActionPriority {
    pub fn weight(self) -> u8 {
        match self {
            ActionPriority::High => 3,
            ActionPriority::Medium => 2,
            ActionPriority::Low => 1,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(ActionPriority::High),
            "medium" | "" => Ok(ActionPriority::Medium),
            "low" => Ok(ActionPriority::Low),
            other => Err(format!("Unknown action priority: {other}")),
        }
    }
}

/// HTTP verbs an action may replay with. Reads are never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionMethod {
    Post,
    Put,
    Patch,
    Delete,
}

impl ActionMethod {
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(ActionMethod::Post),
            "PUT" => Ok(ActionMethod::Put),
            "PATCH" => Ok(ActionMethod::Patch),
            "DELETE" => Ok(ActionMethod::Delete),
            other => Err(format!("Unsupported action method: {other}")),
        }
    }

    pub fn as_http(self) -> Method {
        match self {
            ActionMethod::Post => Method::POST,
            ActionMethod::Put => Method::PUT,
            ActionMethod::Patch => Method::PATCH,
            ActionMethod::Delete => Method::DELETE,
        }
    }
}

/// The closed set of mutations the cashier app can queue, each with its
/// typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ActionKind {
    CreateSale(CheckoutRequest),
    UpdateInventory(ReceiveStockRequest),
    CreateCustomer(NewCustomer),
    SyncInventory(StockRecountRequest),
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::CreateSale(_) => "CreateSale",
            ActionKind::UpdateInventory(_) => "UpdateInventory",
            ActionKind::CreateCustomer(_) => "CreateCustomer",
            ActionKind::SyncInventory(_) => "SyncInventory",
        }
    }

    /// Parse an untyped `(kind, payload)` pair coming from UI code. Unknown
    /// kinds and payloads that do not fit the kind are rejected here rather
    /// than at replay time.
    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, String> {
        fn typed<T: serde::de::DeserializeOwned>(kind: &str, payload: Value) -> Result<T, String> {
            serde_json::from_value(payload).map_err(|e| format!("Invalid {kind} payload: {e}"))
        }

        match kind.trim() {
            "CreateSale" | "create_sale" => Ok(ActionKind::CreateSale(typed(kind, payload)?)),
            "UpdateInventory" | "update_inventory" => {
                Ok(ActionKind::UpdateInventory(typed(kind, payload)?))
            }
            "CreateCustomer" | "create_customer" => {
                Ok(ActionKind::CreateCustomer(typed(kind, payload)?))
            }
            "SyncInventory" | "sync_inventory" => {
                Ok(ActionKind::SyncInventory(typed(kind, payload)?))
            }
            other => Err(format!("Unknown action kind: {other}")),
        }
    }

    /// The request body sent to the backend.
    pub fn body(&self) -> Result<Value, String> {
        let body = match self {
            ActionKind::CreateSale(p) => serde_json::to_value(p),
            ActionKind::UpdateInventory(p) => serde_json::to_value(p),
            ActionKind::CreateCustomer(p) => serde_json::to_value(p),
            ActionKind::SyncInventory(p) => serde_json::to_value(p),
        };
        body.map_err(|e| format!("serialize {} payload: {e}", self.name()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    /// Also sent as the idempotency key, so the backend can recognise a
    /// replay of a request whose response was lost.
    pub id: String,
    pub kind: ActionKind,
    pub endpoint: String,
    pub http_method: ActionMethod,
    pub priority: ActionPriority,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingAction {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// What callers supply; id, timestamps and counters are assigned on enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    pub kind: ActionKind,
    pub endpoint: String,
    pub http_method: ActionMethod,
    pub priority: ActionPriority,
    pub max_retries: u32,
}

impl NewAction {
    pub fn new(kind: ActionKind, endpoint: &str, http_method: ActionMethod) -> Self {
        Self {
            kind,
            endpoint: endpoint.to_string(),
            http_method,
            priority: ActionPriority::default(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_priority(mut self, priority: ActionPriority) -> Self {
        self.priority = priority;
        self
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueList {
    Pending,
    Failed,
}

impl QueueList {
    fn storage_key(self) -> &'static str {
        match self {
            QueueList::Pending => "offline_queue:pending",
            QueueList::Failed => "offline_queue:failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueSnapshot {
    pub pending: Vec<PendingAction>,
    pub failed: Vec<PendingAction>,
}

pub trait ActionQueueRepository: Send + Sync {
    fn load(&self) -> Result<QueueSnapshot, String>;
    fn append(&self, list: QueueList, action: &PendingAction) -> Result<(), String>;
    fn remove(&self, list: QueueList, id: &str) -> Result<(), String>;
    fn replace(&self, list: QueueList, actions: &[PendingAction]) -> Result<(), String>;
}

/// Stores each list as one JSON array in a [`KeyValueStore`].
pub struct KvActionRepository<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> KvActionRepository<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn read_list(&self, list: QueueList) -> Result<Vec<PendingAction>, String> {
        let key = list.storage_key();
        match self.store.get(key)? {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("decode {key}: {e}")),
        }
    }
}

impl<S: KeyValueStore> ActionQueueRepository for KvActionRepository<S> {
    fn load(&self) -> Result<QueueSnapshot, String> {
        Ok(QueueSnapshot {
            pending: self.read_list(QueueList::Pending)?,
            failed: self.read_list(QueueList::Failed)?,
        })
    }

    fn append(&self, list: QueueList, action: &PendingAction) -> Result<(), String> {
        let mut actions = self.read_list(list)?;
        actions.push(action.clone());
        self.replace(list, &actions)
    }

    fn remove(&self, list: QueueList, id: &str) -> Result<(), String> {
        let mut actions = self.read_list(list)?;
        actions.retain(|a| a.id != id);
        self.replace(list, &actions)
    }

    fn replace(&self, list: QueueList, actions: &[PendingAction]) -> Result<(), String> {
        let key = list.storage_key();
        let raw = serde_json::to_string(actions).map_err(|e| format!("encode {key}: {e}"))?;
        self.store
            .set(key, &raw)
            .map_err(|e| format!("persist {key}: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Result of recording a failed replay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Stays pending; will be attempted on the next drain.
    WillRetry { retry_count: u32 },
    /// Moved to the failed list.
    Parked { retry_count: u32 },
    /// The action was no longer pending (removed concurrently).
    Missing,
}

pub struct ActionQueue {
    repo: Arc<dyn ActionQueueRepository>,
    pending: Vec<PendingAction>,
    failed: Vec<PendingAction>,
}

impl ActionQueue {
    /// Load both lists from durable storage. The queue cannot be used before
    /// this has returned.
    pub fn load(repo: Arc<dyn ActionQueueRepository>) -> Result<Self, String> {
        let QueueSnapshot { pending, mut failed } = repo.load()?;

        // A crash between "append to failed" and "remove from pending" leaves
        // an action in both lists. Keep the pending copy.
        let pending_ids: HashSet<&str> = pending.iter().map(|a| a.id.as_str()).collect();
        let before = failed.len();
        failed.retain(|a| !pending_ids.contains(a.id.as_str()));
        if failed.len() != before {
            warn!(
                duplicates = before - failed.len(),
                "Dropping failed-list entries that are still pending"
            );
            repo.replace(QueueList::Failed, &failed)?;
        }

        info!(
            pending = pending.len(),
            failed = failed.len(),
            "Offline action queue loaded"
        );
        Ok(Self {
            repo,
            pending,
            failed,
        })
    }

    pub fn enqueue(&mut self, new_action: NewAction) -> Result<PendingAction, String> {
        if new_action.endpoint.trim().is_empty() {
            return Err("Action endpoint is required".into());
        }

        let action = PendingAction {
            id: Uuid::new_v4().to_string(),
            kind: new_action.kind,
            endpoint: new_action.endpoint,
            http_method: new_action.http_method,
            priority: new_action.priority,
            created_at: Utc::now(),
            retry_count: 0,
            max_retries: new_action.max_retries,
            last_error: None,
        };

        self.pending.push(action.clone());
        if let Err(e) = self.repo.append(QueueList::Pending, &action) {
            self.pending.pop();
            return Err(e);
        }

        info!(
            action_id = %action.id,
            kind = action.kind.name(),
            priority = ?action.priority,
            "Action queued"
        );
        Ok(action)
    }

    /// Stable sort by descending priority weight; equal-priority actions keep
    /// their enqueue order.
    pub fn reorder_by_priority(&mut self) -> Result<(), String> {
        let before: Vec<String> = self.pending.iter().map(|a| a.id.clone()).collect();
        self.pending.sort_by_key(|a| Reverse(a.priority.weight()));

        let changed = self.pending.iter().map(|a| &a.id).ne(before.iter());
        if changed {
            debug!("Pending actions reordered by priority");
            self.repo.replace(QueueList::Pending, &self.pending)?;
        }
        Ok(())
    }

    /// Drop a pending action after it was applied by the backend.
    pub fn remove(&mut self, id: &str) -> Result<bool, String> {
        let Some(idx) = self.pending.iter().position(|a| a.id == id) else {
            return Ok(false);
        };
        self.repo.remove(QueueList::Pending, id)?;
        self.pending.remove(idx);
        Ok(true)
    }

    /// Move a pending action to the failed list, counting the attempt.
    pub fn move_to_failed(&mut self, id: &str, error: Option<&str>) -> Result<bool, String> {
        let Some(idx) = self.pending.iter().position(|a| a.id == id) else {
            return Ok(false);
        };

        let mut action = self.pending[idx].clone();
        action.retry_count += 1;
        if let Some(e) = error {
            action.last_error = Some(e.to_string());
        }

        // Append before removing so a crash in between duplicates rather than loses.
        self.repo.append(QueueList::Failed, &action)?;
        self.repo.remove(QueueList::Pending, id)?;
        self.pending.remove(idx);

        warn!(
            action_id = %action.id,
            retry_count = action.retry_count,
            max_retries = action.max_retries,
            "Action moved to failed list"
        );
        self.failed.push(action);
        Ok(true)
    }

    /// Apply the retry policy after a failed replay. Retryable errors keep
    /// the action pending until the budget is spent; permanent errors park it
    /// at once.
    pub fn record_failure(
        &mut self,
        id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome, String> {
        let Some(idx) = self.pending.iter().position(|a| a.id == id) else {
            return Ok(FailureOutcome::Missing);
        };

        let next_count = self.pending[idx].retry_count + 1;
        if !retryable || next_count >= self.pending[idx].max_retries {
            self.move_to_failed(id, Some(error))?;
            return Ok(FailureOutcome::Parked {
                retry_count: next_count,
            });
        }

        let mut updated = self.pending.clone();
        updated[idx].retry_count = next_count;
        updated[idx].last_error = Some(error.to_string());
        self.repo.replace(QueueList::Pending, &updated)?;
        self.pending = updated;
        Ok(FailureOutcome::WillRetry {
            retry_count: next_count,
        })
    }

    /// Move a failed action back to pending if it still has retry budget.
    /// Returns `Ok(false)` when the budget is exhausted.
    pub fn retry_failed(&mut self, id: &str) -> Result<bool, String> {
        let idx = self
            .failed
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| format!("Failed action not found: {id}"))?;

        if !self.failed[idx].can_retry() {
            return Ok(false);
        }

        let action = self.failed[idx].clone();
        self.repo.append(QueueList::Pending, &action)?;
        self.repo.remove(QueueList::Failed, id)?;
        self.failed.remove(idx);

        info!(action_id = %action.id, retry_count = action.retry_count, "Failed action requeued");
        self.pending.push(action);
        Ok(true)
    }

    pub fn clear_failed(&mut self) -> Result<usize, String> {
        self.repo.replace(QueueList::Failed, &[])?;
        let cleared = self.failed.len();
        self.failed.clear();
        if cleared > 0 {
            info!(cleared, "Failed actions cleared");
        }
        Ok(cleared)
    }

    pub fn pending(&self) -> &[PendingAction] {
        &self.pending
    }

    pub fn failed(&self) -> &[PendingAction] {
        &self.failed
    }

    pub fn get(&self, id: &str) -> Option<&PendingAction> {
        self.pending
            .iter()
            .chain(self.failed.iter())
            .find(|a| a.id == id)
    }
}
