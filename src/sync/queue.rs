//! Offline Queue Module - pending operations with retry logic
//!
//! Local mutations wait here until the engine can deliver them. Failed
//! deliveries are rescheduled with the entry's backoff policy.
//!
//! Features:
//! - At most one entry per operation id (re-enqueue replaces)
//! - Priority ordering, FIFO within a priority
//! - Fixed, linear and exponential backoff
//! - Full-snapshot persistence to the durable store

use super::models::{BackoffKind, Priority, QueueEntry, RetryPolicy, SyncOperation};
use crate::db::{self, DbError, DurableStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// Constants
// ============================================================================

pub const QUEUE_KEY: &str = "sync_queue";
const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// Backoff
// ============================================================================

/// Delay before attempt number `retry_count` (1-based) under the given backoff
pub fn backoff_delay_ms(kind: BackoffKind, base_delay_ms: u64, retry_count: u32) -> u64 {
    match kind {
        BackoffKind::Fixed => base_delay_ms,
        BackoffKind::Linear => base_delay_ms.saturating_mul(retry_count as u64),
        BackoffKind::Exponential => {
            let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
            base_delay_ms.saturating_mul(factor)
        }
    }
}

impl RetryPolicy {
    /// Backoff delay with the policy's cap applied
    pub fn delay_ms(&self, retry_count: u32) -> u64 {
        let delay = backoff_delay_ms(self.backoff, self.base_delay_ms, retry_count);
        match self.max_delay_ms {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    /// When the next attempt may run
    pub fn next_attempt_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = self.delay_ms(retry_count).min(i64::MAX as u64) as i64;
        now.checked_add_signed(chrono::Duration::milliseconds(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    version: u32,
    entries: Vec<QueueEntry>,
}

struct QueueState {
    entries: HashMap<String, QueueEntry>,
    next_sequence: u64,
}

/// Priority queue of pending sync operations.
///
/// All mutation happens under one lock together with its persist step, so
/// concurrent enqueues never lose updates.
pub struct SyncQueue {
    store: Arc<dyn DurableStore>,
    state: Mutex<QueueState>,
}

impl SyncQueue {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            state: Mutex::new(QueueState {
                entries: HashMap::new(),
                next_sequence: 1,
            }),
        }
    }

    /// Restore the queue from the durable store, replacing in-memory entries
    pub fn load(&self) -> Result<usize, QueueError> {
        let snapshot: Option<QueueSnapshot> = db::load_json(self.store.as_ref(), QUEUE_KEY)?;

        let mut state = self.lock();
        state.entries.clear();
        state.next_sequence = 1;

        if let Some(snapshot) = snapshot {
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(QueueError::UnsupportedSnapshot(snapshot.version));
            }
            for entry in snapshot.entries {
                state.next_sequence = state.next_sequence.max(entry.sequence + 1);
                state.entries.insert(entry.operation.id.clone(), entry);
            }
        }

        log::info!("Loaded {} queued operations", state.entries.len());
        Ok(state.entries.len())
    }

    /// Save the full entry set
    pub fn persist(&self) -> Result<(), QueueError> {
        let state = self.lock();
        self.write_snapshot(&state)
    }

    /// Insert or replace the entry for `operation.id`
    pub fn enqueue(
        &self,
        operation: SyncOperation,
        priority: Priority,
        retry_policy: RetryPolicy,
    ) -> Result<(), QueueError> {
        self.enqueue_with(operation, priority, retry_policy, &[])
    }

    /// Insert or replace the entry for `operation.id`, writing the snapshot
    /// and `extra` in one batch. On a failed write the queue is unchanged.
    pub fn enqueue_with(
        &self,
        operation: SyncOperation,
        priority: Priority,
        retry_policy: RetryPolicy,
        extra: &[(String, String)],
    ) -> Result<(), QueueError> {
        let mut entry = QueueEntry::new(operation, priority, retry_policy);

        let mut state = self.lock();
        entry.sequence = state.next_sequence;
        state.next_sequence += 1;

        log::info!(
            "Queueing {} {}:{} ({:?}, id {})",
            entry.operation.kind.as_str(),
            entry.operation.entity_type,
            entry.operation.entity_id,
            entry.priority,
            entry.operation.id
        );

        let id = entry.operation.id.clone();
        let previous = state.entries.insert(id.clone(), entry);
        if previous.is_some() {
            log::debug!("Replaced existing queue entry");
        }

        let written = self.snapshot_json(&state).and_then(|json| {
            let mut batch = Vec::with_capacity(extra.len() + 1);
            batch.push((QUEUE_KEY.to_string(), json));
            batch.extend_from_slice(extra);
            self.store.set_batch(&batch)
        });

        if let Err(e) = written {
            log::warn!("Failed to persist queue entry {}: {}", id, e);
            match previous {
                Some(previous) => state.entries.insert(id, previous),
                None => state.entries.remove(&id),
            };
            return Err(e.into());
        }
        Ok(())
    }

    /// Entries ordered for draining: critical first, then oldest first
    pub fn drain_order(&self) -> Vec<QueueEntry> {
        let mut entries: Vec<QueueEntry> = self.lock().entries.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.sequence.cmp(&b.sequence))
        });
        entries
    }

    /// Remove an entry and persist
    pub fn remove(&self, id: &str) -> Result<Option<QueueEntry>, QueueError> {
        let mut state = self.lock();
        let removed = state.entries.remove(id);
        if let Some(entry) = &removed {
            if let Err(e) = self.write_snapshot(&state) {
                state.entries.insert(id.to_string(), entry.clone());
                return Err(e);
            }
        }
        Ok(removed)
    }

    /// Empty the queue and persist
    pub fn clear(&self) -> Result<usize, QueueError> {
        let mut state = self.lock();
        let previous = std::mem::take(&mut state.entries);
        let cleared = previous.len();
        if let Err(e) = self.write_snapshot(&state) {
            state.entries = previous;
            return Err(e);
        }

        log::info!("Cleared {} queued operations", cleared);
        Ok(cleared)
    }

    /// Drop an entry without persisting, provided it was not replaced since
    /// it was read (same `sequence`). Used inside a drain pass.
    pub fn discard(&self, id: &str, sequence: u64) -> bool {
        let mut state = self.lock();
        match state.entries.get(id) {
            Some(entry) if entry.sequence == sequence => {
                state.entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Write back an updated entry without persisting, under the same
    /// replacement check as `discard`.
    pub fn reschedule(&self, entry: QueueEntry) -> bool {
        let mut state = self.lock();
        match state.entries.get_mut(entry.id()) {
            Some(current) if current.sequence == entry.sequence => {
                *current = entry;
                true
            }
            _ => false,
        }
    }

    /// Whether `id` is still queued under the given `sequence`
    pub fn is_current(&self, id: &str, sequence: u64) -> bool {
        self.lock()
            .entries
            .get(id)
            .map_or(false, |entry| entry.sequence == sequence)
    }

    pub fn get(&self, id: &str) -> Option<QueueEntry> {
        self.lock().entries.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Whether any pending entry targets the given entity
    pub fn has_pending_for(&self, entity_type: &str, entity_id: &str) -> bool {
        self.lock().entries.values().any(|entry| {
            entry.operation.entity_type == entity_type && entry.operation.entity_id == entity_id
        })
    }

    /// Most recent pending entry for an entity
    pub fn latest_for(&self, entity_type: &str, entity_id: &str) -> Option<QueueEntry> {
        self.lock()
            .entries
            .values()
            .filter(|entry| {
                entry.operation.entity_type == entity_type && entry.operation.entity_id == entity_id
            })
            .max_by_key(|entry| entry.sequence)
            .cloned()
    }

    fn write_snapshot(&self, state: &QueueState) -> Result<(), QueueError> {
        let json = self.snapshot_json(state)?;
        self.store.set(QUEUE_KEY, &json)?;
        Ok(())
    }

    fn snapshot_json(&self, state: &QueueState) -> Result<String, DbError> {
        let mut entries: Vec<QueueEntry> = state.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.sequence);

        db::to_json(&QueueSnapshot {
            version: SNAPSHOT_VERSION,
            entries,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    #[error("Unsupported queue snapshot version: {0}")]
    UnsupportedSnapshot(u32),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::conflict::tests::FlakyStore;
    use crate::sync::models::{OperationKind, Origin};
    use serde_json::json;

    fn create_test_queue() -> (Arc<Database>, SyncQueue) {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        let queue = SyncQueue::new(db.clone());
        (db, queue)
    }

    fn op(entity_id: &str) -> SyncOperation {
        let origin = Origin {
            device_id: "device-1".to_string(),
            user_id: "user-1".to_string(),
        };
        SyncOperation::new(OperationKind::Create, "product", entity_id, json!({"id": entity_id}), &origin)
    }

    #[test]
    fn test_enqueue_and_len() {
        let (_db, queue) = create_test_queue();

        queue.enqueue(op("a"), Priority::Normal, RetryPolicy::default()).unwrap();
        queue.enqueue(op("b"), Priority::High, RetryPolicy::default()).unwrap();

        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_reenqueue_same_id_replaces() {
        let (_db, queue) = create_test_queue();

        let first = op("a");
        let mut second = first.clone();
        second.local_payload = json!({"id": "a", "stock": 9});

        queue.enqueue(first, Priority::Low, RetryPolicy::default()).unwrap();
        queue.enqueue(second.clone(), Priority::Critical, RetryPolicy::default()).unwrap();

        assert_eq!(queue.len(), 1);
        let entry = queue.get(&second.id).unwrap();
        assert_eq!(entry.priority, Priority::Critical);
        assert_eq!(entry.operation.local_payload, json!({"id": "a", "stock": 9}));
    }

    #[test]
    fn test_drain_order_priority_first() {
        let (_db, queue) = create_test_queue();

        let low = op("low");
        let critical = op("critical");
        let normal = op("normal");
        queue.enqueue(low.clone(), Priority::Low, RetryPolicy::default()).unwrap();
        queue.enqueue(critical.clone(), Priority::Critical, RetryPolicy::default()).unwrap();
        queue.enqueue(normal.clone(), Priority::Normal, RetryPolicy::default()).unwrap();

        let order: Vec<String> = queue.drain_order().iter().map(|e| e.id().to_string()).collect();
        assert_eq!(order, vec![critical.id, normal.id, low.id]);
    }

    #[test]
    fn test_drain_order_fifo_within_priority() {
        let (_db, queue) = create_test_queue();
        let base = Utc::now();

        let mut ids = Vec::new();
        for (i, offset) in [30, 10, 20].iter().enumerate() {
            let mut operation = op(&format!("item-{}", i));
            operation.created_at = base + chrono::Duration::seconds(*offset);
            ids.push((*offset, operation.id.clone()));
            queue.enqueue(operation, Priority::High, RetryPolicy::default()).unwrap();
        }
        ids.sort();

        let order: Vec<String> = queue.drain_order().iter().map(|e| e.id().to_string()).collect();
        let expected: Vec<String> = ids.into_iter().map(|(_, id)| id).collect();
        assert_eq!(order, expected);
    }

    #[test]
    fn test_drain_order_ties_use_insertion_order() {
        let (_db, queue) = create_test_queue();
        let created_at = Utc::now();

        let mut first = op("first");
        let mut second = op("second");
        first.created_at = created_at;
        second.created_at = created_at;

        queue.enqueue(first.clone(), Priority::Normal, RetryPolicy::default()).unwrap();
        queue.enqueue(second.clone(), Priority::Normal, RetryPolicy::default()).unwrap();

        let order: Vec<String> = queue.drain_order().iter().map(|e| e.id().to_string()).collect();
        assert_eq!(order, vec![first.id, second.id]);
    }

    #[test]
    fn test_remove_and_clear() {
        let (_db, queue) = create_test_queue();
        let a = op("a");
        queue.enqueue(a.clone(), Priority::Normal, RetryPolicy::default()).unwrap();
        queue.enqueue(op("b"), Priority::Normal, RetryPolicy::default()).unwrap();

        assert!(queue.remove(&a.id).unwrap().is_some());
        assert!(queue.remove(&a.id).unwrap().is_none());
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.clear().unwrap(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_persist_and_load_roundtrip() {
        let (db, queue) = create_test_queue();

        let mut retried = op("a");
        retried.retry_count = 2;
        queue.enqueue(retried.clone(), Priority::High, RetryPolicy::default()).unwrap();
        queue.enqueue(op("b"), Priority::Low, RetryPolicy::default()).unwrap();

        let restored = SyncQueue::new(db);
        assert_eq!(restored.load().unwrap(), 2);

        let entry = restored.get(&retried.id).unwrap();
        assert_eq!(entry.priority, Priority::High);
        assert_eq!(entry.operation.retry_count, 2);
        assert_eq!(
            restored.drain_order().iter().map(|e| e.id().to_string()).collect::<Vec<_>>(),
            queue.drain_order().iter().map(|e| e.id().to_string()).collect::<Vec<_>>()
        );

        // New entries continue after the restored sequence numbers
        restored.enqueue(op("c"), Priority::Low, RetryPolicy::default()).unwrap();
        let last = restored.drain_order().pop().unwrap();
        assert_eq!(last.operation.entity_id, "c");
    }

    #[test]
    fn test_failed_write_leaves_queue_unchanged() {
        let store = Arc::new(FlakyStore::new());
        let queue = SyncQueue::new(store.clone());
        let a = op("a");
        queue.enqueue(a.clone(), Priority::Low, RetryPolicy::default()).unwrap();
        let original = queue.get(&a.id).unwrap();

        store.fail_on(Some(QUEUE_KEY));

        assert!(queue.enqueue(op("b"), Priority::Normal, RetryPolicy::default()).is_err());
        assert!(queue.enqueue(a.clone(), Priority::Critical, RetryPolicy::default()).is_err());
        assert!(queue.remove(&a.id).is_err());
        assert!(queue.clear().is_err());

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(&a.id).unwrap(), original);

        store.fail_on(None);
        let restored = SyncQueue::new(store);
        assert_eq!(restored.load().unwrap(), 1);
        assert_eq!(restored.get(&a.id).unwrap().priority, Priority::Low);
    }

    #[test]
    fn test_enqueue_with_writes_extra_entries_atomically() {
        let store = Arc::new(FlakyStore::new());
        let queue = SyncQueue::new(store.clone());
        let extra = vec![("sync_conflicts".to_string(), "[]".to_string())];

        store.fail_on(Some("sync_conflicts"));
        assert!(queue.enqueue_with(op("a"), Priority::High, RetryPolicy::default(), &extra).is_err());
        assert!(queue.is_empty());
        assert!(store.inner.get(QUEUE_KEY).unwrap().is_none());

        store.fail_on(None);
        queue.enqueue_with(op("a"), Priority::High, RetryPolicy::default(), &extra).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(store.inner.get("sync_conflicts").unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueue_keeps_every_entry() {
        let (db, queue) = create_test_queue();
        let queue = Arc::new(queue);

        let mut handles = Vec::new();
        for task in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for i in 0..25 {
                    let operation = op(&format!("item-{}-{}", task, i));
                    ids.push(operation.id.clone());
                    queue.enqueue(operation, Priority::Normal, RetryPolicy::default()).unwrap();
                    tokio::task::yield_now().await;
                }
                ids
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.extend(handle.await.unwrap());
        }

        assert_eq!(queue.len(), 200);

        let restored = SyncQueue::new(db);
        assert_eq!(restored.load().unwrap(), 200);
        for id in &ids {
            assert!(restored.get(id).is_some(), "missing {}", id);
        }

        let mut sequences: Vec<u64> = restored.drain_order().iter().map(|e| e.sequence).collect();
        sequences.sort_unstable();
        sequences.dedup();
        assert_eq!(sequences.len(), 200);
    }

    #[test]
    fn test_discard_ignores_replaced_entry() {
        let (_db, queue) = create_test_queue();
        let a = op("a");
        queue.enqueue(a.clone(), Priority::Normal, RetryPolicy::default()).unwrap();
        let stale = queue.get(&a.id).unwrap();

        queue.enqueue(a.clone(), Priority::Normal, RetryPolicy::default()).unwrap();

        assert!(!queue.discard(&a.id, stale.sequence));
        assert!(!queue.reschedule(stale));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_pending_lookup_by_entity() {
        let (_db, queue) = create_test_queue();
        queue.enqueue(op("a"), Priority::Normal, RetryPolicy::default()).unwrap();

        assert!(queue.has_pending_for("product", "a"));
        assert!(!queue.has_pending_for("product", "b"));
        assert!(!queue.has_pending_for("supplier", "a"));
        assert_eq!(queue.latest_for("product", "a").unwrap().operation.entity_id, "a");
    }

    #[test]
    fn test_backoff_formulas() {
        for n in 1..=10u32 {
            assert_eq!(backoff_delay_ms(BackoffKind::Fixed, 500, n), 500);
            assert_eq!(backoff_delay_ms(BackoffKind::Linear, 500, n), 500 * n as u64);
            assert_eq!(backoff_delay_ms(BackoffKind::Exponential, 500, n), 500 * 2u64.pow(n));
        }
    }

    #[test]
    fn test_backoff_saturates() {
        assert_eq!(backoff_delay_ms(BackoffKind::Exponential, 1000, 80), u64::MAX);
    }

    #[test]
    fn test_policy_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_ms(1), 60_000);
        assert_eq!(policy.delay_ms(20), 3_600_000);

        let now = Utc::now();
        assert!(policy.next_attempt_at(now, 2) > policy.next_attempt_at(now, 1));
    }
}
