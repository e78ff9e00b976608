//! Sync Engine - orchestrates queue draining, pulls, full syncs, device
//! lifecycle and statistics.
//!
//! One engine is constructed at process start and handed to every consumer;
//! clones share the same state.

use super::api::{RemoteBackend, SyncApiError};
use super::conflict::{ConflictError, ConflictResolver, ResolvedOutcome};
use super::models::{
    entity_key, CachedEntity, ConflictCase, ConflictStrategy, DeviceInfo, DeviceRecord,
    EngineConfig, OperationKind, OperationStatus, Origin, Priority, QueueEntry, RemoteEntity,
    RetryPolicy, SyncOperation, SyncStats,
};
use super::network::NetworkMonitor;
use super::observers::{ObserverRegistry, SubscriptionId};
use super::queue::{QueueError, SyncQueue};
use super::scheduler::{BackgroundScheduler, BackgroundWork, SchedulerConfig};
use crate::db::{self, DbError, DurableStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Instant;

pub const STATS_KEY: &str = "sync_stats";
pub const DEVICE_ID_KEY: &str = "device_id";
pub const DEVICES_KEY: &str = "device_info";
pub const WATERMARKS_KEY: &str = "sync_watermarks";

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Ready,
    Draining,
    FullSyncing,
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Another drain was already running; nothing was attempted
    pub skipped: bool,
    pub attempted: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub conflicted: usize,
    /// Conflicted entries whose resolution did not queue a follow-up push
    pub closed_by_conflict: usize,
    /// Entries left untouched because their retry time has not come
    pub not_due: usize,
    /// Entries removed or replaced by another caller while the pass ran
    pub superseded: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Sync engine is not initialized")]
    NotInitialized,

    #[error("Network is offline")]
    Offline,

    #[error("Conflict resolution failed: {0}")]
    ConflictResolutionFailed(#[from] ConflictError),

    #[error("Device registration failed: {0}")]
    DeviceRegistrationFailed(String),

    #[error("Store error: {0}")]
    Store(#[from] DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Remote error: {0}")]
    Remote(#[from] SyncApiError),
}

/// Settings fixed by `initialize`
struct Session {
    config: EngineConfig,
    origin: Origin,
}

struct EngineInner {
    store: Arc<dyn DurableStore>,
    remote: Arc<dyn RemoteBackend>,
    network: NetworkMonitor,
    queue: SyncQueue,
    resolver: ConflictResolver,
    scheduler: BackgroundScheduler,

    session: StdMutex<Option<Arc<Session>>>,
    stats: StdMutex<SyncStats>,
    device: StdMutex<Option<DeviceRecord>>,
    stats_listeners: ObserverRegistry<SyncStats>,
    network_subscription: StdMutex<Option<SubscriptionId>>,

    /// Held for the length of a drain pass
    drain_lock: tokio::sync::Mutex<()>,
    full_syncs: AtomicUsize,
    init_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DurableStore>,
        remote: Arc<dyn RemoteBackend>,
        network: NetworkMonitor,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                queue: SyncQueue::new(store.clone()),
                resolver: ConflictResolver::new(store.clone()),
                store,
                remote,
                network,
                scheduler: BackgroundScheduler::new(),
                session: StdMutex::new(None),
                stats: StdMutex::new(SyncStats::default()),
                device: StdMutex::new(None),
                stats_listeners: ObserverRegistry::new("stats"),
                network_subscription: StdMutex::new(None),
                drain_lock: tokio::sync::Mutex::new(()),
                full_syncs: AtomicUsize::new(0),
                init_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load persisted state, register the device and start background work.
    ///
    /// A second call logs a warning and returns without doing anything.
    pub async fn initialize(&self, config: EngineConfig) -> Result<(), SyncError> {
        let _init = self.inner.init_lock.lock().await;
        if lock(&self.inner.session).is_some() {
            log::warn!("Sync engine already initialized; ignoring initialize()");
            return Ok(());
        }

        let device_id = match db::load_json::<String>(self.inner.store.as_ref(), DEVICE_ID_KEY)? {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                db::save_json(self.inner.store.as_ref(), DEVICE_ID_KEY, &id)?;
                log::info!("Generated device id {}", id);
                id
            }
        };

        let mut stats = match db::load_json::<SyncStats>(self.inner.store.as_ref(), STATS_KEY) {
            Ok(stats) => stats.unwrap_or_default(),
            Err(DbError::Serialization(e)) => {
                log::warn!("Discarding unreadable sync stats: {}", e);
                SyncStats::default()
            }
            Err(e) => return Err(e.into()),
        };

        match self.inner.queue.load() {
            Ok(_) => {}
            Err(QueueError::Store(DbError::Serialization(e))) => {
                log::warn!("Discarding unreadable queue snapshot: {}", e);
            }
            Err(QueueError::UnsupportedSnapshot(version)) => {
                log::warn!("Discarding queue snapshot with unsupported version {}", version);
            }
            Err(e) => return Err(e.into()),
        }

        stats.pending_count = self.inner.queue.len() as u64;
        stats.online = self.inner.network.is_online();
        *lock(&self.inner.stats) = stats;

        let background = config.background;
        let drain_interval = config.drain_interval;
        let heartbeat_interval = config.heartbeat_interval;
        let network_check_interval = config.network_check_interval;
        let device_info = config.device_info();

        let origin = Origin {
            device_id,
            user_id: config.user_id.clone(),
        };
        *lock(&self.inner.session) = Some(Arc::new(Session { config, origin }));

        if let Err(e) = self.register_device(device_info).await {
            log::warn!("Continuing without device registration: {}", e);
        }

        let weak = Arc::downgrade(&self.inner);
        let subscription = self.inner.network.subscribe(move |status| {
            if let Some(inner) = weak.upgrade() {
                SyncEngine { inner }.on_network_change(status.online);
            }
        });
        *lock(&self.inner.network_subscription) = Some(subscription);

        if background {
            self.inner.network.start_periodic_checks(network_check_interval);

            let work = Arc::new(EngineWork {
                engine: Arc::downgrade(&self.inner),
            });
            let schedule = SchedulerConfig {
                drain_interval,
                heartbeat_interval,
            };
            if let Err(e) = self.inner.scheduler.start(work, schedule) {
                log::error!("Failed to start background scheduler: {}", e);
            }
        }

        self.commit_stats()?;
        log::info!(
            "Sync engine initialized ({} pending operations)",
            self.inner.queue.len()
        );
        Ok(())
    }

    /// Stop background loops and flush queue and stats
    pub fn shutdown(&self) -> Result<(), SyncError> {
        if self.inner.scheduler.is_running() {
            let _ = self.inner.scheduler.stop();
        }
        self.inner.network.stop();
        if let Some(id) = lock(&self.inner.network_subscription).take() {
            self.inner.network.unsubscribe(id);
        }

        if lock(&self.inner.session).is_some() {
            self.inner.queue.persist()?;
            self.commit_stats()?;
        }

        log::info!("Sync engine shut down");
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        if lock(&self.inner.session).is_none() {
            EngineState::Uninitialized
        } else if self.inner.full_syncs.load(Ordering::SeqCst) > 0 {
            EngineState::FullSyncing
        } else if self.inner.drain_lock.try_lock().is_err() {
            EngineState::Draining
        } else {
            EngineState::Ready
        }
    }

    pub fn stats(&self) -> SyncStats {
        lock(&self.inner.stats).clone()
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.inner.network
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    /// This device's record, once registered
    pub fn device(&self) -> Option<DeviceRecord> {
        lock(&self.inner.device).clone()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Queue each item as a `create` and attempt an immediate drain if online
    pub async fn enqueue_mutation(
        &self,
        entity_type: &str,
        items: Vec<Value>,
    ) -> Result<SyncStats, SyncError> {
        let session = self.session()?;
        let started = Instant::now();
        let count = items.len() as u64;

        for item in items {
            let entity_id = item_id(&item);
            let operation =
                SyncOperation::new(OperationKind::Create, entity_type, entity_id, item, &session.origin);
            self.inner.queue.enqueue(
                operation,
                Priority::Normal,
                session.config.retry_policy.clone(),
            )?;
        }

        if self.inner.network.is_online() {
            self.drain_queue().await?;
        }

        self.with_stats(|stats| {
            stats.total_items_synced += count;
            stats.record_duration(started.elapsed());
            stats.pending_count = self.inner.queue.len() as u64;
        });
        self.commit_stats()
    }

    /// Queue an arbitrary operation (update, delete, or a prepared create)
    pub async fn enqueue_operation(
        &self,
        operation: SyncOperation,
        priority: Priority,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<SyncStats, SyncError> {
        let session = self.session()?;
        let policy = retry_policy.unwrap_or_else(|| session.config.retry_policy.clone());
        self.inner.queue.enqueue(operation, priority, policy)?;

        if self.inner.network.is_online() {
            self.drain_queue().await?;
        }

        self.with_stats(|stats| stats.pending_count = self.inner.queue.len() as u64);
        self.commit_stats()
    }

    /// Empty the queue
    pub fn clear_queue(&self) -> Result<usize, SyncError> {
        self.session()?;
        let cleared = self.inner.queue.clear()?;
        self.with_stats(|stats| stats.pending_count = 0);
        self.commit_stats()?;
        Ok(cleared)
    }

    // ========================================================================
    // Draining
    // ========================================================================

    /// Run one pass over every due queue entry.
    ///
    /// A call made while another pass is running returns a `skipped` report.
    pub async fn drain_queue(&self) -> Result<DrainReport, SyncError> {
        let session = self.session()?;

        let Ok(pass) = self.inner.drain_lock.try_lock() else {
            log::debug!("Drain already in progress; skipping");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        };
        self.run_drain(&session, pass).await
    }

    /// Like `drain_queue`, but waits for a running pass to finish and then
    /// runs a pass of its own
    async fn drain_after_current(&self, session: &Session) -> Result<DrainReport, SyncError> {
        let pass = self.inner.drain_lock.lock().await;
        self.run_drain(session, pass).await
    }

    async fn run_drain(
        &self,
        session: &Session,
        _pass: tokio::sync::MutexGuard<'_, ()>,
    ) -> Result<DrainReport, SyncError> {
        let now = Utc::now();
        let mut report = DrainReport::default();

        for mut entry in self.inner.queue.drain_order() {
            if !entry.is_due(now) {
                report.not_due += 1;
                continue;
            }
            if !self.inner.queue.is_current(entry.id(), entry.sequence) {
                report.superseded += 1;
                continue;
            }

            report.attempted += 1;
            entry.started_at = Some(Utc::now());
            entry.operation.status = OperationStatus::Processing;

            match self.inner.remote.perform_operation(&entry.operation).await {
                Ok(()) => {
                    if self.inner.queue.discard(entry.id(), entry.sequence) {
                        report.completed += 1;
                    } else {
                        report.superseded += 1;
                    }
                }
                Err(SyncApiError::Conflict { remote }) => {
                    match self.handle_push_conflict(session, &entry, remote) {
                        Ok(followed_up) => {
                            if self.inner.queue.discard(entry.id(), entry.sequence) {
                                report.conflicted += 1;
                                if !followed_up {
                                    report.closed_by_conflict += 1;
                                }
                            } else {
                                report.superseded += 1;
                            }
                        }
                        Err(e) => {
                            log::error!("Could not record conflict for {}: {}", entry.id(), e);
                            self.retry_or_fail(entry, &mut report);
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "{} {}:{} failed: {}",
                        entry.operation.kind.as_str(),
                        entry.operation.entity_type,
                        entry.operation.entity_id,
                        e
                    );
                    self.retry_or_fail(entry, &mut report);
                }
            }
        }

        self.with_stats(|stats| {
            stats.completed_count += report.completed as u64;
            stats.failed_count += report.failed as u64;
            stats.conflicted_count += report.closed_by_conflict as u64;
            stats.pending_count = self.inner.queue.len() as u64;
        });

        self.inner.queue.persist()?;
        self.commit_stats()?;

        if report.attempted > 0 {
            log::info!(
                "Drain pass: {} attempted, {} completed, {} rescheduled, {} failed, {} conflicted",
                report.attempted,
                report.completed,
                report.rescheduled,
                report.failed,
                report.conflicted
            );
        }
        if report.superseded > 0 {
            log::debug!("{} entries changed during the drain pass", report.superseded);
        }
        Ok(report)
    }

    fn retry_or_fail(&self, mut entry: QueueEntry, report: &mut DrainReport) {
        entry.operation.retry_count += 1;
        let retries = entry.operation.retry_count;

        if retries >= entry.retry_policy.max_retries {
            log::error!(
                "Giving up on operation {} after {} attempts",
                entry.id(),
                retries
            );
            if self.inner.queue.discard(entry.id(), entry.sequence) {
                report.failed += 1;
            } else {
                report.superseded += 1;
            }
            return;
        }

        entry.operation.status = OperationStatus::Pending;
        entry.started_at = None;
        entry.scheduled_at = Some(entry.retry_policy.next_attempt_at(Utc::now(), retries));
        log::debug!(
            "Operation {} retry {} scheduled for {:?}",
            entry.id(),
            retries,
            entry.scheduled_at
        );
        if self.inner.queue.reschedule(entry) {
            report.rescheduled += 1;
        } else {
            report.superseded += 1;
        }
    }

    /// The remote rejected a push because its version diverged.
    ///
    /// Returns whether a follow-up push was queued.
    fn handle_push_conflict(
        &self,
        session: &Session,
        entry: &QueueEntry,
        remote: Value,
    ) -> Result<bool, SyncError> {
        let conflict = ConflictCase::new(
            entry.operation.entity_type.clone(),
            entry.operation.entity_id.clone(),
            entry.operation.local_payload.clone(),
            remote,
            session.config.conflict_strategy,
        );
        self.inner.resolver.record(conflict.clone())?;
        Ok(self.auto_resolve(session, conflict))
    }

    /// Apply the configured strategy unless it is manual. Returns whether a
    /// follow-up push was queued.
    fn auto_resolve(&self, session: &Session, conflict: ConflictCase) -> bool {
        if conflict.strategy == ConflictStrategy::Manual {
            return false;
        }
        let id = conflict.id.clone();
        match self.apply_resolution(session, conflict, true) {
            Ok(outcome) => outcome.follow_up().is_some(),
            Err(e) => {
                log::warn!("Conflict {} left open: {}", id, e);
                false
            }
        }
    }

    /// Resolve a conflict, writing the follow-up queue entry in the same
    /// batch as the closed conflict. Stats are updated but not committed.
    fn apply_resolution(
        &self,
        session: &Session,
        conflict: ConflictCase,
        auto: bool,
    ) -> Result<ResolvedOutcome, SyncError> {
        let queue = &self.inner.queue;
        let store = &self.inner.store;
        let retry_policy = &session.config.retry_policy;

        let outcome = self.inner.resolver.resolve_with(
            conflict,
            &session.origin,
            auto,
            |follow_up, batch| match follow_up {
                Some(follow_up) => queue
                    .enqueue_with(
                        follow_up.operation.clone(),
                        follow_up.priority,
                        retry_policy.clone(),
                        batch,
                    )
                    .map_err(queue_write_error),
                None => store.set_batch(batch),
            },
        )?;

        if outcome.is_resolved() {
            self.with_stats(|stats| {
                stats.conflicts_resolved_count += 1;
                stats.pending_count = queue.len() as u64;
            });
        }

        Ok(outcome)
    }

    // ========================================================================
    // Pulls
    // ========================================================================

    /// Fetch remote changes for one entity type.
    ///
    /// Returns nothing when offline. `since` overrides the stored watermark.
    pub async fn pull(
        &self,
        entity_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteEntity>, SyncError> {
        let session = self.session()?;
        if !self.inner.network.is_online() {
            log::debug!("Offline; skipping pull of {}", entity_type);
            return Ok(Vec::new());
        }

        let mut watermarks: HashMap<String, DateTime<Utc>> =
            db::load_json(self.inner.store.as_ref(), WATERMARKS_KEY)?.unwrap_or_default();
        let since = since.or_else(|| watermarks.get(entity_type).copied());

        let entities = self.inner.remote.fetch_since(entity_type, since).await?;

        let now = Utc::now();
        let mut batch = Vec::new();
        for entity in &entities {
            let key = entity_key(entity_type, &entity.entity_id);
            let cached: Option<CachedEntity> = db::load_json(self.inner.store.as_ref(), &key)?;
            let cached_at = cached.and_then(|c| c.remote_updated_at);

            match self.inner.queue.latest_for(entity_type, &entity.entity_id) {
                Some(pending) if cached_at != Some(entity.updated_at) => {
                    self.record_pull_conflict(&session, pending, entity)?;
                }
                _ => {
                    let fresh = CachedEntity {
                        payload: if entity.deleted { Value::Null } else { entity.payload.clone() },
                        remote_updated_at: Some(entity.updated_at),
                        stored_at: now,
                    };
                    batch.push((key, db::to_json(&fresh)?));
                }
            }
        }

        if let Some(newest) = entities.iter().map(|e| e.updated_at).max() {
            let mark = watermarks.entry(entity_type.to_string()).or_insert(newest);
            if newest > *mark {
                *mark = newest;
            }
        }
        batch.push((WATERMARKS_KEY.to_string(), db::to_json(&watermarks)?));
        self.inner.store.set_batch(&batch)?;

        self.with_stats(|stats| {
            stats.last_sync_at = Some(now);
            stats.total_items_synced += entities.len() as u64;
            stats.pending_count = self.inner.queue.len() as u64;
        });
        self.commit_stats()?;

        log::info!("Pulled {} {} entities", entities.len(), entity_type);
        Ok(entities)
    }

    /// Local changes to an entity that also changed remotely.
    ///
    /// Pending entries for the entity leave the queue; the conflict carries
    /// the local version from here on.
    fn record_pull_conflict(
        &self,
        session: &Session,
        pending: QueueEntry,
        entity: &RemoteEntity,
    ) -> Result<(), SyncError> {
        let conflict = ConflictCase::new(
            pending.operation.entity_type.clone(),
            pending.operation.entity_id.clone(),
            pending.operation.local_payload.clone(),
            entity.payload.clone(),
            session.config.conflict_strategy,
        );
        self.inner.resolver.record(conflict.clone())?;

        let mut removed = 0u64;
        while let Some(entry) = self
            .inner
            .queue
            .latest_for(&pending.operation.entity_type, &pending.operation.entity_id)
        {
            self.inner.queue.remove(entry.id())?;
            removed += 1;
        }

        // A follow-up push stands in for one of the removed entries
        let followed_up = self.auto_resolve(session, conflict);
        let closed = removed.saturating_sub(u64::from(followed_up));
        self.with_stats(|stats| stats.conflicted_count += closed);
        Ok(())
    }

    /// Drain the queue, then pull every configured entity type in order.
    ///
    /// A drain pass already in flight is waited for, and the queue is then
    /// drained again before anything is pulled.
    ///
    /// Fails with `Offline` before doing any work. A failure partway keeps
    /// whatever was already pulled.
    pub async fn full_sync(&self) -> Result<SyncStats, SyncError> {
        let session = self.session()?;
        if !self.inner.network.is_online() {
            return Err(SyncError::Offline);
        }

        let _active = FullSyncGuard::enter(&self.inner.full_syncs);
        let started = Instant::now();
        log::info!("Full sync started");

        if let Err(e) = self.run_full_sync(&session).await {
            log::error!("Full sync failed: {}", e);
            self.with_stats(|stats| stats.failed_count += 1);
            if let Err(persist) = self.commit_stats() {
                log::error!("Failed to persist stats after full sync failure: {}", persist);
            }
            return Err(e);
        }

        self.with_stats(|stats| {
            stats.last_sync_at = Some(Utc::now());
            stats.record_duration(started.elapsed());
        });
        let stats = self.commit_stats()?;
        log::info!("Full sync completed in {:?}", started.elapsed());
        Ok(stats)
    }

    async fn run_full_sync(&self, session: &Session) -> Result<(), SyncError> {
        self.drain_after_current(session).await?;
        for entity_type in &session.config.entity_types {
            self.pull(entity_type, None).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    /// Conflicts still waiting for a resolution
    pub fn list_conflicts(&self) -> Result<Vec<ConflictCase>, SyncError> {
        self.session()?;
        Ok(self.inner.resolver.open_conflicts()?)
    }

    /// Resolve a logged conflict with the given strategy.
    ///
    /// `merged` is required for `Merge`. `Manual` leaves the conflict open.
    pub fn resolve_conflict(
        &self,
        id: &str,
        strategy: ConflictStrategy,
        merged: Option<Value>,
    ) -> Result<ResolvedOutcome, SyncError> {
        let session = self.session()?;
        let mut conflict = self
            .inner
            .resolver
            .get(id)?
            .ok_or_else(|| ConflictError::NotFound(id.to_string()))?;

        conflict.strategy = strategy;
        if merged.is_some() {
            conflict.merged_version = merged;
        }

        let outcome = self.apply_resolution(&session, conflict, false)?;
        if outcome.is_resolved() {
            self.commit_stats()?;
        }
        Ok(outcome)
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Save this device's record locally and announce it to the backend
    pub async fn register_device(&self, info: DeviceInfo) -> Result<DeviceRecord, SyncError> {
        let session = self.session()?;
        let now = Utc::now();

        let existing = self
            .load_devices()
            .map_err(|e| SyncError::DeviceRegistrationFailed(e.to_string()))?
            .into_iter()
            .find(|d| d.device_id == session.origin.device_id);

        let record = DeviceRecord {
            device_id: session.origin.device_id.clone(),
            device_name: info.device_name,
            platform: info.platform,
            app_version: info.app_version,
            last_sync_at: existing.as_ref().and_then(|d| d.last_sync_at),
            active: true,
            registered_at: existing.as_ref().map(|d| d.registered_at).unwrap_or(now),
            last_heartbeat: now,
        };

        self.save_device(&record)
            .map_err(|e| SyncError::DeviceRegistrationFailed(e.to_string()))?;
        *lock(&self.inner.device) = Some(record.clone());

        self.inner
            .remote
            .register_device(&record)
            .await
            .map_err(|e| SyncError::DeviceRegistrationFailed(e.to_string()))?;

        log::info!("Registered device {} ({})", record.device_name, record.device_id);
        Ok(record)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>, SyncError> {
        self.session()?;
        Ok(self.load_devices()?)
    }

    /// Refresh this device's heartbeat and last sync time
    pub fn heartbeat(&self) -> Result<(), SyncError> {
        self.session()?;
        let last_sync_at = self.stats().last_sync_at;

        let record = {
            let mut device = lock(&self.inner.device);
            match device.as_mut() {
                Some(record) => {
                    record.last_heartbeat = Utc::now();
                    record.last_sync_at = last_sync_at;
                    record.clone()
                }
                None => return Ok(()),
            }
        };

        self.save_device(&record)?;
        log::debug!("Heartbeat for device {}", record.device_id);
        Ok(())
    }

    fn load_devices(&self) -> Result<Vec<DeviceRecord>, DbError> {
        Ok(db::load_json(self.inner.store.as_ref(), DEVICES_KEY)?.unwrap_or_default())
    }

    fn save_device(&self, record: &DeviceRecord) -> Result<(), DbError> {
        let mut devices = self.load_devices()?;
        match devices.iter_mut().find(|d| d.device_id == record.device_id) {
            Some(existing) => *existing = record.clone(),
            None => devices.push(record.clone()),
        }
        db::save_json(self.inner.store.as_ref(), DEVICES_KEY, &devices)
    }

    // ========================================================================
    // Stats
    // ========================================================================

    /// Register a stats listener; it is called once right away with the
    /// current stats
    pub fn subscribe_stats<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SyncStats) + Send + Sync + 'static,
    {
        let id = self.inner.stats_listeners.subscribe(listener);
        self.inner.stats_listeners.notify_one(id, &self.stats());
        id
    }

    pub fn unsubscribe_stats(&self, id: SubscriptionId) -> bool {
        self.inner.stats_listeners.unsubscribe(id)
    }

    fn with_stats<R>(&self, f: impl FnOnce(&mut SyncStats) -> R) -> R {
        f(&mut lock(&self.inner.stats))
    }

    /// Persist the current stats, then notify listeners
    fn commit_stats(&self) -> Result<SyncStats, SyncError> {
        let snapshot = {
            let stats = lock(&self.inner.stats);
            db::save_json(self.inner.store.as_ref(), STATS_KEY, &*stats)?;
            stats.clone()
        };
        self.inner.stats_listeners.notify(&snapshot);
        Ok(snapshot)
    }

    fn on_network_change(&self, online: bool) {
        self.with_stats(|stats| {
            stats.online = online;
            if online {
                stats.last_online_at = Some(Utc::now());
            }
        });
        if let Err(e) = self.commit_stats() {
            log::error!("Failed to persist stats after network change: {}", e);
        }

        if !online || self.inner.queue.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let engine = self.clone();
                handle.spawn(async move {
                    if let Err(e) = engine.drain_queue().await {
                        log::warn!("Drain after reconnect failed: {}", e);
                    }
                });
            }
            Err(_) => log::debug!("No runtime available; leaving drain to the scheduler"),
        }
    }

    fn session(&self) -> Result<Arc<Session>, SyncError> {
        lock(&self.inner.session)
            .clone()
            .ok_or(SyncError::NotInitialized)
    }
}

/// Scheduler callbacks; holds the engine weakly so dropping the last engine
/// handle ends the loops
struct EngineWork {
    engine: Weak<EngineInner>,
}

impl EngineWork {
    fn engine(&self) -> Option<SyncEngine> {
        self.engine.upgrade().map(|inner| SyncEngine { inner })
    }
}

#[async_trait]
impl BackgroundWork for EngineWork {
    async fn drain_tick(&self) -> bool {
        let Some(engine) = self.engine() else {
            return false;
        };

        if engine.network().is_online() && !engine.queue().is_empty() {
            if let Err(e) = engine.drain_queue().await {
                log::warn!("Scheduled drain failed: {}", e);
            }
        }
        true
    }

    async fn heartbeat_tick(&self) -> bool {
        let Some(engine) = self.engine() else {
            return false;
        };

        if let Err(e) = engine.heartbeat() {
            log::warn!("Heartbeat failed: {}", e);
        }
        true
    }
}

/// Counts a running full sync for as long as it is held
struct FullSyncGuard<'a>(&'a AtomicUsize);

impl<'a> FullSyncGuard<'a> {
    fn enter(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for FullSyncGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn queue_write_error(error: QueueError) -> DbError {
    match error {
        QueueError::Store(e) => e,
        other => DbError::Unavailable(other.to_string()),
    }
}

/// Entity id taken from the item's `id` field, or a fresh one
fn item_id(item: &Value) -> String {
    match item.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
