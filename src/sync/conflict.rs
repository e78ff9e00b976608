//! Conflict resolution for divergent local and remote entity versions.
//!
//! A `ConflictCase` is resolved under an explicit strategy:
//! - `UseLocal`: local wins; a high-priority update carrying it is emitted
//! - `UseCloud`: remote wins; local cached state is overwritten, nothing emitted
//! - `Merge`: the caller-supplied merged version is stored locally and emitted
//! - `Manual`: no state change, the conflict stays open
//!
//! Applying new local state and closing the conflict record happen in one
//! `set_batch` write, so a failed persist leaves the conflict open and the
//! local state untouched.

use super::models::{
    entity_key, CachedEntity, ConflictCase, ConflictStrategy, OperationKind, Origin, Priority,
    SyncOperation,
};
use crate::db::{self, DbError, DurableStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};

pub const CONFLICTS_KEY: &str = "sync_conflicts";

/// Resolved conflicts kept as history
const RESOLVED_HISTORY_LIMIT: usize = 200;

/// Priority of operations emitted by a resolution
pub const FOLLOW_UP_PRIORITY: Priority = Priority::High;

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConflictLog {
    conflicts: Vec<ConflictCase>,
}

impl ConflictLog {
    fn upsert(&mut self, conflict: ConflictCase) {
        match self.conflicts.iter_mut().find(|c| c.id == conflict.id) {
            Some(existing) => *existing = conflict,
            None => self.conflicts.push(conflict),
        }
    }

    fn prune(&mut self) {
        let resolved = self.conflicts.iter().filter(|c| c.is_resolved()).count();
        if resolved <= RESOLVED_HISTORY_LIMIT {
            return;
        }

        let excess = resolved - RESOLVED_HISTORY_LIMIT;
        let mut oldest: Vec<_> = self
            .conflicts
            .iter()
            .filter_map(|c| c.resolved_at.map(|at| (at, c.id.clone())))
            .collect();
        oldest.sort();

        let drop_ids: Vec<String> = oldest.into_iter().take(excess).map(|(_, id)| id).collect();

        self.conflicts.retain(|c| !drop_ids.contains(&c.id));
    }
}

/// Operation emitted by a resolution, to be queued by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUp {
    pub operation: SyncOperation,
    pub priority: Priority,
}

/// Result of applying a strategy
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedOutcome {
    /// `Manual`: nothing applied, conflict still open
    Pending(ConflictCase),

    /// Strategy applied and the conflict closed
    Resolved {
        conflict: ConflictCase,
        follow_up: Option<FollowUp>,
    },
}

impl ResolvedOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, ResolvedOutcome::Resolved { .. })
    }

    pub fn follow_up(&self) -> Option<&FollowUp> {
        match self {
            ResolvedOutcome::Resolved { follow_up, .. } => follow_up.as_ref(),
            ResolvedOutcome::Pending(_) => None,
        }
    }
}

/// Applies resolution strategies and keeps the conflict log
pub struct ConflictResolver {
    store: Arc<dyn DurableStore>,
    // Serializes read-modify-write of the conflict log
    log_lock: Mutex<()>,
}

impl ConflictResolver {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            log_lock: Mutex::new(()),
        }
    }

    /// Record a newly detected conflict, superseding any open conflict for
    /// the same entity
    pub fn record(&self, conflict: ConflictCase) -> Result<(), ConflictError> {
        let _guard = self.lock();
        let mut log = self.load_log()?;

        log.conflicts.retain(|c| {
            c.is_resolved()
                || c.id == conflict.id
                || c.entity_type != conflict.entity_type
                || c.entity_id != conflict.entity_id
        });

        log::warn!(
            "Conflict detected on {}:{} (strategy {:?})",
            conflict.entity_type,
            conflict.entity_id,
            conflict.strategy
        );

        log.upsert(conflict);
        db::save_json(self.store.as_ref(), CONFLICTS_KEY, &log)?;
        Ok(())
    }

    /// Conflicts still waiting for a resolution
    pub fn open_conflicts(&self) -> Result<Vec<ConflictCase>, ConflictError> {
        let _guard = self.lock();
        let log = self.load_log()?;
        Ok(log.conflicts.into_iter().filter(|c| !c.is_resolved()).collect())
    }

    /// Every known conflict, resolved history included
    pub fn all_conflicts(&self) -> Result<Vec<ConflictCase>, ConflictError> {
        let _guard = self.lock();
        Ok(self.load_log()?.conflicts)
    }

    pub fn get(&self, id: &str) -> Result<Option<ConflictCase>, ConflictError> {
        let _guard = self.lock();
        Ok(self.load_log()?.conflicts.into_iter().find(|c| c.id == id))
    }

    /// Apply `conflict.strategy`.
    ///
    /// `auto` marks resolutions made by a configured policy rather than a
    /// person.
    pub fn resolve(
        &self,
        conflict: ConflictCase,
        origin: &Origin,
        auto: bool,
    ) -> Result<ResolvedOutcome, ConflictError> {
        self.resolve_with(conflict, origin, auto, |_, batch| self.store.set_batch(batch))
    }

    /// Like [`resolve`](Self::resolve), but the final write goes through
    /// `write`, which receives the follow-up (if any) and the batch that
    /// stores new local state and closes the conflict. Nothing changes
    /// unless `write` succeeds.
    pub fn resolve_with<W>(
        &self,
        conflict: ConflictCase,
        origin: &Origin,
        auto: bool,
        write: W,
    ) -> Result<ResolvedOutcome, ConflictError>
    where
        W: FnOnce(Option<&FollowUp>, &[(String, String)]) -> Result<(), DbError>,
    {
        if conflict.is_resolved() {
            return Err(ConflictError::AlreadyResolved(conflict.id));
        }

        let (local_state, emitted) = match conflict.strategy {
            ConflictStrategy::Manual => {
                log::info!("Conflict {} left for manual resolution", conflict.id);
                return Ok(ResolvedOutcome::Pending(conflict));
            }
            ConflictStrategy::UseLocal => (None, Some(conflict.local_version.clone())),
            ConflictStrategy::UseCloud => (Some(conflict.remote_version.clone()), None),
            ConflictStrategy::Merge => {
                let merged = conflict
                    .merged_version
                    .clone()
                    .ok_or_else(|| ConflictError::MissingMergedVersion(conflict.id.clone()))?;
                (Some(merged.clone()), Some(merged))
            }
        };

        let mut resolved = conflict;
        resolved.resolved_at = Some(Utc::now());
        resolved.auto_resolved = auto;

        let follow_up = emitted.map(|payload| {
            let mut operation = SyncOperation::new(
                OperationKind::Update,
                resolved.entity_type.clone(),
                resolved.entity_id.clone(),
                payload,
                origin,
            );
            operation.remote_payload = Some(resolved.remote_version.clone());
            FollowUp {
                operation,
                priority: FOLLOW_UP_PRIORITY,
            }
        });

        self.commit(&resolved, local_state, follow_up.as_ref(), write)?;

        log::info!(
            "Resolved conflict {} on {}:{} with {:?}",
            resolved.id,
            resolved.entity_type,
            resolved.entity_id,
            resolved.strategy
        );

        Ok(ResolvedOutcome::Resolved {
            conflict: resolved,
            follow_up,
        })
    }

    /// Build the batch holding new local state (if any) and the closed
    /// conflict, then hand it to `write` while the log is locked
    fn commit<W>(
        &self,
        resolved: &ConflictCase,
        local_state: Option<Value>,
        follow_up: Option<&FollowUp>,
        write: W,
    ) -> Result<(), ConflictError>
    where
        W: FnOnce(Option<&FollowUp>, &[(String, String)]) -> Result<(), DbError>,
    {
        let _guard = self.lock();
        let mut log = self.load_log().map_err(ConflictError::PersistFailed)?;
        log.upsert(resolved.clone());
        log.prune();

        let mut batch = Vec::with_capacity(2);
        if let Some(payload) = local_state {
            let cached = CachedEntity {
                payload,
                remote_updated_at: None,
                stored_at: Utc::now(),
            };
            batch.push((
                entity_key(&resolved.entity_type, &resolved.entity_id),
                db::to_json(&cached).map_err(ConflictError::PersistFailed)?,
            ));
        }
        batch.push((
            CONFLICTS_KEY.to_string(),
            db::to_json(&log).map_err(ConflictError::PersistFailed)?,
        ));

        write(follow_up, &batch).map_err(ConflictError::PersistFailed)
    }

    fn load_log(&self) -> Result<ConflictLog, DbError> {
        Ok(db::load_json(self.store.as_ref(), CONFLICTS_KEY)?.unwrap_or_default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.log_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("Failed to persist conflict resolution: {0}")]
    PersistFailed(DbError),

    #[error("Merge strategy requires a merged version (conflict {0})")]
    MissingMergedVersion(String),

    #[error("Conflict already resolved: {0}")]
    AlreadyResolved(String),

    #[error("Conflict not found: {0}")]
    NotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] DbError),
}

// ============================================================================
// Tests
// ============================================================================
