//! Sync Data Models
//!
//! Defines the data structures shared by the queue, the conflict resolver
//! and the engine:
//! - SyncOperation / QueueEntry: pending local mutations
//! - ConflictCase: divergent local and remote versions of one entity
//! - SyncStats: process-wide counters broadcast to listeners
//! - DeviceRecord: this client's registration and heartbeat
//! - EngineConfig: engine settings
//!
//! Entity payloads are opaque JSON values; the engine never inspects them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

// ============================================================================
// Sync Operations
// ============================================================================

/// Kind of mutation carried by a sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// Lifecycle status of a sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A single local mutation waiting to reach the remote store.
///
/// Only `status` and `retry_count` change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: String,
    pub kind: OperationKind,
    pub entity_type: String,
    pub entity_id: String,
    pub local_payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub origin_device: String,
    pub origin_user: String,
    pub status: OperationStatus,
    pub retry_count: u32,
}

impl SyncOperation {
    /// Create a new pending operation with a fresh id
    pub fn new(
        kind: OperationKind,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        local_payload: Value,
        origin: &Origin,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            local_payload,
            remote_payload: None,
            created_at: Utc::now(),
            origin_device: origin.device_id.clone(),
            origin_user: origin.user_id.clone(),
            status: OperationStatus::Pending,
            retry_count: 0,
        }
    }
}

/// Device and user that produced an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub device_id: String,
    pub user_id: String,
}

// ============================================================================
// Queue Entries
// ============================================================================

/// Scheduling priority; `Critical` drains first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// How the delay between retries grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    Exponential,
}

/// Retry policy attached to each queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    /// Upper bound applied after the backoff formula
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 30_000,
            max_delay_ms: Some(3_600_000),
        }
    }
}

/// A sync operation as held by the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub operation: SyncOperation,
    pub priority: Priority,
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    /// Earliest time the next attempt may run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Insertion order, used to break ties between equal timestamps
    #[serde(default)]
    pub sequence: u64,
}

impl QueueEntry {
    pub fn new(operation: SyncOperation, priority: Priority, retry_policy: RetryPolicy) -> Self {
        Self {
            created_at: operation.created_at,
            operation,
            priority,
            retry_policy,
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            sequence: 0,
        }
    }

    /// Whether the entry may be attempted at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    pub fn id(&self) -> &str {
        &self.operation.id
    }
}

// ============================================================================
// Conflicts
// ============================================================================

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Keep the local version and push it to the remote
    UseLocal,

    /// Keep the remote version and overwrite local state
    UseCloud,

    /// Apply a caller-supplied merged version
    Merge,

    /// Leave the conflict open for a person to decide
    #[default]
    Manual,
}

/// Two divergent versions of the same `(entity_type, entity_id)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCase {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub local_version: Value,
    pub remote_version: Value,
    pub strategy: ConflictStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_version: Option<Value>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub auto_resolved: bool,
}

impl ConflictCase {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        local_version: Value,
        remote_version: Value,
        strategy: ConflictStrategy,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            local_version,
            remote_version,
            strategy,
            merged_version: None,
            detected_at: Utc::now(),
            resolved_at: None,
            auto_resolved: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Process-wide sync counters, persisted after every change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStats {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    /// Queued operations closed by a conflict without a follow-up push
    pub conflicted_count: u64,
    pub conflicts_resolved_count: u64,
    pub total_items_synced: u64,
    pub average_sync_duration_ms: f64,
    /// Number of samples folded into `average_sync_duration_ms`
    pub sync_samples: u64,
    pub online: bool,
    pub last_online_at: Option<DateTime<Utc>>,
}

impl SyncStats {
    /// Fold one duration sample into the running mean
    pub fn record_duration(&mut self, duration: Duration) {
        let sample = duration.as_secs_f64() * 1000.0;
        let n = self.sync_samples as f64;
        self.average_sync_duration_ms = (self.average_sync_duration_ms * n + sample) / (n + 1.0);
        self.sync_samples += 1;
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Platform identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    MacOS,
    Linux,
    Android,
    Ios,
    Other,
}

impl Platform {
    /// Get current platform
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::MacOS => "macos",
            Platform::Linux => "linux",
            Platform::Android => "android",
            Platform::Ios => "ios",
            Platform::Other => "other",
        }
    }
}

/// Registration details supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_name: String,
    pub platform: Platform,
    pub app_version: String,
}

/// A registered client device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_name: String,
    pub platform: Platform,
    pub app_version: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Get default device name from hostname
pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| format!("{} Device", Platform::current().as_str()))
}

// ============================================================================
// Remote Entities
// ============================================================================

/// An entity returned by a pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub entity_id: String,
    pub updated_at: DateTime<Utc>,
    pub payload: Value,
    #[serde(default)]
    pub deleted: bool,
}

/// Locally cached copy of an entity's last known state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub payload: Value,
    /// Remote timestamp this copy corresponds to, if it came from a pull
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_updated_at: Option<DateTime<Utc>>,
    pub stored_at: DateTime<Utc>,
}

/// Store key for an entity's cached state
pub fn entity_key(entity_type: &str, entity_id: &str) -> String {
    format!("entity:{}:{}", entity_type, entity_id)
}

// ============================================================================
// Engine Configuration
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub device_name: String,
    pub platform: Platform,
    pub app_version: String,
    pub user_id: String,

    /// Entity types pulled during a full sync, in order
    pub entity_types: Vec<String>,

    /// Policy for operations enqueued without an explicit one
    pub retry_policy: RetryPolicy,

    /// Strategy applied to conflicts discovered while syncing
    pub conflict_strategy: ConflictStrategy,

    /// Start the periodic drain, heartbeat and network-check loops
    pub background: bool,

    #[serde(with = "duration_secs")]
    pub drain_interval: Duration,
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_secs")]
    pub network_check_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            platform: Platform::current(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            user_id: "local".to_string(),
            entity_types: Vec::new(),
            retry_policy: RetryPolicy::default(),
            conflict_strategy: ConflictStrategy::Manual,
            background: true,
            drain_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5 * 60),
            network_check_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Overlay `SYNC_*` environment variables on the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("SYNC_DEVICE_NAME") {
            config.device_name = name;
        }
        if let Ok(user) = std::env::var("SYNC_USER_ID") {
            config.user_id = user;
        }
        if let Ok(types) = std::env::var("SYNC_ENTITY_TYPES") {
            config.entity_types = types
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = env_secs("SYNC_DRAIN_INTERVAL_SECS") {
            config.drain_interval = secs;
        }
        if let Some(secs) = env_secs("SYNC_HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = secs;
        }
        if let Some(secs) = env_secs("SYNC_CHECK_INTERVAL_SECS") {
            config.network_check_interval = secs;
        }

        config
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            device_name: self.device_name.clone(),
            platform: self.platform,
            app_version: self.app_version.clone(),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a number of seconds", key, raw);
            None
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================
