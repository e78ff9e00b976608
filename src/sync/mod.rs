//! Sync Module - Offline-First Data Synchronization
//!
//! Provides:
//! - A durable, priority-ordered queue of local mutations
//! - Retry with fixed, linear or exponential backoff
//! - Conflict detection and resolution (use local, use cloud, merge, manual)
//! - Network monitoring with change notifications
//! - Device registration and heartbeat
//!
//! Architecture:
//! - `SyncEngine` owns the queue, the conflict resolver and the stats
//! - `NetworkMonitor` gates draining on connectivity
//! - `RemoteBackend` is the only path to the server

pub mod api;
pub mod conflict;
pub mod engine;
pub mod models;
pub mod network;
pub mod observers;
pub mod queue;
pub mod scheduler;


// Re-export commonly used types
pub use models::{
    BackoffKind, CachedEntity, ConflictCase, ConflictStrategy, DeviceInfo, DeviceRecord,
    EngineConfig, OperationKind, OperationStatus, Origin, Platform, Priority, QueueEntry,
    RemoteEntity, RetryPolicy, SyncOperation, SyncStats,
};

pub use api::{HttpBackend, RemoteBackend, SyncApiError};
pub use conflict::{ConflictError, ConflictResolver, FollowUp, ResolvedOutcome};
pub use engine::{DrainReport, EngineState, SyncEngine, SyncError};
pub use network::{
    ConnectionClass, ConnectionQuality, HttpProbe, NetworkMonitor, NetworkStatus, Probe,
    ProbeError, ProbeReport,
};
pub use observers::{ObserverRegistry, SubscriptionId};
pub use queue::{backoff_delay_ms, QueueError, SyncQueue};
pub use scheduler::{BackgroundScheduler, BackgroundWork, SchedulerConfig, SchedulerError};
