//! # Offline Sync
//!
//! An offline-first synchronization engine: local mutations are queued in
//! SQLite, pushed to a remote backend when the network allows, and
//! reconciled with remote changes through explicit conflict strategies.

pub mod db;
pub mod sync;

pub use db::{Database, DbError, DurableStore};
pub use sync::{EngineConfig, NetworkMonitor, SyncEngine, SyncError, SyncStats};
