//! Sync Module - Offline-first record synchronization
//!
//! Components, leaf first:
//! - conflict: pure resolution of two divergent record versions
//! - queue: durable, ordered, per-record coalescing mutation queue
//! - worker: background tasks pushing queued mutations to the remote
//! - manager: public API, worker lifecycle and status
//!
//! Collaborators the engine consumes:
//! - api: remote sync endpoint (HTTP implementation included)
//! - store: local record persistence (SQLite implementation included)

pub mod api;
pub mod conflict;
pub mod manager;
pub mod models;
pub mod queue;
pub mod store;
pub mod worker;


// Re-export commonly used types
pub use api::{HttpSyncEndpoint, PushOutcome, RemoteSyncEndpoint, TransportError};
pub use conflict::{Conflict, ConflictResolver, ResolutionError};
pub use manager::{EnqueueReceipt, SyncError, SyncManager, SyncResult};
pub use models::{
    Actor, ConfigError, Record, ResolutionStrategy, Role, SyncConfig, SyncState, SyncStatus,
};
pub use queue::{
    BackoffPolicy, EntryStatus, FailureKind, Partition, QueueError, QueueStats, RequeueOutcome,
    SyncQueue, SyncQueueEntry,
};
pub use store::{RecordStore, SqliteRecordStore, StoreError};
pub use worker::{SyncWorker, WorkerContext};
