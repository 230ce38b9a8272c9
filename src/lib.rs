//! # Clinisync
//!
//! Offline-first record synchronization and conflict resolution engine.
//!
//! Local mutations are queued durably in SQLite, pushed to a remote authority
//! by background workers when connectivity permits, and reconciled with
//! divergent remote versions using a deterministic resolution policy.

pub mod audit;
pub mod db;
pub mod sync;

pub use audit::{AuditEvent, AuditEventType, AuditSink, ChannelAuditSink, LogAuditSink};
pub use db::{Database, DbError};
pub use sync::{
    Actor, ConflictResolver, EnqueueReceipt, HttpSyncEndpoint, PushOutcome, Record,
    RecordStore, RemoteSyncEndpoint, ResolutionStrategy, Role, SqliteRecordStore, SyncConfig,
    SyncError, SyncManager, SyncState, SyncStatus,
};
