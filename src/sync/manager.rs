//! Sync Manager - Orchestrates the sync engine
//!
//! Owns the queue, the worker lifecycle and the public API:
//! - Enqueue local mutations (durable, no network I/O)
//! - Start / pause / resume / shutdown of the background workers
//! - Status reporting
//! - Failed entry administration (retry, clear)

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::api::{RemoteSyncEndpoint, TransportError};
use super::conflict::ResolutionError;
use super::models::{ConfigError, Record, SyncConfig, SyncState, SyncStatus};
use super::queue::{Partition, QueueError, RequeueOutcome, SyncQueue, SyncQueueEntry};
use super::store::{RecordStore, SqliteRecordStore, StoreError};
use super::worker::{SyncWorker, WorkerContext};
use crate::audit::{AuditEvent, AuditEventType, AuditSink, LogAuditSink};
use crate::db::{Database, DbError};

/// Proof that a mutation was durably queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
    pub receipt_id: String,
    /// Queue entry holding the mutation (shared when coalesced)
    pub entry_id: i64,
    pub record_id: String,
    /// Version assigned to the mutation
    pub version: u64,
}

struct WorkerSet {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    ctx: WorkerContext,
    db: Arc<Database>,
    state: Arc<watch::Sender<SyncState>>,
    workers: Arc<StdMutex<Option<WorkerSet>>>,
}

impl SyncManager {
    /// Create a manager with explicit collaborators
    pub fn new(
        config: SyncConfig,
        db: Arc<Database>,
        store: Arc<dyn RecordStore>,
        endpoint: Arc<dyn RemoteSyncEndpoint>,
        audit: Arc<dyn AuditSink>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let (state, _) = watch::channel(SyncState::Stopped);
        let ctx = WorkerContext {
            queue: Arc::new(SyncQueue::new(db.clone())),
            store,
            endpoint,
            audit,
            config: Arc::new(config),
        };

        Ok(Self {
            ctx,
            db,
            state: Arc::new(state),
            workers: Arc::new(StdMutex::new(None)),
        })
    }

    /// Create a manager storing records in `db` and auditing to the log
    pub fn with_defaults(
        config: SyncConfig,
        db: Arc<Database>,
        endpoint: Arc<dyn RemoteSyncEndpoint>,
    ) -> SyncResult<Self> {
        let store = Arc::new(SqliteRecordStore::new(db.clone()));
        Self::new(config, db, store, endpoint, Arc::new(LogAuditSink))
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.ctx.queue
    }

    // ========================================================================
    // Enqueue
    // ========================================================================

    /// Durably queue a local mutation
    ///
    /// The record is written to local storage and the queue under the record
    /// lock. A version not above the stored one is bumped past it. The base
    /// version is the last one the remote acknowledged, never a local version
    /// still in flight or refused.
    pub fn enqueue(&self, mut record: Record) -> SyncResult<EnqueueReceipt> {
        record.validate().map_err(SyncError::Validation)?;

        let (entry_id, base_version) = {
            let _guard = self.ctx.queue.record_lock();

            let stored_version = self
                .ctx
                .store
                .get(&record.id)?
                .map(|stored| stored.version)
                .unwrap_or(0);
            if record.version <= stored_version {
                record.version = stored_version + 1;
            }

            let base_version = self.ctx.queue.remote_version(&record.id)?;
            self.ctx.store.put(&record)?;
            let entry_id = self.ctx.queue.enqueue(&record, base_version)?;
            (entry_id, base_version)
        };

        self.ctx.audit.record(
            AuditEvent::new(
                AuditEventType::Enqueued,
                record.id.clone(),
                json!({
                    "entry_id": entry_id,
                    "version": record.version,
                    "base_version": base_version,
                    "kind": record.kind,
                }),
            )
            .with_actor(record.updated_by.id.clone()),
        );

        Ok(EnqueueReceipt {
            receipt_id: Uuid::new_v4().to_string(),
            entry_id,
            record_id: record.id,
            version: record.version,
        })
    }

    // ========================================================================
    // Worker Lifecycle
    // ========================================================================

    /// Recover interrupted entries and spawn the background workers
    pub async fn start(&self) -> SyncResult<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        self.ctx.queue.recover_stale()?;

        let shutdown = CancellationToken::new();
        self.state.send_replace(SyncState::Running);

        let count = self.ctx.config.worker_count as u32;
        let handles = (0..count)
            .map(|index| {
                let worker = SyncWorker::new(
                    self.ctx.clone(),
                    Partition::new(index, count),
                    self.state.subscribe(),
                    shutdown.clone(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        *workers = Some(WorkerSet { shutdown, handles });

        log::info!("Sync manager started with {} worker(s)", count);
        Ok(())
    }

    /// Stop dequeuing once in-flight transmissions finish
    pub fn pause(&self) -> SyncResult<()> {
        self.ensure_running()?;
        self.state.send_replace(SyncState::Paused);
        log::info!("Sync paused");
        Ok(())
    }

    pub fn resume(&self) -> SyncResult<()> {
        self.ensure_running()?;
        self.state.send_replace(SyncState::Running);
        log::info!("Sync resumed");
        Ok(())
    }

    /// Cancel the workers, waiting up to the shutdown grace period
    ///
    /// Workers still busy after the grace period are aborted; their entries
    /// are recovered on the next start.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let set = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SyncError::NotRunning)?;

        set.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_grace();

        for mut handle in set.handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                log::warn!("Sync worker did not stop within grace period, aborting");
                handle.abort();
            }
        }

        self.state.send_replace(SyncState::Stopped);
        log::info!("Sync manager stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn ensure_running(&self) -> SyncResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(SyncError::NotRunning)
        }
    }

    // ========================================================================
    // Status & Administration
    // ========================================================================

    /// Eventually-consistent status snapshot
    pub fn status(&self) -> SyncResult<SyncStatus> {
        let stats = self.ctx.queue.stats()?;
        let last_sync_at: Option<DateTime<Utc>> = self.db.get_setting("last_sync_at")?;

        Ok(SyncStatus {
            queue_depth: stats.depth(),
            in_flight: stats.in_flight_count,
            failed_count: stats.failed_count,
            last_sync_at,
            state: *self.state.borrow(),
        })
    }

    pub fn failed_entries(&self) -> SyncResult<Vec<SyncQueueEntry>> {
        Ok(self.ctx.queue.failed_entries()?)
    }

    /// Give a failed entry a fresh retry budget
    pub fn retry_failed(&self, entry_id: i64) -> SyncResult<RequeueOutcome> {
        let _guard = self.ctx.queue.record_lock();
        Ok(self.ctx.queue.requeue(entry_id)?)
    }

    /// Permanently discard a failed entry
    pub fn clear_failed(&self, entry_id: i64) -> SyncResult<()> {
        Ok(self.ctx.queue.clear_failed(entry_id)?)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unresolved conflict: {0}")]
    Conflict(String),

    #[error("Resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Sync is already running")]
    AlreadyRunning,

    #[error("Sync is not running")]
    NotRunning,
}

pub type SyncResult<T> = Result<T, SyncError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::api::PushOutcome;
    use crate::sync::models::{Actor, Role};
    use async_trait::async_trait;
    use serde_json::Map;

    /// Endpoint that accepts everything
    struct AcceptAll;

    #[async_trait]
    impl RemoteSyncEndpoint for AcceptAll {
        async fn push(&self, record: &Record, _base: u64) -> Result<PushOutcome, TransportError> {
            Ok(PushOutcome::Accepted(record.clone()))
        }
    }

    fn create_test_manager() -> SyncManager {
        let db = Arc::new(Database::in_memory().expect("Failed to create test database"));
        SyncManager::with_defaults(SyncConfig::default(), db, Arc::new(AcceptAll)).unwrap()
    }

    fn record(id: &str, version: u64) -> Record {
        let mut record = Record::new(id, "patient", Actor::new("n-1", Role::Nurse), Map::new());
        record.version = version;
        record
    }

    #[test]
    fn test_manager_rejects_invalid_config() {
        let db = Arc::new(Database::in_memory().unwrap());
        let mut config = SyncConfig::default();
        config.max_attempts = 0;

        let result = SyncManager::with_defaults(config, db, Arc::new(AcceptAll));
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_enqueue_rejects_invalid_record() {
        let manager = create_test_manager();
        let result = manager.enqueue(record("", 1));
        assert!(matches!(result, Err(SyncError::Validation(_))));
        assert_eq!(manager.status().unwrap().queue_depth, 0);
    }

    #[test]
    fn test_enqueue_bumps_stale_version() {
        let manager = create_test_manager();

        let first = manager.enqueue(record("p-1", 1)).unwrap();
        assert_eq!(first.version, 1);

        // Same version again must still move forward
        let second = manager.enqueue(record("p-1", 1)).unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.entry_id, first.entry_id);
        assert_ne!(second.receipt_id, first.receipt_id);

        let entries = manager.queue().entries_for("p-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.version, 2);
        assert_eq!(entries[0].base_version, 0);
    }

    #[test]
    fn test_status_before_start() {
        let manager = create_test_manager();
        manager.enqueue(record("p-1", 1)).unwrap();

        let status = manager.status().unwrap();
        assert_eq!(status.state, SyncState::Stopped);
        assert_eq!(status.queue_depth, 1);
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.failed_count, 0);
        assert!(status.last_sync_at.is_none());
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let manager = create_test_manager();

        assert!(matches!(manager.pause(), Err(SyncError::NotRunning)));
        assert!(matches!(manager.shutdown().await, Err(SyncError::NotRunning)));

        manager.start().await.unwrap();
        assert!(matches!(manager.start().await, Err(SyncError::AlreadyRunning)));

        manager.pause().unwrap();
        assert_eq!(manager.status().unwrap().state, SyncState::Paused);
        manager.resume().unwrap();
        assert_eq!(manager.status().unwrap().state, SyncState::Running);

        manager.shutdown().await.unwrap();
        assert!(!manager.is_running());
        assert_eq!(manager.status().unwrap().state, SyncState::Stopped);
    }

    #[test]
    fn test_failed_entry_admin_unknown_id() {
        let manager = create_test_manager();
        assert!(matches!(
            manager.retry_failed(99),
            Err(SyncError::Queue(QueueError::EntryNotFound(99)))
        ));
        assert!(matches!(
            manager.clear_failed(99),
            Err(SyncError::Queue(QueueError::EntryNotFound(99)))
        ));
    }
}
