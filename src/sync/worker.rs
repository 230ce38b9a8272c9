//! Background Sync Worker
//!
//! One tokio task per partition. Each worker drains its slice of the queue in
//! order, pushes mutations to the remote endpoint and applies the outcome.
//! Idle workers sleep until the queue signals new work, a deferred entry
//! becomes eligible, or the poll interval elapses.

use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::api::{PushOutcome, RemoteSyncEndpoint, TransportError};
use super::conflict::Conflict;
use super::manager::{SyncError, SyncResult};
use super::models::{Record, ResolutionStrategy, SyncConfig, SyncState};
use super::queue::{FailureKind, Partition, SyncQueue, SyncQueueEntry};
use super::store::RecordStore;
use crate::audit::{AuditEvent, AuditEventType, AuditSink};

/// Collaborators shared by the manager and every worker
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: Arc<SyncQueue>,
    pub store: Arc<dyn RecordStore>,
    pub endpoint: Arc<dyn RemoteSyncEndpoint>,
    pub audit: Arc<dyn AuditSink>,
    pub config: Arc<SyncConfig>,
}

/// Background worker owning one partition of the queue
pub struct SyncWorker {
    ctx: WorkerContext,
    partition: Partition,
    run_state: watch::Receiver<SyncState>,
    shutdown: CancellationToken,
}

impl SyncWorker {
    pub fn new(
        ctx: WorkerContext,
        partition: Partition,
        run_state: watch::Receiver<SyncState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            partition,
            run_state,
            shutdown,
        }
    }

    /// Worker loop (runs in spawned task until cancelled)
    pub async fn run(mut self) {
        let mut signal = self.ctx.queue.subscribe();

        log::info!(
            "Sync worker {}/{} started",
            self.partition.index + 1,
            self.partition.count
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if *self.run_state.borrow_and_update() == SyncState::Paused {
                if !self.wait_for_resume().await {
                    break;
                }
                continue;
            }

            // Mark the signal seen before looking, so a concurrent enqueue
            // always wakes the idle wait below
            signal.borrow_and_update();

            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {
                    if !self.wait_for_work(&mut signal).await {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Sync worker {} error: {}", self.partition.index + 1, e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.ctx.config.poll_interval()) => {}
                    }
                }
            }
        }

        log::info!("Sync worker {} exited", self.partition.index + 1);
    }

    /// Returns false when the worker should exit
    async fn wait_for_resume(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            changed = self.run_state.changed() => changed.is_ok(),
        }
    }

    /// Returns false when the worker should exit
    async fn wait_for_work(&mut self, signal: &mut watch::Receiver<u64>) -> bool {
        let poll = self.ctx.config.poll_interval();
        let wait = match self.ctx.queue.next_eligible_in(self.partition) {
            Ok(Some(eligible_in)) => eligible_in.min(poll),
            Ok(None) => poll,
            Err(e) => {
                log::warn!("Failed to read next retry time: {}", e);
                poll
            }
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            changed = self.run_state.changed() => changed.is_ok(),
            _ = signal.changed() => true,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    /// Transmit the next eligible entry, if any
    ///
    /// Returns whether an entry was processed.
    pub async fn process_next(&self) -> SyncResult<bool> {
        let Some(mut entry) = self.ctx.queue.dequeue_next(self.partition)? else {
            return Ok(false);
        };

        log::debug!(
            "Pushing {} version {} (base {}, attempt {})",
            entry.record_id,
            entry.record.version,
            entry.base_version,
            entry.attempt_count + 1
        );

        let outcome = self.push(&entry).await;
        let handled = match outcome {
            Ok(PushOutcome::Accepted(accepted)) => self.on_accepted(&entry, accepted),
            Ok(PushOutcome::Conflict(remote)) => self.on_conflict(&entry, remote),
            Ok(PushOutcome::Rejected(reason)) => self.fail(
                &entry,
                FailureKind::Validation,
                &SyncError::Validation(reason).to_string(),
            ),
            Err(e) => self.on_transport_error(&mut entry, e),
        };

        if let Err(e) = handled {
            // Put it back in line rather than leaving it stuck in flight
            log::error!("Failed to apply push outcome for entry {}: {}", entry.seq, e);
            self.ctx
                .queue
                .defer(&entry, &e.to_string(), self.ctx.config.poll_interval())?;
        }

        Ok(true)
    }

    async fn push(&self, entry: &SyncQueueEntry) -> Result<PushOutcome, TransportError> {
        let timeout = self.ctx.config.request_timeout();
        let outcome = tokio::time::timeout(
            timeout,
            self.ctx.endpoint.push(&entry.record, entry.base_version),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

        // A reply about some other record is as good as no reply
        match &outcome {
            PushOutcome::Accepted(remote) | PushOutcome::Conflict(remote) => {
                if remote.id != entry.record_id {
                    return Err(TransportError::InvalidResponse(format!(
                        "expected record {}, got {}",
                        entry.record_id, remote.id
                    )));
                }
                remote.validate().map_err(TransportError::InvalidResponse)?;
            }
            PushOutcome::Rejected(_) => {}
        }

        Ok(outcome)
    }

    fn on_accepted(&self, entry: &SyncQueueEntry, accepted: Record) -> SyncResult<()> {
        {
            // A newer local mutation keeps its content and moves onto the
            // accepted version
            let _guard = self.ctx.queue.record_lock();
            self.ctx
                .queue
                .mark_synced(entry, &accepted, self.ctx.store.as_ref())?;
        }

        self.emit(
            entry,
            AuditEventType::Synced,
            json!({
                "version": accepted.version,
                "base_version": entry.base_version,
                "attempts": entry.attempt_count + 1,
            }),
        );
        Ok(())
    }

    fn on_conflict(&self, entry: &SyncQueueEntry, remote: Record) -> SyncResult<()> {
        self.ctx.queue.mark_conflicted(entry)?;

        // A retransmitted resolution only gets one more chance
        let strategy = if entry.conflict_rounds == 0 {
            self.ctx.config.strategy_for(&entry.record.kind)
        } else {
            ResolutionStrategy::Timestamp
        };

        let conflict = Conflict::new(entry.record.clone(), remote);
        let resolved = match conflict.resolve(strategy) {
            Ok(resolved) => resolved,
            Err(e) => {
                return self.fail(entry, FailureKind::Resolution, &SyncError::from(e).to_string())
            }
        };
        let remote = conflict.remote;

        log::info!(
            "Conflict on {}: local v{} vs remote v{}, resolved with {}",
            entry.record_id,
            entry.record.version,
            remote.version,
            strategy.as_str()
        );

        let outcome = {
            let _guard = self.ctx.queue.record_lock();

            if self.ctx.queue.has_pending(&entry.record_id)? {
                // The newer mutation resolves on its own transmission
                self.ctx.queue.retire(entry)?;
                "superseded"
            } else if resolved.same_content(&remote) {
                self.ctx
                    .queue
                    .mark_synced(entry, &remote, self.ctx.store.as_ref())?;
                "remote_kept"
            } else if entry.conflict_rounds == 0 {
                let mut resolved = resolved;
                resolved.version = resolved.version.max(remote.version.saturating_add(1));
                self.ctx.store.put(&resolved)?;
                if self.ctx.queue.requeue_resolution(entry, &resolved, remote.version)? {
                    "retransmit"
                } else {
                    "superseded"
                }
            } else {
                "unresolved"
            }
        };

        self.emit(
            entry,
            AuditEventType::Conflicted,
            json!({
                "strategy": strategy.as_str(),
                "local_version": entry.record.version,
                "remote_version": remote.version,
                "round": entry.conflict_rounds + 1,
                "outcome": outcome,
            }),
        );

        if outcome == "unresolved" {
            return self.fail(
                entry,
                FailureKind::Resolution,
                &SyncError::Conflict(format!(
                    "remote version {} not settled after retransmission",
                    remote.version
                ))
                .to_string(),
            );
        }
        Ok(())
    }

    fn on_transport_error(&self, entry: &mut SyncQueueEntry, error: TransportError) -> SyncResult<()> {
        entry.attempt_count += 1;
        let max_attempts = self.ctx.config.max_attempts;

        if entry.attempt_count >= max_attempts {
            let exhausted = SyncError::ExhaustedRetries {
                attempts: entry.attempt_count,
                last_error: error.to_string(),
            };
            return self.fail(entry, FailureKind::ExhaustedRetries, &exhausted.to_string());
        }

        let delay = self.ctx.config.backoff().delay(entry.attempt_count);
        log::warn!(
            "Push of {} failed (attempt {}/{}): {}",
            entry.record_id,
            entry.attempt_count,
            max_attempts,
            error
        );
        self.ctx.queue.defer(entry, &error.to_string(), delay)?;
        Ok(())
    }

    fn fail(&self, entry: &SyncQueueEntry, failure: FailureKind, error: &str) -> SyncResult<()> {
        self.ctx.queue.mark_failed(entry, failure, error)?;
        self.emit(
            entry,
            AuditEventType::Failed,
            json!({
                "failure": failure.as_str(),
                "error": error,
                "attempts": entry.attempt_count,
            }),
        );
        Ok(())
    }

    fn emit(&self, entry: &SyncQueueEntry, event_type: AuditEventType, details: serde_json::Value) {
        self.ctx.audit.record(
            AuditEvent::new(event_type, entry.record_id.clone(), details)
                .with_actor(entry.record.updated_by.id.clone()),
        );
    }
}

