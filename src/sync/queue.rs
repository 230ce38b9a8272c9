//! Sync Queue Module - Durable, ordered queue of local mutations
//!
//! Every local mutation is written here before the caller gets a receipt and
//! stays until the remote acknowledges it or it is explicitly cleared.
//!
//! Features:
//! - SQLite-backed persistent queue (survives crashes and restarts)
//! - Per-record coalescing: only the latest local state is transmitted
//! - Strict per-record ordering (one active transmission per record)
//! - Exponential backoff with jitter for transport failures
//! - Hash partitioning so several workers never share a record
//! - Change signal so idle workers wake without polling the table

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use super::models::Record;
use super::store::{RecordStore, StoreError};
use crate::db::{Database, DbError};

const ENTRY_COLUMNS: &str = "seq, record_id, partition_key, record, base_version, status, \
     attempt_count, conflict_rounds, last_error, failure, enqueued_at, next_attempt_at, updated_at";

// ============================================================================
// Data Types
// ============================================================================

/// Queue entry status
///
/// `Synced` is terminal and never stored: acknowledged rows are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    InFlight,
    Synced,
    Conflicted,
    Failed,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Synced => "synced",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "in_flight" => Self::InFlight,
            "synced" => Self::Synced,
            "conflicted" => Self::Conflicted,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Why an entry stopped being retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Remote refused the mutation as invalid
    Validation,
    /// Conflict could not be settled
    Resolution,
    /// Transport failed `max_attempts` times
    ExhaustedRetries,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Resolution => "resolution",
            Self::ExhaustedRetries => "exhausted_retries",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(Self::Validation),
            "resolution" => Some(Self::Resolution),
            "exhausted_retries" => Some(Self::ExhaustedRetries),
            _ => None,
        }
    }
}

/// Queue entry stored in database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    /// Insertion order, also the entry id used by admin operations
    pub seq: i64,
    pub record_id: String,
    pub partition_key: u32,
    pub record: Record,
    /// Remote version this mutation was derived from
    pub base_version: u64,
    pub status: EntryStatus,
    pub attempt_count: u32,
    pub conflict_rounds: u32,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
    pub enqueued_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: usize,
    pub in_flight_count: usize,
    pub conflicted_count: usize,
    pub failed_count: usize,
}

impl QueueStats {
    /// Entries not yet settled (failed entries excluded)
    pub fn depth(&self) -> usize {
        self.pending_count + self.in_flight_count + self.conflicted_count
    }
}

/// Outcome of moving a failed entry back into the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued,
    /// A newer mutation for the same record is already queued; the failed
    /// entry was dropped in its favour
    Superseded,
}

/// Slice of the record-id space owned by one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub index: u32,
    pub count: u32,
}

impl Partition {
    pub fn new(index: u32, count: u32) -> Self {
        let count = count.max(1);
        Self {
            index: index % count,
            count,
        }
    }

    /// The whole queue
    pub fn all() -> Self {
        Self::new(0, 1)
    }

    pub fn owns(&self, partition_key: u32) -> bool {
        partition_key % self.count == self.index
    }
}

/// Stable partition key for a record id: first four bytes of SHA-256(id)
pub fn partition_key(record_id: &str) -> u32 {
    let digest = Sha256::digest(record_id.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential backoff with bounded random jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the computed delay added as random jitter (0.0 - 1.0)
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Delay before retrying after `attempt` failures, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);

        Duration::from_millis(base_ms.saturating_mul(1u64 << exponent).min(max_ms))
    }

    /// Delay before retrying after `attempt` failures
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let spread_ms = (delay.as_millis() as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        if spread_ms == 0 {
            return delay;
        }

        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread_ms))
    }
}

// ============================================================================
// Sync Queue
// ============================================================================

/// Durable mutation queue shared by the manager and all workers
pub struct SyncQueue {
    db: Arc<Database>,
    signal: watch::Sender<u64>,
    record_lock: Mutex<()>,
}

impl SyncQueue {
    pub fn new(db: Arc<Database>) -> Self {
        let (signal, _) = watch::channel(0);
        Self {
            db,
            signal,
            record_lock: Mutex::new(()),
        }
    }

    /// Receiver bumped whenever work may have become available
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.signal.subscribe()
    }

    fn notify(&self) {
        self.signal.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Process-wide lock for operations spanning the record store and queue
    ///
    /// Never hold the guard across an `.await`.
    pub fn record_lock(&self) -> MutexGuard<'_, ()> {
        self.record_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a mutation, coalescing with a queued one for the same record
    ///
    /// Returns the entry id. Durable once this returns.
    pub fn enqueue(&self, record: &Record, base_version: u64) -> QueueResult<i64> {
        let body = encode_record(record)?;
        let key = partition_key(&record.id);
        let now = now_ms();

        let (seq, coalesced) = self.db.write_transaction(|tx| -> QueueResult<(i64, bool)> {
            if let Some(seq) = pending_seq(tx, &record.id)? {
                tx.execute(
                    "UPDATE sync_queue SET record = ?1, updated_at = ?2 WHERE seq = ?3",
                    params![body, now, seq],
                )?;
                return Ok((seq, true));
            }

            tx.execute(
                r#"
                INSERT INTO sync_queue (
                    record_id, partition_key, record, base_version, status,
                    enqueued_at, next_attempt_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5, ?5)
                "#,
                params![record.id, key as i64, body, base_version as i64, now],
            )?;
            Ok((tx.last_insert_rowid(), false))
        })?;

        if coalesced {
            log::debug!("Coalesced mutation for {} into entry {}", record.id, seq);
        } else {
            log::debug!("Queued mutation for {} as entry {} (base {})", record.id, seq, base_version);
        }

        self.notify();
        Ok(seq)
    }

    /// Claim the oldest eligible pending entry in `partition`
    pub fn dequeue_next(&self, partition: Partition) -> QueueResult<Option<SyncQueueEntry>> {
        let now = now_ms();

        self.db.write_transaction(|tx| -> QueueResult<Option<SyncQueueEntry>> {
            let sql = format!(
                r#"
                SELECT {} FROM sync_queue q
                WHERE q.status = 'pending'
                  AND q.next_attempt_at <= ?1
                  AND q.partition_key % ?2 = ?3
                  AND NOT EXISTS (
                      SELECT 1 FROM sync_queue a
                      WHERE a.record_id = q.record_id
                        AND a.status IN ('in_flight', 'conflicted')
                  )
                ORDER BY q.enqueued_at ASC, q.seq ASC
                LIMIT 1
                "#,
                ENTRY_COLUMNS
            );

            let entry = tx
                .query_row(
                    &sql,
                    params![now, partition.count as i64, partition.index as i64],
                    entry_from_row,
                )
                .optional()?;

            let Some(mut entry) = entry else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE sync_queue SET status = 'in_flight', updated_at = ?1 WHERE seq = ?2",
                params![now, entry.seq],
            )?;
            entry.status = EntryStatus::InFlight;
            Ok(Some(entry))
        })
    }

    /// Remote acknowledged the entry
    ///
    /// In one transaction: a newer pending mutation is rebased onto the
    /// accepted version and stored locally (otherwise `accepted` is), the
    /// entry is removed, the acknowledged version is remembered as the base
    /// for later mutations, and `last_sync_at` is stamped. Returns the record
    /// now held in `store`.
    pub fn mark_synced(
        &self,
        entry: &SyncQueueEntry,
        accepted: &Record,
        store: &dyn RecordStore,
    ) -> QueueResult<Record> {
        let stamp = serde_json::to_string(&Utc::now())
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let now = now_ms();

        let local = self.db.write_transaction(|tx| -> QueueResult<Record> {
            let local = rebase_pending(tx, &entry.record_id, accepted.version, now)?
                .unwrap_or_else(|| accepted.clone());
            store.put_in(tx, &local)?;

            tx.execute("DELETE FROM sync_queue WHERE seq = ?1", params![entry.seq])?;
            tx.execute(
                r#"
                INSERT INTO sync_remote_versions (record_id, version, synced_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(record_id) DO UPDATE SET
                    version = MAX(version, excluded.version),
                    synced_at = excluded.synced_at
                "#,
                params![entry.record_id, accepted.version as i64, now],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES ('last_sync_at', ?1)",
                params![stamp],
            )?;
            Ok(local)
        })?;

        log::info!(
            "Entry {} synced ({} at version {})",
            entry.seq, entry.record_id, accepted.version
        );
        self.notify();
        Ok(local)
    }

    /// Last version of the record the remote acknowledged (0 if never)
    pub fn remote_version(&self, record_id: &str) -> QueueResult<u64> {
        let version: i64 = self.db.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM sync_remote_versions WHERE record_id = ?1",
            params![record_id],
            |row| row.get(0),
        )?;
        Ok(version as u64)
    }

    /// Remove an in-flight entry superseded by a newer local mutation
    ///
    /// The pending mutation takes over the entry's base version when it is
    /// older, so the remote still sees every edit it has not acknowledged.
    pub fn retire(&self, entry: &SyncQueueEntry) -> QueueResult<()> {
        self.db.write_transaction(|tx| -> QueueResult<()> {
            hand_over_base(tx, entry)?;
            tx.execute("DELETE FROM sync_queue WHERE seq = ?1", params![entry.seq])?;
            Ok(())
        })?;

        log::info!("Entry {} retired in favour of a newer mutation", entry.seq);
        self.notify();
        Ok(())
    }

    pub fn mark_conflicted(&self, entry: &SyncQueueEntry) -> QueueResult<()> {
        self.transition(entry.seq, EntryStatus::Conflicted)
    }

    /// Stop retrying an entry; it stays queryable until cleared
    pub fn mark_failed(
        &self,
        entry: &SyncQueueEntry,
        failure: FailureKind,
        error: &str,
    ) -> QueueResult<()> {
        log::warn!(
            "Entry {} for {} failed ({}): {}",
            entry.seq,
            entry.record_id,
            failure.as_str(),
            error
        );

        let updated = self.db.execute(
            r#"
            UPDATE sync_queue
            SET status = 'failed', failure = ?1, last_error = ?2,
                attempt_count = ?3, updated_at = ?4
            WHERE seq = ?5
            "#,
            params![
                failure.as_str(),
                error,
                entry.attempt_count,
                now_ms(),
                entry.seq
            ],
        )?;

        if updated == 0 {
            return Err(QueueError::EntryNotFound(entry.seq));
        }
        Ok(())
    }

    /// Return an entry to Pending, not eligible again for `delay`
    ///
    /// Records `entry.attempt_count` as the number of failed attempts so far.
    pub fn defer(&self, entry: &SyncQueueEntry, error: &str, delay: Duration) -> QueueResult<()> {
        let now = now_ms();
        // +1 so the measured wait is never shorter than `delay`
        let eligible_at = now + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2) + 1;

        self.db.write_transaction(|tx| -> QueueResult<()> {
            release_to_pending(tx, entry, entry.attempt_count, eligible_at, Some(error), now)
        })?;

        log::info!(
            "Entry {} will retry in {:?} (attempt {})",
            entry.seq,
            delay,
            entry.attempt_count + 1
        );
        self.notify();
        Ok(())
    }

    /// Queue a conflict resolution for retransmission
    ///
    /// Returns `false` when a newer local mutation is already pending, in
    /// which case the in-flight entry is dropped instead.
    pub fn requeue_resolution(
        &self,
        entry: &SyncQueueEntry,
        resolved: &Record,
        base_version: u64,
    ) -> QueueResult<bool> {
        let body = encode_record(resolved)?;
        let now = now_ms();

        let requeued = self.db.write_transaction(|tx| -> QueueResult<bool> {
            if pending_seq(tx, &entry.record_id)?.is_some() {
                hand_over_base(tx, entry)?;
                tx.execute("DELETE FROM sync_queue WHERE seq = ?1", params![entry.seq])?;
                return Ok(false);
            }

            tx.execute(
                r#"
                UPDATE sync_queue
                SET status = 'pending', record = ?1, base_version = ?2,
                    conflict_rounds = conflict_rounds + 1, attempt_count = 0,
                    last_error = NULL, next_attempt_at = ?3, updated_at = ?3
                WHERE seq = ?4
                "#,
                params![body, base_version as i64, now, entry.seq],
            )?;
            Ok(true)
        })?;

        if requeued {
            log::info!(
                "Entry {} requeued with resolved version {} (base {})",
                entry.seq, resolved.version, base_version
            );
        }
        self.notify();
        Ok(requeued)
    }

    /// Move a failed entry back to Pending with a fresh retry budget
    pub fn requeue(&self, seq: i64) -> QueueResult<RequeueOutcome> {
        let now = now_ms();

        let outcome = self.db.write_transaction(|tx| -> QueueResult<RequeueOutcome> {
            let record_id: Option<String> = tx
                .query_row(
                    "SELECT record_id FROM sync_queue WHERE seq = ?1 AND status = 'failed'",
                    params![seq],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(record_id) = record_id else {
                return Err(QueueError::EntryNotFound(seq));
            };

            let newer: i64 = tx.query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE record_id = ?1 AND seq > ?2",
                params![record_id, seq],
                |row| row.get(0),
            )?;
            if newer > 0 {
                tx.execute("DELETE FROM sync_queue WHERE seq = ?1", params![seq])?;
                return Ok(RequeueOutcome::Superseded);
            }

            tx.execute(
                r#"
                UPDATE sync_queue
                SET status = 'pending', attempt_count = 0, conflict_rounds = 0,
                    failure = NULL, last_error = NULL,
                    next_attempt_at = ?1, updated_at = ?1
                WHERE seq = ?2
                "#,
                params![now, seq],
            )?;
            Ok(RequeueOutcome::Requeued)
        })?;

        log::info!("Failed entry {} requeued: {:?}", seq, outcome);
        self.notify();
        Ok(outcome)
    }

    /// Reset entries left InFlight or Conflicted by a crash
    pub fn recover_stale(&self) -> QueueResult<usize> {
        let now = now_ms();

        let recovered = self.db.write_transaction(|tx| -> QueueResult<usize> {
            let sql = format!(
                "SELECT {} FROM sync_queue WHERE status IN ('in_flight', 'conflicted') ORDER BY seq",
                ENTRY_COLUMNS
            );
            let stale = {
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map([], entry_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            for entry in &stale {
                release_to_pending(tx, entry, entry.attempt_count, now, entry.last_error.as_deref(), now)?;
            }
            Ok(stale.len())
        })?;

        if recovered > 0 {
            log::warn!("Recovered {} interrupted queue entries", recovered);
            self.notify();
        }
        Ok(recovered)
    }

    /// Whether a not-yet-transmitted mutation exists for the record
    pub fn has_pending(&self, record_id: &str) -> QueueResult<bool> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE record_id = ?1 AND status = 'pending'",
            params![record_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueResult<QueueStats> {
        let rows: Vec<(String, i64)> = self.db.query(
            "SELECT status, COUNT(*) FROM sync_queue GROUP BY status",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let count = count as usize;
            match EntryStatus::from_str(&status) {
                EntryStatus::Pending => stats.pending_count += count,
                EntryStatus::InFlight => stats.in_flight_count += count,
                EntryStatus::Conflicted => stats.conflicted_count += count,
                EntryStatus::Failed => stats.failed_count += count,
                EntryStatus::Synced => {}
            }
        }
        Ok(stats)
    }

    pub fn failed_entries(&self) -> QueueResult<Vec<SyncQueueEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_queue WHERE status = 'failed' ORDER BY seq",
            ENTRY_COLUMNS
        );
        Ok(self.db.query(&sql, [], entry_from_row)?)
    }

    /// All queued entries for a record, oldest first
    pub fn entries_for(&self, record_id: &str) -> QueueResult<Vec<SyncQueueEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_queue WHERE record_id = ?1 ORDER BY seq",
            ENTRY_COLUMNS
        );
        Ok(self.db.query(&sql, params![record_id], entry_from_row)?)
    }

    /// Delete a failed entry (manual action)
    pub fn clear_failed(&self, seq: i64) -> QueueResult<()> {
        let deleted = self.db.execute(
            "DELETE FROM sync_queue WHERE seq = ?1 AND status = 'failed'",
            params![seq],
        )?;
        if deleted == 0 {
            return Err(QueueError::EntryNotFound(seq));
        }

        log::info!("Cleared failed queue entry {}", seq);
        Ok(())
    }

    /// Time until the next deferred entry in `partition` becomes eligible
    pub fn next_eligible_in(&self, partition: Partition) -> QueueResult<Option<Duration>> {
        let next: Option<i64> = self.db.query_row(
            r#"
            SELECT MIN(q.next_attempt_at) FROM sync_queue q
            WHERE q.status = 'pending'
              AND q.partition_key % ?1 = ?2
              AND NOT EXISTS (
                  SELECT 1 FROM sync_queue a
                  WHERE a.record_id = q.record_id
                    AND a.status IN ('in_flight', 'conflicted')
              )
            "#,
            params![partition.count as i64, partition.index as i64],
            |row| row.get(0),
        )?;

        Ok(next.map(|at| Duration::from_millis(at.saturating_sub(now_ms()).max(0) as u64)))
    }

    fn transition(&self, seq: i64, status: EntryStatus) -> QueueResult<()> {
        let updated = self.db.execute(
            "UPDATE sync_queue SET status = ?1, updated_at = ?2 WHERE seq = ?3",
            params![status.as_str(), now_ms(), seq],
        )?;
        if updated == 0 {
            return Err(QueueError::EntryNotFound(seq));
        }
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn encode_record(record: &Record) -> QueueResult<String> {
    serde_json::to_string(record).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn decode_record(body: &str) -> QueueResult<Record> {
    serde_json::from_str(body).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn pending_seq(tx: &Transaction<'_>, record_id: &str) -> rusqlite::Result<Option<i64>> {
    tx.query_row(
        "SELECT seq FROM sync_queue WHERE record_id = ?1 AND status = 'pending'",
        params![record_id],
        |row| row.get(0),
    )
    .optional()
}

/// Point a queued mutation at a newly accepted remote version
///
/// Returns the rebased record when a pending mutation exists.
fn rebase_pending(
    tx: &Transaction<'_>,
    record_id: &str,
    accepted_version: u64,
    now: i64,
) -> QueueResult<Option<Record>> {
    let Some(seq) = pending_seq(tx, record_id)? else {
        return Ok(None);
    };

    let body: String = tx.query_row(
        "SELECT record FROM sync_queue WHERE seq = ?1",
        params![seq],
        |row| row.get(0),
    )?;
    let mut record = decode_record(&body)?;
    if record.version <= accepted_version {
        record.version = accepted_version + 1;
    }

    tx.execute(
        "UPDATE sync_queue SET record = ?1, base_version = ?2, updated_at = ?3 WHERE seq = ?4",
        params![encode_record(&record)?, accepted_version as i64, now, seq],
    )?;
    Ok(Some(record))
}

/// Give a pending mutation the older of its own and `entry`'s base versions
fn hand_over_base(tx: &Transaction<'_>, entry: &SyncQueueEntry) -> rusqlite::Result<usize> {
    tx.execute(
        r#"
        UPDATE sync_queue SET base_version = MIN(base_version, ?1)
        WHERE record_id = ?2 AND status = 'pending' AND seq != ?3
        "#,
        params![entry.base_version as i64, entry.record_id, entry.seq],
    )
}

/// Put an active entry back in line
///
/// If a newer mutation for the record is already pending, the two are folded:
/// the newer record keeps its content but inherits this entry's position,
/// base version and retry state, and this entry is removed.
fn release_to_pending(
    tx: &Transaction<'_>,
    entry: &SyncQueueEntry,
    attempt_count: u32,
    eligible_at: i64,
    error: Option<&str>,
    now: i64,
) -> QueueResult<()> {
    let newer = pending_seq(tx, &entry.record_id)?.filter(|seq| *seq != entry.seq);

    match newer {
        Some(newer) => {
            tx.execute(
                r#"
                UPDATE sync_queue
                SET base_version = ?1, enqueued_at = ?2, attempt_count = ?3,
                    next_attempt_at = ?4, last_error = ?5, updated_at = ?6
                WHERE seq = ?7
                "#,
                params![
                    entry.base_version as i64,
                    entry.enqueued_at.timestamp_millis(),
                    attempt_count,
                    eligible_at,
                    error,
                    now,
                    newer
                ],
            )?;
            tx.execute("DELETE FROM sync_queue WHERE seq = ?1", params![entry.seq])?;
        }
        None => {
            tx.execute(
                r#"
                UPDATE sync_queue
                SET status = 'pending', attempt_count = ?1, next_attempt_at = ?2,
                    last_error = ?3, updated_at = ?4
                WHERE seq = ?5
                "#,
                params![attempt_count, eligible_at, error, now, entry.seq],
            )?;
        }
    }
    Ok(())
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<SyncQueueEntry> {
    let body: String = row.get(3)?;
    let record: Record = serde_json::from_str(&body).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(SyncQueueEntry {
        seq: row.get(0)?,
        record_id: row.get(1)?,
        partition_key: row.get::<_, i64>(2)? as u32,
        record,
        base_version: row.get::<_, i64>(4)? as u64,
        status: EntryStatus::from_str(&row.get::<_, String>(5)?),
        attempt_count: row.get(6)?,
        conflict_rounds: row.get(7)?,
        last_error: row.get(8)?,
        failure: row
            .get::<_, Option<String>>(9)?
            .and_then(|s| FailureKind::from_str(&s)),
        enqueued_at: from_ms(row.get(10)?),
        next_attempt_at: from_ms(row.get(11)?),
        updated_at: from_ms(row.get(12)?),
    })
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Queue entry not found: {0}")]
    EntryNotFound(i64),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Database(DbError::from(e))
    }
}

pub type QueueResult<T> = Result<T, QueueError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{Actor, Role};
    use crate::sync::store::SqliteRecordStore;
    use serde_json::{json, Map};

    fn create_test_queue() -> SyncQueue {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        SyncQueue::new(db)
    }

    fn create_queue_with_store() -> (SyncQueue, SqliteRecordStore) {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        (SyncQueue::new(db.clone()), SqliteRecordStore::new(db))
    }

    fn record(id: &str, version: u64, bed: i64) -> Record {
        let mut payload = Map::new();
        payload.insert("bed".to_string(), json!(bed));
        let mut record = Record::new(id, "patient", Actor::new("n-1", Role::Nurse), payload);
        record.version = version;
        record
    }

    #[test]
    fn test_queue_creation() {
        let queue = create_test_queue();
        assert_eq!(queue.stats().unwrap(), QueueStats::default());
        assert!(queue.dequeue_next(Partition::all()).unwrap().is_none());
    }

    #[test]
    fn test_enqueue_and_dequeue() {
        let queue = create_test_queue();
        let seq = queue.enqueue(&record("p-1", 1, 3), 0).unwrap();
        assert!(seq > 0);

        let entry = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        assert_eq!(entry.seq, seq);
        assert_eq!(entry.status, EntryStatus::InFlight);
        assert_eq!(entry.base_version, 0);
        assert_eq!(entry.record.payload["bed"], json!(3));
        assert_eq!(entry.partition_key, partition_key("p-1"));

        let stats = queue.stats().unwrap();
        assert_eq!(stats.in_flight_count, 1);
        assert_eq!(stats.pending_count, 0);
    }

    #[test]
    fn test_dequeue_in_enqueue_order() {
        let queue = create_test_queue();
        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        queue.enqueue(&record("p-2", 1, 1), 0).unwrap();
        queue.enqueue(&record("p-3", 1, 1), 0).unwrap();

        let ids: Vec<String> = (0..3)
            .map(|_| queue.dequeue_next(Partition::all()).unwrap().unwrap().record_id)
            .collect();
        assert_eq!(ids, vec!["p-1", "p-2", "p-3"]);
    }

    #[test]
    fn test_coalescing_keeps_position_and_base() {
        let queue = create_test_queue();
        let first = queue.enqueue(&record("p-1", 2, 1), 1).unwrap();
        queue.enqueue(&record("p-2", 1, 1), 0).unwrap();
        let second = queue.enqueue(&record("p-1", 3, 9), 2).unwrap();
        assert_eq!(first, second);

        let entries = queue.entries_for("p-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.version, 3);
        assert_eq!(entries[0].record.payload["bed"], json!(9));
        assert_eq!(entries[0].base_version, 1);

        let next = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        assert_eq!(next.record_id, "p-1");
    }

    #[test]
    fn test_mutation_during_flight_waits_for_completion() {
        let (queue, store) = create_queue_with_store();
        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        let in_flight = queue.dequeue_next(Partition::all()).unwrap().unwrap();

        queue.enqueue(&record("p-1", 2, 2), 1).unwrap();
        assert_eq!(queue.entries_for("p-1").unwrap().len(), 2);
        assert!(queue.dequeue_next(Partition::all()).unwrap().is_none());

        queue.mark_synced(&in_flight, &in_flight.record, &store).unwrap();
        let next = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        assert_eq!(next.record.version, 2);
    }

    #[test]
    fn test_mark_synced_removes_entry_and_stamps_last_sync() {
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = SyncQueue::new(db.clone());
        let store = SqliteRecordStore::new(db.clone());
        assert_eq!(queue.remote_version("p-1").unwrap(), 0);

        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        let entry = queue.dequeue_next(Partition::all()).unwrap().unwrap();

        let accepted = record("p-1", 3, 1);
        let stored = queue.mark_synced(&entry, &accepted, &store).unwrap();
        assert_eq!(stored, accepted);
        assert_eq!(store.get("p-1").unwrap(), Some(accepted));
        assert_eq!(queue.remote_version("p-1").unwrap(), 3);
        assert!(queue.entries_for("p-1").unwrap().is_empty());
        assert!(db
            .get_setting::<DateTime<Utc>>("last_sync_at")
            .unwrap()
            .is_some());

        // A late acknowledgement never moves the known remote version back
        queue.enqueue(&record("p-1", 2, 1), 3).unwrap();
        let late = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        queue.mark_synced(&late, &record("p-1", 2, 1), &store).unwrap();
        assert_eq!(queue.remote_version("p-1").unwrap(), 3);
    }

    #[test]
    fn test_defer_delays_eligibility() {
        let queue = create_test_queue();
        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        let mut entry = queue.dequeue_next(Partition::all()).unwrap().unwrap();

        entry.attempt_count += 1;
        queue
            .defer(&entry, "connection refused", Duration::from_secs(60))
            .unwrap();

        assert!(queue.dequeue_next(Partition::all()).unwrap().is_none());
        let wait = queue.next_eligible_in(Partition::all()).unwrap().unwrap();
        assert!(wait > Duration::from_secs(59));

        let stored = &queue.entries_for("p-1").unwrap()[0];
        assert_eq!(stored.status, EntryStatus::Pending);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_defer_folds_into_newer_pending_mutation() {
        let queue = create_test_queue();
        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        let mut in_flight = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        queue.enqueue(&record("p-1", 2, 2), 1).unwrap();

        in_flight.attempt_count = 1;
        queue.defer(&in_flight, "timeout", Duration::ZERO).unwrap();

        let entries = queue.entries_for("p-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.version, 2);
        assert_eq!(entries[0].base_version, 0);
        assert_eq!(entries[0].attempt_count, 1);
        assert_eq!(entries[0].enqueued_at, in_flight.enqueued_at);
    }

    #[test]
    fn test_failed_entries_requeue_and_clear() {
        let queue = create_test_queue();
        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        let mut entry = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        entry.attempt_count = 5;
        queue
            .mark_failed(&entry, FailureKind::ExhaustedRetries, "server down")
            .unwrap();

        let failed = queue.failed_entries().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure, Some(FailureKind::ExhaustedRetries));
        assert_eq!(failed[0].attempt_count, 5);
        assert_eq!(queue.stats().unwrap().failed_count, 1);
        assert_eq!(queue.stats().unwrap().depth(), 0);

        assert_eq!(queue.requeue(entry.seq).unwrap(), RequeueOutcome::Requeued);
        let retried = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        assert_eq!(retried.attempt_count, 0);
        assert_eq!(retried.failure, None);

        queue
            .mark_failed(&retried, FailureKind::Validation, "bad payload")
            .unwrap();
        queue.clear_failed(retried.seq).unwrap();
        assert!(queue.failed_entries().unwrap().is_empty());
        assert!(matches!(
            queue.clear_failed(retried.seq),
            Err(QueueError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_requeue_superseded_by_newer_mutation() {
        let queue = create_test_queue();
        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        let entry = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        queue
            .mark_failed(&entry, FailureKind::Validation, "rejected")
            .unwrap();
        queue.enqueue(&record("p-1", 2, 2), 0).unwrap();

        assert_eq!(queue.requeue(entry.seq).unwrap(), RequeueOutcome::Superseded);
        let entries = queue.entries_for("p-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.version, 2);
    }

    #[test]
    fn test_requeue_resolution_bumps_round() {
        let queue = create_test_queue();
        queue.enqueue(&record("p-1", 2, 1), 1).unwrap();
        let entry = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        queue.mark_conflicted(&entry).unwrap();

        let resolved = record("p-1", 6, 7);
        assert!(queue.requeue_resolution(&entry, &resolved, 5).unwrap());

        let next = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        assert_eq!(next.conflict_rounds, 1);
        assert_eq!(next.base_version, 5);
        assert_eq!(next.record.version, 6);
    }

    #[test]
    fn test_mark_synced_rebases_pending_mutation() {
        let (queue, store) = create_queue_with_store();
        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        let in_flight = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        queue.enqueue(&record("p-1", 2, 2), 0).unwrap();

        let stored = queue
            .mark_synced(&in_flight, &record("p-1", 4, 1), &store)
            .unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(stored.payload["bed"], json!(2));
        assert_eq!(store.get("p-1").unwrap(), Some(stored));

        let entry = &queue.entries_for("p-1").unwrap()[0];
        assert_eq!(entry.base_version, 4);
        assert_eq!(entry.record.version, 5);
    }

    #[test]
    fn test_retire_hands_base_to_pending_mutation() {
        let queue = create_test_queue();
        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        let in_flight = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        queue.mark_conflicted(&in_flight).unwrap();
        queue.enqueue(&record("p-1", 2, 2), 1).unwrap();

        queue.retire(&in_flight).unwrap();

        let entries = queue.entries_for("p-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Pending);
        assert_eq!(entries[0].record.version, 2);
        assert_eq!(entries[0].base_version, 0);
    }

    #[test]
    fn test_superseded_resolution_hands_base_to_pending_mutation() {
        let queue = create_test_queue();
        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        let in_flight = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        queue.mark_conflicted(&in_flight).unwrap();
        queue.enqueue(&record("p-1", 2, 2), 1).unwrap();

        assert!(!queue
            .requeue_resolution(&in_flight, &record("p-1", 6, 3), 5)
            .unwrap());

        let entries = queue.entries_for("p-1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record.payload["bed"], json!(2));
        assert_eq!(entries[0].base_version, 0);
    }

    #[test]
    fn test_recover_stale() {
        let queue = create_test_queue();
        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        queue.enqueue(&record("p-2", 1, 1), 0).unwrap();
        let first = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        let second = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        queue.mark_conflicted(&second).unwrap();

        assert_eq!(queue.recover_stale().unwrap(), 2);
        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending_count, 2);
        assert_eq!(stats.in_flight_count, 0);
        assert_eq!(stats.conflicted_count, 0);

        let again = queue.dequeue_next(Partition::all()).unwrap().unwrap();
        assert_eq!(again.seq, first.seq);
    }

    #[test]
    fn test_partitions_are_disjoint() {
        let queue = create_test_queue();
        let ids: Vec<String> = (0..20).map(|i| format!("patient-{}", i)).collect();
        for id in &ids {
            queue.enqueue(&record(id, 1, 1), 0).unwrap();
        }

        let mut seen = Vec::new();
        for index in 0..3 {
            let partition = Partition::new(index, 3);
            while let Some(entry) = queue.dequeue_next(partition).unwrap() {
                assert!(partition.owns(entry.partition_key));
                seen.push(entry.record_id);
            }
        }

        seen.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_enqueue_bumps_signal() {
        let queue = create_test_queue();
        let mut rx = queue.subscribe();
        assert!(!rx.has_changed().unwrap());

        queue.enqueue(&record("p-1", 1, 1), 0).unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_is_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1_000),
            max: Duration::from_secs(60),
            jitter: 0.1,
        };

        for _ in 0..200 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_millis(2_000));
            assert!(delay <= Duration::from_millis(2_200));
        }
    }

    #[test]
    fn test_status_conversion() {
        for status in [
            EntryStatus::Pending,
            EntryStatus::InFlight,
            EntryStatus::Synced,
            EntryStatus::Conflicted,
            EntryStatus::Failed,
        ] {
            assert_eq!(EntryStatus::from_str(status.as_str()), status);
        }
        assert_eq!(FailureKind::from_str("resolution"), Some(FailureKind::Resolution));
        assert_eq!(FailureKind::from_str("bogus"), None);
    }
}
