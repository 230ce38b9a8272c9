//! Local record persistence
//!
//! The engine only needs get/put by key; `SqliteRecordStore` keeps records in
//! the same database as the queue.

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::sync::Arc;

use super::models::Record;
use crate::db::{Database, DbError};

/// Key-value access to the latest local state of each record
pub trait RecordStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Record>, StoreError>;

    fn put(&self, record: &Record) -> Result<(), StoreError>;

    /// Write `record` as part of a queue transaction
    ///
    /// Stores kept outside the queue database may ignore `tx`; the write then
    /// only happens-before the queue commit instead of sharing it.
    fn put_in(&self, tx: &Transaction<'_>, record: &Record) -> Result<(), StoreError>;
}

/// `records` table backed store
pub struct SqliteRecordStore {
    db: Arc<Database>,
}

impl SqliteRecordStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl RecordStore for SqliteRecordStore {
    fn get(&self, id: &str) -> Result<Option<Record>, StoreError> {
        let conn = self.db.get_conn()?;
        let body: Option<String> = conn
            .query_row("SELECT body FROM records WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(DbError::from)?;

        body.map(|json| {
            serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    fn put(&self, record: &Record) -> Result<(), StoreError> {
        let conn = self.db.get_conn()?;
        upsert_record(&conn, record)
    }

    fn put_in(&self, tx: &Transaction<'_>, record: &Record) -> Result<(), StoreError> {
        upsert_record(tx, record)
    }
}

fn upsert_record(conn: &Connection, record: &Record) -> Result<(), StoreError> {
    let body =
        serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))?;

    conn.execute(
        r#"
        INSERT INTO records (id, kind, version, body, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(id) DO UPDATE SET
            kind = excluded.kind,
            version = excluded.version,
            body = excluded.body,
            updated_at = excluded.updated_at
        "#,
        params![
            record.id,
            record.kind,
            record.version as i64,
            body,
            record.updated_at.timestamp_millis()
        ],
    )
    .map_err(DbError::from)?;

    log::debug!("Stored {} at version {}", record.id, record.version);
    Ok(())
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
