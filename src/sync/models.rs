//! Sync Data Models
//!
//! Defines the data structures shared by the queue, the workers and the
//! manager:
//! - Record: versioned clinical entity subject to sync
//! - Actor / Role: who made a change and how much they are trusted
//! - ResolutionStrategy: how divergent versions are reconciled
//! - SyncConfig: engine settings (persisted in the settings table)
//! - SyncStatus: read-only snapshot for UIs and the CLI

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use super::queue::BackoffPolicy;
use crate::db::{Database, DbError};

// ============================================================================
// Records
// ============================================================================

/// Clinical role of the actor that last modified a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Doctor,
    Nurse,
    Admin,
    /// Any role the engine does not rank
    #[serde(other)]
    Unknown,
}

impl Role {
    /// Priority ordinal used by the role-priority strategy
    pub fn priority(&self) -> u8 {
        match self {
            Role::Doctor => 3,
            Role::Nurse => 2,
            Role::Admin => 1,
            Role::Unknown => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Doctor => "doctor",
            Role::Nurse => "nurse",
            Role::Admin => "admin",
            Role::Unknown => "unknown",
        }
    }
}

/// Identity of whoever made a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Versioned record subject to sync
///
/// The payload is opaque to the engine except for the merge strategy, which
/// works on its top-level fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Stable unique key
    pub id: String,

    /// Record type, used to pick a per-type resolution strategy
    #[serde(default)]
    pub kind: String,

    /// Monotonic version; strictly increases with every accepted mutation
    pub version: u64,

    pub updated_at: DateTime<Utc>,

    pub updated_by: Actor,

    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Record {
    /// Create a new, never-synced record stamped with the current time
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        updated_by: Actor,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            version: 1,
            updated_at: Utc::now(),
            updated_by,
            payload,
        }
    }

    /// Check the identity fields every mutation must carry
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("record id must not be empty".to_string());
        }
        if self.updated_by.id.trim().is_empty() {
            return Err(format!("record {} has no updated_by actor", self.id));
        }
        Ok(())
    }

    /// Whether two versions carry the same payload, ignoring metadata
    pub fn same_content(&self, other: &Record) -> bool {
        self.payload == other.payload
    }
}

// ============================================================================
// Conflict Resolution
// ============================================================================

/// Conflict resolution strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Last write wins by `updated_at`
    Timestamp,

    /// Higher-privilege role wins; equal roles fall back to timestamp
    RolePriority,

    /// Field-level union of both payloads
    Merge,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Timestamp => "timestamp",
            ResolutionStrategy::RolePriority => "role_priority",
            ResolutionStrategy::Merge => "merge",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestamp" => Ok(ResolutionStrategy::Timestamp),
            "role" | "role_priority" => Ok(ResolutionStrategy::RolePriority),
            "merge" => Ok(ResolutionStrategy::Merge),
            other => Err(ConfigError::Invalid(format!(
                "unknown resolution strategy: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Sync Configuration
// ============================================================================

const SETTINGS_KEY: &str = "sync_config";
const MAX_WORKERS: usize = 64;

/// Sync engine configuration
///
/// Stored as JSON in the settings table; environment variables prefixed with
/// `CLINISYNC_` override individual fields at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Strategy used when no per-kind override matches
    pub strategy: ResolutionStrategy,

    /// Strategy per record kind
    pub strategy_overrides: HashMap<String, ResolutionStrategy>,

    /// Number of partitioned background workers
    pub worker_count: usize,

    /// Transport attempts before an entry is marked failed
    pub max_attempts: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Extra random delay as a fraction of the computed backoff (0.0 - 1.0)
    pub backoff_jitter: f64,

    /// Idle wake-up interval when no queue signal arrives
    pub poll_interval_ms: u64,

    /// Upper bound for a single remote call
    pub request_timeout_ms: u64,

    /// How long shutdown waits for in-flight transmissions
    pub shutdown_grace_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::Timestamp,
            strategy_overrides: HashMap::new(),
            worker_count: 1,
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            backoff_jitter: 0.1,
            poll_interval_ms: 5_000,
            request_timeout_ms: 30_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl SyncConfig {
    /// Strategy for a given record kind
    pub fn strategy_for(&self, kind: &str) -> ResolutionStrategy {
        self.strategy_overrides
            .get(kind)
            .copied()
            .unwrap_or(self.strategy)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            jitter: self.backoff_jitter,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            return Err(ConfigError::Invalid(format!(
                "worker_count must be 1-{}, got {}",
                MAX_WORKERS, self.worker_count
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff base ({}ms) must be non-zero and not exceed max ({}ms)",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff_jitter must be within 0.0-1.0, got {}",
                self.backoff_jitter
            )));
        }
        if self.poll_interval_ms == 0 || self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll interval and request timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from database settings table
    pub fn load(db: &Database) -> Result<Self, ConfigError> {
        let config: SyncConfig = db.get_setting(SETTINGS_KEY)?.unwrap_or_default();
        Ok(config)
    }

    /// Save configuration to database settings table
    pub fn save(&self, db: &Database) -> Result<(), ConfigError> {
        self.validate()?;
        db.set_setting(SETTINGS_KEY, self)?;
        Ok(())
    }

    /// Apply `CLINISYNC_*` environment overrides
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(strategy) = env_var::<ResolutionStrategy>("CLINISYNC_STRATEGY")? {
            self.strategy = strategy;
        }
        if let Some(workers) = env_var("CLINISYNC_WORKERS")? {
            self.worker_count = workers;
        }
        if let Some(attempts) = env_var("CLINISYNC_MAX_ATTEMPTS")? {
            self.max_attempts = attempts;
        }
        if let Some(base) = env_var("CLINISYNC_BACKOFF_BASE_MS")? {
            self.backoff_base_ms = base;
        }
        if let Some(max) = env_var("CLINISYNC_BACKOFF_MAX_MS")? {
            self.backoff_max_ms = max;
        }
        if let Some(poll) = env_var("CLINISYNC_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = poll;
        }
        if let Some(timeout) = env_var("CLINISYNC_REQUEST_TIMEOUT_MS")? {
            self.request_timeout_ms = timeout;
        }
        self.validate()?;
        Ok(self)
    }
}

fn env_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", name, e))),
        _ => Ok(None),
    }
}

// ============================================================================
// Sync Status
// ============================================================================

/// Lifecycle state of the sync workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Stopped,
    Running,
    Paused,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Stopped => "stopped",
            SyncState::Running => "running",
            SyncState::Paused => "paused",
        }
    }
}

/// Eventually-consistent status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Entries waiting for or undergoing transmission
    pub queue_depth: usize,
    pub in_flight: usize,
    pub failed_count: usize,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub state: SyncState,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_role_priority_order() {
        assert!(Role::Doctor.priority() > Role::Nurse.priority());
        assert!(Role::Nurse.priority() > Role::Admin.priority());
        assert!(Role::Admin.priority() > Role::Unknown.priority());
    }

    #[test]
    fn test_unranked_role_deserializes_as_unknown() {
        let actor: Actor = serde_json::from_str(r#"{"id":"u-9","role":"pharmacist"}"#).unwrap();
        assert_eq!(actor.role, Role::Unknown);

        let actor: Actor = serde_json::from_str(r#"{"id":"u-1","role":"doctor"}"#).unwrap();
        assert_eq!(actor.role, Role::Doctor);
    }

    #[test]
    fn test_record_validation() {
        let actor = Actor::new("dr-house", Role::Doctor);
        let record = Record::new("patient-1", "patient", actor.clone(), Map::new());
        assert!(record.validate().is_ok());

        let blank_id = Record::new("  ", "patient", actor, Map::new());
        assert!(blank_id.validate().is_err());

        let anonymous = Record::new("patient-1", "patient", Actor::new("", Role::Nurse), Map::new());
        assert!(anonymous.validate().is_err());
    }

    #[test]
    fn test_record_deserializes_without_optional_fields() {
        let record: Record = serde_json::from_value(json!({
            "id": "patient-7",
            "version": 3,
            "updated_at": "2026-01-01T12:00:00Z",
            "updated_by": {"id": "n-1", "role": "nurse"}
        }))
        .unwrap();

        assert_eq!(record.kind, "");
        assert!(record.payload.is_empty());
        assert_eq!(record.version, 3);
    }

    #[test]
    fn test_same_content_ignores_metadata() {
        let a = Record::new(
            "p-1",
            "patient",
            Actor::new("n-1", Role::Nurse),
            payload(json!({"bed": 4})),
        );
        let mut b = a.clone();
        b.version = 9;
        b.updated_by = Actor::new("dr-1", Role::Doctor);
        assert!(a.same_content(&b));

        b.payload.insert("bed".to_string(), json!(5));
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_sync_config_default_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.strategy, ResolutionStrategy::Timestamp);
    }

    #[test]
    fn test_strategy_override_per_kind() {
        let mut config = SyncConfig::default();
        config
            .strategy_overrides
            .insert("medication".to_string(), ResolutionStrategy::RolePriority);

        assert_eq!(config.strategy_for("medication"), ResolutionStrategy::RolePriority);
        assert_eq!(config.strategy_for("note"), ResolutionStrategy::Timestamp);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = SyncConfig::default();
        config.worker_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = SyncConfig::default();
        config.backoff_base_ms = 10_000;
        config.backoff_max_ms = 1_000;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.backoff_jitter = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_load_config() {
        let db = Database::in_memory().unwrap();
        assert_eq!(SyncConfig::load(&db).unwrap(), SyncConfig::default());

        let mut config = SyncConfig::default();
        config.strategy = ResolutionStrategy::Merge;
        config.worker_count = 4;
        config.save(&db).unwrap();

        let loaded = SyncConfig::load(&db).unwrap();
        assert_eq!(loaded.strategy, ResolutionStrategy::Merge);
        assert_eq!(loaded.worker_count, 4);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("merge".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::Merge);
        assert_eq!("ROLE".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::RolePriority);
        assert!("coin_flip".parse::<ResolutionStrategy>().is_err());
    }

    #[test]
    fn test_sync_state_as_str() {
        assert_eq!(SyncState::Stopped.as_str(), "stopped");
        assert_eq!(SyncState::Running.as_str(), "running");
        assert_eq!(SyncState::Paused.as_str(), "paused");
    }
}
