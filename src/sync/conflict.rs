//! Conflict Resolution
//!
//! Reconciles two divergent versions of the same record. Every strategy is a
//! pure function of its inputs, so independent replicas resolving the same
//! pair reach the same result regardless of which side they call "local".
//!
//! Strategies:
//! - Timestamp: newer `updated_at` wins, exact ties broken by a total order
//! - RolePriority: doctor > nurse > admin > unknown, then Timestamp
//! - Merge: field-level union, colliding fields taken from the Timestamp winner

use serde_json::{Map, Value};
use std::cmp::Ordering;

use super::models::{Record, ResolutionStrategy};

/// Two versions of the same record that diverged from a common base
#[derive(Debug, Clone)]
pub struct Conflict {
    pub local: Record,
    pub remote: Record,
}

impl Conflict {
    pub fn new(local: Record, remote: Record) -> Self {
        Self { local, remote }
    }

    pub fn resolve(&self, strategy: ResolutionStrategy) -> Result<Record, ResolutionError> {
        ConflictResolver::resolve(&self.local, &self.remote, strategy)
    }
}

/// Stateless resolver
pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve `local` against `remote` with the given strategy
    pub fn resolve(
        local: &Record,
        remote: &Record,
        strategy: ResolutionStrategy,
    ) -> Result<Record, ResolutionError> {
        local.validate().map_err(ResolutionError::InvalidRecord)?;
        remote.validate().map_err(ResolutionError::InvalidRecord)?;

        if local.id != remote.id {
            return Err(ResolutionError::IdMismatch {
                local: local.id.clone(),
                remote: remote.id.clone(),
            });
        }

        if local == remote {
            return Ok(local.clone());
        }

        let resolved = match strategy {
            ResolutionStrategy::Timestamp => Self::by_timestamp(local, remote).clone(),
            ResolutionStrategy::RolePriority => Self::by_role(local, remote).clone(),
            ResolutionStrategy::Merge => Self::merge(local, remote),
        };

        Ok(resolved)
    }

    /// Last-write-wins; a full tie goes to remote
    fn by_timestamp<'a>(local: &'a Record, remote: &'a Record) -> &'a Record {
        match timestamp_order(local, remote) {
            Ordering::Greater => local,
            _ => remote,
        }
    }

    fn by_role<'a>(local: &'a Record, remote: &'a Record) -> &'a Record {
        let local_rank = local.updated_by.role.priority();
        let remote_rank = remote.updated_by.role.priority();

        match local_rank.cmp(&remote_rank) {
            Ordering::Greater => local,
            Ordering::Less => remote,
            Ordering::Equal => Self::by_timestamp(local, remote),
        }
    }

    fn merge(local: &Record, remote: &Record) -> Record {
        let (primary, secondary) = match timestamp_order(local, remote) {
            Ordering::Greater => (local, remote),
            _ => (remote, local),
        };

        let mut payload: Map<String, Value> = secondary.payload.clone();
        for (key, value) in &primary.payload {
            payload.insert(key.clone(), value.clone());
        }

        // Already the merge result of an earlier round
        if payload == primary.payload && primary.version > secondary.version {
            return primary.clone();
        }

        Record {
            id: primary.id.clone(),
            kind: primary.kind.clone(),
            version: local.version.max(remote.version).saturating_add(1),
            updated_at: primary.updated_at,
            updated_by: primary.updated_by.clone(),
            payload,
        }
    }
}

/// Total order used by the Timestamp strategy
///
/// `Equal` only when every compared field matches, in which case the two
/// records are identical.
fn timestamp_order(a: &Record, b: &Record) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then_with(|| a.version.cmp(&b.version))
        .then_with(|| {
            a.updated_by
                .role
                .priority()
                .cmp(&b.updated_by.role.priority())
        })
        .then_with(|| a.updated_by.id.cmp(&b.updated_by.id))
        .then_with(|| a.kind.cmp(&b.kind))
        .then_with(|| canonical_payload(&a.payload).cmp(&canonical_payload(&b.payload)))
}

/// JSON text of a payload with object keys sorted at every level
fn canonical_payload(payload: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_object(payload, &mut out);
    out
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        if let Some(value) = map.get(key) {
            write_value(value, out);
        }
    }
    out.push('}');
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolutionError {
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Cannot resolve different records: local {local}, remote {remote}")]
    IdMismatch { local: String, remote: String },
}

// ============================================================================
// Tests
// ============================================================================
