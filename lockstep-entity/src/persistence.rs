//! Snapshot persistence.
//!
//! A persisted snapshot is a MessagePack envelope holding the schema version
//! and the MessagePack-encoded model, compressed with LZ4. Older schema
//! versions are upgraded through a [`SchemaMigrator`] chain before the model
//! is decoded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

use crate::error::PersistenceError;
use crate::types::EntityId;

/// Read/write access to persisted entity snapshots.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Read the latest snapshot of `id`, if any.
    async fn try_read(&self, id: &EntityId) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Write a snapshot. `is_final` marks the write made during shutdown.
    async fn write(
        &self,
        id: &EntityId,
        payload: Vec<u8>,
        schema_version: u32,
        is_final: bool,
    ) -> Result<(), PersistenceError>;

    /// Whether snapshots are kept at all.
    fn is_persistent(&self) -> bool {
        true
    }
}

/// Ephemeral entities: nothing is read, writes are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

#[async_trait]
impl PersistenceStore for NoPersistence {
    async fn try_read(&self, _id: &EntityId) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(None)
    }

    async fn write(
        &self,
        _id: &EntityId,
        _payload: Vec<u8>,
        _schema_version: u32,
        _is_final: bool,
    ) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}

/// A stored snapshot with its write metadata.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub payload: Vec<u8>,
    pub schema_version: u32,
    pub is_final: bool,
    pub writes: u64,
}

/// Process-local store, shared by clones.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    snapshots: Arc<RwLock<HashMap<EntityId, StoredSnapshot>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &EntityId) -> Option<StoredSnapshot> {
        self.snapshots.read().await.get(id).cloned()
    }

    /// Place a raw payload, e.g. one written by an older build.
    pub async fn insert_raw(&self, id: EntityId, payload: Vec<u8>, schema_version: u32) {
        self.snapshots.write().await.insert(
            id,
            StoredSnapshot {
                payload,
                schema_version,
                is_final: false,
                writes: 0,
            },
        );
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn try_read(&self, id: &EntityId) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.snapshots.read().await.get(id).map(|s| s.payload.clone()))
    }

    async fn write(
        &self,
        id: &EntityId,
        payload: Vec<u8>,
        schema_version: u32,
        is_final: bool,
    ) -> Result<(), PersistenceError> {
        let mut snapshots = self.snapshots.write().await;
        let writes = snapshots.get(id).map(|s| s.writes).unwrap_or(0) + 1;
        snapshots.insert(
            id.clone(),
            StoredSnapshot {
                payload,
                schema_version,
                is_final,
                writes,
            },
        );
        debug!(entity_id = %id, schema_version, is_final, writes, "Snapshot stored in memory");
        Ok(())
    }
}

/// Upgrades one schema version to the next.
pub type MigrationFn = Box<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Chain of single-step schema migrations ending at the current version.
pub struct SchemaMigrator {
    current: u32,
    steps: BTreeMap<u32, MigrationFn>,
}

impl SchemaMigrator {
    /// A migrator that only accepts `current`.
    pub fn new(current: u32) -> Self {
        Self {
            current,
            steps: BTreeMap::new(),
        }
    }

    /// Register the migration from `from` to `from + 1`.
    pub fn with_migration<F>(mut self, from: u32, migrate: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.steps.insert(from, Box::new(migrate));
        self
    }

    pub fn current_version(&self) -> u32 {
        self.current
    }

    /// Oldest version with an unbroken chain up to the current one.
    pub fn oldest_supported_version(&self) -> u32 {
        let mut oldest = self.current;
        while oldest > 0 && self.steps.contains_key(&(oldest - 1)) {
            oldest -= 1;
        }
        oldest
    }

    /// Upgrade `value` from `stored` to the current version.
    pub fn migrate(&self, stored: u32, mut value: Value) -> Result<Value, PersistenceError> {
        if stored > self.current {
            return Err(PersistenceError::SchemaTooNew {
                stored,
                current: self.current,
            });
        }
        let oldest = self.oldest_supported_version();
        if stored < oldest {
            return Err(PersistenceError::SchemaTooOld { stored, oldest });
        }
        for version in stored..self.current {
            let step = self
                .steps
                .get(&version)
                .ok_or(PersistenceError::SchemaTooOld { stored, oldest })?;
            value = step(value).map_err(|reason| PersistenceError::Migration {
                from: version,
                reason,
            })?;
            debug!(from = version, to = version + 1, "Migrated snapshot schema");
        }
        Ok(value)
    }
}

impl std::fmt::Debug for SchemaMigrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMigrator")
            .field("current", &self.current)
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope {
    schema_version: u32,
    persisted_at: DateTime<Utc>,
    model: Vec<u8>,
}

/// Encode `model` as a compressed snapshot payload.
pub fn encode_snapshot<M: Serialize>(
    model: &M,
    schema_version: u32,
    persisted_at: DateTime<Utc>,
) -> Result<Vec<u8>, PersistenceError> {
    let model = rmp_serde::to_vec_named(model).map_err(|e| PersistenceError::Codec(e.to_string()))?;
    let envelope = SnapshotEnvelope {
        schema_version,
        persisted_at,
        model,
    };
    let bytes =
        rmp_serde::to_vec_named(&envelope).map_err(|e| PersistenceError::Codec(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

/// Decode a snapshot payload, migrating it to the current schema if needed.
pub fn decode_snapshot<M: DeserializeOwned>(
    payload: &[u8],
    migrator: &SchemaMigrator,
) -> Result<M, PersistenceError> {
    let envelope = open_envelope(payload)?;
    if envelope.schema_version == migrator.current_version() {
        return rmp_serde::from_slice(&envelope.model).map_err(|e| PersistenceError::Codec(e.to_string()));
    }

    let value: Value =
        rmp_serde::from_slice(&envelope.model).map_err(|e| PersistenceError::Codec(e.to_string()))?;
    let migrated = migrator.migrate(envelope.schema_version, value)?;
    serde_json::from_value(migrated).map_err(|e| PersistenceError::Codec(e.to_string()))
}

fn open_envelope(payload: &[u8]) -> Result<SnapshotEnvelope, PersistenceError> {
    let bytes = lz4_flex::decompress_size_prepended(payload)
        .map_err(|e| PersistenceError::Codec(format!("decompression failed: {e}")))?;
    rmp_serde::from_slice(&bytes).map_err(|e| PersistenceError::Codec(e.to_string()))
}

/// Log everything known about a payload that failed to restore.
pub fn log_restore_failure(id: &EntityId, payload: &[u8], err: &PersistenceError) {
    const HEX_DUMP_LIMIT: usize = 4096;
    let shown = &payload[..payload.len().min(HEX_DUMP_LIMIT)];

    let structure = open_envelope(payload).and_then(|envelope| {
        let model: Value = rmp_serde::from_slice(&envelope.model)
            .map_err(|e| PersistenceError::Codec(e.to_string()))?;
        Ok(serde_json::json!({
            "schema_version": envelope.schema_version,
            "persisted_at": envelope.persisted_at,
            "model": model,
        }))
    });
    let structure = match structure {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_default(),
        Err(e) => format!("<unreadable: {e}>"),
    };

    error!(
        entity_id = %id,
        error = %err,
        payload_len = payload.len(),
        payload_hex = %hex::encode(shown),
        structure = %structure,
        "Failed to restore persisted snapshot"
    );
}
