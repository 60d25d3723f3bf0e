//! The local store seam the sync engine reads and writes through.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use querydeck_types::{ChangeRecord, EntityKind, SyncCheckpoint};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Storage abstraction over the per-kind local stores.
///
/// The engine never talks to a database directly; the app supplies
/// whatever persistence it has behind this trait. The checkpoint lives
/// here too so a device resumes from where its store actually is, not
/// from where some other cache thinks it is.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Returns every record of the given kind.
    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<ChangeRecord>>;

    /// Looks up a single record.
    async fn get(&self, kind: EntityKind, entity_id: &str) -> StoreResult<Option<ChangeRecord>>;

    /// Inserts or overwrites a record.
    async fn put(&self, record: ChangeRecord) -> StoreResult<()>;

    /// Removes a record. Removing a missing record is an error.
    async fn delete(&self, kind: EntityKind, entity_id: &str) -> StoreResult<()>;

    /// Loads the persisted sync checkpoint, if any.
    async fn load_checkpoint(&self) -> StoreResult<Option<SyncCheckpoint>>;

    /// Persists the sync checkpoint.
    async fn save_checkpoint(&self, checkpoint: SyncCheckpoint) -> StoreResult<()>;
}

/// In-memory [`LocalStore`] used in tests and as the default for
/// ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<(EntityKind, String), ChangeRecord>>,
    checkpoint: RwLock<Option<SyncCheckpoint>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held across all kinds.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<ChangeRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<ChangeRecord> = records
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, record)| record.clone())
            .collect();
        // Deterministic order for callers that iterate
        matching.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(matching)
    }

    async fn get(&self, kind: EntityKind, entity_id: &str) -> StoreResult<Option<ChangeRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&(kind, entity_id.to_string())).cloned())
    }

    async fn put(&self, record: ChangeRecord) -> StoreResult<()> {
        let mut records = self.records.write().await;
        records.insert((record.kind, record.entity_id.clone()), record);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, entity_id: &str) -> StoreResult<()> {
        let mut records = self.records.write().await;
        records
            .remove(&(kind, entity_id.to_string()))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("{kind}/{entity_id}")))
    }

    async fn load_checkpoint(&self) -> StoreResult<Option<SyncCheckpoint>> {
        Ok(*self.checkpoint.read().await)
    }

    async fn save_checkpoint(&self, checkpoint: SyncCheckpoint) -> StoreResult<()> {
        *self.checkpoint.write().await = Some(checkpoint);
        Ok(())
    }
}
