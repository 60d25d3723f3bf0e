//! Change tracking types for cloud sync.
//!
//! A [`ChangeRecord`] is the unit of replication: one syncable entity
//! (a connection profile, saved query, or history entry) together with
//! the bookkeeping the sync engine needs to decide what to upload, what
//! to merge, and what counts as a conflict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of entities that participate in cloud sync.
///
/// Each kind maps to one named local store. Anything not listed here
/// (result sets, editor buffers, UI layout) never leaves the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Database connection profiles. Secrets are stripped before upload.
    Connection,
    /// Saved queries with their editor metadata.
    SavedQuery,
    /// Query execution history entries.
    QueryHistory,
}

impl EntityKind {
    /// All syncable kinds, in upload order.
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Connection,
        EntityKind::SavedQuery,
        EntityKind::QueryHistory,
    ];

    /// The local store this kind of entity lives in.
    #[must_use]
    pub const fn store_name(&self) -> &'static str {
        match self {
            EntityKind::Connection => "connections",
            EntityKind::SavedQuery => "saved_queries",
            EntityKind::QueryHistory => "query_history",
        }
    }

    /// Resolves a store name back to its entity kind.
    #[must_use]
    pub fn from_store_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.store_name() == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.store_name())
    }
}

/// One syncable entity with its replication bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Stable identity of the entity across devices.
    pub entity_id: String,
    /// Which store the entity belongs to.
    pub kind: EntityKind,
    /// The entity payload as schemaless JSON.
    pub data: serde_json::Value,
    /// Last local modification time.
    pub updated_at: DateTime<Utc>,
    /// Server-assigned version, bumped each time the server accepts the
    /// record. Zero for records the server has never seen.
    pub sync_version: i64,
    /// Whether the current local state has reached the server.
    pub synced: bool,
}

impl ChangeRecord {
    /// Creates a fresh, never-synced record stamped at the current time.
    #[must_use]
    pub fn new(kind: EntityKind, entity_id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            data,
            updated_at: Utc::now(),
            sync_version: 0,
            synced: false,
        }
    }

    /// Marks the record as locally modified: refreshes the timestamp and
    /// flags it for upload on the next cycle.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.synced = false;
    }

    /// Marks the record as accepted by the server at the given version.
    pub fn mark_synced(&mut self, version: i64) {
        self.sync_version = version;
        self.synced = true;
    }

    /// Whether this record should be included in the next upload batch.
    ///
    /// Unsynced records always upload. Synced records re-upload when
    /// their modification time is past the checkpoint, so a lost
    /// acknowledgement costs a duplicate upload rather than a lost
    /// change.
    #[must_use]
    pub fn needs_upload(&self, checkpoint: &SyncCheckpoint) -> bool {
        !self.synced || self.updated_at > checkpoint.at()
    }
}

/// One side of a detected conflict: the payload plus the bookkeeping
/// needed to apply it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictVersion {
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    pub sync_version: i64,
}

impl From<&ChangeRecord> for ConflictVersion {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            data: record.data.clone(),
            updated_at: record.updated_at,
            sync_version: record.sync_version,
        }
    }
}

/// A divergence between the local and remote copy of one entity.
///
/// Only raised when both the version and the timestamp differ; see
/// [`Resolution`] for the ways out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Identity of this conflict occurrence, minted at detection time.
    pub id: String,
    /// The entity both sides modified.
    pub entity_id: String,
    pub kind: EntityKind,
    pub local: ConflictVersion,
    pub remote: ConflictVersion,
    /// The resolution the engine would pick on its own.
    pub recommended: Resolution,
    pub detected_at: DateTime<Utc>,
}

/// How a conflict gets settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the local copy; the remote one is discarded.
    Local,
    /// Take the remote copy; the local one is overwritten.
    Remote,
    /// Keep both: the remote copy is inserted as a new record with a
    /// disambiguated name, the local one stays untouched.
    KeepBoth,
    /// Deferred to the user. Never applied by the engine directly.
    Manual,
}

impl Resolution {
    /// Server-side strategy name reported when a resolution is applied.
    #[must_use]
    pub const fn strategy(&self) -> &'static str {
        match self {
            Resolution::Local | Resolution::Remote => "last_write_wins",
            Resolution::KeepBoth => "keep_both",
            Resolution::Manual => "user_choice",
        }
    }

    /// Which side won, for strategies where that matters.
    #[must_use]
    pub const fn chosen_version(&self) -> Option<&'static str> {
        match self {
            Resolution::Local => Some("local"),
            Resolution::Remote => Some("remote"),
            Resolution::KeepBoth | Resolution::Manual => None,
        }
    }
}

/// High-water mark of server time up to which this device has downloaded
/// changes.
///
/// Only ever moves forward, and only after a fully successful sync
/// cycle. A failed cycle leaves it untouched so the next attempt re-pulls
/// the same window.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SyncCheckpoint(DateTime<Utc>);

impl SyncCheckpoint {
    /// Creates a checkpoint at the given server time.
    #[must_use]
    pub const fn new(at: DateTime<Utc>) -> Self {
        Self(at)
    }

    /// The checkpoint a device starts from before its first sync.
    #[must_use]
    pub const fn epoch() -> Self {
        Self(DateTime::UNIX_EPOCH)
    }

    /// The server time this checkpoint stands at.
    #[must_use]
    pub const fn at(&self) -> DateTime<Utc> {
        self.0
    }

    /// Advances the checkpoint, ignoring moves backward in time.
    pub fn advance_to(&mut self, at: DateTime<Utc>) {
        if at > self.0 {
            self.0 = at;
        }
    }
}

impl Default for SyncCheckpoint {
    fn default() -> Self {
        Self::epoch()
    }
}

impl fmt::Display for SyncCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}
