//! Core type definitions for QueryDeck.
//!
//! This crate defines the fundamental, UI-agnostic types shared by every
//! browsing context of the app:
//! - Context identifiers (UUID v7)
//! - Hybrid Logical Clock timestamps for message stamping
//! - Change records, conflicts, and sync checkpoints
//!
//! Presentation concerns (result grids, editor buffers, layout state)
//! belong in the app layer, not here.

mod change;
mod ids;
mod timestamp;

pub use change::{
    ChangeRecord, Conflict, ConflictVersion, EntityKind, Resolution, SyncCheckpoint,
};
pub use ids::ContextId;
pub use timestamp::HybridTimestamp;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("unknown store name: {0}")]
    UnknownStore(String),
}
