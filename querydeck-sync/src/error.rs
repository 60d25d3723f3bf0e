//! Error types for the sync layer.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The message bus primitive could not be opened.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A message could not be delivered after retries.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Missing or rejected credentials for the sync service.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Network error reaching the sync service.
    #[error("network error: {0}")]
    Network(String),

    /// The sync service answered with a failure status.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Cloud sync is not enabled for this account.
    #[error("sync is disabled for this account")]
    SyncDisabled,

    /// The client knows it is offline and was asked not to try.
    #[error("client is offline")]
    Offline,

    /// A sync cycle is already running.
    #[error("a sync cycle is already in progress")]
    SyncInProgress,

    /// A record failed secret-scrubbing validation.
    #[error("sanitization failed: {0}")]
    Sanitization(String),

    /// A credential payload could not be decrypted.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// The requested resolution cannot be applied.
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] querydeck_store::StoreError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl From<querydeck_crypto::CryptoError> for SyncError {
    fn from(err: querydeck_crypto::CryptoError) -> Self {
        SyncError::Decryption(err.to_string())
    }
}
