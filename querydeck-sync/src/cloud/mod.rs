//! Cloud synchronization with the QueryDeck sync service.
//!
//! The engine orchestrates the upload/download/resolve/merge cycle;
//! the api module speaks the service's wire format; sanitize and
//! conflict hold the pure passes the cycle is built from.

pub mod api;
pub mod conflict;
pub mod engine;
pub mod sanitize;

pub use api::{
    DownloadPage, HttpSyncApi, HttpSyncConfig, RejectedChange, RemoteSyncApi, SyncAction,
    SyncChange, UploadReceipt,
};
pub use conflict::KEEP_BOTH_SUFFIX;
pub use engine::{StaticGate, SyncEngine, SyncEngineConfig, SyncGate, SyncPhase, SyncReport};
