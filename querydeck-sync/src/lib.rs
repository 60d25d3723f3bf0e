//! Multi-context synchronization core for QueryDeck.
//!
//! One running QueryDeck profile may have several browsing contexts
//! open at once. This crate keeps them coherent:
//!
//! - **Transport**: fire-and-forget messaging between contexts over a
//!   shared bus channel, with retry, reconnect and degraded mode
//! - **Presence**: heartbeat tracking and primary election, so work
//!   that must happen once per profile has a single owner
//! - **Relay**: credential sharing between contexts under short-lived
//!   sealing keys, backed by an in-memory vault
//! - **Broadcast**: replication of reactive state containers with
//!   per-store policies, field exclusion and debouncing
//! - **Cloud**: the sync engine pushing and pulling change records
//!   against the QueryDeck sync service
//!
//! Contexts share nothing but messages. Every cross-context invariant
//! is eventually consistent rather than linearizable, so components
//! tolerate out-of-order and duplicate delivery.
//!
//! # Example
//!
//! ```no_run
//! use querydeck_sync::{LocalHub, PresenceConfig, PresenceManager, Transport, TransportConfig};
//! use querydeck_types::ContextId;
//!
//! # async fn run() {
//! let hub = LocalHub::new();
//! let transport = Transport::connect(hub, ContextId::new(), TransportConfig::default()).await;
//! let presence = PresenceManager::new(transport, PresenceConfig::default());
//! presence.start();
//! # }
//! ```

pub mod broadcast;
pub mod cloud;
mod error;
pub mod policy;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod vault;

pub use error::{SyncError, SyncResult};
pub use protocol::{
    CredentialRequestMessage, CredentialResponseMessage, HeartbeatMessage, MessageKind,
    MessagePayload, PeerMessage, ResourceAddedMessage, StatePatchMessage,
};
pub use transport::{
    BusBackend, BusLink, LocalHub, MessageHandler, Subscription, Transport, TransportConfig,
};

pub use broadcast::{
    deep_merge, remove_field, ReplicatedState, StateBroadcaster, StateContainer,
};
pub use policy::{PolicyRegistry, StoreSyncPolicy};
pub use presence::{choose_primary, PresenceConfig, PresenceManager, PresenceRecord};
pub use relay::{ApproveAll, CredentialRelay, RelayConfig, ShareApprover, SharedCredential};
pub use vault::{CredentialVault, MemoryVault};

// Cloud sync
pub use cloud::{
    DownloadPage, HttpSyncApi, HttpSyncConfig, RemoteSyncApi, StaticGate, SyncChange, SyncEngine,
    SyncEngineConfig, SyncGate, SyncPhase, SyncReport,
};
