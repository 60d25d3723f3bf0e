//! Messages exchanged between browsing contexts.
//!
//! Every frame on the bus is a [`PeerMessage`]: an envelope stamping the
//! sender and a hybrid-clock timestamp around one [`MessagePayload`].
//! Payloads are tagged JSON so a context running an older build skips
//! kinds it does not know instead of failing the whole frame.

use chrono::{DateTime, Utc};
use querydeck_types::{ContextId, EntityKind, HybridTimestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The envelope around every message a context publishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMessage {
    /// The publishing context. Receivers drop frames carrying their own ID.
    pub sender: ContextId,
    /// Hybrid-clock stamp, strictly increasing per sender.
    pub timestamp: HybridTimestamp,
    /// The actual message.
    pub payload: MessagePayload,
}

impl PeerMessage {
    /// Wraps a payload in an envelope.
    pub fn new(sender: ContextId, timestamp: HybridTimestamp, payload: MessagePayload) -> Self {
        Self {
            sender,
            timestamp,
            payload,
        }
    }
}

/// Everything that can travel between contexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePayload {
    /// Partial state update for one replicated store.
    StatePatch(StatePatchMessage),

    /// Liveness beacon, also carries the sender's primary flag.
    PresenceHeartbeat(HeartbeatMessage),

    /// Orderly goodbye; peers drop the sender without waiting for
    /// staleness.
    PresenceDeparted,

    /// Ask sibling contexts for stored credentials.
    CredentialRequest(CredentialRequestMessage),

    /// Sealed credential bundle answering a request.
    CredentialResponse(CredentialResponseMessage),

    /// The user signed out in some context; every context should drop
    /// session state and in-memory secrets.
    Logout,

    /// A new syncable entity appeared; peers may want to refresh lists.
    ResourceAdded(ResourceAddedMessage),
}

impl MessagePayload {
    /// The subscription channel this payload belongs to.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::StatePatch(_) => MessageKind::StatePatch,
            MessagePayload::PresenceHeartbeat(_) => MessageKind::PresenceHeartbeat,
            MessagePayload::PresenceDeparted => MessageKind::PresenceDeparted,
            MessagePayload::CredentialRequest(_) => MessageKind::CredentialRequest,
            MessagePayload::CredentialResponse(_) => MessageKind::CredentialResponse,
            MessagePayload::Logout => MessageKind::Logout,
            MessagePayload::ResourceAdded(_) => MessageKind::ResourceAdded,
        }
    }
}

/// Payload discriminants, used as subscription channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    StatePatch,
    PresenceHeartbeat,
    PresenceDeparted,
    CredentialRequest,
    CredentialResponse,
    Logout,
    ResourceAdded,
}

/// Partial update for one replicated store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePatchMessage {
    /// Name of the store the patch applies to.
    pub store: String,
    /// The fields that changed, nested objects merged recursively.
    pub patch: serde_json::Value,
}

impl StatePatchMessage {
    pub fn new(store: impl Into<String>, patch: serde_json::Value) -> Self {
        Self {
            store: store.into(),
            patch,
        }
    }
}

/// Liveness beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Whether the sender currently believes it is the primary context.
    pub is_primary: bool,
}

/// Request for stored credentials covering a set of entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRequestMessage {
    /// Correlates responses with this request.
    pub request_id: String,
    /// Connection entity IDs whose secrets are wanted.
    pub entity_ids: Vec<String>,
}

impl CredentialRequestMessage {
    /// Creates a request with a fresh correlation ID.
    pub fn new(entity_ids: Vec<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            entity_ids,
        }
    }
}

/// Sealed credential bundle.
///
/// The ephemeral key travels with the ciphertext; its expiry is what
/// protects a logged or replayed frame, not key secrecy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialResponseMessage {
    /// The request this answers.
    pub request_id: String,
    /// The context that asked. Other contexts ignore the response.
    pub requester: ContextId,
    /// Ephemeral key material, base64.
    pub key: String,
    /// Seal nonce, base64.
    pub nonce: String,
    /// Sealed credential bundle, base64.
    pub ciphertext: String,
    /// When the key stops opening the bundle.
    pub expires_at: DateTime<Utc>,
}

/// Notification that a syncable entity was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAddedMessage {
    pub kind: EntityKind,
    pub entity_id: String,
}

impl ResourceAddedMessage {
    pub fn new(kind: EntityKind, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
        }
    }
}
