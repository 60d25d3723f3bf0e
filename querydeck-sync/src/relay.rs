//! Credential sharing between contexts.
//!
//! A context that needs connection secrets it does not hold asks its
//! siblings. Any holder may answer after an approval check: the bundle
//! is sealed under a fresh single-use key that travels with the
//! ciphertext. Key secrecy is not the point; the short expiry is what
//! keeps a logged or replayed frame from being useful later. A request
//! nobody answers resolves to an empty list, never an error.

use crate::error::SyncResult;
use crate::protocol::{
    CredentialRequestMessage, CredentialResponseMessage, MessageKind, MessagePayload,
};
use crate::transport::{Subscription, Transport};
use crate::vault::CredentialVault;
use querydeck_crypto::{open, seal, EphemeralKey, KeyRing, SealedPayload};
use querydeck_types::ContextId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Relay timing knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long a requester waits before settling for no credentials.
    pub request_timeout: Duration,
    /// Lifetime of each sealing key.
    pub key_lifetime: Duration,
    /// Cadence of the expired-key sweep.
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            key_lifetime: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// One entity's plaintext secret, as carried inside the sealed bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedCredential {
    pub entity_id: String,
    pub secret: String,
}

/// Decides whether to answer a sibling's credential request.
///
/// Implementations may prompt the user or consult policy. Declining is
/// silent: the requester simply times out.
#[async_trait::async_trait]
pub trait ShareApprover: Send + Sync {
    async fn approve(&self, requester: ContextId, entity_ids: &[String]) -> bool;
}

/// Grants every request. Suitable when all contexts belong to one
/// signed-in user on one machine.
#[derive(Debug, Default)]
pub struct ApproveAll;

#[async_trait::async_trait]
impl ShareApprover for ApproveAll {
    async fn approve(&self, _requester: ContextId, _entity_ids: &[String]) -> bool {
        true
    }
}

enum RelayEvent {
    Request {
        sender: ContextId,
        request: CredentialRequestMessage,
    },
    Response(CredentialResponseMessage),
    Logout,
}

/// Answers sibling credential requests and collects answers to our own.
pub struct CredentialRelay {
    context_id: ContextId,
    transport: Arc<Transport>,
    vault: Arc<dyn CredentialVault>,
    approver: Arc<dyn ShareApprover>,
    config: RelayConfig,
    ring: Arc<KeyRing>,
    pending: Arc<StdMutex<HashMap<String, oneshot::Sender<Vec<SharedCredential>>>>>,
    event_tx: mpsc::Sender<RelayEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<RelayEvent>>>,
    subscriptions: StdMutex<Vec<Subscription>>,
    loop_handle: StdMutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl CredentialRelay {
    /// Creates a stopped relay bound to one transport and vault.
    #[must_use]
    pub fn new(
        transport: Arc<Transport>,
        vault: Arc<dyn CredentialVault>,
        approver: Arc<dyn ShareApprover>,
        config: RelayConfig,
    ) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(64);
        Arc::new(Self {
            context_id: transport.context_id(),
            transport,
            vault,
            approver,
            config,
            ring: Arc::new(KeyRing::default()),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            subscriptions: StdMutex::new(Vec::new()),
            loop_handle: StdMutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Starts answering requests and sweeping expired keys.
    ///
    /// Must be called from inside a tokio runtime. Calling twice is a
    /// no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let events = self
            .event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(events) = events else {
            return;
        };

        let tx = self.event_tx.clone();
        let on_request = self
            .transport
            .on(MessageKind::CredentialRequest, move |message| {
                if let MessagePayload::CredentialRequest(request) = message.payload {
                    let _ = tx.try_send(RelayEvent::Request {
                        sender: message.sender,
                        request,
                    });
                }
            });
        let tx = self.event_tx.clone();
        let on_response = self
            .transport
            .on(MessageKind::CredentialResponse, move |message| {
                if let MessagePayload::CredentialResponse(response) = message.payload {
                    let _ = tx.try_send(RelayEvent::Response(response));
                }
            });
        let tx = self.event_tx.clone();
        let on_logout = self.transport.on(MessageKind::Logout, move |_message| {
            let _ = tx.try_send(RelayEvent::Logout);
        });
        {
            let mut subs = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subs.push(on_request);
            subs.push(on_response);
            subs.push(on_logout);
        }

        let handle = tokio::spawn(Self::run_loop(
            self.context_id,
            Arc::clone(&self.transport),
            Arc::clone(&self.vault),
            Arc::clone(&self.approver),
            self.config.clone(),
            Arc::clone(&self.ring),
            Arc::clone(&self.pending),
            events,
            Arc::clone(&self.running),
        ));
        *self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stops the relay. Outstanding requests resolve empty.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(handle) = self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        // Dropping the waiters resolves every outstanding request to
        // an empty list immediately.
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Asks sibling contexts for the secrets of the given entities.
    ///
    /// Resolves with whatever the first trusted answer carried, or an
    /// empty list after the timeout. Received secrets are already in
    /// the vault when this returns.
    pub async fn request(&self, entity_ids: Vec<String>) -> Vec<SharedCredential> {
        if entity_ids.is_empty() {
            return Vec::new();
        }
        let request = CredentialRequestMessage::new(entity_ids);
        let request_id = request.request_id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            map.insert(request_id.clone(), reply_tx);
        }
        self.transport.send(MessagePayload::CredentialRequest(request));
        match tokio::time::timeout(self.config.request_timeout, reply_rx).await {
            Ok(Ok(credentials)) => credentials,
            _ => {
                let mut map = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
                map.remove(&request_id);
                debug!("Credential request {request_id} went unanswered");
                Vec::new()
            }
        }
    }

    /// Clears the local vault and tells every sibling to do the same.
    pub async fn broadcast_logout(&self) {
        self.vault.clear().await;
        self.transport.send(MessagePayload::Logout);
    }

    /// Requests currently waiting for an answer.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Sealing keys not yet swept.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.ring.len()
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        context_id: ContextId,
        transport: Arc<Transport>,
        vault: Arc<dyn CredentialVault>,
        approver: Arc<dyn ShareApprover>,
        config: RelayConfig,
        ring: Arc<KeyRing>,
        pending: Arc<StdMutex<HashMap<String, oneshot::Sender<Vec<SharedCredential>>>>>,
        mut events: mpsc::Receiver<RelayEvent>,
        running: Arc<AtomicBool>,
    ) {
        let mut sweeper = tokio::time::interval(config.sweep_interval);
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = sweeper.tick() => {
                    let removed = ring.sweep();
                    if removed > 0 {
                        debug!("Swept {removed} expired sealing keys");
                    }
                }
                event = events.recv() => match event {
                    Some(RelayEvent::Request { sender, request }) => {
                        Self::answer_request(&transport, &vault, &approver, &config, &ring, sender, request)
                            .await;
                    }
                    Some(RelayEvent::Response(response)) => {
                        Self::accept_response(context_id, &vault, &pending, response).await;
                    }
                    Some(RelayEvent::Logout) => {
                        vault.clear().await;
                        debug!("Cleared credential vault after sibling logout");
                    }
                    None => return,
                }
            }
        }
    }

    /// Seals and sends our secrets for an approved request. Declines
    /// and empty holdings are silent; the requester times out.
    async fn answer_request(
        transport: &Arc<Transport>,
        vault: &Arc<dyn CredentialVault>,
        approver: &Arc<dyn ShareApprover>,
        config: &RelayConfig,
        ring: &Arc<KeyRing>,
        requester: ContextId,
        request: CredentialRequestMessage,
    ) {
        if !approver.approve(requester, &request.entity_ids).await {
            debug!(
                "Declined credential request {} from {requester}",
                request.request_id
            );
            return;
        }
        let mut bundle = Vec::new();
        for entity_id in &request.entity_ids {
            if let Some(secret) = vault.get_secret(entity_id).await {
                bundle.push(SharedCredential {
                    entity_id: entity_id.clone(),
                    secret,
                });
            }
        }
        if bundle.is_empty() {
            debug!("No credentials held for request {}", request.request_id);
            return;
        }
        let plaintext = match serde_json::to_vec(&bundle) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode credential bundle: {e}");
                return;
            }
        };
        let key = ring.mint(config.key_lifetime);
        let sealed = match seal(&key, &plaintext) {
            Ok(sealed) => sealed,
            Err(e) => {
                warn!("Failed to seal credential bundle: {e}");
                return;
            }
        };
        transport.send(MessagePayload::CredentialResponse(
            CredentialResponseMessage {
                request_id: request.request_id,
                requester,
                key: key.material_base64(),
                nonce: sealed.nonce_base64(),
                ciphertext: sealed.ciphertext_base64(),
                expires_at: key.expires_at(),
            },
        ));
    }

    /// Applies the first usable answer to one of our own requests.
    ///
    /// The pending entry is removed only after a successful unseal, so
    /// a malformed or expired response does not consume the request:
    /// a later answer can still win, or the timeout fires.
    async fn accept_response(
        context_id: ContextId,
        vault: &Arc<dyn CredentialVault>,
        pending: &Arc<StdMutex<HashMap<String, oneshot::Sender<Vec<SharedCredential>>>>>,
        response: CredentialResponseMessage,
    ) {
        if response.requester != context_id {
            return;
        }
        let wanted = {
            let map = pending.lock().unwrap_or_else(PoisonError::into_inner);
            map.contains_key(&response.request_id)
        };
        if !wanted {
            return;
        }
        let credentials = match Self::unseal_bundle(&response) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!(
                    "Discarding credential response for {}: {e}",
                    response.request_id
                );
                return;
            }
        };
        for credential in &credentials {
            vault
                .put_secret(&credential.entity_id, &credential.secret)
                .await;
        }
        let waiter = {
            let mut map = pending.lock().unwrap_or_else(PoisonError::into_inner);
            map.remove(&response.request_id)
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(credentials);
        }
    }

    fn unseal_bundle(response: &CredentialResponseMessage) -> SyncResult<Vec<SharedCredential>> {
        let key = EphemeralKey::from_base64(&response.key, response.expires_at)?;
        let sealed = SealedPayload::from_base64_parts(&response.nonce, &response.ciphertext)?;
        let plaintext = open(&key, &sealed)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}
