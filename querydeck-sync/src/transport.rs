//! Context-to-context message transport.
//!
//! Wraps a broadcast bus primitive behind [`BusBackend`] so the rest of
//! the crate never touches it directly. The [`Transport`] owns the
//! envelope stamping, the per-kind handler registry, the outbound retry
//! queue, and the degraded mode the app falls into when the bus cannot
//! be opened. Sending is fire-and-forget: a message that cannot be
//! delivered after retries is dropped with a warning, never surfaced to
//! the caller.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{MessageKind, MessagePayload, PeerMessage};
use async_trait::async_trait;
use querydeck_types::{ContextId, HybridTimestamp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tracing::{debug, info, warn};

/// How many frames a hub channel buffers before slow receivers lag.
const HUB_CAPACITY: usize = 256;

/// A live link to one named bus channel.
///
/// Publishing is fallible; receiving yields raw frames until the channel
/// closes. A link never yields frames it published itself.
#[async_trait]
pub trait BusLink: Send + Sync {
    /// Publishes one frame to every other link on the channel.
    async fn publish(&self, frame: Vec<u8>) -> SyncResult<()>;

    /// Waits for the next frame from a sibling link. Returns `None`
    /// once the channel is closed.
    async fn recv(&self) -> Option<Vec<u8>>;
}

/// Factory for bus links, one per named channel.
pub trait BusBackend: Send + Sync {
    /// Opens a link to the named channel. Fails when the underlying
    /// primitive is unavailable, in which case the transport degrades
    /// to a no-op.
    fn open(&self, channel: &str) -> SyncResult<Box<dyn BusLink>>;
}

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// The bus channel all contexts of one profile share.
    pub channel: String,
    /// First retry delay after a failed publish; doubles per attempt.
    pub send_retry_base: Duration,
    /// Ceiling for the publish retry delay.
    pub send_retry_cap: Duration,
    /// Publish attempts before a message is dropped.
    pub max_send_attempts: u32,
    /// First delay before reopening an unavailable bus; doubles per attempt.
    pub reconnect_base: Duration,
    /// Ceiling for the reconnect delay.
    pub reconnect_cap: Duration,
    /// Reopen attempts before messaging stays disabled for good.
    pub max_reconnect_attempts: u32,
    /// Outbound queue depth; sends beyond it are dropped.
    pub queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel: "querydeck-sync".to_string(),
            send_retry_base: Duration::from_millis(200),
            send_retry_cap: Duration::from_secs(5),
            max_send_attempts: 5,
            reconnect_base: Duration::from_millis(500),
            reconnect_cap: Duration::from_secs(10),
            max_reconnect_attempts: 6,
            queue_capacity: 256,
        }
    }
}

/// Handler invoked for each matching inbound message.
pub type MessageHandler = Arc<dyn Fn(PeerMessage) + Send + Sync>;

type HandlerMap = HashMap<MessageKind, Vec<(u64, MessageHandler)>>;

/// Registration handle returned by [`Transport::on`].
///
/// The handler stays registered for as long as this is held; dropping
/// it (or calling [`unsubscribe`](Self::unsubscribe)) removes the
/// handler.
#[must_use = "dropping a subscription unregisters its handler"]
pub struct Subscription {
    kind: MessageKind,
    id: u64,
    handlers: Weak<StdRwLock<HandlerMap>>,
}

impl Subscription {
    /// Removes the handler. Equivalent to dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            let mut map = handlers.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = map.get_mut(&self.kind) {
                list.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// The message transport for one browsing context.
///
/// Construct with [`connect`](Self::connect); it never fails. If the
/// bus cannot be opened the transport comes up degraded: sends become
/// silent no-ops while a background task retries the open with
/// exponential backoff, up to a cap, after which messaging stays off
/// for the life of the context.
pub struct Transport {
    context_id: ContextId,
    config: TransportConfig,
    backend: Arc<dyn BusBackend>,
    link: Arc<RwLock<Option<Arc<dyn BusLink>>>>,
    connected: Arc<AtomicBool>,
    handlers: Arc<StdRwLock<HandlerMap>>,
    next_handler_id: AtomicU64,
    outbound_tx: mpsc::Sender<PeerMessage>,
    last_stamp: StdMutex<HybridTimestamp>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl Transport {
    /// Opens the bus channel and starts the send and receive tasks.
    ///
    /// Must be called from inside a tokio runtime.
    pub async fn connect(
        backend: Arc<dyn BusBackend>,
        context_id: ContextId,
        config: TransportConfig,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity);
        let transport = Arc::new(Self {
            context_id,
            config,
            backend,
            link: Arc::new(RwLock::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            handlers: Arc::new(StdRwLock::new(HashMap::new())),
            next_handler_id: AtomicU64::new(1),
            outbound_tx,
            last_stamp: StdMutex::new(HybridTimestamp::now()),
            running: Arc::new(AtomicBool::new(true)),
            shutdown: Arc::new(Notify::new()),
        });

        match transport.backend.open(&transport.config.channel) {
            Ok(link) => {
                let link: Arc<dyn BusLink> = Arc::from(link);
                *transport.link.write().await = Some(Arc::clone(&link));
                transport.connected.store(true, Ordering::SeqCst);
                debug!("Bus channel {} opened", transport.config.channel);
                Self::spawn_receiver(Arc::clone(&transport), link);
            }
            Err(e) => {
                warn!(
                    "Bus channel {} unavailable, messaging degraded: {e}",
                    transport.config.channel
                );
                Self::spawn_reconnect(Arc::clone(&transport));
            }
        }

        Self::spawn_sender(Arc::clone(&transport), outbound_rx);
        transport
    }

    /// This context's identity.
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Whether a live bus link is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queues a payload for delivery to sibling contexts.
    ///
    /// Fire-and-forget: stamps the envelope and returns immediately.
    /// When the transport is degraded or the queue is full the message
    /// is dropped.
    pub fn send(&self, payload: MessagePayload) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let message = PeerMessage::new(self.context_id, self.next_stamp(), payload);
        if let Err(e) = self.outbound_tx.try_send(message) {
            debug!("Outbound queue rejected message: {e}");
        }
    }

    /// Registers a handler for one message kind.
    ///
    /// Each matching inbound message runs the handler on its own task,
    /// so a panicking or slow handler cannot stall the receive loop or
    /// its neighbours.
    pub fn on<F>(&self, kind: MessageKind, handler: F) -> Subscription
    where
        F: Fn(PeerMessage) + Send + Sync + 'static,
    {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        let mut map = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(kind).or_default().push((id, Arc::new(handler)));
        Subscription {
            kind,
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Announces departure and stops the transport.
    ///
    /// The goodbye bypasses the retry queue: it gets one direct publish
    /// attempt so peers can re-elect promptly, and is abandoned if that
    /// fails.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let farewell = PeerMessage::new(
            self.context_id,
            self.next_stamp(),
            MessagePayload::PresenceDeparted,
        );
        let link = self.link.read().await.clone();
        if let Some(link) = link {
            match serde_json::to_vec(&farewell) {
                Ok(bytes) => {
                    if let Err(e) = link.publish(bytes).await {
                        debug!("Departure announcement failed: {e}");
                    }
                }
                Err(e) => debug!("Failed to encode departure announcement: {e}"),
            }
        }
        *self.link.write().await = None;
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        info!("Transport for context {} shut down", self.context_id);
    }

    fn next_stamp(&self) -> HybridTimestamp {
        let mut stamp = self
            .last_stamp
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *stamp = stamp.tick();
        *stamp
    }

    fn handle_frame(&self, bytes: &[u8]) {
        let message: PeerMessage = match serde_json::from_slice(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring malformed bus frame: {e}");
                return;
            }
        };
        // The hub suppresses own frames, but a backend is not required to.
        if message.sender == self.context_id {
            return;
        }
        let kind = message.payload.kind();
        let targets: Vec<MessageHandler> = {
            let map = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            map.get(&kind)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in targets {
            let message = message.clone();
            tokio::spawn(async move {
                handler(message);
            });
        }
    }

    async fn deliver(&self, message: PeerMessage) {
        let bytes = match serde_json::to_vec(&message) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "Failed to encode {:?} message: {e}",
                    message.payload.kind()
                );
                return;
            }
        };
        let mut attempt: u32 = 0;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let link = self.link.read().await.clone();
            let Some(link) = link else {
                debug!(
                    "Transport degraded, dropping {:?} message",
                    message.payload.kind()
                );
                return;
            };
            match link.publish(bytes.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.max_send_attempts {
                        warn!(
                            "Dropping {:?} message after {attempt} attempts: {e}",
                            message.payload.kind()
                        );
                        return;
                    }
                    let delay = backoff_delay(
                        self.config.send_retry_base,
                        self.config.send_retry_cap,
                        attempt - 1,
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn spawn_sender(transport: Arc<Self>, mut outbound_rx: mpsc::Receiver<PeerMessage>) {
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    maybe = outbound_rx.recv() => match maybe {
                        Some(message) => message,
                        None => return,
                    },
                    _ = transport.shutdown.notified() => return,
                };
                transport.deliver(message).await;
            }
        });
    }

    fn spawn_receiver(transport: Arc<Self>, link: Arc<dyn BusLink>) {
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = link.recv() => frame,
                    _ = transport.shutdown.notified() => return,
                };
                match frame {
                    Some(bytes) => transport.handle_frame(&bytes),
                    None => break,
                }
            }
            if transport.running.load(Ordering::SeqCst) {
                warn!("Bus link closed unexpectedly, attempting to reopen");
                *transport.link.write().await = None;
                transport.connected.store(false, Ordering::SeqCst);
                Self::spawn_reconnect(transport);
            }
        });
    }

    fn spawn_reconnect(transport: Arc<Self>) {
        tokio::spawn(async move {
            for attempt in 0..transport.config.max_reconnect_attempts {
                let delay = backoff_delay(
                    transport.config.reconnect_base,
                    transport.config.reconnect_cap,
                    attempt,
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = transport.shutdown.notified() => return,
                }
                if !transport.running.load(Ordering::SeqCst) {
                    return;
                }
                match transport.backend.open(&transport.config.channel) {
                    Ok(link) => {
                        let link: Arc<dyn BusLink> = Arc::from(link);
                        *transport.link.write().await = Some(Arc::clone(&link));
                        transport.connected.store(true, Ordering::SeqCst);
                        info!(
                            "Bus channel {} reopened on attempt {}",
                            transport.config.channel,
                            attempt + 1
                        );
                        Self::spawn_receiver(transport, link);
                        return;
                    }
                    Err(e) => {
                        debug!("Bus reopen attempt {} failed: {e}", attempt + 1);
                    }
                }
            }
            warn!(
                "Bus channel {} still unavailable after {} attempts, messaging stays disabled",
                transport.config.channel, transport.config.max_reconnect_attempts
            );
        });
    }
}

fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(cap)
}

// ── In-process hub ───────────────────────────────────────────────

#[derive(Clone)]
struct Frame {
    origin: u64,
    bytes: Vec<u8>,
}

/// In-process [`BusBackend`]: a set of named broadcast channels shared
/// by every link opened through the same hub.
///
/// This is the production backend when all contexts live in one
/// process, and the test double everywhere else. Frames are delivered
/// to every link on the channel except the one that published them.
pub struct LocalHub {
    channels: StdMutex<HashMap<String, broadcast::Sender<Frame>>>,
    next_link_id: AtomicU64,
    available: AtomicBool,
}

impl LocalHub {
    /// Creates a hub that accepts links.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: StdMutex::new(HashMap::new()),
            next_link_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
        })
    }

    /// Creates a hub that refuses to open links, for exercising the
    /// degraded path.
    #[must_use]
    pub fn unavailable() -> Arc<Self> {
        let hub = Self::new();
        hub.available.store(false, Ordering::SeqCst);
        hub
    }

    /// Flips availability; existing links are unaffected.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl BusBackend for LocalHub {
    fn open(&self, channel: &str) -> SyncResult<Box<dyn BusLink>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(SyncError::TransportUnavailable(
                "bus backend offline".to_string(),
            ));
        }
        let tx = {
            let mut channels = self
                .channels
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(HUB_CAPACITY).0)
                .clone()
        };
        let id = self.next_link_id.fetch_add(1, Ordering::SeqCst);
        let rx = tx.subscribe();
        Ok(Box::new(HubLink {
            id,
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }))
    }
}

struct HubLink {
    id: u64,
    tx: broadcast::Sender<Frame>,
    rx: tokio::sync::Mutex<broadcast::Receiver<Frame>>,
}

#[async_trait]
impl BusLink for HubLink {
    async fn publish(&self, frame: Vec<u8>) -> SyncResult<()> {
        // Own subscription keeps the channel alive, so send only fails
        // once the hub itself is gone.
        self.tx
            .send(Frame {
                origin: self.id,
                bytes: frame,
            })
            .map(|_| ())
            .map_err(|_| SyncError::Delivery("bus channel closed".to_string()))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(frame) if frame.origin == self.id => continue,
                Ok(frame) => return Some(frame.bytes),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Bus receiver lagged, {missed} frames dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Failure-injecting backends for testing.
pub mod mock {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Backend whose links open fine but fail every publish, for
    /// exercising the retry-then-drop path.
    #[derive(Default)]
    pub struct FailingBackend {
        attempts: Arc<AtomicU32>,
    }

    impl FailingBackend {
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Publish attempts seen across all links.
        pub fn publish_attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl BusBackend for FailingBackend {
        fn open(&self, _channel: &str) -> SyncResult<Box<dyn BusLink>> {
            Ok(Box::new(FailingLink {
                attempts: Arc::clone(&self.attempts),
            }))
        }
    }

    struct FailingLink {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BusLink for FailingLink {
        async fn publish(&self, _frame: Vec<u8>) -> SyncResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SyncError::Delivery("injected publish failure".to_string()))
        }

        async fn recv(&self) -> Option<Vec<u8>> {
            std::future::pending().await
        }
    }
}
