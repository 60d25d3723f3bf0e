//! Context presence tracking and primary election.
//!
//! Every context heartbeats on a fixed interval and keeps a table of
//! the peers it has heard from, stamped with local receive time. One
//! context is elected primary so work that must happen once per
//! profile (cloud sync timers, notification polling) has a single
//! owner. The election re-runs on membership changes only: a peer's
//! first heartbeat, a stale prune, or a departure. A crashed context
//! is noticed within one stale timeout; there is no tighter guarantee.

use crate::protocol::{HeartbeatMessage, MessageKind, MessagePayload};
use crate::transport::{Subscription, Transport};
use querydeck_types::ContextId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Presence timing knobs.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Gap between heartbeats; also the sweep cadence.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is pruned. Keep this at two to three
    /// heartbeat intervals to tolerate jitter.
    pub stale_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            stale_timeout: Duration::from_secs(30),
        }
    }
}

/// One live context as seen from here.
#[derive(Debug, Clone)]
pub struct PresenceRecord {
    /// The peer's identity (or our own, for the local record).
    pub context_id: ContextId,
    /// Local receive time of the peer's latest heartbeat. For the
    /// local record, the time of the latest beat.
    pub last_heartbeat_at: Instant,
    /// The primary flag the peer last claimed.
    pub is_primary: bool,
}

/// Picks the primary from a set of presence records: the record with
/// the earliest `last_heartbeat_at` wins, and equal instants fall back
/// to the lowest context id.
///
/// Receive time, not origin time, ranks the peers. Transport delay can
/// mis-rank them for a window; membership churn settles it.
pub fn choose_primary<'a, I>(records: I) -> Option<ContextId>
where
    I: IntoIterator<Item = &'a PresenceRecord>,
{
    records
        .into_iter()
        .min_by_key(|record| (record.last_heartbeat_at, record.context_id))
        .map(|record| record.context_id)
}

enum PresenceEvent {
    Heartbeat { sender: ContextId, is_primary: bool },
    Departed { sender: ContextId },
}

/// Tracks live contexts and elects exactly one primary among them.
///
/// [`start`](Self::start) begins heartbeating immediately, so a
/// context alone on the channel elects itself without waiting a full
/// interval. Transitions into and out of primary are pushed through
/// [`primary_changes`](Self::primary_changes) and announced to peers
/// with an out-of-band heartbeat.
pub struct PresenceManager {
    context_id: ContextId,
    transport: Arc<Transport>,
    config: PresenceConfig,
    peers: Arc<RwLock<HashMap<ContextId, PresenceRecord>>>,
    primary_tx: Arc<watch::Sender<bool>>,
    primary_id: Arc<RwLock<Option<ContextId>>>,
    event_tx: mpsc::Sender<PresenceEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<PresenceEvent>>>,
    subscriptions: StdMutex<Vec<Subscription>>,
    loop_handle: StdMutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl PresenceManager {
    /// Creates a stopped manager bound to one transport.
    #[must_use]
    pub fn new(transport: Arc<Transport>, config: PresenceConfig) -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (primary_tx, _) = watch::channel(false);
        Arc::new(Self {
            context_id: transport.context_id(),
            transport,
            config,
            peers: Arc::new(RwLock::new(HashMap::new())),
            primary_tx: Arc::new(primary_tx),
            primary_id: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            subscriptions: StdMutex::new(Vec::new()),
            loop_handle: StdMutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Starts heartbeating and watching for peers.
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
        let on_beat = self.transport.on(MessageKind::PresenceHeartbeat, move |message| {
            if let MessagePayload::PresenceHeartbeat(beat) = message.payload {
                let _ = tx.try_send(PresenceEvent::Heartbeat {
                    sender: message.sender,
                    is_primary: beat.is_primary,
                });
            }
        });
        let tx = self.event_tx.clone();
        let on_depart = self.transport.on(MessageKind::PresenceDeparted, move |message| {
            let _ = tx.try_send(PresenceEvent::Departed {
                sender: message.sender,
            });
        });
        {
            let mut subs = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subs.push(on_beat);
            subs.push(on_depart);
        }

        let handle = tokio::spawn(Self::run_loop(
            self.context_id,
            Arc::clone(&self.transport),
            self.config.clone(),
            Arc::clone(&self.peers),
            Arc::clone(&self.primary_tx),
            Arc::clone(&self.primary_id),
            events,
            Arc::clone(&self.running),
        ));
        *self
            .loop_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Announces departure and stops heartbeating.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.transport.send(MessagePayload::PresenceDeparted);
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
        self.primary_tx.send_if_modified(|flag| {
            if *flag {
                *flag = false;
                true
            } else {
                false
            }
        });
    }

    /// This context's identity.
    #[must_use]
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Whether this context currently holds the primary role.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        *self.primary_tx.borrow()
    }

    /// Watch channel that flips whenever this context gains or loses
    /// the primary role.
    #[must_use]
    pub fn primary_changes(&self) -> watch::Receiver<bool> {
        self.primary_tx.subscribe()
    }

    /// Identity of the current primary, if any context has been seen.
    pub async fn current_primary(&self) -> Option<ContextId> {
        *self.primary_id.read().await
    }

    /// Snapshot of every context known to be alive, self included,
    /// ordered by id.
    pub async fn active_contexts(&self) -> Vec<PresenceRecord> {
        let map = self.peers.read().await;
        let mut records: Vec<PresenceRecord> = map.values().cloned().collect();
        records.sort_by_key(|record| record.context_id);
        records
    }

    async fn run_loop(
        context_id: ContextId,
        transport: Arc<Transport>,
        config: PresenceConfig,
        peers: Arc<RwLock<HashMap<ContextId, PresenceRecord>>>,
        primary_tx: Arc<watch::Sender<bool>>,
        primary_id: Arc<RwLock<Option<ContextId>>>,
        mut events: mpsc::Receiver<PresenceEvent>,
        running: Arc<AtomicBool>,
    ) {
        let mut ticker = tokio::time::interval(config.heartbeat_interval);
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let first_beat = Self::beat(context_id, &transport, &primary_tx, &peers).await;
                    let pruned = Self::sweep(&peers, config.stale_timeout).await;
                    if first_beat || pruned > 0 {
                        Self::settle_election(context_id, &transport, &peers, &primary_tx, &primary_id)
                            .await;
                    }
                }
                event = events.recv() => match event {
                    Some(PresenceEvent::Heartbeat { sender, is_primary }) => {
                        let newcomer = {
                            let mut map = peers.write().await;
                            let newcomer = !map.contains_key(&sender);
                            map.insert(sender, PresenceRecord {
                                context_id: sender,
                                last_heartbeat_at: Instant::now(),
                                is_primary,
                            });
                            newcomer
                        };
                        if newcomer {
                            debug!("Context {sender} joined the channel");
                            Self::settle_election(context_id, &transport, &peers, &primary_tx, &primary_id)
                                .await;
                        }
                    }
                    Some(PresenceEvent::Departed { sender }) => {
                        let removed = peers.write().await.remove(&sender).is_some();
                        if removed {
                            debug!("Context {sender} departed");
                            Self::settle_election(context_id, &transport, &peers, &primary_tx, &primary_id)
                                .await;
                        }
                    }
                    None => return,
                }
            }
        }
    }

    /// Emits one heartbeat and refreshes the local record. Returns
    /// whether this was the first beat.
    async fn beat(
        context_id: ContextId,
        transport: &Arc<Transport>,
        primary_tx: &watch::Sender<bool>,
        peers: &Arc<RwLock<HashMap<ContextId, PresenceRecord>>>,
    ) -> bool {
        let is_primary = *primary_tx.borrow();
        transport.send(MessagePayload::PresenceHeartbeat(HeartbeatMessage {
            is_primary,
        }));
        let mut map = peers.write().await;
        map.insert(
            context_id,
            PresenceRecord {
                context_id,
                last_heartbeat_at: Instant::now(),
                is_primary,
            },
        )
        .is_none()
    }

    /// Removes peers that have gone silent. Returns how many were
    /// pruned.
    async fn sweep(
        peers: &Arc<RwLock<HashMap<ContextId, PresenceRecord>>>,
        stale_timeout: Duration,
    ) -> usize {
        let now = Instant::now();
        let mut map = peers.write().await;
        let before = map.len();
        map.retain(|id, record| {
            let stale = now.duration_since(record.last_heartbeat_at) > stale_timeout;
            if stale {
                debug!("Pruning stale context {id}");
            }
            !stale
        });
        before - map.len()
    }

    async fn settle_election(
        context_id: ContextId,
        transport: &Arc<Transport>,
        peers: &Arc<RwLock<HashMap<ContextId, PresenceRecord>>>,
        primary_tx: &watch::Sender<bool>,
        primary_id: &Arc<RwLock<Option<ContextId>>>,
    ) {
        let winner = {
            let map = peers.read().await;
            choose_primary(map.values())
        };
        {
            let mut current = primary_id.write().await;
            if *current != winner {
                debug!("Primary moved from {:?} to {:?}", *current, winner);
                *current = winner;
            }
        }
        let am_primary = winner == Some(context_id);
        let flipped = primary_tx.send_if_modified(|flag| {
            if *flag == am_primary {
                false
            } else {
                *flag = am_primary;
                true
            }
        });
        if flipped {
            if am_primary {
                info!("Context {context_id} is now primary");
            } else {
                info!("Context {context_id} is no longer primary");
            }
            // Out-of-band heartbeat so peers see the flag change before
            // the next tick.
            transport.send(MessagePayload::PresenceHeartbeat(HeartbeatMessage {
                is_primary: am_primary,
            }));
            if let Some(record) = peers.write().await.get_mut(&context_id) {
                record.is_primary = am_primary;
            }
        }
    }
}
