//! Cross-context state replication.
//!
//! Sits between reactive state containers and the transport. Local
//! patches are scrubbed of excluded field paths, coalesced per store
//! within a trailing-edge debounce window, and published tagged with
//! the store name. Inbound patches are deep-merged into the matching
//! container under a re-entrancy guard so applying a remote patch
//! never echoes it back out. Merging is last-write-wins per leaf:
//! nested objects merge recursively, everything else is replaced.

use crate::policy::PolicyRegistry;
use crate::protocol::{MessageKind, MessagePayload, StatePatchMessage};
use crate::transport::{Subscription, Transport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use tracing::{debug, warn};

/// Merges `patch` into `target`.
///
/// Objects merge key by key, recursing where both sides are objects.
/// Primitives and arrays are replaced outright. Concurrent edits to
/// different leaves both survive; edits to the same leaf pick whichever
/// patch applied last.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match target_map.get_mut(key) {
                    Some(existing @ Value::Object(_)) if patch_value.is_object() => {
                        deep_merge(existing, patch_value);
                    }
                    _ => {
                        target_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (target_slot, patch_value) => *target_slot = patch_value.clone(),
    }
}

/// Removes one dot-separated field path from a JSON object, if present.
pub fn remove_field(value: &mut Value, path: &str) {
    let Value::Object(map) = value else {
        return;
    };
    match path.split_once('.') {
        Some((head, rest)) => {
            if let Some(child) = map.get_mut(head) {
                remove_field(child, rest);
            }
        }
        None => {
            map.remove(path);
        }
    }
}

/// A reactive state container the middleware can replicate.
///
/// Implementations need only a patch entrypoint and a snapshot getter;
/// everything else about the container stays opaque.
pub trait StateContainer: Send + Sync {
    /// Logical store name, matched against policies and patches.
    fn store_name(&self) -> &str;

    /// Current state as a JSON value.
    fn snapshot(&self) -> Value;

    /// Deep-merges a partial patch into the state.
    fn apply_patch(&self, patch: &Value);

    /// Replaces the whole state. Never triggers replication.
    fn replace_state(&self, state: &Value);
}

/// [`StateContainer`] over any serde-compatible state type.
///
/// Patches are applied against the serialized form and deserialized
/// back, so the container's schema stays closed: a patch that does not
/// fit the type is dropped with a warning rather than corrupting state.
pub struct ReplicatedState<T> {
    name: String,
    state: StdRwLock<T>,
}

impl<T> ReplicatedState<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, initial: T) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: StdRwLock::new(initial),
        })
    }

    /// Clone of the current state.
    pub fn get(&self) -> T {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T> StateContainer for ReplicatedState<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn store_name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> Value {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_value(&*guard).unwrap_or(Value::Null)
    }

    fn apply_patch(&self, patch: &Value) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut current = match serde_json::to_value(&*guard) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to serialize state for store {}: {e}", self.name);
                return;
            }
        };
        deep_merge(&mut current, patch);
        match serde_json::from_value::<T>(current) {
            Ok(next) => *guard = next,
            Err(e) => {
                warn!(
                    "Patch for store {} does not fit its schema, ignored: {e}",
                    self.name
                );
            }
        }
    }

    fn replace_state(&self, state: &Value) {
        match serde_json::from_value::<T>(state.clone()) {
            Ok(next) => {
                *self.state.write().unwrap_or_else(PoisonError::into_inner) = next;
            }
            Err(e) => {
                warn!(
                    "Replacement state for store {} does not fit its schema, ignored: {e}",
                    self.name
                );
            }
        }
    }
}

/// Clears the re-entrancy flag even if the apply panics.
struct ApplyGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> ApplyGuard<'a> {
    fn engage(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag }
    }
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct Attached {
    container: Arc<dyn StateContainer>,
    applying: Arc<AtomicBool>,
    pending: Arc<StdMutex<Option<Value>>>,
}

struct Inner {
    transport: Arc<Transport>,
    registry: PolicyRegistry,
    containers: StdRwLock<HashMap<String, Attached>>,
}

impl Inner {
    fn attached(&self, store: &str) -> Option<Attached> {
        self.containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(store)
            .cloned()
    }

    fn apply_remote(self: &Arc<Self>, store: &str, patch: &Value) {
        if !self.registry.is_replicated(store) {
            debug!("Ignoring patch for non-replicated store {store}");
            return;
        }
        let Some(attached) = self.attached(store) else {
            debug!("No container attached for store {store}");
            return;
        };
        let _guard = ApplyGuard::engage(&attached.applying);
        attached.container.apply_patch(patch);
    }

    fn on_local_update(self: &Arc<Self>, store: &str, patch: &Value, full_replace: bool) {
        if full_replace {
            return;
        }
        let Some(attached) = self.attached(store) else {
            return;
        };
        if attached.applying.load(Ordering::SeqCst) {
            return;
        }
        let Some(policy) = self.registry.get(store) else {
            return;
        };
        if !policy.enabled {
            return;
        }
        let mut outgoing = patch.clone();
        for path in &policy.exclude_fields {
            remove_field(&mut outgoing, path);
        }
        if outgoing.as_object().is_some_and(|map| map.is_empty()) {
            return;
        }
        let window = policy.debounce_window();
        if window.is_zero() {
            self.publish(store, outgoing);
            return;
        }
        let arm_timer = {
            let mut pending = attached
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match pending.as_mut() {
                Some(buffered) => {
                    deep_merge(buffered, &outgoing);
                    false
                }
                None => {
                    *pending = Some(outgoing);
                    true
                }
            }
        };
        if arm_timer {
            let weak = Arc::downgrade(self);
            let store = store.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if let Some(inner) = weak.upgrade() {
                    inner.flush(&store);
                }
            });
        }
    }

    fn flush(&self, store: &str) {
        let Some(attached) = self.attached(store) else {
            return;
        };
        let buffered = attached
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(patch) = buffered {
            self.publish(store, patch);
        }
    }

    fn flush_all(&self) {
        for policy in self.registry.by_priority() {
            self.flush(&policy.name);
        }
    }

    fn publish(&self, store: &str, patch: Value) {
        debug!("Publishing patch for store {store}");
        self.transport
            .send(MessagePayload::StatePatch(StatePatchMessage::new(
                store, patch,
            )));
    }
}

/// Replicates attached containers across contexts.
pub struct StateBroadcaster {
    inner: Arc<Inner>,
    subscription: StdMutex<Option<Subscription>>,
}

impl StateBroadcaster {
    #[must_use]
    pub fn new(transport: Arc<Transport>, registry: PolicyRegistry) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                registry,
                containers: StdRwLock::new(HashMap::new()),
            }),
            subscription: StdMutex::new(None),
        }
    }

    /// Starts applying inbound patches. Calling twice is a no-op.
    pub fn start(&self) {
        let mut slot = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let subscription = self
            .inner
            .transport
            .on(MessageKind::StatePatch, move |message| {
                if let MessagePayload::StatePatch(patch) = message.payload {
                    if let Some(inner) = weak.upgrade() {
                        inner.apply_remote(&patch.store, &patch.patch);
                    }
                }
            });
        *slot = Some(subscription);
    }

    /// Stops applying inbound patches. Buffered local patches still
    /// flush when their windows elapse.
    pub fn stop(&self) {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Registers a container under its store name, replacing any
    /// previous registration.
    pub fn attach(&self, container: Arc<dyn StateContainer>) {
        let name = container.store_name().to_string();
        if !self.inner.registry.is_replicated(&name) {
            debug!("Store {name} attached without a replication policy");
        }
        let mut containers = self
            .inner
            .containers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        containers.insert(
            name,
            Attached {
                container,
                applying: Arc::new(AtomicBool::new(false)),
                pending: Arc::new(StdMutex::new(None)),
            },
        );
    }

    pub fn detach(&self, store: &str) {
        self.inner
            .containers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(store);
    }

    /// Applies a local patch to the container and queues it for
    /// replication per the store's policy.
    pub fn update(&self, store: &str, patch: &Value) {
        let Some(attached) = self.inner.attached(store) else {
            debug!("No container attached for store {store}");
            return;
        };
        attached.container.apply_patch(patch);
        self.inner.on_local_update(store, patch, false);
    }

    /// Replaces the container's state wholesale. Full replacements are
    /// never replicated.
    pub fn replace(&self, store: &str, state: &Value) {
        let Some(attached) = self.inner.attached(store) else {
            debug!("No container attached for store {store}");
            return;
        };
        attached.container.replace_state(state);
        self.inner.on_local_update(store, state, true);
    }

    /// Hook for containers that mutate themselves: report a mutation
    /// that already happened so it replicates.
    pub fn on_local_update(&self, store: &str, patch: &Value, full_replace: bool) {
        self.inner.on_local_update(store, patch, full_replace);
    }

    /// Publishes every buffered patch now, in policy priority order.
    pub fn flush_all(&self) {
        self.inner.flush_all();
    }

    /// Snapshot of one attached container's state.
    #[must_use]
    pub fn snapshot(&self, store: &str) -> Option<Value> {
        self.inner
            .attached(store)
            .map(|attached| attached.container.snapshot())
    }
}
