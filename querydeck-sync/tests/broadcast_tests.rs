//! Tests for broadcast.rs — patch merging, replication policy, and debounce.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use querydeck_sync::{
    deep_merge, remove_field, BusBackend, LocalHub, MessageKind, MessagePayload, PolicyRegistry,
    ReplicatedState, StateBroadcaster, StateContainer, StatePatchMessage, StoreSyncPolicy,
    Subscription, Transport, TransportConfig,
};
use querydeck_types::ContextId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Prefs {
    theme: String,
    page_size: u32,
}

fn prefs() -> Prefs {
    Prefs {
        theme: "light".into(),
        page_size: 50,
    }
}

fn instant_registry() -> PolicyRegistry {
    PolicyRegistry::new(vec![StoreSyncPolicy::new("preferences")])
}

async fn transport_on(hub: &Arc<LocalHub>) -> Arc<Transport> {
    Transport::connect(
        Arc::clone(hub) as Arc<dyn BusBackend>,
        ContextId::new(),
        TransportConfig::default(),
    )
    .await
}

async fn broadcaster_on(
    hub: &Arc<LocalHub>,
    registry: PolicyRegistry,
) -> (StateBroadcaster, Arc<ReplicatedState<Prefs>>) {
    let transport = transport_on(hub).await;
    let broadcaster = StateBroadcaster::new(transport, registry);
    broadcaster.start();
    let state = ReplicatedState::new("preferences", prefs());
    broadcaster.attach(Arc::clone(&state) as Arc<dyn StateContainer>);
    (broadcaster, state)
}

/// Watches raw patch frames on the bus without applying them anywhere.
async fn observe_patches(
    hub: &Arc<LocalHub>,
) -> (Subscription, mpsc::Receiver<StatePatchMessage>) {
    let transport = transport_on(hub).await;
    let (tx, rx) = mpsc::channel(64);
    let subscription = transport.on(MessageKind::StatePatch, move |message| {
        if let MessagePayload::StatePatch(patch) = message.payload {
            let _ = tx.try_send(patch);
        }
    });
    (subscription, rx)
}

async fn expect_patch(rx: &mut mpsc::Receiver<StatePatchMessage>) -> StatePatchMessage {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no patch within deadline")
        .expect("observer channel closed")
}

async fn expect_no_patch(rx: &mut mpsc::Receiver<StatePatchMessage>) {
    if let Ok(Some(patch)) = timeout(Duration::from_millis(100), rx.recv()).await {
        panic!("unexpected patch: {patch:?}");
    }
}

// ── Merge primitives ─────────────────────────────────────────────

#[test]
fn deep_merge_recurses_objects_and_replaces_leaves() {
    let mut target = json!({
        "theme": "light",
        "editor": {"font": "mono", "size": 12}
    });
    deep_merge(&mut target, &json!({"editor": {"size": 14}, "theme": "dark"}));

    assert_eq!(
        target,
        json!({"theme": "dark", "editor": {"font": "mono", "size": 14}})
    );
}

#[test]
fn deep_merge_replaces_arrays_and_mismatched_shapes() {
    let mut target = json!({"tags": ["a", "b"], "nested": {"keep": 1}});
    deep_merge(&mut target, &json!({"tags": ["c"], "nested": 7}));
    assert_eq!(target, json!({"tags": ["c"], "nested": 7}));

    let mut scalar = json!(1);
    deep_merge(&mut scalar, &json!({"now": "object"}));
    assert_eq!(scalar, json!({"now": "object"}));
}

#[test]
fn remove_field_handles_nested_paths() {
    let mut value = json!({
        "credential": {"password": "x", "username": "admin"},
        "host": "db.local"
    });
    remove_field(&mut value, "credential.password");
    remove_field(&mut value, "credential.missing");
    remove_field(&mut value, "absent.path");

    assert_eq!(
        value,
        json!({"credential": {"username": "admin"}, "host": "db.local"})
    );

    let mut scalar = json!("nothing to do");
    remove_field(&mut scalar, "some.path");
    assert_eq!(scalar, json!("nothing to do"));
}

// ── Replication ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn local_update_reaches_sibling_stores() {
    let hub = LocalHub::new();
    let (sender, sender_state) = broadcaster_on(&hub, instant_registry()).await;
    let (_receiver, receiver_state) = broadcaster_on(&hub, instant_registry()).await;

    sender.update("preferences", &json!({"theme": "dark"}));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(sender_state.get().theme, "dark");
    assert_eq!(receiver_state.get().theme, "dark");
    // Untouched fields survive the merge on both sides.
    assert_eq!(receiver_state.get().page_size, 50);
}

#[tokio::test(start_paused = true)]
async fn remote_applies_do_not_echo() {
    let hub = LocalHub::new();
    let (sender, _sender_state) = broadcaster_on(&hub, instant_registry()).await;
    let (_receiver, receiver_state) = broadcaster_on(&hub, instant_registry()).await;
    let (_patch_sub, mut patches) = observe_patches(&hub).await;

    sender.update("preferences", &json!({"theme": "dark"}));
    sleep(Duration::from_millis(100)).await;

    // Exactly one frame despite two broadcasters applying the patch.
    expect_patch(&mut patches).await;
    expect_no_patch(&mut patches).await;
    assert_eq!(receiver_state.get().theme, "dark");
}

#[tokio::test(start_paused = true)]
async fn excluded_fields_never_leave_the_context() {
    let registry = PolicyRegistry::new(vec![
        StoreSyncPolicy::new("connections").exclude("credential.password")
    ]);
    let hub = LocalHub::new();
    let transport = transport_on(&hub).await;
    let broadcaster = StateBroadcaster::new(transport, registry);
    broadcaster.start();
    let state = ReplicatedState::new("connections", json!({}));
    broadcaster.attach(Arc::clone(&state) as Arc<dyn StateContainer>);
    let (_patch_sub, mut patches) = observe_patches(&hub).await;

    broadcaster.update(
        "connections",
        &json!({
            "host": "db.local",
            "credential": {"username": "admin", "password": "hunter2"}
        }),
    );

    let published = expect_patch(&mut patches).await;
    assert_eq!(published.patch["host"], "db.local");
    assert_eq!(published.patch["credential"]["username"], "admin");
    assert!(published.patch["credential"].get("password").is_none());

    // The local store keeps the full value; only the wire is scrubbed.
    let local: Value = state.get();
    assert_eq!(local["credential"]["password"], "hunter2");
}

#[tokio::test(start_paused = true)]
async fn fully_excluded_patches_are_not_published() {
    let registry = PolicyRegistry::new(vec![
        StoreSyncPolicy::new("connections").exclude("credential.password")
    ]);
    let hub = LocalHub::new();
    let transport = transport_on(&hub).await;
    let broadcaster = StateBroadcaster::new(transport, registry);
    broadcaster.start();
    let state = ReplicatedState::new("connections", json!({}));
    broadcaster.attach(Arc::clone(&state) as Arc<dyn StateContainer>);
    let (_patch_sub, mut patches) = observe_patches(&hub).await;

    broadcaster.update("connections", &json!({"credential": {"password": "hunter2"}}));

    expect_no_patch(&mut patches).await;
}

#[tokio::test(start_paused = true)]
async fn full_replacements_stay_local() {
    let hub = LocalHub::new();
    let (sender, sender_state) = broadcaster_on(&hub, instant_registry()).await;
    let (_receiver, receiver_state) = broadcaster_on(&hub, instant_registry()).await;
    let (_patch_sub, mut patches) = observe_patches(&hub).await;

    sender.replace(
        "preferences",
        &json!({"theme": "solarized", "page_size": 10}),
    );
    sleep(Duration::from_millis(50)).await;

    assert_eq!(sender_state.get().theme, "solarized");
    assert_eq!(receiver_state.get().theme, "light");
    expect_no_patch(&mut patches).await;
}

#[tokio::test(start_paused = true)]
async fn stores_without_policy_stay_local() {
    let hub = LocalHub::new();
    let transport = transport_on(&hub).await;
    let broadcaster = StateBroadcaster::new(transport, PolicyRegistry::new(vec![]));
    broadcaster.start();
    let state = ReplicatedState::new("scratch", prefs());
    broadcaster.attach(Arc::clone(&state) as Arc<dyn StateContainer>);
    let (_patch_sub, mut patches) = observe_patches(&hub).await;

    broadcaster.update("scratch", &json!({"theme": "dark"}));

    assert_eq!(state.get().theme, "dark");
    expect_no_patch(&mut patches).await;
}

#[tokio::test(start_paused = true)]
async fn disabled_stores_stay_local() {
    let registry = PolicyRegistry::new(vec![StoreSyncPolicy::new("query_editor").disabled()]);
    let hub = LocalHub::new();
    let transport = transport_on(&hub).await;
    let broadcaster = StateBroadcaster::new(transport, registry);
    broadcaster.start();
    let state = ReplicatedState::new("query_editor", json!({}));
    broadcaster.attach(Arc::clone(&state) as Arc<dyn StateContainer>);
    let (_patch_sub, mut patches) = observe_patches(&hub).await;

    broadcaster.update("query_editor", &json!({"draft": "select 1"}));

    expect_no_patch(&mut patches).await;
}

#[tokio::test(start_paused = true)]
async fn schema_breaking_patches_are_ignored() {
    let hub = LocalHub::new();
    let (broadcaster, state) = broadcaster_on(&hub, instant_registry()).await;

    broadcaster.update("preferences", &json!({"page_size": "not a number"}));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(state.get(), prefs());
}

// ── Debounce ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn debounce_coalesces_rapid_updates() {
    let registry = PolicyRegistry::new(vec![
        StoreSyncPolicy::new("preferences").debounce(Duration::from_millis(200))
    ]);
    let hub = LocalHub::new();
    let (sender, _state) = broadcaster_on(&hub, registry).await;
    let (_patch_sub, mut patches) = observe_patches(&hub).await;

    sender.update("preferences", &json!({"theme": "dark"}));
    sleep(Duration::from_millis(10)).await;
    sender.update("preferences", &json!({"page_size": 100}));
    sleep(Duration::from_millis(10)).await;
    sender.update("preferences", &json!({"theme": "dracula"}));

    // Nothing leaves during the window.
    expect_no_patch(&mut patches).await;

    sleep(Duration::from_millis(300)).await;
    let published = expect_patch(&mut patches).await;
    assert_eq!(
        published.patch,
        json!({"theme": "dracula", "page_size": 100})
    );
    expect_no_patch(&mut patches).await;
}

#[tokio::test(start_paused = true)]
async fn flush_all_publishes_pending_immediately() {
    let registry = PolicyRegistry::new(vec![
        StoreSyncPolicy::new("preferences").debounce(Duration::from_secs(5))
    ]);
    let hub = LocalHub::new();
    let (sender, _state) = broadcaster_on(&hub, registry).await;
    let (_patch_sub, mut patches) = observe_patches(&hub).await;

    sender.update("preferences", &json!({"theme": "dark"}));
    expect_no_patch(&mut patches).await;

    sender.flush_all();
    let published = expect_patch(&mut patches).await;
    assert_eq!(published.patch, json!({"theme": "dark"}));

    // The armed timer finds nothing left to send.
    sleep(Duration::from_secs(6)).await;
    expect_no_patch(&mut patches).await;
}
