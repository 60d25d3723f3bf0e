use pretty_assertions::assert_eq;
use querydeck_sync::{
    CredentialRequestMessage, HeartbeatMessage, MessageKind, MessagePayload, PeerMessage,
    ResourceAddedMessage, StatePatchMessage,
};
use querydeck_types::{ContextId, EntityKind, HybridTimestamp};
use serde_json::json;
use uuid::Uuid;

fn envelope(payload: MessagePayload) -> PeerMessage {
    PeerMessage::new(ContextId::new(), HybridTimestamp::new(1_700_000_000_000, 0), payload)
}

// ── Envelope ─────────────────────────────────────────────────────

#[test]
fn envelope_round_trips() {
    let message = envelope(MessagePayload::StatePatch(StatePatchMessage::new(
        "preferences",
        json!({"theme": "dark"}),
    )));

    let bytes = serde_json::to_vec(&message).unwrap();
    let decoded: PeerMessage = serde_json::from_slice(&bytes).unwrap();

    assert_eq!(decoded.sender, message.sender);
    assert_eq!(decoded.timestamp, message.timestamp);
    match decoded.payload {
        MessagePayload::StatePatch(patch) => {
            assert_eq!(patch.store, "preferences");
            assert_eq!(patch.patch, json!({"theme": "dark"}));
        }
        other => panic!("wrong payload: {other:?}"),
    }
}

#[test]
fn payloads_are_tagged_kebab_case() {
    let cases = [
        (
            MessagePayload::StatePatch(StatePatchMessage::new("connections", json!({}))),
            "state-patch",
        ),
        (
            MessagePayload::PresenceHeartbeat(HeartbeatMessage { is_primary: true }),
            "presence-heartbeat",
        ),
        (MessagePayload::PresenceDeparted, "presence-departed"),
        (
            MessagePayload::CredentialRequest(CredentialRequestMessage::new(vec![])),
            "credential-request",
        ),
        (MessagePayload::Logout, "logout"),
        (
            MessagePayload::ResourceAdded(ResourceAddedMessage::new(
                EntityKind::SavedQuery,
                "q-1",
            )),
            "resource-added",
        ),
    ];

    for (payload, tag) in cases {
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], tag, "payload {payload:?}");
    }
}

#[test]
fn kind_matches_every_variant() {
    let heartbeat = MessagePayload::PresenceHeartbeat(HeartbeatMessage { is_primary: false });
    assert_eq!(heartbeat.kind(), MessageKind::PresenceHeartbeat);
    assert_eq!(MessagePayload::PresenceDeparted.kind(), MessageKind::PresenceDeparted);
    assert_eq!(MessagePayload::Logout.kind(), MessageKind::Logout);

    let patch = MessagePayload::StatePatch(StatePatchMessage::new("preferences", json!({})));
    assert_eq!(patch.kind(), MessageKind::StatePatch);

    let request = MessagePayload::CredentialRequest(CredentialRequestMessage::new(vec![]));
    assert_eq!(request.kind(), MessageKind::CredentialRequest);

    let added = MessagePayload::ResourceAdded(ResourceAddedMessage::new(
        EntityKind::Connection,
        "c-1",
    ));
    assert_eq!(added.kind(), MessageKind::ResourceAdded);
}

#[test]
fn unknown_payload_type_fails_decode() {
    let frame = json!({
        "sender": Uuid::new_v4(),
        "timestamp": {"millis": 1, "counter": 0},
        "payload": {"type": "telemetry-burst", "rows": 3}
    });

    assert!(serde_json::from_value::<PeerMessage>(frame).is_err());
}

// ── Payload details ──────────────────────────────────────────────

#[test]
fn credential_requests_get_unique_correlation_ids() {
    let first = CredentialRequestMessage::new(vec!["conn-1".into()]);
    let second = CredentialRequestMessage::new(vec!["conn-1".into()]);

    assert_ne!(first.request_id, second.request_id);
    assert!(Uuid::parse_str(&first.request_id).is_ok());
}

#[test]
fn unit_payloads_serialize_without_extra_fields() {
    let value = serde_json::to_value(MessagePayload::Logout).unwrap();
    assert_eq!(value, json!({"type": "logout"}));
}

#[test]
fn envelope_stamps_order_after_tick() {
    let stamp = HybridTimestamp::new(42, 7);
    assert!(stamp.tick() > stamp);
    assert!(HybridTimestamp::new(43, 0) > HybridTimestamp::new(42, u32::MAX));
}
