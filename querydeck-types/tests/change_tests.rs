use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use querydeck_types::{ChangeRecord, EntityKind, Resolution, SyncCheckpoint};
use serde_json::json;

fn sample_record() -> ChangeRecord {
    ChangeRecord::new(
        EntityKind::Connection,
        "conn-1",
        json!({"name": "staging", "host": "db.internal", "port": 5432}),
    )
}

// ── EntityKind ───────────────────────────────────────────────────

#[test]
fn store_names_are_stable() {
    assert_eq!(EntityKind::Connection.store_name(), "connections");
    assert_eq!(EntityKind::SavedQuery.store_name(), "saved_queries");
    assert_eq!(EntityKind::QueryHistory.store_name(), "query_history");
}

#[test]
fn store_name_roundtrip() {
    for kind in EntityKind::ALL {
        assert_eq!(EntityKind::from_store_name(kind.store_name()), Some(kind));
    }
    assert_eq!(EntityKind::from_store_name("result_grids"), None);
}

#[test]
fn entity_kind_serializes_snake_case() {
    assert_eq!(
        serde_json::to_string(&EntityKind::SavedQuery).unwrap(),
        "\"saved_query\""
    );
}

// ── ChangeRecord ─────────────────────────────────────────────────

#[test]
fn new_record_is_unsynced() {
    let record = sample_record();
    assert!(!record.synced);
    assert_eq!(record.sync_version, 0);
}

#[test]
fn touch_refreshes_timestamp_and_clears_synced() {
    let mut record = sample_record();
    record.mark_synced(3);
    let before = record.updated_at;
    record.touch();
    assert!(!record.synced);
    assert!(record.updated_at >= before);
    assert_eq!(record.sync_version, 3);
}

#[test]
fn mark_synced_sets_version() {
    let mut record = sample_record();
    record.mark_synced(7);
    assert!(record.synced);
    assert_eq!(record.sync_version, 7);
}

#[test]
fn unsynced_record_needs_upload() {
    let record = sample_record();
    let future = SyncCheckpoint::new(Utc::now() + Duration::hours(1));
    assert!(record.needs_upload(&future));
}

#[test]
fn synced_record_behind_checkpoint_does_not_upload() {
    let mut record = sample_record();
    record.mark_synced(1);
    let ahead = SyncCheckpoint::new(record.updated_at + Duration::seconds(1));
    assert!(!record.needs_upload(&ahead));
}

#[test]
fn synced_record_past_checkpoint_reuploads() {
    let mut record = sample_record();
    record.mark_synced(1);
    let behind = SyncCheckpoint::new(record.updated_at - Duration::seconds(1));
    assert!(record.needs_upload(&behind));
}

#[test]
fn record_serde_roundtrip() {
    let record = sample_record();
    let json = serde_json::to_string(&record).unwrap();
    let parsed: ChangeRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(record, parsed);
}

// ── Resolution ───────────────────────────────────────────────────

#[test]
fn resolution_serializes_snake_case() {
    assert_eq!(
        serde_json::to_string(&Resolution::KeepBoth).unwrap(),
        "\"keep_both\""
    );
    let parsed: Resolution = serde_json::from_str("\"manual\"").unwrap();
    assert_eq!(parsed, Resolution::Manual);
}

#[test]
fn resolution_strategy_mapping() {
    assert_eq!(Resolution::Local.strategy(), "last_write_wins");
    assert_eq!(Resolution::Local.chosen_version(), Some("local"));
    assert_eq!(Resolution::Remote.strategy(), "last_write_wins");
    assert_eq!(Resolution::Remote.chosen_version(), Some("remote"));
    assert_eq!(Resolution::KeepBoth.strategy(), "keep_both");
    assert_eq!(Resolution::KeepBoth.chosen_version(), None);
    assert_eq!(Resolution::Manual.strategy(), "user_choice");
}

// ── SyncCheckpoint ───────────────────────────────────────────────

#[test]
fn default_checkpoint_is_epoch() {
    assert_eq!(SyncCheckpoint::default(), SyncCheckpoint::epoch());
    assert_eq!(SyncCheckpoint::epoch().at().timestamp(), 0);
}

#[test]
fn advance_moves_forward() {
    let mut cp = SyncCheckpoint::epoch();
    let t1 = Utc::now();
    cp.advance_to(t1);
    assert_eq!(cp.at(), t1);
}

#[test]
fn advance_ignores_moves_backward() {
    let t1 = Utc::now();
    let mut cp = SyncCheckpoint::new(t1);
    cp.advance_to(t1 - Duration::minutes(5));
    assert_eq!(cp.at(), t1);
}

#[test]
fn advance_to_same_instant_is_a_noop() {
    let t1 = Utc::now();
    let mut cp = SyncCheckpoint::new(t1);
    cp.advance_to(t1);
    assert_eq!(cp.at(), t1);
}

#[test]
fn checkpoint_serde_is_transparent() {
    let cp = SyncCheckpoint::new(Utc::now());
    let json = serde_json::to_string(&cp).unwrap();
    let parsed: SyncCheckpoint = serde_json::from_str(&json).unwrap();
    assert_eq!(cp, parsed);
}
