//! Tests for the HTTP sync client against a scripted server.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use querydeck_sync::cloud::SyncChange;
use querydeck_sync::{HttpSyncApi, HttpSyncConfig, RemoteSyncApi, SyncError};
use querydeck_types::{ChangeRecord, EntityKind, Resolution};
use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api_for(server: &MockServer) -> HttpSyncApi {
    HttpSyncApi::new(HttpSyncConfig {
        base_url: server.uri(),
        device_id: "dev-1".to_string(),
        timeout: Duration::from_secs(5),
    })
}

fn sample_change() -> SyncChange {
    SyncChange::from_record(&ChangeRecord::new(
        EntityKind::Connection,
        "conn-1",
        json!({"id": "conn-1", "name": "DB-A", "has_password": true}),
    ))
}

// ── Upload ───────────────────────────────────────────────────────

#[tokio::test]
async fn upload_posts_device_stamped_changes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/sync/upload"))
        .and(header("authorization", "Bearer tok-1"))
        .and(body_partial_json(json!({
            "device_id": "dev-1",
            "changes": [{
                "item_type": "connection",
                "item_id": "conn-1",
                "action": "create",
                "device_id": "dev-1"
            }]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "synced_at": "2026-08-23T10:00:00Z",
            "rejected": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    api.set_token(Some("tok-1".to_string()));

    let receipt = api
        .upload(Utc::now(), &[sample_change()])
        .await
        .unwrap();

    assert!(receipt.success);
    assert_eq!(receipt.accepted(1), 1);
    assert!(receipt.rejected.is_empty());
}

#[tokio::test]
async fn rejected_changes_reduce_the_accepted_count() {
    let server = MockServer::start().await;
    let change = sample_change();
    let change_value = serde_json::to_value(&change).unwrap();
    Mock::given(method("POST"))
        .and(path("/api/sync/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "synced_at": "2026-08-23T10:00:00Z",
            "rejected": [{"change": change_value, "reason": "version conflict"}]
        })))
        .mount(&server)
        .await;

    let api = api_for(&server);
    let receipt = api.upload(Utc::now(), &[change]).await.unwrap();

    assert_eq!(receipt.accepted(1), 0);
    assert_eq!(receipt.rejected[0].reason, "version conflict");
}

// ── Download ─────────────────────────────────────────────────────

#[tokio::test]
async fn download_sends_cursor_query_and_parses_the_page() {
    let since = Utc.with_ymd_and_hms(2026, 8, 20, 12, 0, 0).unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/sync/download"))
        .and(query_param("device_id", "dev-1"))
        .and(query_param("since", "2026-08-20T12:00:00+00:00"))
        .and(query_param("limit", "200"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "connections": [{
                "id": "c-1",
                "name": "DB-A",
                "updated_at": "2026-08-21T08:30:00+00:00",
                "sync_version": 2
            }],
            "saved_queries": [],
            "query_history": [{
                "id": "h-1",
                "query": "select 1",
                "executed_at": "2026-08-21T09:00:00+00:00"
            }],
            "sync_timestamp": "2026-08-21T10:00:00Z",
            "has_more": false
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    let page = api.download(since, 200).await.unwrap();

    assert!(!page.has_more);
    assert_eq!(page.len(), 2);

    let records = page.into_records();
    assert_eq!(records.len(), 2);

    let connection = &records[0];
    assert_eq!(connection.kind, EntityKind::Connection);
    assert_eq!(connection.entity_id, "c-1");
    assert_eq!(connection.sync_version, 2);
    assert!(connection.synced);
    assert_eq!(
        connection.updated_at,
        Utc.with_ymd_and_hms(2026, 8, 21, 8, 30, 0).unwrap()
    );

    // History entries carry their timestamp as executed_at.
    let history = &records[1];
    assert_eq!(history.kind, EntityKind::QueryHistory);
    assert_eq!(
        history.updated_at,
        Utc.with_ymd_and_hms(2026, 8, 21, 9, 0, 0).unwrap()
    );
    assert_eq!(history.sync_version, 0);
}

#[tokio::test]
async fn items_without_an_id_are_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/sync/download"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "connections": [
                {"name": "no id here"},
                {"id": "c-2", "name": "DB-B", "updated_at": "2026-08-21T08:30:00Z", "sync_version": 1}
            ],
            "sync_timestamp": "2026-08-21T10:00:00Z"
        })))
        .mount(&server)
        .await;

    let api = api_for(&server);
    let records = api.download(Utc::now(), 50).await.unwrap().into_records();

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entity_id, "c-2");
}

// ── Errors ───────────────────────────────────────────────────────

#[tokio::test]
async fn auth_failures_map_to_auth_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/sync/download"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let api = api_for(&server);
    let err = api.download(Utc::now(), 10).await.unwrap_err();

    assert!(matches!(err, SyncError::Auth(_)));
}

#[tokio::test]
async fn server_errors_carry_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/sync/upload"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database on fire"))
        .mount(&server)
        .await;

    let api = api_for(&server);
    let err = api.upload(Utc::now(), &[sample_change()]).await.unwrap_err();

    match err {
        SyncError::Server { status, message } => {
            assert_eq!(status, 500);
            assert!(message.contains("database on fire"));
        }
        other => panic!("wrong error: {other:?}"),
    }
}

#[tokio::test]
async fn unreachable_service_is_a_network_error() {
    let api = HttpSyncApi::new(HttpSyncConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        device_id: "dev-1".to_string(),
        timeout: Duration::from_secs(2),
    });

    let err = api.download(Utc::now(), 10).await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
}

// ── Conflict reporting ───────────────────────────────────────────

#[tokio::test]
async fn resolve_conflict_posts_the_strategy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/sync/conflicts/c-1/resolve"))
        .and(body_json(json!({"strategy": "keep_both", "chosen_version": null})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    api.resolve_conflict("c-1", Resolution::KeepBoth).await.unwrap();
}

#[tokio::test]
async fn last_write_wins_reports_the_chosen_side() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/sync/conflicts/c-2/resolve"))
        .and(body_json(json!({"strategy": "last_write_wins", "chosen_version": "remote"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    api.resolve_conflict("c-2", Resolution::Remote).await.unwrap();
}
