//! Remote sync service client.
//!
//! Wire types mirror the QueryDeck sync service: uploads carry a flat
//! change list, downloads come back as per-kind arrays of full entity
//! objects, and conflict resolutions post a strategy name. The
//! [`RemoteSyncApi`] trait is the seam the engine syncs through; the
//! HTTP client and the in-memory test double both implement it.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use querydeck_types::{ChangeRecord, EntityKind, Resolution};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{PoisonError, RwLock as StdRwLock};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// What happened to an uploaded entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    /// A record the server has never versioned is a create.
    #[must_use]
    pub const fn for_version(sync_version: i64) -> Self {
        if sync_version == 0 {
            SyncAction::Create
        } else {
            SyncAction::Update
        }
    }
}

/// One entry in an upload batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncChange {
    /// Identity of this change submission, not of the entity.
    pub id: String,
    pub item_type: EntityKind,
    pub item_id: String,
    pub action: SyncAction,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
    pub sync_version: i64,
    /// Stamped by the HTTP client; the engine leaves it empty.
    #[serde(default)]
    pub device_id: String,
}

impl SyncChange {
    /// Wraps a local record for upload.
    pub fn from_record(record: &ChangeRecord) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item_type: record.kind,
            item_id: record.entity_id.clone(),
            action: SyncAction::for_version(record.sync_version),
            data: record.data.clone(),
            updated_at: record.updated_at,
            sync_version: record.sync_version,
            device_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct UploadBody {
    device_id: String,
    last_sync_at: DateTime<Utc>,
    changes: Vec<SyncChange>,
}

/// A change the server refused, with its reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedChange {
    pub change: SyncChange,
    pub reason: String,
}

/// Server answer to an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReceipt {
    #[serde(default)]
    pub success: bool,
    /// Server time the batch was applied at.
    pub synced_at: DateTime<Utc>,
    #[serde(default)]
    pub rejected: Vec<RejectedChange>,
    #[serde(default)]
    pub message: Option<String>,
}

impl UploadReceipt {
    /// How many of `submitted` changes the server took.
    #[must_use]
    pub fn accepted(&self, submitted: usize) -> usize {
        submitted.saturating_sub(self.rejected.len())
    }
}

/// One page of remote changes.
///
/// Items arrive as full entity objects with `id`, `updated_at` and
/// `sync_version` embedded, per kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadPage {
    #[serde(default)]
    pub connections: Vec<Value>,
    #[serde(default)]
    pub saved_queries: Vec<Value>,
    #[serde(default)]
    pub query_history: Vec<Value>,
    /// Server time of this page.
    pub sync_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub has_more: bool,
}

impl DownloadPage {
    /// An empty page stamped with the given server time.
    #[must_use]
    pub fn empty(sync_timestamp: DateTime<Utc>) -> Self {
        Self {
            connections: Vec::new(),
            saved_queries: Vec::new(),
            query_history: Vec::new(),
            sync_timestamp,
            has_more: false,
        }
    }

    /// Total items across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len() + self.saved_queries.len() + self.query_history.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flattens the page into local change records. Items missing an
    /// `id` are skipped with a warning; a missing timestamp falls back
    /// to the page's server time.
    pub fn into_records(self) -> Vec<ChangeRecord> {
        let fallback = self.sync_timestamp;
        let mut records = Vec::new();
        let batches = [
            (EntityKind::Connection, self.connections),
            (EntityKind::SavedQuery, self.saved_queries),
            (EntityKind::QueryHistory, self.query_history),
        ];
        for (kind, items) in batches {
            for item in items {
                match remote_record(kind, item, fallback) {
                    Some(record) => records.push(record),
                    None => warn!("Skipping downloaded {kind} record without an id"),
                }
            }
        }
        records
    }
}

fn remote_record(kind: EntityKind, data: Value, fallback: DateTime<Utc>) -> Option<ChangeRecord> {
    let entity_id = data.get("id")?.as_str()?.to_string();
    let updated_at = data
        .get("updated_at")
        .or_else(|| data.get("executed_at"))
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or(fallback);
    let sync_version = data.get("sync_version").and_then(Value::as_i64).unwrap_or(0);
    Some(ChangeRecord {
        entity_id,
        kind,
        data,
        updated_at,
        sync_version,
        synced: true,
    })
}

/// The remote endpoints the engine needs.
#[async_trait]
pub trait RemoteSyncApi: Send + Sync {
    /// Pushes a batch of local changes.
    async fn upload(
        &self,
        last_sync_at: DateTime<Utc>,
        changes: &[SyncChange],
    ) -> SyncResult<UploadReceipt>;

    /// Pulls changes the server accepted after `since`, at most `limit`
    /// per kind.
    async fn download(&self, since: DateTime<Utc>, limit: usize) -> SyncResult<DownloadPage>;

    /// Reports how a conflict was settled.
    async fn resolve_conflict(&self, conflict_id: &str, resolution: Resolution) -> SyncResult<()>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpSyncConfig {
    pub base_url: String,
    /// Stable identity of this install, sent with every call.
    pub device_id: String,
    pub timeout: Duration,
}

impl Default for HttpSyncConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.querydeck.app".to_string(),
            device_id: Uuid::new_v4().to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// [`RemoteSyncApi`] over HTTP with bearer authentication.
pub struct HttpSyncApi {
    config: HttpSyncConfig,
    client: reqwest::Client,
    token: StdRwLock<Option<String>>,
}

impl HttpSyncApi {
    #[must_use]
    pub fn new(config: HttpSyncConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("failed to create HTTP client");
        Self {
            config,
            client,
            token: StdRwLock::new(None),
        }
    }

    /// Installs or clears the session token used for every call.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn bearer(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn execute(&self, request: reqwest::RequestBuilder) -> SyncResult<reqwest::Response> {
        let request = match self.bearer() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::Auth(
                "sync service rejected the session token".to_string(),
            ));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::Server {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteSyncApi for HttpSyncApi {
    async fn upload(
        &self,
        last_sync_at: DateTime<Utc>,
        changes: &[SyncChange],
    ) -> SyncResult<UploadReceipt> {
        let stamped = changes
            .iter()
            .cloned()
            .map(|mut change| {
                change.device_id = self.config.device_id.clone();
                change
            })
            .collect();
        let body = UploadBody {
            device_id: self.config.device_id.clone(),
            last_sync_at,
            changes: stamped,
        };
        let url = format!("{}/api/sync/upload", self.config.base_url);
        let response = self.execute(self.client.post(&url).json(&body)).await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))
    }

    async fn download(&self, since: DateTime<Utc>, limit: usize) -> SyncResult<DownloadPage> {
        let since = since.to_rfc3339();
        let limit = limit.to_string();
        let url = format!("{}/api/sync/download", self.config.base_url);
        let response = self
            .execute(self.client.get(&url).query(&[
                ("device_id", self.config.device_id.as_str()),
                ("since", since.as_str()),
                ("limit", limit.as_str()),
            ]))
            .await?;
        response
            .json()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))
    }

    async fn resolve_conflict(&self, conflict_id: &str, resolution: Resolution) -> SyncResult<()> {
        let url = format!(
            "{}/api/sync/conflicts/{conflict_id}/resolve",
            self.config.base_url
        );
        let body = serde_json::json!({
            "strategy": resolution.strategy(),
            "chosen_version": resolution.chosen_version(),
        });
        self.execute(self.client.post(&url).json(&body)).await?;
        Ok(())
    }
}

/// Scriptable [`RemoteSyncApi`] for testing.
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    /// Records every call and replays queued download pages.
    pub struct MockSyncApi {
        server_time: DateTime<Utc>,
        uploads: StdMutex<Vec<Vec<SyncChange>>>,
        download_calls: StdMutex<Vec<DateTime<Utc>>>,
        resolved: StdMutex<Vec<(String, Resolution)>>,
        pages: StdMutex<VecDeque<DownloadPage>>,
        fail_uploads: AtomicBool,
        fail_downloads: AtomicBool,
        delay: StdMutex<Option<Duration>>,
    }

    impl MockSyncApi {
        #[must_use]
        pub fn new() -> Arc<Self> {
            Self::with_server_time(Utc::now())
        }

        /// Fixes the server time stamped on receipts and empty pages.
        #[must_use]
        pub fn with_server_time(server_time: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                server_time,
                uploads: StdMutex::new(Vec::new()),
                download_calls: StdMutex::new(Vec::new()),
                resolved: StdMutex::new(Vec::new()),
                pages: StdMutex::new(VecDeque::new()),
                fail_uploads: AtomicBool::new(false),
                fail_downloads: AtomicBool::new(false),
                delay: StdMutex::new(None),
            })
        }

        /// Queues the next download answer; pages replay in order, then
        /// empty pages follow.
        pub fn queue_page(&self, page: DownloadPage) {
            self.pages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_back(page);
        }

        pub fn fail_uploads(&self, fail: bool) {
            self.fail_uploads.store(fail, Ordering::SeqCst);
        }

        pub fn fail_downloads(&self, fail: bool) {
            self.fail_downloads.store(fail, Ordering::SeqCst);
        }

        /// Adds latency to every call, for overlap tests.
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
        }

        pub fn uploads(&self) -> Vec<Vec<SyncChange>> {
            self.uploads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn download_calls(&self) -> Vec<DateTime<Utc>> {
            self.download_calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub fn resolved(&self) -> Vec<(String, Resolution)> {
            self.resolved
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        async fn maybe_delay(&self) {
            let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl RemoteSyncApi for MockSyncApi {
        async fn upload(
            &self,
            _last_sync_at: DateTime<Utc>,
            changes: &[SyncChange],
        ) -> SyncResult<UploadReceipt> {
            self.maybe_delay().await;
            if self.fail_uploads.load(Ordering::SeqCst) {
                return Err(SyncError::Network("injected upload failure".to_string()));
            }
            self.uploads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(changes.to_vec());
            Ok(UploadReceipt {
                success: true,
                synced_at: self.server_time,
                rejected: Vec::new(),
                message: None,
            })
        }

        async fn download(&self, since: DateTime<Utc>, _limit: usize) -> SyncResult<DownloadPage> {
            self.maybe_delay().await;
            if self.fail_downloads.load(Ordering::SeqCst) {
                return Err(SyncError::Network("injected download failure".to_string()));
            }
            self.download_calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(since);
            let next = self
                .pages
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            Ok(next.unwrap_or_else(|| DownloadPage::empty(self.server_time)))
        }

        async fn resolve_conflict(
            &self,
            conflict_id: &str,
            resolution: Resolution,
        ) -> SyncResult<()> {
            self.maybe_delay().await;
            self.resolved
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((conflict_id.to_string(), resolution));
            Ok(())
        }
    }

    /// Builds a download page whose items embed each record's identity
    /// and versioning fields, the way the server serializes entities.
    #[must_use]
    pub fn page_from_records(
        records: &[ChangeRecord],
        sync_timestamp: DateTime<Utc>,
        has_more: bool,
    ) -> DownloadPage {
        let mut page = DownloadPage::empty(sync_timestamp);
        page.has_more = has_more;
        for record in records {
            let mut item = record.data.clone();
            if let Value::Object(map) = &mut item {
                map.insert("id".to_string(), Value::String(record.entity_id.clone()));
                map.insert(
                    "updated_at".to_string(),
                    Value::String(record.updated_at.to_rfc3339()),
                );
                map.insert(
                    "sync_version".to_string(),
                    Value::Number(record.sync_version.into()),
                );
            }
            match record.kind {
                EntityKind::Connection => page.connections.push(item),
                EntityKind::SavedQuery => page.saved_queries.push(item),
                EntityKind::QueryHistory => page.query_history.push(item),
            }
        }
        page
    }
}
