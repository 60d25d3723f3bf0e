//! The cloud sync engine.
//!
//! Runs the upload/download/resolve/merge cycle against the remote
//! service and the local store. At most one cycle runs per context; a
//! second [`sync_now`](SyncEngine::sync_now) rejects immediately
//! instead of queueing. The checkpoint advances only after a fully
//! successful cycle, so a failure retries the same window and merges
//! must stay idempotent.

use crate::cloud::api::{RemoteSyncApi, SyncChange};
use crate::cloud::{conflict, sanitize};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use querydeck_store::LocalStore;
use querydeck_types::{ChangeRecord, Conflict, EntityKind, Resolution, SyncCheckpoint};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Entitlement and connectivity preconditions for a cycle.
pub trait SyncGate: Send + Sync {
    /// Whether the account has cloud sync at all.
    fn sync_enabled(&self) -> bool;

    /// Whether a user session is present.
    fn authenticated(&self) -> bool;

    /// Whether the device believes it is online.
    fn online(&self) -> bool {
        true
    }
}

/// Flag-backed [`SyncGate`] driven by the app's auth and connectivity
/// listeners.
pub struct StaticGate {
    sync_enabled: AtomicBool,
    authenticated: AtomicBool,
    online: AtomicBool,
}

impl StaticGate {
    #[must_use]
    pub fn new(sync_enabled: bool, authenticated: bool) -> Arc<Self> {
        Arc::new(Self {
            sync_enabled: AtomicBool::new(sync_enabled),
            authenticated: AtomicBool::new(authenticated),
            online: AtomicBool::new(true),
        })
    }

    /// A gate with everything on, for tests and local development.
    #[must_use]
    pub fn allow_all() -> Arc<Self> {
        Self::new(true, true)
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        self.sync_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl SyncGate for StaticGate {
    fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    fn authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Progress phases a cycle moves through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Preparing,
    Uploading,
    Downloading,
    Resolving,
    Merging,
    Complete,
    Failed,
}

/// Outcome of one completed cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Changes the server accepted.
    pub uploaded: usize,
    /// Remote records pulled this cycle.
    pub downloaded: usize,
    /// Non-conflicting records merged into the local store.
    pub merged: usize,
    /// Conflicts left for the caller to resolve.
    pub conflicts: Vec<Conflict>,
    /// Conflicts settled by the recommended resolution.
    pub auto_resolved: usize,
    /// Records excluded by sanitization.
    pub sanitize_failures: usize,
    pub duration_ms: u64,
    /// Where the checkpoint stands after the cycle.
    pub checkpoint: SyncCheckpoint,
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    pub upload_batch_size: usize,
    pub download_batch_size: usize,
    /// Cadence of the periodic timer started by [`SyncEngine::start`].
    pub interval: Duration,
    /// Apply recommended resolutions instead of surfacing conflicts.
    pub auto_resolve: bool,
    /// Fail fast when the gate reports the device offline.
    pub require_online: bool,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            upload_batch_size: 100,
            download_batch_size: 200,
            interval: Duration::from_secs(300),
            auto_resolve: true,
            require_online: true,
        }
    }
}

/// Releases the single-cycle flag however the cycle ends.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Synchronizes the local store with the remote service.
pub struct SyncEngine {
    api: Arc<dyn RemoteSyncApi>,
    store: Arc<dyn LocalStore>,
    gate: Arc<dyn SyncGate>,
    config: SyncEngineConfig,
    checkpoint: RwLock<Option<SyncCheckpoint>>,
    in_flight: Arc<AtomicBool>,
    progress_tx: broadcast::Sender<SyncPhase>,
    timer_handle: StdMutex<Option<JoinHandle<()>>>,
    timer_running: Arc<AtomicBool>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        api: Arc<dyn RemoteSyncApi>,
        store: Arc<dyn LocalStore>,
        gate: Arc<dyn SyncGate>,
        config: SyncEngineConfig,
    ) -> Arc<Self> {
        let (progress_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            api,
            store,
            gate,
            config,
            checkpoint: RwLock::new(None),
            in_flight: Arc::new(AtomicBool::new(false)),
            progress_tx,
            timer_handle: StdMutex::new(None),
            timer_running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Runs one full sync cycle.
    ///
    /// Rejects with [`SyncError::SyncInProgress`] if a cycle is
    /// already running. A failed cycle leaves the checkpoint where it
    /// was; retry happens on the next call or timer tick, never inside
    /// the engine.
    pub async fn sync_now(&self) -> SyncResult<SyncReport> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(SyncError::SyncInProgress);
        }
        let _guard = CycleGuard {
            flag: &self.in_flight,
        };
        let started = tokio::time::Instant::now();
        match self.run_cycle().await {
            Ok(mut report) => {
                report.duration_ms = started.elapsed().as_millis() as u64;
                info!(
                    "Sync cycle finished: {} uploaded, {} downloaded, {} conflicts in {}ms",
                    report.uploaded,
                    report.downloaded,
                    report.conflicts.len(),
                    report.duration_ms
                );
                self.emit(SyncPhase::Complete);
                Ok(report)
            }
            Err(e) => {
                warn!("Sync cycle failed: {e}");
                self.emit(SyncPhase::Failed);
                Err(e)
            }
        }
    }

    /// Starts the periodic timer. The first cycle runs one interval
    /// from now; a tick that lands while a cycle is in flight is
    /// skipped.
    pub fn start(self: &Arc<Self>) {
        if self.timer_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // An interval's first tick completes immediately; consume
            // it so the schedule starts one interval out.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !engine.timer_running.load(Ordering::SeqCst) {
                    return;
                }
                match engine.sync_now().await {
                    Ok(_) => {}
                    Err(SyncError::SyncInProgress) => {
                        debug!("Skipping scheduled sync, a cycle is already running");
                    }
                    Err(e) => warn!("Scheduled sync failed: {e}"),
                }
            }
        });
        *self
            .timer_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stops the periodic timer. An in-flight cycle runs to completion.
    pub fn stop(&self) {
        if !self.timer_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self
            .timer_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }

    /// Applies a caller-picked resolution to a surfaced conflict and
    /// reports it to the server.
    pub async fn resolve_conflict(
        &self,
        found: &Conflict,
        resolution: Resolution,
    ) -> SyncResult<()> {
        if resolution == Resolution::Manual {
            return Err(SyncError::InvalidResolution(
                "manual resolution must pick a side".to_string(),
            ));
        }
        self.apply_resolution(found, resolution).await?;
        self.api.resolve_conflict(&found.id, resolution).await?;
        Ok(())
    }

    /// Whether a cycle is currently running.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// The current checkpoint, loading it from the store on first use.
    pub async fn checkpoint(&self) -> SyncResult<SyncCheckpoint> {
        {
            let cached = self.checkpoint.read().await;
            if let Some(checkpoint) = *cached {
                return Ok(checkpoint);
            }
        }
        let loaded = self.store.load_checkpoint().await?.unwrap_or_default();
        *self.checkpoint.write().await = Some(loaded);
        Ok(loaded)
    }

    /// Phase notifications for the current and future cycles.
    #[must_use]
    pub fn subscribe_progress(&self) -> broadcast::Receiver<SyncPhase> {
        self.progress_tx.subscribe()
    }

    fn emit(&self, phase: SyncPhase) {
        let _ = self.progress_tx.send(phase);
    }

    async fn run_cycle(&self) -> SyncResult<SyncReport> {
        self.emit(SyncPhase::Preparing);
        if !self.gate.sync_enabled() {
            return Err(SyncError::SyncDisabled);
        }
        if !self.gate.authenticated() {
            return Err(SyncError::Auth("not signed in".to_string()));
        }
        if self.config.require_online && !self.gate.online() {
            return Err(SyncError::Offline);
        }

        let checkpoint = self.checkpoint().await?;
        let mut report = SyncReport {
            checkpoint,
            ..SyncReport::default()
        };

        let mut pending = Vec::new();
        for kind in EntityKind::ALL {
            let records = self.store.get_all(kind).await?;
            pending.extend(
                records
                    .into_iter()
                    .filter(|record| record.needs_upload(&checkpoint)),
            );
        }
        let (clean, sanitize_failures) = sanitize::sanitize_batch(&pending);
        report.sanitize_failures = sanitize_failures;

        self.emit(SyncPhase::Uploading);
        let mut server_time: Option<DateTime<Utc>> = None;
        for batch in clean.chunks(self.config.upload_batch_size) {
            let changes: Vec<SyncChange> = batch.iter().map(SyncChange::from_record).collect();
            let receipt = self.api.upload(checkpoint.at(), &changes).await?;
            report.uploaded += receipt.accepted(changes.len());
            server_time = Some(receipt.synced_at);
            self.mark_uploaded(batch).await?;
        }

        self.emit(SyncPhase::Downloading);
        let mut remote_records = Vec::new();
        let mut cursor = checkpoint.at();
        loop {
            let page = self
                .api
                .download(cursor, self.config.download_batch_size)
                .await?;
            server_time = Some(page.sync_timestamp);
            let has_more = page.has_more;
            let records = page.into_records();
            // An empty page ends pagination regardless of has_more;
            // trusting the flag alone could loop forever.
            if records.is_empty() {
                break;
            }
            for record in &records {
                if record.updated_at > cursor {
                    cursor = record.updated_at;
                }
            }
            remote_records.extend(records);
            if !has_more {
                break;
            }
        }
        report.downloaded = remote_records.len();

        self.emit(SyncPhase::Resolving);
        let mut mergeable = Vec::new();
        for remote in remote_records {
            let local = self.store.get(remote.kind, &remote.entity_id).await?;
            match local {
                None => mergeable.push(remote),
                Some(local) => match conflict::detect(&local, &remote) {
                    Some(found) => {
                        if self.config.auto_resolve && found.recommended != Resolution::Manual {
                            self.apply_resolution(&found, found.recommended).await?;
                            report.auto_resolved += 1;
                        } else {
                            report.conflicts.push(found);
                        }
                    }
                    None => {
                        let identical = local.sync_version == remote.sync_version
                            && local.updated_at == remote.updated_at;
                        if !identical {
                            mergeable.push(remote);
                        }
                    }
                },
            }
        }

        self.emit(SyncPhase::Merging);
        for remote in mergeable {
            let record = ChangeRecord {
                sync_version: remote.sync_version + 1,
                synced: true,
                ..remote
            };
            self.store.put(record).await?;
            report.merged += 1;
        }

        if let Some(server_time) = server_time {
            let mut next = checkpoint;
            next.advance_to(server_time);
            self.store.save_checkpoint(next).await?;
            *self.checkpoint.write().await = Some(next);
            report.checkpoint = next;
        }
        Ok(report)
    }

    /// Marks uploaded records synced, skipping any the user edited
    /// while the upload was in flight. Only the flags move; local data
    /// keeps its unsanitized form.
    async fn mark_uploaded(&self, batch: &[ChangeRecord]) -> SyncResult<()> {
        for sent in batch {
            let Some(mut current) = self.store.get(sent.kind, &sent.entity_id).await? else {
                continue;
            };
            if current.updated_at != sent.updated_at {
                debug!(
                    "Record {}/{} changed mid-upload, leaving it unsynced",
                    sent.kind, sent.entity_id
                );
                continue;
            }
            current.mark_synced(current.sync_version + 1);
            self.store.put(current).await?;
        }
        Ok(())
    }

    /// Applies one resolution locally. Local keeps the local copy
    /// untouched, remote overwrites it, keep-both inserts the remote
    /// data as a new unsynced record.
    async fn apply_resolution(&self, found: &Conflict, resolution: Resolution) -> SyncResult<()> {
        match resolution {
            Resolution::Manual => Err(SyncError::InvalidResolution(
                "manual resolution must pick a side".to_string(),
            )),
            Resolution::Local => Ok(()),
            Resolution::Remote => {
                self.store.put(conflict::remote_record(found)).await?;
                Ok(())
            }
            Resolution::KeepBoth => {
                self.store.put(conflict::keep_both_copy(found)).await?;
                Ok(())
            }
        }
    }
}
