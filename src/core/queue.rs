use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mediafetch_core::core::events::{EventEmitter, QueueEvent};
use mediafetch_core::models::record::{
    generate_id, quality_number, DownloadRecord, DownloadStatus, FormatType,
};
use mediafetch_core::models::settings::AppSettings;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::filename;
use crate::core::url_parser;
use crate::core::worker::{TransferWorker, WorkerControl};
use crate::error::{QueueError, Result};
use crate::platforms::traits::{DownloadEngine, MediaExtractor, MetadataTagger};
use crate::storage::history::{self, HistoryFormat};
use crate::storage::store::RecordStore;

pub const MAX_CONCURRENT_KEY: &str = "max_concurrent";
const PLAYLIST_FOLDER_FALLBACK: &str = "playlist";
const LIVE_STATUSES: [DownloadStatus; 4] = [
    DownloadStatus::Pending,
    DownloadStatus::Preparing,
    DownloadStatus::Downloading,
    DownloadStatus::Paused,
];

/// Runtime knobs handed to the queue at construction. Workers get a copy at
/// admission time.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: u32,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub cancel_grace: Duration,
    pub shutdown_grace: Duration,
    pub pause_timeout: Option<Duration>,
    pub socket_timeout_secs: u64,
    pub progress_interval: Duration,
    pub history_export_limit: u32,
    pub default_output_dir: PathBuf,
    pub default_video_quality: String,
    pub audio_codec: String,
    pub audio_bitrate: u32,
    pub embed_metadata: bool,
    pub proxy: Option<String>,
    pub extra_args: Vec<String>,
}

impl QueueConfig {
    pub fn from_settings(settings: &AppSettings) -> Self {
        let adv = &settings.advanced;
        let dl = &settings.download;
        Self {
            max_concurrent: adv.max_concurrent_downloads.max(1),
            max_retries: adv.max_retries,
            retry_backoff: Duration::from_millis(adv.retry_backoff_ms),
            cancel_grace: Duration::from_millis(adv.cancel_grace_ms),
            shutdown_grace: Duration::from_millis(adv.shutdown_grace_ms),
            pause_timeout: adv.pause_timeout_secs.map(Duration::from_secs),
            socket_timeout_secs: adv.socket_timeout_secs,
            progress_interval: Duration::from_millis(adv.progress_interval_ms),
            history_export_limit: adv.history_export_limit,
            default_output_dir: dl.default_output_dir.clone(),
            default_video_quality: dl.video_quality.clone(),
            audio_codec: dl.audio_codec.clone(),
            audio_bitrate: dl.audio_bitrate,
            embed_metadata: dl.embed_metadata,
            proxy: settings.proxy.url(),
            extra_args: dl.extra_ytdlp_flags.clone(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from_settings(&AppSettings::default())
    }
}

/// External collaborators the queue drives.
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub engine: Arc<dyn DownloadEngine>,
    pub extractor: Arc<dyn MediaExtractor>,
    pub tagger: Arc<dyn MetadataTagger>,
    pub emitter: Arc<dyn EventEmitter>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct QueueStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub total_size_mb: f64,
    pub active_count: usize,
    pub queued_count: usize,
}

struct QueueState {
    records: Vec<DownloadRecord>,
    workers: HashMap<String, WorkerControl>,
    /// Latest copy of every record whose last store write failed.
    unsynced: HashMap<String, DownloadRecord>,
    config: QueueConfig,
}

impl QueueState {
    fn find_mut(&mut self, id: &str) -> Option<&mut DownloadRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }
}

/// State shared between the manager handle and its workers.
///
/// Lock order is `write_gate` then `state`. `state` is never held across
/// store I/O; `write_gate` serializes store writes so a stale snapshot can
/// never overwrite a newer one.
pub(crate) struct Shared {
    state: Mutex<QueueState>,
    write_gate: Mutex<()>,
    store: Arc<dyn RecordStore>,
    pub(crate) engine: Arc<dyn DownloadEngine>,
    pub(crate) extractor: Arc<dyn MediaExtractor>,
    pub(crate) tagger: Arc<dyn MetadataTagger>,
    emitter: Arc<dyn EventEmitter>,
    shutting_down: AtomicBool,
    next_worker: AtomicU64,
}

impl Shared {
    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn next_worker_serial(&self) -> u64 {
        self.next_worker.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn snapshot(&self, id: &str) -> Option<DownloadRecord> {
        let state = self.state.lock().await;
        state.records.iter().find(|r| r.id == id).cloned()
    }

    /// Moves a live record to `next` and emits the change. Returns `None` when
    /// the record has left the queue or the transition is not allowed.
    pub(crate) async fn transition(
        &self,
        id: &str,
        next: DownloadStatus,
        apply: impl FnOnce(&mut DownloadRecord),
    ) -> Option<DownloadRecord> {
        let mut state = self.state.lock().await;
        let record = state.find_mut(id)?;
        if record.status != next && !record.status.can_transition_to(next) {
            warn!("[{}] rejected transition {} -> {}", id, record.status, next);
            return None;
        }
        record.status = next;
        apply(record);
        let snapshot = record.clone();
        self.emitter.emit(QueueEvent::for_record(&snapshot));
        Some(snapshot)
    }

    /// Mutates live fields without touching the status.
    pub(crate) async fn update_live(
        &self,
        id: &str,
        apply: impl FnOnce(&mut DownloadRecord),
    ) -> Option<DownloadRecord> {
        let mut state = self.state.lock().await;
        let record = state.find_mut(id)?;
        apply(record);
        let snapshot = record.clone();
        self.emitter.emit(QueueEvent::Updated(snapshot.clone()));
        Some(snapshot)
    }

    /// Counts a failed attempt against the retry budget. A paused record stays
    /// paused and its next attempt waits for resume; anything else goes back
    /// to `preparing`.
    pub(crate) async fn book_retry(&self, id: &str, message: &str) -> Option<DownloadRecord> {
        let mut state = self.state.lock().await;
        let record = state.find_mut(id)?;
        if record.status != DownloadStatus::Paused {
            if !record.status.can_transition_to(DownloadStatus::Preparing) {
                warn!("[{}] cannot retry from {}", id, record.status);
                return None;
            }
            record.status = DownloadStatus::Preparing;
        }
        record.retry_count += 1;
        record.set_error(message);
        record.reset_progress();
        let snapshot = record.clone();
        self.emitter.emit(QueueEvent::Updated(snapshot.clone()));
        Some(snapshot)
    }

    /// Writes the current in-memory copy of `id` to the store.
    pub(crate) async fn persist(&self, id: &str) {
        let _gate = self.write_gate.lock().await;
        if let Some(record) = self.snapshot(id).await {
            self.write(&record).await;
        }
    }

    /// Moves a live record into a terminal status and hands it over to the
    /// store. The record leaves the in-memory queue and its worker slot frees
    /// up. No-op when the record already left.
    pub(crate) async fn finish(
        &self,
        id: &str,
        status: DownloadStatus,
        apply: impl FnOnce(&mut DownloadRecord),
    ) -> Option<DownloadRecord> {
        let _gate = self.write_gate.lock().await;
        let record = {
            let mut state = self.state.lock().await;
            let pos = state.records.iter().position(|r| r.id == id)?;
            let from = state.records[pos].status;
            if !from.can_transition_to(status) {
                warn!("[{}] rejected transition {} -> {}", id, from, status);
                return None;
            }
            let mut record = state.records.remove(pos);
            state.workers.remove(id);
            state.unsynced.remove(id);
            record.status = status;
            apply(&mut record);
            self.emitter.emit(QueueEvent::for_record(&record));
            record
        };
        self.write(&record).await;
        Some(record)
    }

    /// Puts an interrupted transfer back into `pending` so the next start picks
    /// it up again. Paused records keep their status.
    pub(crate) async fn requeue_interrupted(&self, id: &str) {
        let _gate = self.write_gate.lock().await;
        let record = {
            let mut state = self.state.lock().await;
            state.workers.remove(id);
            let Some(record) = state.find_mut(id) else {
                return;
            };
            if matches!(
                record.status,
                DownloadStatus::Preparing | DownloadStatus::Downloading
            ) {
                record.status = DownloadStatus::Pending;
                record.reset_progress();
                self.emitter.emit(QueueEvent::Updated(record.clone()));
            }
            record.clone()
        };
        self.write(&record).await;
    }

    pub(crate) async fn release_worker(&self, id: &str, serial: u64) {
        let mut state = self.state.lock().await;
        if state.workers.get(id).is_some_and(|w| w.serial() == serial) {
            state.workers.remove(id);
        }
    }

    /// Store write with convergence bookkeeping. Callers hold `write_gate`.
    async fn write(&self, record: &DownloadRecord) {
        match self.store.put(record).await {
            Ok(()) => {
                self.state.lock().await.unsynced.remove(&record.id);
            }
            Err(e) => {
                warn!("[{}] store write failed, will retry: {}", record.id, e);
                self.state
                    .lock()
                    .await
                    .unsynced
                    .insert(record.id.clone(), record.clone());
            }
        }
    }

    async fn flush_unsynced(&self) {
        let _gate = self.write_gate.lock().await;
        let pending: Vec<DownloadRecord> = {
            let state = self.state.lock().await;
            state.unsynced.values().cloned().collect()
        };
        if pending.is_empty() {
            return;
        }
        debug!("retrying {} unsynced store writes", pending.len());
        for record in pending {
            self.write(&record).await;
        }
    }
}

/// The scheduler. Cheap to clone; all clones drive the same queue.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<Shared>,
}

impl QueueManager {
    /// Builds the queue and reconciles it with the store: live records are
    /// reloaded, and anything caught mid-transfer by the last shutdown goes
    /// back to `pending`.
    pub async fn init(mut config: QueueConfig, deps: Collaborators) -> Self {
        match deps.store.get_setting(MAX_CONCURRENT_KEY).await {
            Ok(Some(value)) => match value.parse::<u32>() {
                Ok(n) if n >= 1 => config.max_concurrent = n,
                _ => warn!("ignoring invalid stored max_concurrent '{}'", value),
            },
            Ok(None) => {}
            Err(e) => warn!("could not read stored max_concurrent: {}", e),
        }

        let mut records = match deps.store.list(Some(&LIVE_STATUSES), None, false).await {
            Ok(records) => records,
            Err(e) => {
                warn!("could not load queued downloads: {}", e);
                Vec::new()
            }
        };
        records.sort_by_key(|r| r.created_at);

        let mut reset = Vec::new();
        for record in records.iter_mut() {
            if matches!(
                record.status,
                DownloadStatus::Preparing | DownloadStatus::Downloading
            ) {
                debug!("[{}] reconciling {} -> pending", record.id, record.status);
                record.status = DownloadStatus::Pending;
                record.reset_progress();
                reset.push(record.id.clone());
            }
        }

        info!(
            "queue ready: {} live records ({} reconciled), max_concurrent={}, store={}",
            records.len(),
            reset.len(),
            config.max_concurrent,
            deps.store.kind()
        );

        let manager = Self {
            inner: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    records,
                    workers: HashMap::new(),
                    unsynced: HashMap::new(),
                    config,
                }),
                write_gate: Mutex::new(()),
                store: deps.store,
                engine: deps.engine,
                extractor: deps.extractor,
                tagger: deps.tagger,
                emitter: deps.emitter,
                shutting_down: AtomicBool::new(false),
                next_worker: AtomicU64::new(1),
            }),
        };

        for id in reset {
            manager.inner.persist(&id).await;
        }
        manager
    }

    pub async fn config(&self) -> QueueConfig {
        self.inner.state.lock().await.config.clone()
    }

    pub async fn add_download(
        &self,
        url: &str,
        format_type: FormatType,
        quality: &str,
        output_path: Option<PathBuf>,
    ) -> Result<String> {
        url_parser::validate_url(url)?;
        let config = self.config().await;
        let output = output_path.unwrap_or_else(|| config.default_output_dir.clone());
        self.enqueue(url.trim(), format_type, quality, output, &config, |_| {})
            .await
    }

    /// Expands a playlist with the extractor's flat mode and queues one record
    /// per entry in `[start, end]` (1-based, inclusive, clamped).
    pub async fn add_playlist(
        &self,
        url: &str,
        format_type: FormatType,
        quality: &str,
        output_path: Option<PathBuf>,
        start: Option<usize>,
        end: Option<usize>,
    ) -> Result<Vec<String>> {
        url_parser::validate_url(url)?;
        let playlist = self
            .inner
            .extractor
            .extract_flat(url.trim())
            .await
            .map_err(|e| QueueError::Transfer(format!("playlist lookup failed: {:#}", e)))?;

        let config = self.config().await;
        let mut folder = filename::sanitize_title(&playlist.title);
        if folder.is_empty() {
            folder = PLAYLIST_FOLDER_FALLBACK.to_string();
        }
        let output = output_path
            .unwrap_or_else(|| config.default_output_dir.clone())
            .join(folder);

        let entry_format = match format_type {
            FormatType::Playlist => FormatType::Video,
            other => other,
        };

        let len = playlist.entries.len();
        let first = start.unwrap_or(1).max(1);
        let last = end.unwrap_or(len).min(len);
        if len == 0 || first > last {
            info!("playlist {} has no entries in range {}..={}", url, first, last);
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in &playlist.entries[first - 1..last] {
            if entry.url.trim().is_empty() {
                continue;
            }
            if let Err(e) = url_parser::validate_url(&entry.url) {
                warn!("skipping playlist entry '{}': {}", entry.url, e);
                continue;
            }
            let title = entry.title.clone();
            let duration = entry.duration_seconds;
            let id = self
                .enqueue(
                    entry.url.trim(),
                    entry_format,
                    quality,
                    output.clone(),
                    &config,
                    |r| {
                        r.title = title;
                        r.duration_seconds = duration;
                    },
                )
                .await?;
            ids.push(id);
        }
        info!("queued {} entries from playlist '{}'", ids.len(), playlist.title);
        Ok(ids)
    }

    async fn enqueue(
        &self,
        url: &str,
        format_type: FormatType,
        quality: &str,
        output: PathBuf,
        config: &QueueConfig,
        customize: impl FnOnce(&mut DownloadRecord),
    ) -> Result<String> {
        let quality = match quality.trim() {
            "" if format_type == FormatType::Audio => format!("{}kbps", config.audio_bitrate),
            "" => config.default_video_quality.clone(),
            q => q.to_string(),
        };

        let _gate = self.inner.write_gate.lock().await;
        let created_at = Utc::now();
        let id = self.allocate_id(url, created_at).await;

        let mut record =
            DownloadRecord::new(id.clone(), url.to_string(), format_type, quality, output, created_at);
        record.max_retries = config.max_retries;
        if format_type == FormatType::Audio {
            record.codec = config.audio_codec.clone();
            record.bitrate = quality_number(&record.quality).unwrap_or(config.audio_bitrate);
        }
        customize(&mut record);

        {
            let mut state = self.inner.state.lock().await;
            state.records.push(record.clone());
            self.inner.emitter.emit(QueueEvent::Added(record.clone()));
        }
        self.inner.write(&record).await;
        info!("[{}] queued {} ({}, {})", id, url, format_type, record.quality);
        Ok(id)
    }

    /// Caller holds `write_gate`, so no other enqueue can race for the same id.
    async fn allocate_id(&self, url: &str, created_at: chrono::DateTime<Utc>) -> String {
        let mut nonce = 0u32;
        loop {
            let id = generate_id(url, created_at, nonce);
            let in_memory = {
                let state = self.inner.state.lock().await;
                state.records.iter().any(|r| r.id == id) || state.unsynced.contains_key(&id)
            };
            let in_store = if in_memory {
                true
            } else {
                match self.inner.store.get(&id).await {
                    Ok(found) => found.is_some(),
                    Err(e) => {
                        warn!("[{}] id lookup failed, assuming unused: {}", id, e);
                        false
                    }
                }
            };
            if !in_store {
                return id;
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    /// Admits pending records, oldest first, until the concurrency limit is
    /// reached. Returns how many were started.
    pub async fn tick(&self) -> usize {
        if self.inner.is_shutting_down() {
            return 0;
        }

        let mut state = self.inner.state.lock().await;
        if !state.unsynced.is_empty() {
            let shared = self.inner.clone();
            tokio::spawn(async move { shared.flush_unsynced().await });
        }

        let limit = state.config.max_concurrent as usize;
        let slots = limit.saturating_sub(state.workers.len());
        if slots == 0 {
            return 0;
        }

        let mut candidates: Vec<_> = state
            .records
            .iter()
            .filter(|r| r.status == DownloadStatus::Pending && !state.workers.contains_key(&r.id))
            .map(|r| (r.created_at, r.id.clone()))
            .collect();
        candidates.sort_by_key(|(created_at, _)| *created_at);

        let mut started = 0;
        for (_, id) in candidates.into_iter().take(slots) {
            let Some(record) = state.find_mut(&id) else {
                continue;
            };
            record.status = DownloadStatus::Preparing;
            self.inner.emitter.emit(QueueEvent::Updated(record.clone()));

            let control = TransferWorker::spawn(self.inner.clone(), id.clone(), state.config.clone());
            state.workers.insert(id.clone(), control);
            debug!("[{}] admitted", id);
            started += 1;
        }
        started
    }

    pub async fn pause(&self, id: &str) -> Result<()> {
        let changed = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            match state.records.iter_mut().find(|r| r.id == id) {
                None => None,
                Some(record) => Some(match record.status {
                    DownloadStatus::Paused => false,
                    DownloadStatus::Downloading => {
                        if let Some(worker) = state.workers.get(id) {
                            worker.pause();
                        }
                        record.status = DownloadStatus::Paused;
                        record.speed_bytes_per_sec = 0.0;
                        record.eta_seconds = None;
                        self.inner.emitter.emit(QueueEvent::Updated(record.clone()));
                        true
                    }
                    other => return Err(QueueError::invalid_transition(id, other, "pause")),
                }),
            }
        };

        match changed {
            None => Err(self.not_live(id, "pause").await),
            Some(false) => Ok(()),
            Some(true) => {
                info!("[{}] paused", id);
                self.inner.persist(id).await;
                Ok(())
            }
        }
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        let changed = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            match state.records.iter_mut().find(|r| r.id == id) {
                None => None,
                Some(record) => Some(match record.status {
                    DownloadStatus::Downloading => false,
                    DownloadStatus::Paused => {
                        match state.workers.get(id) {
                            Some(worker) => {
                                worker.resume();
                                record.status = DownloadStatus::Downloading;
                            }
                            None => {
                                record.status = DownloadStatus::Pending;
                                record.reset_progress();
                            }
                        }
                        self.inner.emitter.emit(QueueEvent::Updated(record.clone()));
                        true
                    }
                    other => return Err(QueueError::invalid_transition(id, other, "resume")),
                }),
            }
        };

        match changed {
            None => Err(self.not_live(id, "resume").await),
            Some(false) => Ok(()),
            Some(true) => {
                info!("[{}] resumed", id);
                self.inner.persist(id).await;
                Ok(())
            }
        }
    }

    /// Stops a download. A running worker gets `cancel_grace` to stop on its
    /// own before its task is aborted.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let (join, grace) = {
            let mut state = self.inner.state.lock().await;
            if !state.records.iter().any(|r| r.id == id) {
                drop(state);
                return Err(self.not_live(id, "cancel").await);
            }
            let grace = state.config.cancel_grace;
            let join = state.workers.get_mut(id).and_then(|w| {
                w.cancel();
                w.take_join()
            });
            (join, grace)
        };

        if let Some(mut join) = join {
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                warn!("[{}] worker ignored cancellation for {:?}, aborting", id, grace);
                join.abort();
                let _ = join.await;
            }
        }

        let cancelled = self
            .inner
            .finish(id, DownloadStatus::Cancelled, |r| {
                r.speed_bytes_per_sec = 0.0;
                r.eta_seconds = None;
            })
            .await;
        if cancelled.is_none() {
            // The worker reached a terminal state on its own during the grace wait.
            let err = self.not_live(id, "cancel").await;
            debug!("[{}] cancel lost the race: {}", id, err);
            return Err(err);
        }
        info!("[{}] cancelled by user", id);
        Ok(())
    }

    /// Re-queues a failed download with a fresh retry budget.
    pub async fn retry(&self, id: &str) -> Result<()> {
        if let Some(live) = self.inner.snapshot(id).await {
            return Err(QueueError::invalid_transition(id, live.status, "retry"));
        }
        let mut record = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if record.status != DownloadStatus::Failed {
            return Err(QueueError::invalid_transition(id, record.status, "retry"));
        }

        record.status = DownloadStatus::Pending;
        record.retry_count = 0;
        record.error_message = None;
        record.completed_at = None;
        record.resolved_filename = None;
        record.file_size_bytes = None;
        record.reset_progress();

        let _gate = self.inner.write_gate.lock().await;
        {
            let mut state = self.inner.state.lock().await;
            if let Some(live) = state.records.iter().find(|r| r.id == id) {
                return Err(QueueError::invalid_transition(id, live.status, "retry"));
            }
            state.records.push(record.clone());
            self.inner.emitter.emit(QueueEvent::Updated(record.clone()));
        }
        self.inner.write(&record).await;
        info!("[{}] retry requested", id);
        Ok(())
    }

    async fn not_live(&self, id: &str, action: &'static str) -> QueueError {
        match self.inner.store.get(id).await {
            Ok(Some(record)) if record.status == DownloadStatus::Cancelled => {
                QueueError::CancelledByUser(id.to_string())
            }
            Ok(Some(record)) => QueueError::invalid_transition(id, record.status, action),
            Ok(None) => QueueError::NotFound(id.to_string()),
            Err(e) => e,
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<DownloadRecord>> {
        if let Some(record) = self.inner.snapshot(id).await {
            return Ok(Some(record));
        }
        self.inner.store.get(id).await
    }

    /// Every record still in the in-memory queue, in admission order.
    pub async fn get_active(&self) -> Vec<DownloadRecord> {
        self.inner.state.lock().await.records.clone()
    }

    /// Terminal records, newest first.
    pub async fn get_history(&self, limit: u32) -> Result<Vec<DownloadRecord>> {
        self.inner
            .store
            .list(Some(&DownloadStatus::TERMINAL), Some(limit), true)
            .await
    }

    pub async fn get_stats(&self) -> QueueStats {
        let (active_count, queued_count) = {
            let state = self.inner.state.lock().await;
            let queued = state
                .records
                .iter()
                .filter(|r| r.status == DownloadStatus::Pending)
                .count();
            (state.workers.len(), queued)
        };

        let totals = match self.inner.store.totals().await {
            Ok(t) => t,
            Err(e) => {
                warn!("could not compute download stats: {}", e);
                Default::default()
            }
        };

        let success_rate = if totals.total > 0 {
            totals.completed as f64 / totals.total as f64 * 100.0
        } else {
            0.0
        };

        QueueStats {
            total: totals.total,
            completed: totals.completed,
            failed: totals.failed,
            success_rate,
            total_size_mb: totals.completed_bytes as f64 / (1024.0 * 1024.0),
            active_count,
            queued_count,
        }
    }

    pub async fn export_history(&self, path: &Path, format: HistoryFormat) -> Result<usize> {
        let limit = self.config().await.history_export_limit;
        let records = self.get_history(limit).await?;
        history::export(path, format, &records)?;
        info!("exported {} records to {}", records.len(), path.display());
        Ok(records.len())
    }

    /// Upserts records from a JSON export. Ids currently in the live queue are
    /// skipped; imported non-terminal records join the queue.
    pub async fn import_history(&self, path: &Path) -> Result<usize> {
        let records = history::import(path)?;
        let mut imported = 0;

        for mut record in records {
            let _gate = self.inner.write_gate.lock().await;
            {
                let mut state = self.inner.state.lock().await;
                if state.records.iter().any(|r| r.id == record.id) {
                    debug!("[{}] skipping import of a live record", record.id);
                    continue;
                }
                if !record.is_terminal() {
                    if matches!(
                        record.status,
                        DownloadStatus::Preparing | DownloadStatus::Downloading
                    ) {
                        record.status = DownloadStatus::Pending;
                        record.reset_progress();
                    }
                    state.records.push(record.clone());
                    self.inner.emitter.emit(QueueEvent::Added(record.clone()));
                }
            }
            self.inner.write(&record).await;
            imported += 1;
        }

        info!("imported {} records from {}", imported, path.display());
        Ok(imported)
    }

    pub async fn cleanup_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let removed = self
            .inner
            .store
            .delete_older_than(cutoff, &DownloadStatus::TERMINAL)
            .await?;
        info!("removed {} history records older than {} days", removed, days);
        Ok(removed)
    }

    /// Changes the admission limit. Running workers are never preempted.
    pub async fn set_max_concurrent(&self, n: u32) -> Result<()> {
        if n == 0 {
            return Err(QueueError::invalid_input("max_concurrent must be at least 1"));
        }
        self.inner.state.lock().await.config.max_concurrent = n;
        if let Err(e) = self
            .inner
            .store
            .set_setting(MAX_CONCURRENT_KEY, &n.to_string())
            .await
        {
            warn!("could not persist max_concurrent={}: {}", n, e);
        }
        info!("max_concurrent set to {}", n);
        Ok(())
    }

    /// Drops terminal records that are still in memory. Returns how many.
    pub async fn clear_finished(&self) -> usize {
        let mut state = self.inner.state.lock().await;
        let before = state.records.len();
        state.records.retain(|r| !r.is_terminal());
        before - state.records.len()
    }

    pub async fn active_workers(&self) -> usize {
        self.inner.state.lock().await.workers.len()
    }

    /// True when nothing is running and nothing is waiting to be admitted.
    pub async fn is_idle(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.workers.is_empty()
            && !state
                .records
                .iter()
                .any(|r| r.status == DownloadStatus::Pending)
    }

    /// Stops every worker within `shutdown_grace`, puts interrupted transfers
    /// back to `pending` for the next start, flushes pending writes and closes
    /// the store.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let (joins, grace) = {
            let mut state = self.inner.state.lock().await;
            let grace = state.config.shutdown_grace;
            let joins: Vec<_> = state
                .workers
                .iter_mut()
                .filter_map(|(id, w)| {
                    w.cancel();
                    w.take_join().map(|j| (id.clone(), j))
                })
                .collect();
            (joins, grace)
        };

        info!("shutting down, stopping {} workers", joins.len());
        let deadline = tokio::time::Instant::now() + grace;
        for (id, mut join) in joins {
            if tokio::time::timeout_at(deadline, &mut join).await.is_err() {
                warn!("[{}] worker did not stop in time, aborting", id);
                join.abort();
                let _ = join.await;
            }
            self.inner.requeue_interrupted(&id).await;
        }

        self.inner.flush_unsynced().await;
        let unsynced = self.inner.state.lock().await.unsynced.len();
        if unsynced > 0 {
            warn!("{} records could not be written before shutdown", unsynced);
        }
        self.inner.store.close().await;
    }
}
