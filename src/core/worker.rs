use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use mediafetch_core::models::record::{quality_number, DownloadRecord, DownloadStatus, FormatType};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::filename;
use crate::core::queue::{QueueConfig, Shared};
use crate::error::QueueError;
use crate::platforms::traits::{
    AudioExtraction, ProgressPhase, ProgressUpdate, TransferOptions, TransferOutput,
};

const PROGRESS_CHANNEL_CAPACITY: usize = 64;
const PLAYLIST_ITEM_TEMPLATE: &str = "%(playlist_index)s - %(title)s.%(ext)s";
pub const PAUSE_EXPIRED_MESSAGE: &str = "paused too long";

/// Returned by [`ProgressHook`] when the transfer must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transfer cancelled")]
pub struct Cancelled;

/// Parks a worker while its download is paused. With a timeout, an
/// expired wait cancels the transfer and marks it as expired.
#[derive(Clone)]
pub(crate) struct PauseGate {
    cancel: CancellationToken,
    rx: watch::Receiver<bool>,
    timeout: Option<Duration>,
    expired: Arc<AtomicBool>,
}

impl PauseGate {
    pub(crate) fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    pub(crate) fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) -> Result<(), Cancelled> {
        let mut rx = self.rx.clone();
        let cancel = self.cancel.clone();
        let wait = async move {
            loop {
                if !*rx.borrow_and_update() {
                    return Ok(());
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Cancelled),
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return Err(Cancelled);
                        }
                    }
                }
            }
        };

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    self.expired.store(true, Ordering::SeqCst);
                    self.cancel.cancel();
                    Err(Cancelled)
                }
            },
            None => wait.await,
        }
    }
}

/// The only cooperative checkpoint inside a running transfer. Engines call
/// [`ProgressHook::report`] for each progress sample; the hook observes
/// cancellation first, then parks the caller for as long as the download is
/// paused.
pub struct ProgressHook {
    gate: PauseGate,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressHook {
    pub async fn report(&self, update: ProgressUpdate) -> Result<(), Cancelled> {
        self.checkpoint().await?;
        if self.tx.send(update).await.is_err() {
            debug!("progress receiver gone, dropping sample");
        }
        Ok(())
    }

    pub async fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled);
        }
        if self.gate.is_paused() {
            self.gate.wait().await?;
            if self.is_cancelled() {
                return Err(Cancelled);
            }
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.gate.cancel.is_cancelled()
    }
}

/// Handle the queue keeps for a running worker.
pub(crate) struct WorkerControl {
    serial: u64,
    cancel: CancellationToken,
    pause_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerControl {
    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Returns false when the worker was already paused.
    pub(crate) fn pause(&self) -> bool {
        self.pause_tx.send_if_modified(|paused| {
            if *paused {
                false
            } else {
                *paused = true;
                true
            }
        })
    }

    pub(crate) fn resume(&self) -> bool {
        self.pause_tx.send_if_modified(|paused| {
            if *paused {
                *paused = false;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
        self.pause_tx.send_replace(false);
    }

    pub(crate) fn take_join(&mut self) -> Option<JoinHandle<()>> {
        self.join.take()
    }
}

/// Rate limit for progress samples. The first sample always passes.
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.min_interval);
        if due {
            self.last_emit = Some(now);
        }
        due
    }
}

/// Engine format selector for a record.
///
/// Video and playlists pick the best stream no taller than the leading number
/// of `quality`, preferring mp4; audio takes the best audio-only stream and
/// relies on the extraction step for the target codec.
pub fn format_selector(format_type: FormatType, quality: &str) -> String {
    match format_type {
        FormatType::Audio => "bestaudio/best".to_string(),
        FormatType::Video | FormatType::Playlist => match quality_number(quality) {
            Some(h) => format!("best[height<={h}][ext=mp4]/best[height<={h}]/best"),
            None => "best[ext=mp4]/best".to_string(),
        },
    }
}

pub fn build_options(record: &DownloadRecord, config: &QueueConfig) -> TransferOptions {
    let stem = filename::file_stem(&record.title, &record.id);
    let (output_dir, output_template) = match record.format_type {
        FormatType::Playlist => (
            record.output_path.join(&stem),
            PLAYLIST_ITEM_TEMPLATE.to_string(),
        ),
        _ => (record.output_path.clone(), format!("{}.%(ext)s", stem)),
    };

    let audio = (record.format_type == FormatType::Audio).then(|| AudioExtraction {
        codec: record.codec.clone(),
        bitrate_kbps: record.bitrate,
    });

    TransferOptions {
        url: record.url.clone(),
        output_dir,
        output_template,
        format_selector: format_selector(record.format_type, &record.quality),
        audio,
        allow_playlist: record.format_type == FormatType::Playlist,
        socket_timeout_secs: config.socket_timeout_secs,
        proxy: config.proxy.clone(),
        extra_args: config.extra_args.clone(),
    }
}

pub(crate) struct TransferWorker {
    shared: Arc<Shared>,
    id: String,
    serial: u64,
    config: QueueConfig,
    cancel: CancellationToken,
    gate: PauseGate,
}

impl TransferWorker {
    /// Starts the worker task for a record already marked `preparing`.
    pub(crate) fn spawn(shared: Arc<Shared>, id: String, config: QueueConfig) -> WorkerControl {
        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);
        let serial = shared.next_worker_serial();
        let gate = PauseGate {
            cancel: cancel.clone(),
            rx: pause_rx,
            timeout: config.pause_timeout,
            expired: Arc::new(AtomicBool::new(false)),
        };
        let worker = TransferWorker {
            shared,
            id,
            serial,
            config,
            cancel: cancel.clone(),
            gate,
        };
        let join = tokio::spawn(worker.run());
        WorkerControl {
            serial,
            cancel,
            pause_tx,
            join: Some(join),
        }
    }

    async fn run(self) {
        self.drive().await;
        self.shared.release_worker(&self.id, self.serial).await;
    }

    async fn drive(&self) {
        let Some(initial) = self.shared.snapshot(&self.id).await else {
            return;
        };
        self.shared.persist(&self.id).await;

        if initial.title.trim().is_empty() {
            self.prefetch_metadata(&initial.url).await;
        }

        loop {
            if self.cancel.is_cancelled() {
                return self.stop().await;
            }
            // Paused between attempts; the next one starts on resume.
            if self.gate.is_paused() {
                if self.gate.wait().await.is_err() {
                    return self.stop().await;
                }
                continue;
            }

            let Some(record) = self
                .shared
                .transition(&self.id, DownloadStatus::Downloading, |_| {})
                .await
            else {
                debug!("[{}] record left the queue before transfer start", self.id);
                return;
            };
            self.shared.persist(&self.id).await;

            info!(
                "[{}] starting transfer of {} (attempt {}/{})",
                self.id,
                record.url,
                record.retry_count + 1,
                record.max_retries + 1
            );
            let result = self.attempt(&record).await;

            if self.cancel.is_cancelled() {
                return self.stop().await;
            }

            match result {
                Ok(output) => {
                    self.complete(output).await;
                    return;
                }
                Err(err) => {
                    let message = format!("{:#}", err);
                    let Some(latest) = self.shared.snapshot(&self.id).await else {
                        return;
                    };

                    if latest.retries_left() {
                        let Some(booked) = self.shared.book_retry(&self.id, &message).await
                        else {
                            debug!("[{}] record left the queue after a failed attempt", self.id);
                            return;
                        };
                        let attempt = booked.retry_count;
                        warn!(
                            "[{}] transfer failed, retry {}/{} ({}): {}",
                            self.id, attempt, booked.max_retries, booked.status, message
                        );
                        self.shared.persist(&self.id).await;

                        if !self.backoff(attempt).await {
                            return self.stop().await;
                        }
                    } else {
                        error!(
                            "[{}] transfer failed after {} attempts: {}",
                            self.id,
                            latest.retry_count + 1,
                            message
                        );
                        self.shared
                            .finish(&self.id, DownloadStatus::Failed, |r| {
                                r.set_error(&message);
                                r.speed_bytes_per_sec = 0.0;
                                r.eta_seconds = None;
                            })
                            .await;
                        return;
                    }
                }
            }
        }
    }

    async fn prefetch_metadata(&self, url: &str) {
        let lookup = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = self.shared.extractor.extract_info(url) => r,
        };

        match lookup {
            Ok(info) => {
                self.shared
                    .update_live(&self.id, |r| {
                        r.title = info.title.clone();
                        r.thumbnail_url = info.thumbnail_url.clone();
                        r.duration_seconds = info.duration_seconds;
                    })
                    .await;
            }
            Err(e) => warn!(
                "[{}] metadata lookup failed, using fallback filename: {:#}",
                self.id, e
            ),
        }
    }

    async fn attempt(&self, record: &DownloadRecord) -> anyhow::Result<TransferOutput> {
        let opts = build_options(record, &self.config);
        tokio::fs::create_dir_all(&opts.output_dir)
            .await
            .with_context(|| format!("cannot create {}", opts.output_dir.display()))?;

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let forwarder = self.spawn_forwarder(rx);
        let hook = ProgressHook {
            gate: self.gate.clone(),
            tx,
        };

        let result = self.shared.engine.download(&opts, &hook).await;
        drop(hook);
        let _ = forwarder.await;
        result
    }

    fn spawn_forwarder(&self, mut rx: mpsc::Receiver<ProgressUpdate>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let id = self.id.clone();
        let interval = self.config.progress_interval;

        tokio::spawn(async move {
            let mut throttle = ProgressThrottle::new(interval);
            while let Some(update) = rx.recv().await {
                let finished = update.phase == ProgressPhase::Finished;
                let percent = update.percent();
                if !finished && percent < 100 && !throttle.should_emit() {
                    continue;
                }

                let speed = update.speed.unwrap_or(0.0);
                shared
                    .update_live(&id, |r| {
                        r.apply_progress(percent, speed, update.eta);
                        if finished {
                            if let Some(name) = &update.filename {
                                r.resolved_filename = Some(name.clone());
                            }
                        }
                    })
                    .await;
                shared.persist(&id).await;
            }
        })
    }

    async fn complete(&self, output: TransferOutput) {
        let file_size = match output.file_size_bytes {
            Some(size) => Some(size),
            None => tokio::fs::metadata(&output.file_path)
                .await
                .ok()
                .filter(|m| m.is_file())
                .map(|m| m.len()),
        };

        if let Some(record) = self.shared.snapshot(&self.id).await {
            if record.format_type == FormatType::Audio
                && self.config.embed_metadata
                && !record.title.trim().is_empty()
            {
                if let Err(e) = self.tag(&output.file_path, &record.title).await {
                    warn!("[{}] {}", self.id, e);
                }
            }
        }

        let path = output.file_path.to_string_lossy().to_string();
        info!("[{}] completed: {}", self.id, path);
        self.shared
            .finish(&self.id, DownloadStatus::Completed, |r| {
                r.progress_percent = 100;
                r.speed_bytes_per_sec = 0.0;
                r.eta_seconds = None;
                r.completed_at = Some(Utc::now());
                r.resolved_filename = Some(path);
                r.file_size_bytes = file_size;
                r.error_message = None;
            })
            .await;
    }

    async fn tag(&self, file: &Path, title: &str) -> Result<(), QueueError> {
        self.shared.tagger.tag_title(file, title).await.map_err(|e| {
            QueueError::PostProcess(format!("tagging {} failed: {:#}", file.display(), e))
        })
    }

    async fn backoff(&self, attempt: u32) -> bool {
        let base = self
            .config
            .retry_backoff
            .as_millis()
            .saturating_mul(attempt as u128) as u64;
        let jitter = rand::random::<u64>() % (base / 2 + 1);
        let delay = Duration::from_millis(base + jitter);

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn stop(&self) {
        if self.shared.is_shutting_down() {
            self.shared.requeue_interrupted(&self.id).await;
            return;
        }

        let expired = self.gate.expired();
        info!("[{}] cancelled{}", self.id, if expired { " (pause timeout)" } else { "" });
        self.shared
            .finish(&self.id, DownloadStatus::Cancelled, |r| {
                r.speed_bytes_per_sec = 0.0;
                r.eta_seconds = None;
                if expired {
                    r.set_error(PAUSE_EXPIRED_MESSAGE);
                }
            })
            .await;
    }
}
