//! Scripted collaborators for queue and worker tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mediafetch_core::core::events::EventBus;
use mediafetch_core::models::media::{FormatKind, FormatOption, MediaInfo, PlaylistInfo};
use mediafetch_core::models::record::{DownloadRecord, DownloadStatus};
use tempfile::TempDir;

use crate::core::queue::{Collaborators, QueueConfig, QueueManager};
use crate::core::worker::ProgressHook;
use crate::error::{QueueError, Result};
use crate::platforms::traits::{
    DownloadEngine, MediaExtractor, MetadataTagger, ProgressUpdate, TransferOptions,
    TransferOutput,
};
use crate::storage::store::{MemoryRecordStore, RecordStore, StoreTotals};

pub(crate) fn fast_config() -> QueueConfig {
    QueueConfig {
        max_concurrent: 3,
        max_retries: 3,
        retry_backoff: Duration::from_millis(5),
        cancel_grace: Duration::from_millis(200),
        shutdown_grace: Duration::from_millis(200),
        pause_timeout: None,
        progress_interval: Duration::ZERO,
        ..QueueConfig::default()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Reports each percentage, then finishes.
    Succeed(Vec<u8>),
    Fail(&'static str),
    /// Runs until cancelled, honouring pause at the checkpoint.
    Hang,
    /// Never returns and never looks at the hook.
    Stuck,
    /// Reports one sample, then fails (or finishes) after `delay` without
    /// looking at the hook again.
    Settle {
        percent: u8,
        delay: Duration,
        fail: Option<&'static str>,
    },
}

pub(crate) struct ScriptedEngine {
    default: Step,
    script: Mutex<VecDeque<Step>>,
    attempts: AtomicUsize,
    running: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedEngine {
    pub(crate) const FILE_SIZE: u64 = 4 * 1024 * 1024;

    pub(crate) fn new(default: Step) -> Self {
        Self {
            default,
            script: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            running: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        }
    }

    /// Queues a step that runs before the default one.
    pub(crate) fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_running(&self, n: usize) {
        for _ in 0..500 {
            if self.running.load(Ordering::SeqCst) == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} running transfers, found {}",
            n,
            self.running.load(Ordering::SeqCst)
        );
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl DownloadEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn download(
        &self,
        opts: &TransferOptions,
        hook: &ProgressHook,
    ) -> anyhow::Result<TransferOutput> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(self.running.clone());

        match self.next_step() {
            Step::Succeed(percents) => {
                for p in percents {
                    hook.report(ProgressUpdate::downloading(u64::from(p), Some(100)))
                        .await?;
                }
                let file_path = output_file(opts);
                hook.report(ProgressUpdate::finished(Some(
                    file_path.to_string_lossy().to_string(),
                )))
                .await?;
                Ok(TransferOutput {
                    file_path,
                    file_size_bytes: Some(Self::FILE_SIZE),
                })
            }
            Step::Fail(msg) => Err(anyhow::anyhow!("ERROR: {}", msg)),
            Step::Hang => loop {
                hook.checkpoint().await?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            },
            Step::Stuck => std::future::pending().await,
            Step::Settle {
                percent,
                delay,
                fail,
            } => {
                hook.report(ProgressUpdate::downloading(u64::from(percent), Some(100)))
                    .await?;
                tokio::time::sleep(delay).await;
                match fail {
                    Some(msg) => Err(anyhow::anyhow!("ERROR: {}", msg)),
                    None => Ok(TransferOutput {
                        file_path: output_file(opts),
                        file_size_bytes: Some(Self::FILE_SIZE),
                    }),
                }
            }
        }
    }
}

fn output_file(opts: &TransferOptions) -> PathBuf {
    let ext = opts.audio.as_ref().map_or("mp4", |a| a.codec.as_str());
    opts.output_dir
        .join(opts.output_template.replace("%(ext)s", ext))
}

pub(crate) struct FakeExtractor {
    fail: bool,
    playlist: Option<PlaylistInfo>,
}

impl FakeExtractor {
    pub(crate) const TITLE: &'static str = "Sample Video";

    pub(crate) fn new() -> Self {
        Self {
            fail: false,
            playlist: None,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            playlist: None,
        }
    }

    pub(crate) fn with_playlist(playlist: PlaylistInfo) -> Self {
        Self {
            fail: false,
            playlist: Some(playlist),
        }
    }
}

#[async_trait]
impl MediaExtractor for FakeExtractor {
    async fn extract_info(&self, url: &str) -> anyhow::Result<MediaInfo> {
        if self.fail {
            anyhow::bail!("metadata unavailable for {}", url);
        }
        Ok(MediaInfo {
            title: Self::TITLE.to_string(),
            uploader: "Someone".into(),
            platform: "Unknown".into(),
            duration_seconds: Some(90),
            thumbnail_url: Some("https://example.com/t.jpg".into()),
            available_formats: vec![FormatOption {
                quality_label: "720p".into(),
                format_id: "22".into(),
                kind: FormatKind::Video,
            }],
        })
    }

    async fn extract_flat(&self, url: &str) -> anyhow::Result<PlaylistInfo> {
        match &self.playlist {
            Some(p) if !self.fail => Ok(p.clone()),
            _ => anyhow::bail!("no playlist at {}", url),
        }
    }
}

#[derive(Default)]
pub(crate) struct RecordingTagger {
    fail: bool,
    delay: Option<Duration>,
    calls: Mutex<Vec<(PathBuf, String)>>,
}

impl RecordingTagger {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub(crate) fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<(PathBuf, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataTagger for RecordingTagger {
    async fn tag_title(&self, file: &Path, title: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((file.to_path_buf(), title.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("tagger exploded");
        }
        Ok(())
    }
}

/// Memory store whose writes can be switched to fail.
pub(crate) struct FlakyStore {
    inner: MemoryRecordStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryRecordStore::new(),
            failing: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn inner(&self) -> &MemoryRecordStore {
        &self.inner
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(QueueError::store("put", "disk I/O error"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    fn kind(&self) -> &'static str {
        "flaky"
    }

    async fn put(&self, record: &DownloadRecord) -> Result<()> {
        self.check()?;
        self.inner.put(record).await
    }

    async fn get(&self, id: &str) -> Result<Option<DownloadRecord>> {
        self.inner.get(id).await
    }

    async fn list(
        &self,
        statuses: Option<&[DownloadStatus]>,
        limit: Option<u32>,
        newest_first: bool,
    ) -> Result<Vec<DownloadRecord>> {
        self.inner.list(statuses, limit, newest_first).await
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[DownloadStatus],
    ) -> Result<u64> {
        self.inner.delete_older_than(cutoff, statuses).await
    }

    async fn totals(&self) -> Result<StoreTotals> {
        self.inner.totals().await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_setting(key).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.set_setting(key, value).await
    }

    async fn close(&self) {}
}

pub(crate) struct Harness {
    pub queue: QueueManager,
    pub store: Arc<dyn RecordStore>,
    pub engine: Arc<ScriptedEngine>,
    pub extractor: Arc<FakeExtractor>,
    pub tagger: Arc<RecordingTagger>,
    pub bus: EventBus,
    pub config: QueueConfig,
    pub dir: TempDir,
}

impl Harness {
    pub(crate) async fn build(
        config: QueueConfig,
        engine: ScriptedEngine,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self::assemble(
            config,
            Arc::new(engine),
            store,
            Arc::new(FakeExtractor::new()),
            Arc::new(RecordingTagger::default()),
            tempfile::tempdir().unwrap(),
        )
        .await
    }

    async fn assemble(
        config: QueueConfig,
        engine: Arc<ScriptedEngine>,
        store: Arc<dyn RecordStore>,
        extractor: Arc<FakeExtractor>,
        tagger: Arc<RecordingTagger>,
        dir: TempDir,
    ) -> Self {
        let bus = EventBus::new();
        let queue = QueueManager::init(
            config.clone(),
            Collaborators {
                store: store.clone(),
                engine: engine.clone(),
                extractor: extractor.clone(),
                tagger: tagger.clone(),
                emitter: Arc::new(bus.clone()),
            },
        )
        .await;
        Self {
            queue,
            store,
            engine,
            extractor,
            tagger,
            bus,
            config,
            dir,
        }
    }

    pub(crate) async fn with_tagger(self, tagger: RecordingTagger) -> Self {
        Self::assemble(
            self.config,
            self.engine,
            self.store,
            self.extractor,
            Arc::new(tagger),
            self.dir,
        )
        .await
    }

    pub(crate) async fn with_extractor(self, extractor: FakeExtractor) -> Self {
        Self::assemble(
            self.config,
            self.engine,
            self.store,
            Arc::new(extractor),
            self.tagger,
            self.dir,
        )
        .await
    }

    pub(crate) async fn with_config(self, config: QueueConfig) -> Self {
        Self::assemble(
            config,
            self.engine,
            self.store,
            self.extractor,
            self.tagger,
            self.dir,
        )
        .await
    }
}

pub(crate) async fn harness(step: Step) -> Harness {
    harness_with(fast_config(), ScriptedEngine::new(step)).await
}

pub(crate) async fn harness_with(config: QueueConfig, engine: ScriptedEngine) -> Harness {
    Harness::build(config, engine, Arc::new(MemoryRecordStore::new())).await
}

/// Polls `get(id)` until `pred` holds, for up to five seconds.
pub(crate) async fn wait_for(
    queue: &QueueManager,
    id: &str,
    pred: impl Fn(&DownloadRecord) -> bool,
) -> DownloadRecord {
    let mut last = None;
    for _ in 0..500 {
        if let Ok(Some(record)) = queue.get(id).await {
            if pred(&record) {
                return record;
            }
            last = Some(record.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("record {} never reached the expected state (last: {:?})", id, last);
}
