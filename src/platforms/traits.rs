use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mediafetch_core::models::media::{MediaInfo, PlaylistInfo};

use crate::core::worker::ProgressHook;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioExtraction {
    pub codec: String,
    pub bitrate_kbps: u32,
}

/// Everything the external engine needs for one transfer attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOptions {
    pub url: String,
    pub output_dir: PathBuf,
    /// Engine output template relative to `output_dir`, e.g. `My Title.%(ext)s`.
    pub output_template: String,
    pub format_selector: String,
    pub audio: Option<AudioExtraction>,
    pub allow_playlist: bool,
    pub socket_timeout_secs: u64,
    pub proxy: Option<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Downloading,
    Finished,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase: ProgressPhase,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub total_bytes_estimate: Option<u64>,
    pub speed: Option<f64>,
    pub eta: Option<u64>,
    pub filename: Option<String>,
}

impl ProgressUpdate {
    pub fn downloading(downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        Self {
            phase: ProgressPhase::Downloading,
            downloaded_bytes,
            total_bytes,
            total_bytes_estimate: None,
            speed: None,
            eta: None,
            filename: None,
        }
    }

    pub fn finished(filename: Option<String>) -> Self {
        Self {
            phase: ProgressPhase::Finished,
            downloaded_bytes: 0,
            total_bytes: None,
            total_bytes_estimate: None,
            speed: None,
            eta: None,
            filename,
        }
    }

    pub fn total(&self) -> Option<u64> {
        self.total_bytes
            .filter(|t| *t > 0)
            .or(self.total_bytes_estimate.filter(|t| *t > 0))
    }

    /// `floor(downloaded / total * 100)`, or 0 while the total is unknown.
    pub fn percent(&self) -> u8 {
        if self.phase == ProgressPhase::Finished {
            return 100;
        }
        match self.total() {
            Some(total) => {
                let pct = self.downloaded_bytes.saturating_mul(100) / total;
                pct.min(100) as u8
            }
            None => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutput {
    pub file_path: PathBuf,
    pub file_size_bytes: Option<u64>,
}

/// The external extraction+download tool. Implementations must call
/// `hook.report` for every progress sample and abort when it returns an error.
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    fn name(&self) -> &str;
    async fn download(
        &self,
        opts: &TransferOptions,
        hook: &ProgressHook,
    ) -> anyhow::Result<TransferOutput>;
}

#[async_trait]
pub trait MediaExtractor: Send + Sync {
    async fn extract_info(&self, url: &str) -> anyhow::Result<MediaInfo>;
    async fn extract_flat(&self, url: &str) -> anyhow::Result<PlaylistInfo>;
}

#[async_trait]
pub trait MetadataTagger: Send + Sync {
    async fn tag_title(&self, file: &Path, title: &str) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_floors_known_total() {
        let u = ProgressUpdate::downloading(999, Some(1000));
        assert_eq!(u.percent(), 99);
    }

    #[test]
    fn percent_uses_estimate_when_total_missing() {
        let mut u = ProgressUpdate::downloading(50, None);
        u.total_bytes_estimate = Some(200);
        assert_eq!(u.percent(), 25);
    }

    #[test]
    fn percent_is_zero_without_total() {
        assert_eq!(ProgressUpdate::downloading(50, None).percent(), 0);
        assert_eq!(ProgressUpdate::downloading(50, Some(0)).percent(), 0);
    }

    #[test]
    fn finished_is_complete() {
        assert_eq!(ProgressUpdate::finished(None).percent(), 100);
    }

    #[test]
    fn overshoot_is_clamped() {
        assert_eq!(ProgressUpdate::downloading(300, Some(100)).percent(), 100);
    }
}
