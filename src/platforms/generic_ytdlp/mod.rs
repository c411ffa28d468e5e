use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::anyhow;
use async_trait::async_trait;
use mediafetch_core::models::media::{FormatKind, FormatOption, MediaInfo, PlaylistInfo};
use tokio::sync::OnceCell;

use crate::core::url_parser;
use crate::core::worker::ProgressHook;
use crate::core::ytdlp;
use crate::platforms::traits::{DownloadEngine, MediaExtractor, TransferOptions, TransferOutput};

/// yt-dlp backed engine and extractor for any http(s) URL.
pub struct GenericYtdlpDownloader {
    socket_timeout_secs: u64,
    proxy: Option<String>,
    binary: OnceCell<PathBuf>,
}

impl GenericYtdlpDownloader {
    pub fn new(socket_timeout_secs: u64, proxy: Option<String>) -> Self {
        Self {
            socket_timeout_secs,
            proxy,
            binary: OnceCell::new(),
        }
    }

    async fn ytdlp(&self) -> anyhow::Result<&PathBuf> {
        self.binary
            .get_or_try_init(|| async {
                ytdlp::require_ytdlp()
                    .await
                    .map_err(|e| anyhow!("yt-dlp unavailable: {}", e))
            })
            .await
    }

    fn detect_platform(json: &serde_json::Value, url: &str) -> String {
        json.get("extractor_key")
            .or_else(|| json.get("extractor"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| url_parser::detect_platform(url).to_string())
    }

    pub fn parse_video_info(json: &serde_json::Value, url: &str) -> MediaInfo {
        let title = json
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let uploader = json
            .get("uploader")
            .or_else(|| json.get("channel"))
            .or_else(|| json.get("uploader_id"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        let duration_seconds = json
            .get("duration")
            .and_then(|v| v.as_f64())
            .filter(|d| *d >= 0.0)
            .map(|d| d as u64);

        let thumbnail_url = json
            .get("thumbnail")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let mut available_formats = Vec::new();
        let mut seen_heights: HashSet<u64> = HashSet::new();
        let mut best_audio: Option<(f64, String)> = None;

        if let Some(formats) = json.get("formats").and_then(|v| v.as_array()) {
            for f in formats {
                let Some(format_id) = f.get("format_id").and_then(|v| v.as_str()) else {
                    continue;
                };
                let vcodec = f.get("vcodec").and_then(|v| v.as_str()).unwrap_or("none");
                let acodec = f.get("acodec").and_then(|v| v.as_str()).unwrap_or("none");
                let height = f.get("height").and_then(|v| v.as_u64()).unwrap_or(0);

                if vcodec != "none" && height > 0 {
                    if seen_heights.insert(height) {
                        available_formats.push(FormatOption {
                            quality_label: format!("{}p", height),
                            format_id: format_id.to_string(),
                            kind: FormatKind::Video,
                        });
                    }
                } else if vcodec == "none" && acodec != "none" {
                    let abr = f.get("abr").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    if best_audio.as_ref().is_none_or(|(b, _)| abr > *b) {
                        best_audio = Some((abr, format_id.to_string()));
                    }
                }
            }
        }

        available_formats.sort_by(|a, b| {
            let h = |o: &FormatOption| {
                o.quality_label
                    .trim_end_matches('p')
                    .parse::<u64>()
                    .unwrap_or(0)
            };
            h(b).cmp(&h(a))
        });

        if let Some((abr, format_id)) = best_audio {
            let quality_label = if abr > 0.0 {
                format!("{}kbps", abr.round() as u64)
            } else {
                "audio".to_string()
            };
            available_formats.push(FormatOption {
                quality_label,
                format_id,
                kind: FormatKind::Audio,
            });
        }

        MediaInfo {
            title,
            uploader,
            platform: Self::detect_platform(json, url),
            duration_seconds,
            thumbnail_url,
            available_formats,
        }
    }
}

#[async_trait]
impl DownloadEngine for GenericYtdlpDownloader {
    fn name(&self) -> &str {
        "yt-dlp"
    }

    async fn download(
        &self,
        opts: &TransferOptions,
        hook: &ProgressHook,
    ) -> anyhow::Result<TransferOutput> {
        let ytdlp_path = self.ytdlp().await?;
        ytdlp::download(ytdlp_path, opts, hook).await
    }
}

#[async_trait]
impl MediaExtractor for GenericYtdlpDownloader {
    async fn extract_info(&self, url: &str) -> anyhow::Result<MediaInfo> {
        let ytdlp_path = self.ytdlp().await?;
        let json =
            ytdlp::get_video_info(ytdlp_path, url, self.socket_timeout_secs, self.proxy.as_deref())
                .await?;
        Ok(Self::parse_video_info(&json, url))
    }

    async fn extract_flat(&self, url: &str) -> anyhow::Result<PlaylistInfo> {
        let ytdlp_path = self.ytdlp().await?;
        ytdlp::get_playlist_info(ytdlp_path, url, self.socket_timeout_secs, self.proxy.as_deref())
            .await
    }
}
