use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub advanced: AdvancedSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    #[serde(default = "default_output_dir")]
    pub default_output_dir: PathBuf,
    #[serde(default = "default_video_quality")]
    pub video_quality: String,
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: u32,
    #[serde(default = "default_true")]
    pub embed_metadata: bool,
    #[serde(default)]
    pub extra_ytdlp_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedSettings {
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Paused transfers are cancelled after this long. `None` waits forever.
    #[serde(default)]
    pub pause_timeout_secs: Option<u64>,
    #[serde(default = "default_socket_timeout_secs")]
    pub socket_timeout_secs: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_history_export_limit")]
    pub history_export_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxySettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_proxy_type")]
    pub proxy_type: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ProxySettings {
    pub fn url(&self) -> Option<String> {
        if !self.enabled || self.host.is_empty() {
            return None;
        }
        let scheme = match self.proxy_type.as_str() {
            "socks5" => "socks5",
            "https" => "https",
            _ => "http",
        };
        if !self.username.is_empty() {
            Some(format!(
                "{}://{}:{}@{}:{}",
                scheme, self.username, self.password, self.host, self.port
            ))
        } else {
            Some(format!("{}://{}:{}", scheme, self.host, self.port))
        }
    }
}

fn default_schema_version() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_video_quality() -> String {
    "720p".into()
}

fn default_audio_codec() -> String {
    "mp3".into()
}

fn default_audio_bitrate() -> u32 {
    320
}

fn default_max_concurrent_downloads() -> u32 {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    2000
}

fn default_cancel_grace_ms() -> u64 {
    5000
}

fn default_shutdown_grace_ms() -> u64 {
    3000
}

fn default_socket_timeout_secs() -> u64 {
    60
}

fn default_progress_interval_ms() -> u64 {
    150
}

fn default_history_export_limit() -> u32 {
    1000
}

fn default_proxy_type() -> String {
    "http".into()
}

fn default_proxy_port() -> u16 {
    8080
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            default_output_dir: default_output_dir(),
            video_quality: default_video_quality(),
            audio_codec: default_audio_codec(),
            audio_bitrate: default_audio_bitrate(),
            embed_metadata: true,
            extra_ytdlp_flags: Vec::new(),
        }
    }
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            pause_timeout_secs: None,
            socket_timeout_secs: default_socket_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            history_export_limit: default_history_export_limit(),
        }
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            download: DownloadSettings::default(),
            advanced: AdvancedSettings::default(),
            proxy: ProxySettings::default(),
        }
    }
}
