use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const MAX_ERROR_CHARS: usize = 500;
const ID_LEN: usize = 12;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Preparing,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadStatus {
    pub const TERMINAL: [DownloadStatus; 3] = [
        DownloadStatus::Completed,
        DownloadStatus::Failed,
        DownloadStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Preparing => "preparing",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// Transition table for the record lifecycle.
    ///
    /// `Downloading -> Preparing` is the automatic retry reset, `Failed -> Pending`
    /// the explicit user retry, and `* -> Pending` from a live state is startup
    /// reconciliation or a resume without a live worker.
    pub fn can_transition_to(self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        match (self, next) {
            (Pending, Preparing | Cancelled | Failed) => true,
            (Preparing, Downloading | Failed | Cancelled | Pending) => true,
            (Downloading, Paused | Completed | Failed | Cancelled | Pending | Preparing) => true,
            (Paused, Downloading | Completed | Failed | Cancelled | Pending) => true,
            (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "pending" => DownloadStatus::Pending,
            "preparing" => DownloadStatus::Preparing,
            "downloading" => DownloadStatus::Downloading,
            "paused" => DownloadStatus::Paused,
            "completed" => DownloadStatus::Completed,
            "failed" => DownloadStatus::Failed,
            "cancelled" | "canceled" => DownloadStatus::Cancelled,
            other => return Err(format!("unknown download status '{}'", other)),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    Video,
    Audio,
    Playlist,
}

impl FormatType {
    pub fn as_str(self) -> &'static str {
        match self {
            FormatType::Video => "video",
            FormatType::Audio => "audio",
            FormatType::Playlist => "playlist",
        }
    }
}

impl fmt::Display for FormatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "video" => FormatType::Video,
            "audio" => FormatType::Audio,
            "playlist" => FormatType::Playlist,
            other => return Err(format!("unknown format type '{}'", other)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadRecord {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
    #[serde(default)]
    pub file_size_bytes: Option<u64>,
    pub format_type: FormatType,
    pub quality: String,
    pub codec: String,
    pub bitrate: u32,
    pub output_path: PathBuf,
    #[serde(default)]
    pub resolved_filename: Option<String>,
    pub status: DownloadStatus,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub speed_bytes_per_sec: f64,
    #[serde(default)]
    pub eta_seconds: Option<u64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl DownloadRecord {
    pub fn new(
        id: String,
        url: String,
        format_type: FormatType,
        quality: String,
        output_path: PathBuf,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            url,
            title: String::new(),
            thumbnail_url: None,
            duration_seconds: None,
            file_size_bytes: None,
            format_type,
            quality,
            codec: "mp4".into(),
            bitrate: 320,
            output_path,
            resolved_filename: None,
            status: DownloadStatus::Pending,
            progress_percent: 0,
            speed_bytes_per_sec: 0.0,
            eta_seconds: None,
            created_at,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Accepts a progress sample. The percentage only moves forward;
    /// `reset_progress` is the only way back to 0.
    pub fn apply_progress(&mut self, percent: u8, speed: f64, eta: Option<u64>) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
        self.speed_bytes_per_sec = speed.max(0.0);
        self.eta_seconds = eta;
    }

    /// Clears live transfer fields before another attempt.
    pub fn reset_progress(&mut self) {
        self.progress_percent = 0;
        self.speed_bytes_per_sec = 0.0;
        self.eta_seconds = None;
    }

    pub fn set_error(&mut self, message: &str) {
        self.error_message = Some(truncate_error(message, MAX_ERROR_CHARS));
    }
}

/// First 12 hex chars of SHA-256 over the URL, creation instant and a nonce.
/// Callers bump the nonce until the id is unused.
pub fn generate_id(url: &str, created_at: DateTime<Utc>, nonce: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(
        created_at
            .timestamp_nanos_opt()
            .unwrap_or_else(|| created_at.timestamp_micros())
            .to_le_bytes(),
    );
    hasher.update(nonce.to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..ID_LEN].to_string()
}

/// Leading digit run of a quality descriptor: "720p" -> 720, "320kbps" -> 320.
pub fn quality_number(quality: &str) -> Option<u32> {
    let digits: String = quality
        .trim()
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u32>().ok().filter(|n| *n > 0)
}

pub fn truncate_error(message: &str, max_chars: usize) -> String {
    let message = message.trim();
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let mut out: String = message.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DownloadRecord {
        DownloadRecord::new(
            "abc".into(),
            "https://example.com/v".into(),
            FormatType::Video,
            "720p".into(),
            PathBuf::from("/tmp"),
            Utc::now(),
        )
    }

    #[test]
    fn terminal_states_only_allow_failed_retry() {
        for from in DownloadStatus::TERMINAL {
            for to in [
                DownloadStatus::Pending,
                DownloadStatus::Preparing,
                DownloadStatus::Downloading,
                DownloadStatus::Paused,
                DownloadStatus::Completed,
                DownloadStatus::Failed,
                DownloadStatus::Cancelled,
            ] {
                let allowed = from == DownloadStatus::Failed && to == DownloadStatus::Pending;
                assert_eq!(from.can_transition_to(to), allowed, "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn pause_cycle_is_allowed() {
        assert!(DownloadStatus::Downloading.can_transition_to(DownloadStatus::Paused));
        assert!(DownloadStatus::Paused.can_transition_to(DownloadStatus::Downloading));
        assert!(!DownloadStatus::Pending.can_transition_to(DownloadStatus::Paused));
    }

    #[test]
    fn status_parses_both_spellings() {
        assert_eq!("canceled".parse::<DownloadStatus>(), Ok(DownloadStatus::Cancelled));
        assert_eq!("Downloading".parse::<DownloadStatus>(), Ok(DownloadStatus::Downloading));
        assert!("gone".parse::<DownloadStatus>().is_err());
    }

    #[test]
    fn ids_differ_by_nonce_and_time() {
        let now = Utc::now();
        let a = generate_id("https://example.com/v", now, 0);
        let b = generate_id("https://example.com/v", now, 1);
        let c = generate_id("https://example.com/v", now + chrono::Duration::nanoseconds(1), 0);
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, generate_id("https://example.com/v", now, 0));
    }

    #[test]
    fn quality_number_takes_leading_run() {
        assert_eq!(quality_number("720p"), Some(720));
        assert_eq!(quality_number("1080p60"), Some(1080));
        assert_eq!(quality_number("320kbps"), Some(320));
        assert_eq!(quality_number("best"), None);
        assert_eq!(quality_number(""), None);
    }

    #[test]
    fn progress_is_monotonic_while_downloading() {
        let mut r = record();
        r.status = DownloadStatus::Downloading;
        r.apply_progress(40, 10.0, Some(5));
        r.apply_progress(12, 10.0, Some(5));
        assert_eq!(r.progress_percent, 40);
        r.apply_progress(250, 10.0, None);
        assert_eq!(r.progress_percent, 100);
        r.reset_progress();
        assert_eq!(r.progress_percent, 0);
    }

    #[test]
    fn error_text_is_bounded() {
        let mut r = record();
        r.set_error(&"x".repeat(2000));
        let msg = r.error_message.unwrap();
        assert_eq!(msg.chars().count(), MAX_ERROR_CHARS + 1);
        assert!(msg.ends_with('…'));
    }

    #[test]
    fn record_json_defaults_missing_fields() {
        let json = r#"{
            "id": "0123456789ab",
            "url": "https://example.com/a",
            "format_type": "audio",
            "quality": "320kbps",
            "codec": "mp3",
            "bitrate": 320,
            "output_path": "/music",
            "status": "completed",
            "created_at": "2024-01-02T03:04:05Z"
        }"#;
        let r: DownloadRecord = serde_json::from_str(json).unwrap();
        assert_eq!(r.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(r.progress_percent, 0);
        assert_eq!(r.format_type, FormatType::Audio);
    }
}
