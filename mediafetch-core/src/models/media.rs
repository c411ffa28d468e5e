use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormatOption {
    pub quality_label: String,
    pub format_id: String,
    pub kind: FormatKind,
}

/// Normalized metadata for a single media URL, fetched without downloading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub title: String,
    pub uploader: String,
    pub platform: String,
    pub duration_seconds: Option<u64>,
    pub thumbnail_url: Option<String>,
    pub available_formats: Vec<FormatOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistEntry {
    pub url: String,
    pub title: String,
    pub duration_seconds: Option<u64>,
}

/// Flat playlist listing: entry URLs and titles only, no per-entry probing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaylistInfo {
    pub title: String,
    pub entries: Vec<PlaylistEntry>,
}
