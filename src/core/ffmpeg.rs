use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;

use crate::core::process;
use crate::platforms::traits::MetadataTagger;

pub async fn is_ffmpeg_available() -> bool {
    process::is_available("ffmpeg", "-version").await
}

/// Extensions whose container carries a title tag ffmpeg can write in place.
fn supports_tags(ext: &str) -> bool {
    matches!(
        ext,
        "mp3" | "m4a" | "mp4" | "m4b" | "mov" | "flac" | "ogg" | "opus"
    )
}

fn temp_path(file: &Path, ext: &str) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    file.with_file_name(format!(".{}.tagging.{}", stem, ext))
}

/// ffmpeg arguments that copy every stream of `input` into `output` with the
/// title tag replaced.
pub fn tag_args(input: &Path, output: &Path, ext: &str, title: &str) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-i".to_string(),
        input.to_string_lossy().to_string(),
        "-map".to_string(),
        "0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-metadata".to_string(),
        format!("title={}", title),
    ];
    if ext == "mp3" {
        args.push("-id3v2_version".to_string());
        args.push("3".to_string());
    }
    args.push(output.to_string_lossy().to_string());
    args
}

pub struct FfmpegTagger;

impl FfmpegTagger {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FfmpegTagger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataTagger for FfmpegTagger {
    async fn tag_title(&self, file: &Path, title: &str) -> anyhow::Result<()> {
        let ext = file
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .ok_or_else(|| anyhow!("{} has no extension", file.display()))?;
        if !supports_tags(&ext) {
            bail!("no tag container for .{} files", ext);
        }

        let tmp = temp_path(file, &ext);
        let output = process::command("ffmpeg")
            .args(tag_args(file, &tmp, &ext, title))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to run ffmpeg")?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&tmp).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("ffmpeg exited with {}: {}", output.status, stderr.trim());
        }

        tokio::fs::rename(&tmp, file)
            .await
            .with_context(|| format!("cannot replace {}", file.display()))?;
        tracing::debug!("tagged {} with title '{}'", file.display(), title);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mp3_gets_id3v2_3() {
        let args = tag_args(Path::new("/m/a.mp3"), Path::new("/m/.a.tagging.mp3"), "mp3", "Song");
        assert!(args.windows(2).any(|w| w[0] == "-id3v2_version" && w[1] == "3"));
        assert!(args.contains(&"title=Song".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/m/.a.tagging.mp3"));
    }

    #[test]
    fn m4a_has_no_id3_flag() {
        let args = tag_args(Path::new("a.m4a"), Path::new("b.m4a"), "m4a", "T");
        assert!(!args.contains(&"-id3v2_version".to_string()));
    }

    #[test]
    fn temp_file_stays_in_same_dir() {
        assert_eq!(
            temp_path(Path::new("/music/My Song.mp3"), "mp3"),
            PathBuf::from("/music/.My Song.tagging.mp3")
        );
    }

    #[tokio::test]
    async fn unsupported_extension_is_an_error() {
        let err = FfmpegTagger::new()
            .tag_title(Path::new("/tmp/file.wav"), "x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains(".wav"));
    }
}
