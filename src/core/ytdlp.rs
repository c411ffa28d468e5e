use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, Context};
use mediafetch_core::models::media::{PlaylistEntry, PlaylistInfo};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::core::process;
use crate::core::worker::{Cancelled, ProgressHook};
use crate::platforms::traits::{ProgressPhase, ProgressUpdate, TransferOptions, TransferOutput};

const PROGRESS_MARKER: &str = "MFPROG ";
const PATH_MARKER: &str = "MFPATH ";
const PROGRESS_TEMPLATE: &str = "download:MFPROG %(progress.status)s|%(progress.downloaded_bytes)s|%(progress.total_bytes)s|%(progress.total_bytes_estimate)s|%(progress.speed)s|%(progress.eta)s|%(progress.filename)s";
const FINAL_PATH_TEMPLATE: &str = "after_move:MFPATH %(filepath)s";
const STDERR_TAIL_LINES: usize = 20;

fn bin_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    }
}

fn managed_ytdlp_path() -> Option<PathBuf> {
    let data = dirs::data_dir()?;
    Some(data.join("mediafetch").join("bin").join(bin_name()))
}

pub async fn find_ytdlp() -> Option<PathBuf> {
    if process::is_available(bin_name(), "--version").await {
        return Some(PathBuf::from(bin_name()));
    }

    let managed = managed_ytdlp_path()?;
    if managed.exists() {
        return Some(managed);
    }

    None
}

pub async fn require_ytdlp() -> anyhow::Result<PathBuf> {
    find_ytdlp()
        .await
        .ok_or_else(|| anyhow!("yt-dlp not found on PATH or in the managed bin directory"))
}

fn network_args(socket_timeout_secs: u64, proxy: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--socket-timeout".to_string(),
        socket_timeout_secs.to_string(),
    ];
    if let Some(proxy) = proxy {
        args.push("--proxy".to_string());
        args.push(proxy.to_string());
    }
    args
}

pub async fn get_video_info(
    ytdlp: &Path,
    url: &str,
    socket_timeout_secs: u64,
    proxy: Option<&str>,
) -> anyhow::Result<serde_json::Value> {
    let output = process::command(ytdlp)
        .args(["--dump-json", "--no-warnings", "--no-playlist"])
        .args(network_args(socket_timeout_secs, proxy))
        .arg("--")
        .arg(url)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to run yt-dlp")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("yt-dlp failed: {}", stderr.trim()));
    }

    serde_json::from_slice(&output.stdout).context("yt-dlp returned invalid JSON")
}

pub async fn get_playlist_info(
    ytdlp: &Path,
    url: &str,
    socket_timeout_secs: u64,
    proxy: Option<&str>,
) -> anyhow::Result<PlaylistInfo> {
    let output = process::command(ytdlp)
        .args(["--flat-playlist", "--dump-json", "--no-warnings"])
        .args(network_args(socket_timeout_secs, proxy))
        .arg("--")
        .arg(url)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to run yt-dlp")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("yt-dlp playlist lookup failed: {}", stderr.trim()));
    }

    Ok(parse_flat_playlist(&String::from_utf8_lossy(&output.stdout)))
}

/// One JSON object per line, as printed by `--flat-playlist --dump-json`.
pub fn parse_flat_playlist(stdout: &str) -> PlaylistInfo {
    let mut title = String::new();
    let mut entries = Vec::new();

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(json) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };

        if title.is_empty() {
            if let Some(t) = json
                .get("playlist_title")
                .or_else(|| json.get("playlist"))
                .and_then(|v| v.as_str())
            {
                title = t.to_string();
            }
        }

        let url = json
            .get("webpage_url")
            .or_else(|| json.get("url"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if url.is_empty() {
            continue;
        }

        entries.push(PlaylistEntry {
            url,
            title: json
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            duration_seconds: json
                .get("duration")
                .and_then(|v| v.as_f64())
                .filter(|d| *d >= 0.0)
                .map(|d| d as u64),
        });
    }

    PlaylistInfo { title, entries }
}

pub fn build_args(opts: &TransferOptions) -> Vec<String> {
    let mut args = vec!["-f".to_string(), opts.format_selector.clone()];

    if let Some(audio) = &opts.audio {
        args.extend([
            "-x".to_string(),
            "--audio-format".to_string(),
            audio.codec.clone(),
            "--audio-quality".to_string(),
            format!("{}K", audio.bitrate_kbps),
        ]);
    }

    args.push(if opts.allow_playlist {
        "--yes-playlist".to_string()
    } else {
        "--no-playlist".to_string()
    });

    args.extend([
        "--newline".to_string(),
        "--progress".to_string(),
        "--progress-template".to_string(),
        PROGRESS_TEMPLATE.to_string(),
        "--print".to_string(),
        FINAL_PATH_TEMPLATE.to_string(),
    ]);
    args.extend(network_args(opts.socket_timeout_secs, opts.proxy.as_deref()));
    args.extend(opts.extra_args.iter().cloned());

    args.extend([
        "-o".to_string(),
        opts.output_dir
            .join(&opts.output_template)
            .to_string_lossy()
            .to_string(),
        "--".to_string(),
        opts.url.clone(),
    ]);
    args
}

fn parse_number(field: &str) -> Option<f64> {
    match field.trim() {
        "" | "NA" | "None" | "null" => None,
        s => s.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0),
    }
}

/// Parses a line produced by the progress template. Other output is ignored.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.trim().strip_prefix(PROGRESS_MARKER)?;
    let mut fields = rest.splitn(7, '|');

    let phase = match fields.next()?.trim() {
        "downloading" => ProgressPhase::Downloading,
        "finished" => ProgressPhase::Finished,
        _ => return None,
    };
    let downloaded_bytes = fields.next().and_then(parse_number).unwrap_or(0.0) as u64;
    let total_bytes = fields.next().and_then(parse_number).map(|v| v as u64);
    let total_bytes_estimate = fields.next().and_then(parse_number).map(|v| v as u64);
    let speed = fields.next().and_then(parse_number);
    let eta = fields.next().and_then(parse_number).map(|v| v as u64);
    let filename = fields
        .next()
        .map(str::trim)
        .filter(|f| !f.is_empty() && *f != "NA")
        .map(str::to_string);

    Some(ProgressUpdate {
        phase,
        downloaded_bytes,
        total_bytes,
        total_bytes_estimate,
        speed,
        eta,
        filename,
    })
}

pub fn parse_final_path(line: &str) -> Option<PathBuf> {
    let path = line.trim().strip_prefix(PATH_MARKER)?.trim();
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// Runs one transfer. Every progress line goes through `hook`; the child is
/// killed as soon as the hook reports cancellation. While the hook blocks on a
/// pause, stdout is not drained and yt-dlp stalls on the full pipe.
pub async fn download(
    ytdlp: &Path,
    opts: &TransferOptions,
    hook: &ProgressHook,
) -> anyhow::Result<TransferOutput> {
    hook.checkpoint().await?;

    let mut child = process::command(ytdlp)
        .args(build_args(opts))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to start yt-dlp")?;

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("yt-dlp stdout unavailable"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("yt-dlp stderr unavailable"))?;

    let stderr_reader = tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("yt-dlp: {}", line);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut final_path: Option<PathBuf> = None;
    let mut last_finished: Option<String> = None;

    while let Some(line) = lines.next_line().await? {
        if let Some(update) = parse_progress_line(&line) {
            if update.phase == ProgressPhase::Finished {
                last_finished = update.filename.clone();
            }
            if hook.report(update).await.is_err() {
                let _ = child.kill().await;
                stderr_reader.abort();
                return Err(Cancelled.into());
            }
        } else if let Some(path) = parse_final_path(&line) {
            final_path = Some(path);
        }
    }

    let status = child.wait().await.context("yt-dlp process failed")?;
    let tail = stderr_reader.await.unwrap_or_default();

    if hook.is_cancelled() {
        return Err(Cancelled.into());
    }

    if !status.success() {
        return Err(anyhow!("{}", error_summary(&tail, &status.to_string())));
    }

    if opts.allow_playlist {
        let size = dir_size(&opts.output_dir).await;
        return Ok(TransferOutput {
            file_path: opts.output_dir.clone(),
            file_size_bytes: Some(size),
        });
    }

    let file_path = match final_path.or_else(|| last_finished.map(PathBuf::from)) {
        Some(p) if tokio::fs::try_exists(&p).await.unwrap_or(false) => p,
        _ => find_downloaded_file(&opts.output_dir).await?,
    };
    let file_size_bytes = tokio::fs::metadata(&file_path).await.ok().map(|m| m.len());

    Ok(TransferOutput {
        file_path,
        file_size_bytes,
    })
}

/// Prefers yt-dlp's own `ERROR:` lines over the raw exit status.
fn error_summary(stderr_tail: &VecDeque<String>, status: &str) -> String {
    let errors: Vec<&str> = stderr_tail
        .iter()
        .map(|l| l.trim())
        .filter(|l| l.starts_with("ERROR:"))
        .collect();
    if !errors.is_empty() {
        return errors.join("; ");
    }
    match stderr_tail.back() {
        Some(last) if !last.trim().is_empty() => {
            format!("yt-dlp exited with {}: {}", status, last.trim())
        }
        _ => format!("yt-dlp exited with {}", status),
    }
}

fn is_partial(name: &str) -> bool {
    name.ends_with(".part") || name.ends_with(".ytdl") || name.starts_with('.')
}

async fn find_downloaded_file(output_dir: &Path) -> anyhow::Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(output_dir).await?;
    let mut best: Option<(PathBuf, std::time::SystemTime)> = None;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if !path.is_file() || is_partial(name) {
            continue;
        }
        let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
            continue;
        };
        if best.as_ref().is_none_or(|(_, t)| modified > *t) {
            best = Some((path, modified));
        }
    }

    best.map(|(p, _)| p)
        .ok_or_else(|| anyhow!("downloaded file not found in {}", output_dir.display()))
}

async fn dir_size(dir: &Path) -> u64 {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };
    let mut total = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await {
            if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::traits::AudioExtraction;

    fn opts() -> TransferOptions {
        TransferOptions {
            url: "https://example.com/v".into(),
            output_dir: PathBuf::from("/out"),
            output_template: "Clip.%(ext)s".into(),
            format_selector: "best[ext=mp4]/best".into(),
            audio: None,
            allow_playlist: false,
            socket_timeout_secs: 60,
            proxy: None,
            extra_args: vec![],
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn video_args_end_with_url() {
        let args = build_args(&opts());
        assert_eq!(value_after(&args, "-f"), Some("best[ext=mp4]/best"));
        assert_eq!(value_after(&args, "--socket-timeout"), Some("60"));
        assert!(args.contains(&"--no-playlist".to_string()));
        assert!(!args.contains(&"-x".to_string()));
        assert_eq!(args[args.len() - 2], "--");
        assert_eq!(args.last().map(String::as_str), Some("https://example.com/v"));
    }

    #[test]
    fn audio_args_request_extraction() {
        let mut o = opts();
        o.audio = Some(AudioExtraction {
            codec: "mp3".into(),
            bitrate_kbps: 192,
        });
        o.proxy = Some("socks5://127.0.0.1:1080".into());
        let args = build_args(&o);
        assert!(args.contains(&"-x".to_string()));
        assert_eq!(value_after(&args, "--audio-format"), Some("mp3"));
        assert_eq!(value_after(&args, "--audio-quality"), Some("192K"));
        assert_eq!(value_after(&args, "--proxy"), Some("socks5://127.0.0.1:1080"));
    }

    #[test]
    fn output_joins_template() {
        let args = build_args(&opts());
        let out = value_after(&args, "-o").unwrap();
        assert_eq!(PathBuf::from(out), PathBuf::from("/out").join("Clip.%(ext)s"));
    }

    #[test]
    fn parses_downloading_line() {
        let u = parse_progress_line("MFPROG downloading|5242880|10485760|NA|1048576.5|5|/out/Clip.mp4")
            .unwrap();
        assert_eq!(u.phase, ProgressPhase::Downloading);
        assert_eq!(u.percent(), 50);
        assert_eq!(u.speed, Some(1048576.5));
        assert_eq!(u.eta, Some(5));
        assert_eq!(u.filename.as_deref(), Some("/out/Clip.mp4"));
    }

    #[test]
    fn parses_estimate_and_missing_fields() {
        let u = parse_progress_line("MFPROG downloading|100|NA|400.0|NA|NA|NA").unwrap();
        assert_eq!(u.total_bytes, None);
        assert_eq!(u.percent(), 25);
        assert_eq!(u.speed, None);
        assert_eq!(u.filename, None);
    }

    #[test]
    fn parses_finished_line() {
        let u = parse_progress_line("MFPROG finished|10|10|NA|NA|NA|/out/a b|c.mp4").unwrap();
        assert_eq!(u.phase, ProgressPhase::Finished);
        assert_eq!(u.filename.as_deref(), Some("/out/a b|c.mp4"));
    }

    #[test]
    fn ignores_other_output() {
        assert!(parse_progress_line("[youtube] abc: Downloading webpage").is_none());
        assert!(parse_progress_line("MFPROG error|1|2|3|4|5|x").is_none());
        assert_eq!(
            parse_final_path("MFPATH /out/Clip.mp4"),
            Some(PathBuf::from("/out/Clip.mp4"))
        );
        assert_eq!(parse_final_path("MFPATH "), None);
    }

    #[test]
    fn flat_playlist_keeps_entries_with_urls() {
        let stdout = r#"
{"playlist_title": "Mix", "url": "https://example.com/1", "title": "One", "duration": 61.5}
{"playlist_title": "Mix", "title": "No url"}
not json
{"playlist": "Mix", "url": "https://example.com/2", "title": "Two"}
"#;
        let info = parse_flat_playlist(stdout);
        assert_eq!(info.title, "Mix");
        assert_eq!(info.entries.len(), 2);
        assert_eq!(info.entries[0].duration_seconds, Some(61));
        assert_eq!(info.entries[1].duration_seconds, None);
    }

    #[test]
    fn error_summary_prefers_error_lines() {
        let tail: VecDeque<String> = vec![
            "WARNING: something".to_string(),
            "ERROR: [generic] Unsupported URL".to_string(),
        ]
        .into();
        assert_eq!(error_summary(&tail, "exit status: 1"), "ERROR: [generic] Unsupported URL");

        let tail: VecDeque<String> = VecDeque::new();
        assert_eq!(error_summary(&tail, "exit status: 2"), "yt-dlp exited with exit status: 2");
    }

    #[tokio::test]
    async fn finds_newest_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4.part"), b"x").unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"data").unwrap();
        let found = find_downloaded_file(dir.path()).await.unwrap();
        assert_eq!(found.file_name().unwrap(), "clip.mp4");
        assert_eq!(dir_size(dir.path()).await, 5);
    }
}
