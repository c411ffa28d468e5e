use std::path::Path;

use anyhow::Context;
use mediafetch_core::models::settings::AppSettings;

/// Reads the settings file. A missing or unreadable file yields defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return AppSettings::default(),
        Err(e) => {
            tracing::warn!("cannot read settings {}: {}", path.display(), e);
            return AppSettings::default();
        }
    };

    match serde_json::from_str::<AppSettings>(&content) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("ignoring corrupt settings {}: {}", path.display(), e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("cannot write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("cannot replace {}", path.display()))?;
    Ok(())
}

/// Loads the file, applies `edit` and writes the result back.
pub fn update_settings(
    path: &Path,
    edit: impl FnOnce(&mut AppSettings),
) -> anyhow::Result<AppSettings> {
    let mut settings = load_settings(path);
    edit(&mut settings);
    save_settings(path, &settings)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let s = load_settings(&dir.path().join("settings.json"));
        assert_eq!(s.advanced.max_concurrent_downloads, 3);
        assert_eq!(s.download.video_quality, "720p");
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ \"advanced\": ").unwrap();
        assert_eq!(load_settings(&path).advanced.max_retries, 3);
    }

    #[test]
    fn saved_settings_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut s = AppSettings::default();
        s.advanced.max_concurrent_downloads = 7;
        s.advanced.pause_timeout_secs = Some(90);
        s.download.extra_ytdlp_flags = vec!["--no-mtime".into()];
        save_settings(&path, &s).unwrap();

        let back = load_settings(&path);
        assert_eq!(back.advanced.max_concurrent_downloads, 7);
        assert_eq!(back.advanced.pause_timeout_secs, Some(90));
        assert_eq!(back.download.extra_ytdlp_flags, ["--no-mtime"]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn update_keeps_unrelated_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"advanced": {"max_retries": 5}}"#).unwrap();

        let s = update_settings(&path, |s| s.advanced.max_concurrent_downloads = 6).unwrap();
        assert_eq!(s.advanced.max_concurrent_downloads, 6);

        let back = load_settings(&path);
        assert_eq!(back.advanced.max_concurrent_downloads, 6);
        assert_eq!(back.advanced.max_retries, 5);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"advanced": {"max_retries": 9}}"#).unwrap();
        let s = load_settings(&path);
        assert_eq!(s.advanced.max_retries, 9);
        assert_eq!(s.advanced.retry_backoff_ms, 2000);
        assert!(s.download.embed_metadata);
    }
}
