use std::path::PathBuf;

pub trait AppPaths: Send + Sync {
    fn downloads_dir(&self) -> PathBuf;
    fn data_dir(&self) -> PathBuf;

    fn database_path(&self) -> PathBuf {
        self.data_dir().join("downloads.db")
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir().join("settings.json")
    }
}

#[cfg(feature = "desktop")]
pub struct DesktopPaths;

#[cfg(feature = "desktop")]
impl AppPaths for DesktopPaths {
    fn downloads_dir(&self) -> PathBuf {
        dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
    }

    fn data_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("MEDIAFETCH_DATA_DIR") {
            return PathBuf::from(dir);
        }
        dirs::data_dir()
            .map(|d| d.join("mediafetch"))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Paths rooted at a fixed directory.
pub struct FixedPaths(pub PathBuf);

impl AppPaths for FixedPaths {
    fn downloads_dir(&self) -> PathBuf {
        self.0.join("downloads")
    }

    fn data_dir(&self) -> PathBuf {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_paths_derive_files_from_root() {
        let p = FixedPaths(PathBuf::from("/srv/mf"));
        assert_eq!(p.database_path(), PathBuf::from("/srv/mf/downloads.db"));
        assert_eq!(p.settings_path(), PathBuf::from("/srv/mf/settings.json"));
        assert_eq!(p.downloads_dir(), PathBuf::from("/srv/mf/downloads"));
    }
}
