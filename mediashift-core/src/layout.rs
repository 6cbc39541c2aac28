//! Data-directory layout of the managed application.
//!
//! `DataLayout` bundles every path the engine touches. Where the layout
//! comes from is the caller's business: the engine only consumes the
//! `PathResolver` seam.

use crate::config::LayoutConfig;
use std::path::{Path, PathBuf};

/// Directory holding the application's databases, relative to the data root.
pub const DATABASES_DIR: &str = "Databases";
/// Metadata cache directory, relative to the data root.
pub const METADATA_DIR: &str = "Metadata";
/// Transient cache directory, relative to the data root.
pub const CACHE_DIR: &str = "Cache";
/// Log directory, relative to the data root.
pub const LOGS_DIR: &str = "Logs";

#[derive(Debug, Clone)]
pub struct DataLayout {
    pub data_dir: PathBuf,
    pub databases_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub preferences_file: PathBuf,
    pub library_db: PathBuf,
    pub blobs_db: PathBuf,
    /// File names of the databases and preferences, relative to the data root
    critical_relative: Vec<PathBuf>,
}

impl DataLayout {
    pub fn from_root(root: &Path, config: &LayoutConfig) -> Self {
        let databases_dir = root.join(DATABASES_DIR);
        let preferences_file = root.join(&config.preferences_file);
        let library_db = databases_dir.join(&config.library_db);
        let blobs_db = databases_dir.join(&config.blobs_db);
        let critical_relative = vec![
            PathBuf::from(&config.preferences_file),
            PathBuf::from(DATABASES_DIR).join(&config.library_db),
            PathBuf::from(DATABASES_DIR).join(&config.blobs_db),
        ];
        DataLayout {
            data_dir: root.to_path_buf(),
            databases_dir,
            metadata_dir: root.join(METADATA_DIR),
            cache_dir: root.join(CACHE_DIR),
            logs_dir: root.join(LOGS_DIR),
            preferences_file,
            library_db,
            blobs_db,
            critical_relative,
        }
    }

    /// Paths whose presence a restore cannot do without, relative to the
    /// data root.
    pub fn critical_files(&self) -> &[PathBuf] {
        &self.critical_relative
    }

    /// The library database plus the sidecar files SQLite may leave beside
    /// it, and the preferences file. Input to DATABASE_ONLY backups.
    pub fn database_file_set(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for db in [&self.library_db, &self.blobs_db] {
            files.push(db.clone());
            for suffix in ["-wal", "-shm"] {
                let mut name = db.as_os_str().to_os_string();
                name.push(suffix);
                files.push(PathBuf::from(name));
            }
        }
        files.push(self.preferences_file.clone());
        files
    }

    pub fn exists(&self) -> bool {
        self.data_dir.is_dir()
    }
}

/// Locates the managed application's data directory.
pub trait PathResolver: Send + Sync {
    fn locate(&self) -> Option<DataLayout>;
}

/// Resolver backed by the `[layout]` configuration section. Yields a layout
/// only when a data directory is configured and present on disk.
pub struct ConfigPathResolver {
    config: LayoutConfig,
}

impl ConfigPathResolver {
    pub fn new(config: LayoutConfig) -> Self {
        ConfigPathResolver { config }
    }
}

impl PathResolver for ConfigPathResolver {
    fn locate(&self) -> Option<DataLayout> {
        let root = self.config.data_dir.as_deref()?;
        if !root.is_dir() {
            return None;
        }
        Some(DataLayout::from_root(root, &self.config))
    }
}

/// Resolver pinned to one directory, existence not required. Used by callers
/// that already know the root (restores into a fresh target, tests).
pub struct FixedPathResolver {
    root: PathBuf,
    config: LayoutConfig,
}

impl FixedPathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FixedPathResolver {
            root: root.into(),
            config: LayoutConfig::default(),
        }
    }

    pub fn with_config(root: impl Into<PathBuf>, config: LayoutConfig) -> Self {
        FixedPathResolver {
            root: root.into(),
            config,
        }
    }
}

impl PathResolver for FixedPathResolver {
    fn locate(&self) -> Option<DataLayout> {
        Some(DataLayout::from_root(&self.root, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = DataLayout::from_root(Path::new("/srv/media"), &LayoutConfig::default());
        assert_eq!(layout.databases_dir, Path::new("/srv/media/Databases"));
        assert_eq!(
            layout.library_db,
            Path::new("/srv/media/Databases/library.db")
        );
        assert_eq!(
            layout.preferences_file,
            Path::new("/srv/media/Preferences.json")
        );
    }

    #[test]
    fn test_critical_files_are_relative() {
        let layout = DataLayout::from_root(Path::new("/srv/media"), &LayoutConfig::default());
        let critical = layout.critical_files();
        assert_eq!(critical.len(), 3);
        assert!(critical.iter().all(|p| p.is_relative()));
        assert!(critical.contains(&PathBuf::from("Databases/library.db")));
    }

    #[test]
    fn test_database_file_set_includes_sidecars() {
        let layout = DataLayout::from_root(Path::new("/srv/media"), &LayoutConfig::default());
        let set = layout.database_file_set();
        assert!(set.contains(&PathBuf::from("/srv/media/Databases/library.db-wal")));
        assert!(set.contains(&PathBuf::from("/srv/media/Databases/library.db-shm")));
        assert!(set.contains(&PathBuf::from("/srv/media/Preferences.json")));
    }

    #[test]
    fn test_config_resolver_requires_existing_dir() {
        let config = LayoutConfig {
            data_dir: Some(PathBuf::from("/definitely/not/here")),
            ..LayoutConfig::default()
        };
        assert!(ConfigPathResolver::new(config).locate().is_none());

        let tmp = tempfile::tempdir().unwrap();
        let config = LayoutConfig {
            data_dir: Some(tmp.path().to_path_buf()),
            ..LayoutConfig::default()
        };
        assert!(ConfigPathResolver::new(config).locate().is_some());
    }
}
