//! Backup manifests.
//!
//! A manifest is written beside every completed backup tree. It records
//! provenance (host, platform, mode) and a catalog of every regular file
//! with its size and mtime, which later incremental runs diff against.

use crate::backup::BackupMode;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::warn;
use walkdir::WalkDir;

pub const MANIFEST_VERSION: &str = "2.0";
pub const MANIFEST_FILE_NAME: &str = "backup_manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub source_platform: String,
    pub source_hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub backup_mode: BackupMode,
    /// Name of the copied tree directory inside the backup destination
    #[serde(default = "default_data_dir_name")]
    pub data_dir_name: String,
    pub total_size: u64,
    pub file_count: u64,
    /// Relative path (forward slashes on every platform) to size and mtime
    pub files: HashMap<String, FileEntry>,
    #[serde(default)]
    pub checksums: HashMap<String, String>,
}

impl BackupManifest {
    /// Walk `root` and build a manifest cataloging every regular file.
    ///
    /// The manifest file itself is skipped so `file_count` stays equal to
    /// the number of backed-up files even when re-running into the same
    /// destination.
    pub fn generate(
        root: &Path,
        backup_mode: BackupMode,
        source_platform: &str,
        source_hostname: &str,
    ) -> Result<Self> {
        let mut files = HashMap::new();
        let mut total_size = 0u64;

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("manifest walk skipped an entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = relative_key(entry.path(), root);
            if relative == MANIFEST_FILE_NAME {
                continue;
            }
            let metadata = entry.metadata().map_err(std::io::Error::from)?;
            let size = metadata.len();
            total_size += size;
            files.insert(
                relative,
                FileEntry {
                    size,
                    mtime: unix_mtime(&metadata),
                },
            );
        }

        Ok(BackupManifest {
            version: MANIFEST_VERSION.to_string(),
            created_at: Utc::now(),
            source_platform: source_platform.to_string(),
            source_hostname: source_hostname.to_string(),
            machine_identifier: None,
            server_name: None,
            backup_mode,
            data_dir_name: root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(default_data_dir_name),
            total_size,
            file_count: files.len() as u64,
            files,
            checksums: HashMap::new(),
        })
    }

    /// Persist into `dir` as `backup_manifest.json`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE_NAME);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Load the manifest stored in `dir`, if one exists and parses.
    ///
    /// An unreadable or corrupt manifest degrades to `None`: the caller
    /// falls back to a full copy instead of failing the run.
    pub fn load(dir: &Path) -> Option<Self> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!(path = %path.display(), "ignoring unreadable manifest: {e}");
                None
            }
        }
    }

    /// Whether a source file is unchanged relative to this manifest.
    pub fn is_unchanged(&self, relative: &str, size: u64, mtime: i64) -> bool {
        self.files
            .get(relative)
            .map(|entry| entry.size == size && entry.mtime == mtime)
            .unwrap_or(false)
    }
}

fn default_data_dir_name() -> String {
    "data".to_string()
}

/// Relative path below `root`, normalized to forward slashes so manifests
/// written on one platform diff correctly on another.
pub fn relative_key(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

/// File mtime as whole seconds since the epoch.
pub fn unix_mtime(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
