//! Collaborator seams consumed by the engine.
//!
//! The core drives backups and migrations through these traits; the shipped
//! implementations cover the common deployment and tests substitute fakes.

pub mod archive;
pub mod database;
pub mod preferences;

pub use archive::{ArchiveFormat, SystemArchiver};
pub use database::SqliteLibraryAdapter;
pub use preferences::JsonPreferencesStore;

use crate::error::Result;
use std::collections::BTreeMap;
use std::path::Path;

/// Rewrites media paths stored inside the application's library database.
pub trait DatabaseAdapter: Send + Sync {
    /// Apply `old prefix -> new prefix` mappings to every path-bearing
    /// column. The database is copied aside before the first write and that
    /// copy is restored automatically when any write fails. Returns the
    /// number of rows changed.
    fn remap_paths(&self, db: &Path, mappings: &BTreeMap<String, String>) -> Result<u64>;

    /// Run the database's built-in consistency check and return its verdict
    /// ("ok" when healthy).
    fn integrity_check(&self, db: &Path) -> Result<String>;

    /// Dump a library summary (sections, locations, statistics) for
    /// provenance exports.
    fn export_summary(&self, db: &Path) -> Result<serde_json::Value>;
}

/// Reads and rewrites the application's preference store.
pub trait PreferencesAdapter: Send + Sync {
    /// Snapshot the preference file into `dir`: the raw file plus a
    /// normalized export with volatile keys dropped.
    fn backup(&self, prefs: &Path, dir: &Path) -> Result<()>;

    /// Put a snapshot taken by `backup` back in place.
    fn restore(&self, dir: &Path, prefs: &Path) -> Result<()>;

    /// Write a fresh machine identifier into the store, returning it.
    fn regenerate_identity(&self, prefs: &Path) -> Result<String>;

    fn machine_identifier(&self, prefs: &Path) -> Option<String>;

    fn server_name(&self, prefs: &Path) -> Option<String>;
}

/// Packs and unpacks backup archives.
pub trait CompressionAdapter: Send + Sync {
    fn detect_format(&self, path: &Path) -> ArchiveFormat;

    /// Pack the contents of `source_dir` into `archive`.
    fn compress(&self, source_dir: &Path, archive: &Path, format: ArchiveFormat) -> Result<()>;

    /// Unpack `archive` into `dest_dir`.
    fn decompress(&self, archive: &Path, dest_dir: &Path) -> Result<()>;
}
