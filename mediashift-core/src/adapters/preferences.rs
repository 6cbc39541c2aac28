//! Preference store adapter for servers keeping preferences as a flat JSON
//! object.
//!
//! Backups carry two artifacts: the raw file (restored verbatim) and a
//! normalized export with volatile keys dropped, kept for inspection and
//! diffing across machines.

use crate::adapters::PreferencesAdapter;
use crate::error::{Result, ToolkitError};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info};

/// Keys that must never travel to another machine.
const VOLATILE_KEYS: &[&str] = &[
    "MachineIdentifier",
    "ProcessedMachineIdentifier",
    "AnonymousMachineIdentifier",
    "CertificateUUID",
    "OnlineToken",
    "LastAutomaticMappedPort",
];

/// Name of the normalized export written beside the raw copy.
pub const NORMALIZED_EXPORT: &str = "preferences.json";

pub struct JsonPreferencesStore;

impl JsonPreferencesStore {
    fn load(path: &Path) -> Result<Map<String, Value>> {
        let content = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&content)?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ToolkitError::Configuration(format!(
                "'{}' is not a JSON object",
                path.display()
            ))),
        }
    }

    fn store(path: &Path, map: &Map<String, Value>) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&Value::Object(map.clone()))?)?;
        Ok(())
    }

    fn get_string(path: &Path, key: &str) -> Option<String> {
        let map = Self::load(path).ok()?;
        map.get(key).and_then(Value::as_str).map(str::to_string)
    }
}

/// 40 hex characters derived from fresh randomness and the local hostname.
pub fn new_machine_identifier() -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    if let Ok(host) = hostname::get() {
        hasher.update(host.to_string_lossy().as_bytes());
    }
    hasher.finalize().to_hex()[..40].to_string()
}

impl PreferencesAdapter for JsonPreferencesStore {
    fn backup(&self, prefs: &Path, dir: &Path) -> Result<()> {
        if !prefs.is_file() {
            return Err(ToolkitError::SourceNotFound(prefs.to_path_buf()));
        }
        std::fs::create_dir_all(dir)?;

        let file_name = prefs
            .file_name()
            .ok_or_else(|| ToolkitError::SourceNotFound(prefs.to_path_buf()))?;
        std::fs::copy(prefs, dir.join(file_name))?;

        let mut map = Self::load(prefs)?;
        for key in VOLATILE_KEYS {
            map.remove(*key);
        }
        Self::store(&dir.join(NORMALIZED_EXPORT), &map)?;
        debug!(dir = %dir.display(), "preference snapshot written");
        Ok(())
    }

    fn restore(&self, dir: &Path, prefs: &Path) -> Result<()> {
        let file_name = prefs
            .file_name()
            .ok_or_else(|| ToolkitError::SourceNotFound(prefs.to_path_buf()))?;
        let stored = dir.join(file_name);
        if !stored.is_file() {
            return Err(ToolkitError::SourceNotFound(stored));
        }
        if let Some(parent) = prefs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&stored, prefs)?;
        Ok(())
    }

    fn regenerate_identity(&self, prefs: &Path) -> Result<String> {
        let mut map = if prefs.is_file() {
            Self::load(prefs)?
        } else {
            Map::new()
        };
        let id = new_machine_identifier();
        map.insert("MachineIdentifier".to_string(), Value::String(id.clone()));
        map.insert(
            "ProcessedMachineIdentifier".to_string(),
            Value::String(id.clone()),
        );
        Self::store(prefs, &map)?;
        info!(prefs = %prefs.display(), "machine identity regenerated");
        Ok(id)
    }

    fn machine_identifier(&self, prefs: &Path) -> Option<String> {
        Self::get_string(prefs, "MachineIdentifier")
    }

    fn server_name(&self, prefs: &Path) -> Option<String> {
        Self::get_string(prefs, "FriendlyName")
    }
}
