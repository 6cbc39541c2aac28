//! Configuration for the engine.
//!
//! Loaded from a TOML file; every field has a compiled default so an empty
//! file (or no file at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolkitConfig {
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Root of the managed application's data directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Preferences file name, relative to the data root
    #[serde(default = "default_preferences_file")]
    pub preferences_file: String,

    /// Primary library database, relative to the databases directory
    #[serde(default = "default_library_db")]
    pub library_db: String,

    /// Blobs database, relative to the databases directory
    #[serde(default = "default_blobs_db")]
    pub blobs_db: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory and file-name patterns skipped by hot copies
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,

    /// Seconds to wait after stopping the service before copying
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Use the platform bulk-mirror tool when present
    #[serde(default = "default_true")]
    pub use_mirror_tool: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP port this instance listens on for incoming transfers
    #[serde(default = "default_toolkit_port")]
    pub toolkit_port: u16,

    /// UDP port for peer announcements
    #[serde(default = "default_announce_port")]
    pub announce_port: u16,

    /// TCP port the managed application serves on (subnet probe target)
    #[serde(default = "default_app_port")]
    pub app_port: u16,

    /// UDP port for the managed application's native discovery protocol
    #[serde(default = "default_app_discovery_port")]
    pub app_discovery_port: u16,

    /// Seconds between discovery ticks
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,

    /// Seconds a peer survives without being re-seen
    #[serde(default = "default_peer_ttl_secs")]
    pub peer_ttl_secs: u64,

    /// Address stride for the /24 subnet probe
    #[serde(default = "default_probe_stride")]
    pub probe_stride: u8,

    /// Milliseconds allowed for one probe connect
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Seconds to wait for a partner during a network pull
    #[serde(default = "default_partner_timeout_secs")]
    pub partner_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Command that exits 0 while the service is running
    #[serde(default = "default_status_command")]
    pub status_command: Vec<String>,

    /// Command that starts the service
    #[serde(default = "default_start_command")]
    pub start_command: Vec<String>,

    /// Command that stops the service
    #[serde(default = "default_stop_command")]
    pub stop_command: Vec<String>,
}

fn default_preferences_file() -> String {
    "Preferences.json".to_string()
}

fn default_library_db() -> String {
    "library.db".to_string()
}

fn default_blobs_db() -> String {
    "library.blobs.db".to_string()
}

fn default_exclude_patterns() -> Vec<String> {
    [
        "Cache",
        "Crash Reports",
        "Diagnostics",
        "Logs",
        "Updates",
        "Transcode",
        ".tmp",
        ".log",
        ".pid",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_stop_grace_secs() -> u64 {
    3
}

fn default_true() -> bool {
    true
}

fn default_toolkit_port() -> u16 {
    52400
}

fn default_announce_port() -> u16 {
    52401
}

fn default_app_port() -> u16 {
    32400
}

fn default_app_discovery_port() -> u16 {
    32414
}

fn default_discovery_interval_secs() -> u64 {
    5
}

fn default_peer_ttl_secs() -> u64 {
    60
}

fn default_probe_stride() -> u8 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    500
}

fn default_partner_timeout_secs() -> u64 {
    60
}

fn default_status_command() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "is-active".to_string(),
        "--quiet".to_string(),
        "mediaserver".to_string(),
    ]
}

fn default_start_command() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "start".to_string(),
        "mediaserver".to_string(),
    ]
}

fn default_stop_command() -> Vec<String> {
    vec![
        "systemctl".to_string(),
        "stop".to_string(),
        "mediaserver".to_string(),
    ]
}

impl Default for LayoutConfig {
    fn default() -> Self {
        LayoutConfig {
            data_dir: None,
            preferences_file: default_preferences_file(),
            library_db: default_library_db(),
            blobs_db: default_blobs_db(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            exclude_patterns: default_exclude_patterns(),
            stop_grace_secs: default_stop_grace_secs(),
            use_mirror_tool: default_true(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            toolkit_port: default_toolkit_port(),
            announce_port: default_announce_port(),
            app_port: default_app_port(),
            app_discovery_port: default_app_discovery_port(),
            discovery_interval_secs: default_discovery_interval_secs(),
            peer_ttl_secs: default_peer_ttl_secs(),
            probe_stride: default_probe_stride(),
            probe_timeout_ms: default_probe_timeout_ms(),
            partner_timeout_secs: default_partner_timeout_secs(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            status_command: default_status_command(),
            start_command: default_start_command(),
            stop_command: default_stop_command(),
        }
    }
}

impl ToolkitConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ToolkitConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: ToolkitConfig = toml::from_str("").unwrap();
        assert_eq!(config.network.toolkit_port, 52400);
        assert_eq!(config.network.announce_port, 52401);
        assert_eq!(config.network.discovery_interval_secs, 5);
        assert_eq!(config.network.peer_ttl_secs, 60);
        assert_eq!(config.backup.stop_grace_secs, 3);
        assert!(config.backup.exclude_patterns.contains(&"Cache".to_string()));
        assert!(config.layout.data_dir.is_none());
    }

    #[test]
    fn test_partial_override() {
        let toml = r#"
            [network]
            toolkit_port = 62400

            [layout]
            data_dir = "/srv/media"
        "#;
        let config: ToolkitConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.network.toolkit_port, 62400);
        assert_eq!(config.network.announce_port, 52401);
        assert_eq!(
            config.layout.data_dir,
            Some(PathBuf::from("/srv/media"))
        );
        assert_eq!(config.layout.library_db, "library.db");
    }
}
