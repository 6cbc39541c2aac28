//! Mediashift Core
//!
//! Backup, restore and migration engine for media-server data directories:
//! a backup engine with hot/cold/smart/incremental modes, a multi-phase
//! migration coordinator, LAN peer discovery and a length-prefixed transfer
//! protocol.

pub mod adapters;
pub mod backup;
pub mod config;
pub mod context;
pub mod error;
pub mod layout;
pub mod migrate;
pub mod net;
pub mod progress;
pub mod service;

// Re-export commonly used types
pub use backup::{BackupEngine, BackupMode, BackupOptions, BackupProgress, BackupStatus};
pub use config::ToolkitConfig;
pub use context::ToolkitContext;
pub use error::{Result, ToolkitError};
pub use layout::{ConfigPathResolver, DataLayout, FixedPathResolver, PathResolver};
pub use migrate::{
    MigrationConfig, MigrationCoordinator, MigrationMode, MigrationProgress, MigrationResult,
    MigrationState,
};
pub use net::{DiscoveryService, PeerRole};
pub use service::CommandServiceController;
