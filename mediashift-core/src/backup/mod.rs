//! Backup engine.
//!
//! One engine instance runs at most one backup at a time on a dedicated
//! worker. `start` returns immediately; callers poll [`BackupEngine::is_running`],
//! read [`BackupEngine::progress`] or subscribe to snapshot broadcasts.

pub mod copier;
pub mod manifest;
mod runner;

pub use manifest::{BackupManifest, FileEntry, MANIFEST_FILE_NAME};

use crate::adapters::{ArchiveFormat, CompressionAdapter, DatabaseAdapter, PreferencesAdapter};
use crate::context::ToolkitContext;
use crate::error::{Result, ToolkitError};
use crate::layout::PathResolver;
use crate::progress::{read_lock, write_lock, ProgressBus};
use crate::service::ServiceController;
use runner::BackupRunner;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    /// Copy the live tree, skipping caches, logs and scratch data.
    Hot,
    /// Stop the service for the whole copy; restart guaranteed.
    Cold,
    /// Hot copy first, then a brief stop to re-copy the critical files.
    Smart,
    /// Copy only what changed since the manifest in the destination.
    Incremental,
    /// Databases, their sidecars and the preferences file, under a stop.
    DatabaseOnly,
}

impl std::str::FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(BackupMode::Hot),
            "cold" => Ok(BackupMode::Cold),
            "smart" => Ok(BackupMode::Smart),
            "incremental" => Ok(BackupMode::Incremental),
            "database_only" | "database-only" | "db" => Ok(BackupMode::DatabaseOnly),
            other => Err(format!("unknown backup mode '{other}'")),
        }
    }
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BackupMode::Hot => "hot",
            BackupMode::Cold => "cold",
            BackupMode::Smart => "smart",
            BackupMode::Incremental => "incremental",
            BackupMode::DatabaseOnly => "database_only",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Idle,
    Preparing,
    StoppingService,
    Copying,
    Verifying,
    Compressing,
    StartingService,
    Completed,
    Failed,
    Cancelled,
}

impl BackupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackupStatus::Completed | BackupStatus::Failed | BackupStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupProgress {
    pub status: BackupStatus,
    pub message: String,
    pub current_file: String,
    pub files_done: u64,
    pub files_total: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl BackupProgress {
    fn new() -> Self {
        BackupProgress {
            status: BackupStatus::Idle,
            message: String::new(),
            current_file: String::new(),
            files_done: 0,
            files_total: 0,
            bytes_done: 0,
            bytes_total: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Byte-based completion in the 0..=100 range.
    pub fn percent(&self) -> f64 {
        if self.bytes_total > 0 {
            (self.bytes_done as f64 / self.bytes_total as f64 * 100.0).min(100.0)
        } else if self.status == BackupStatus::Completed {
            100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub destination: PathBuf,
    pub mode: BackupMode,
    pub compress: bool,
    pub format: ArchiveFormat,
    pub verify: bool,
}

impl BackupOptions {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        BackupOptions {
            destination: destination.into(),
            mode: BackupMode::Smart,
            compress: false,
            format: ArchiveFormat::TarGz,
            verify: true,
        }
    }
}

pub struct BackupEngine {
    ctx: Arc<ToolkitContext>,
    resolver: Arc<dyn PathResolver>,
    service: Arc<dyn ServiceController>,
    database: Arc<dyn DatabaseAdapter>,
    preferences: Arc<dyn PreferencesAdapter>,
    archiver: Arc<dyn CompressionAdapter>,
    progress: Arc<RwLock<BackupProgress>>,
    bus: ProgressBus<BackupProgress>,
    running: Arc<AtomicBool>,
    cancel: RwLock<CancellationToken>,
}

impl BackupEngine {
    pub fn new(
        ctx: Arc<ToolkitContext>,
        resolver: Arc<dyn PathResolver>,
        service: Arc<dyn ServiceController>,
        database: Arc<dyn DatabaseAdapter>,
        preferences: Arc<dyn PreferencesAdapter>,
        archiver: Arc<dyn CompressionAdapter>,
    ) -> Self {
        BackupEngine {
            ctx,
            resolver,
            service,
            database,
            preferences,
            archiver,
            progress: Arc::new(RwLock::new(BackupProgress::new())),
            bus: ProgressBus::new(),
            running: Arc::new(AtomicBool::new(false)),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Launch a backup on a dedicated worker. Returns `false`, with no side
    /// effects, when a run is already in flight. Must be called within a
    /// Tokio runtime.
    pub fn start(&self, options: BackupOptions) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("backup already running, start ignored");
            return false;
        }

        let cancel = CancellationToken::new();
        *write_lock(&self.cancel) = cancel.clone();

        let runner = BackupRunner::new(
            self.ctx.clone(),
            self.resolver.clone(),
            self.service.clone(),
            self.database.clone(),
            self.preferences.clone(),
            self.archiver.clone(),
            options,
            cancel,
            self.progress.clone(),
            self.bus.clone(),
        );

        let running = self.running.clone();
        let progress = self.progress.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::task::spawn_blocking(move || runner.run()).await {
                error!("backup worker aborted: {e}");
                let mut snapshot = read_lock(&progress).clone();
                snapshot.status = BackupStatus::Failed;
                snapshot.message = format!("worker aborted: {e}");
                snapshot.errors.push(snapshot.message.clone());
                *write_lock(&progress) = snapshot.clone();
                bus.publish(snapshot);
            }
            running.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Request cooperative cancellation of the current run.
    pub fn cancel(&self) {
        read_lock(&self.cancel).cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Latest progress snapshot.
    pub fn progress(&self) -> BackupProgress {
        read_lock(&self.progress).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupProgress> {
        self.bus.subscribe()
    }

    /// Size in bytes of what a backup would copy, exclusions applied.
    pub fn estimate_size(&self) -> Result<u64> {
        let layout = self
            .resolver
            .locate()
            .ok_or_else(|| ToolkitError::Configuration("data directory not located".to_string()))?;
        if !layout.exists() {
            return Err(ToolkitError::SourceNotFound(layout.data_dir));
        }
        let cancel = CancellationToken::new();
        let copier = copier::TreeCopier::new(
            &cancel,
            &self.ctx.config.backup.exclude_patterns,
            false,
        );
        let (_files, bytes) = copier.scan(&layout.data_dir);
        Ok(bytes)
    }
}
