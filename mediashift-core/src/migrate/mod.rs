//! Migration coordinator.
//!
//! Five end-to-end flows compose the backup engine, the restore mechanics,
//! peer discovery and the transfer protocol: LOCAL_BACKUP, LOCAL_RESTORE,
//! NETWORK_PUSH, NETWORK_PULL and FULL_MIGRATION. One coordinator runs at
//! most one flow at a time; `start` validates and returns immediately,
//! progress arrives as weighted-percent snapshots, and the immutable result
//! of the last run stays readable afterwards.

mod phases;
mod worker;

pub use phases::{MigrationPhase, PhaseTiming};

use crate::adapters::{CompressionAdapter, DatabaseAdapter, PreferencesAdapter};
use crate::backup::BackupMode;
use crate::context::ToolkitContext;
use crate::error::Result;
use crate::layout::PathResolver;
use crate::net::DiscoveryService;
use crate::progress::{read_lock, write_lock, ProgressBus};
use crate::service::ServiceController;
use chrono::{DateTime, Utc};
use phases::PhaseTracker;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use worker::MigrationWorker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationMode {
    /// Back up the local data directory with provenance extras.
    LocalBackup,
    /// Install a backup (directory or archive) into the local data directory.
    LocalRestore,
    /// Back up locally, then stream the backup to a remote toolkit instance.
    NetworkPush,
    /// Wait for a remote instance to stream its backup to us.
    NetworkPull,
    /// Push plus a remote restore on the receiving side.
    FullMigration,
}

impl std::str::FromStr for MigrationMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "local_backup" | "backup" => Ok(MigrationMode::LocalBackup),
            "local_restore" | "restore" => Ok(MigrationMode::LocalRestore),
            "network_push" | "push" => Ok(MigrationMode::NetworkPush),
            "network_pull" | "pull" => Ok(MigrationMode::NetworkPull),
            "full_migration" | "full" => Ok(MigrationMode::FullMigration),
            other => Err(format!("unknown migration mode '{other}'")),
        }
    }
}

impl std::fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MigrationMode::LocalBackup => "LOCAL_BACKUP",
            MigrationMode::LocalRestore => "LOCAL_RESTORE",
            MigrationMode::NetworkPush => "NETWORK_PUSH",
            MigrationMode::NetworkPull => "NETWORK_PULL",
            MigrationMode::FullMigration => "FULL_MIGRATION",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationState::Completed | MigrationState::Failed | MigrationState::Cancelled
        )
    }
}

/// Everything one migration run needs to know. Defaults follow the common
/// case: SMART backup, service stops allowed, verification on, fresh
/// identity on restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub mode: MigrationMode,

    /// Backup to restore from (LOCAL_RESTORE).
    #[serde(default)]
    pub source_path: Option<PathBuf>,

    /// Where the backup lands (LOCAL_BACKUP, NETWORK_PULL).
    #[serde(default)]
    pub dest_path: Option<PathBuf>,

    /// Expected remote sender; set it to skip discovery (NETWORK_PULL).
    #[serde(default)]
    pub source_host: Option<String>,

    /// Remote toolkit instance to push to (NETWORK_PUSH, FULL_MIGRATION).
    #[serde(default)]
    pub target_host: Option<String>,

    #[serde(default = "default_target_port")]
    pub target_port: u16,

    #[serde(default = "default_backup_mode")]
    pub backup_mode: BackupMode,

    /// Allow stopping the managed service. When refused, SMART backups
    /// demote to HOT and restore-side stop/start phases are skipped.
    #[serde(default = "default_true")]
    pub stop_service: bool,

    #[serde(default = "default_true")]
    pub verify: bool,

    /// Keep the backed-up machine identity instead of regenerating it on
    /// restore.
    #[serde(default)]
    pub preserve_identity: bool,

    /// Media path prefix rewrites applied to the restored library database.
    #[serde(default)]
    pub path_mappings: BTreeMap<String, String>,
}

impl MigrationConfig {
    pub fn new(mode: MigrationMode) -> Self {
        MigrationConfig {
            mode,
            source_path: None,
            dest_path: None,
            source_host: None,
            target_host: None,
            target_port: default_target_port(),
            backup_mode: default_backup_mode(),
            stop_service: true,
            verify: true,
            preserve_identity: false,
            path_mappings: BTreeMap::new(),
        }
    }

    /// The backup mode actually run, after the stop-service policy is
    /// applied.
    pub fn effective_backup_mode(&self) -> BackupMode {
        if !self.stop_service && self.backup_mode == BackupMode::Smart {
            BackupMode::Hot
        } else {
            self.backup_mode
        }
    }
}

fn default_target_port() -> u16 {
    52400
}

fn default_backup_mode() -> BackupMode {
    BackupMode::Smart
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationProgress {
    pub state: MigrationState,
    pub phase: Option<MigrationPhase>,
    /// Completion of the current phase, 0 to 100.
    pub phase_percent: f64,
    /// Weighted completion of the whole run; reaches 100 only on success.
    pub overall_percent: f64,
    pub message: String,
    pub files_done: u64,
    pub files_total: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl MigrationProgress {
    fn new() -> Self {
        MigrationProgress {
            state: MigrationState::Idle,
            phase: None,
            phase_percent: 0.0,
            overall_percent: 0.0,
            message: String::new(),
            files_done: 0,
            files_total: 0,
            bytes_done: 0,
            bytes_total: 0,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn begin(mode: MigrationMode) -> Self {
        MigrationProgress {
            state: MigrationState::Running,
            message: format!("{mode} started"),
            ..MigrationProgress::new()
        }
    }
}

/// Immutable record of one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub mode: MigrationMode,
    pub success: bool,
    pub state: MigrationState,
    pub phase_reached: Option<MigrationPhase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub files_moved: u64,
    pub bytes_moved: u64,
    pub source: Option<String>,
    pub target: Option<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub phase_timings: Vec<PhaseTiming>,
}

impl MigrationResult {
    /// JSON rendering for automation callers.
    pub fn report(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct MigrationCoordinator {
    ctx: Arc<ToolkitContext>,
    resolver: Arc<dyn PathResolver>,
    service: Arc<dyn ServiceController>,
    database: Arc<dyn DatabaseAdapter>,
    preferences: Arc<dyn PreferencesAdapter>,
    archiver: Arc<dyn CompressionAdapter>,
    discovery: Option<Arc<DiscoveryService>>,
    progress: Arc<RwLock<MigrationProgress>>,
    result: Arc<RwLock<Option<MigrationResult>>>,
    bus: ProgressBus<MigrationProgress>,
    running: Arc<AtomicBool>,
    cancel: RwLock<CancellationToken>,
}

impl MigrationCoordinator {
    pub fn new(
        ctx: Arc<ToolkitContext>,
        resolver: Arc<dyn PathResolver>,
        service: Arc<dyn ServiceController>,
        database: Arc<dyn DatabaseAdapter>,
        preferences: Arc<dyn PreferencesAdapter>,
        archiver: Arc<dyn CompressionAdapter>,
    ) -> Self {
        MigrationCoordinator {
            ctx,
            resolver,
            service,
            database,
            preferences,
            archiver,
            discovery: None,
            progress: Arc::new(RwLock::new(MigrationProgress::new())),
            result: Arc::new(RwLock::new(None)),
            bus: ProgressBus::new(),
            running: Arc::new(AtomicBool::new(false)),
            cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Attach a discovery registry so NETWORK_PULL can find its partner.
    pub fn with_discovery(mut self, discovery: Arc<DiscoveryService>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Check a configuration without side effects. An empty list means the
    /// run can start.
    pub fn validate(&self, config: &MigrationConfig) -> Vec<String> {
        let mut errors = Vec::new();
        match config.mode {
            MigrationMode::LocalBackup => {
                if config.dest_path.is_none() {
                    errors.push("LOCAL_BACKUP needs a destination path".to_string());
                }
            }
            MigrationMode::LocalRestore => match &config.source_path {
                None => errors.push("LOCAL_RESTORE needs a source path".to_string()),
                Some(path) if !path.exists() => {
                    errors.push(format!("source '{}' does not exist", path.display()));
                }
                Some(_) => {}
            },
            MigrationMode::NetworkPush => {
                if config.target_host.is_none() {
                    errors.push("NETWORK_PUSH needs a target host".to_string());
                }
            }
            MigrationMode::NetworkPull => {
                if config.dest_path.is_none() {
                    errors.push("NETWORK_PULL needs a destination path".to_string());
                }
                if config.source_host.is_none() && self.discovery.is_none() {
                    errors.push(
                        "NETWORK_PULL needs a source host or an attached discovery service"
                            .to_string(),
                    );
                }
            }
            MigrationMode::FullMigration => {
                if config.target_host.is_none() {
                    errors.push("FULL_MIGRATION needs a target host".to_string());
                }
            }
        }

        let backs_up = matches!(
            config.mode,
            MigrationMode::LocalBackup | MigrationMode::NetworkPush | MigrationMode::FullMigration
        );
        if backs_up
            && !config.stop_service
            && matches!(
                config.backup_mode,
                BackupMode::Cold | BackupMode::DatabaseOnly
            )
        {
            errors.push(format!(
                "backup mode '{}' requires stopping the service",
                config.backup_mode
            ));
        }
        errors
    }

    /// Launch a migration. Returns `false`, with no side effects, when the
    /// configuration is invalid or a run is already in flight. Must be
    /// called within a Tokio runtime.
    pub fn start(&self, config: MigrationConfig) -> bool {
        let problems = self.validate(&config);
        if !problems.is_empty() {
            warn!(mode = %config.mode, "invalid migration config: {}", problems.join("; "));
            return false;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("migration already running, start ignored");
            return false;
        }

        let cancel = CancellationToken::new();
        *write_lock(&self.cancel) = cancel.clone();

        let snapshot = MigrationProgress::begin(config.mode);
        *write_lock(&self.progress) = snapshot.clone();
        self.bus.publish(snapshot);

        let tracker = PhaseTracker::new(config.mode);
        let worker = MigrationWorker::new(
            self.ctx.clone(),
            self.resolver.clone(),
            self.service.clone(),
            self.database.clone(),
            self.preferences.clone(),
            self.archiver.clone(),
            self.discovery.clone(),
            config,
            cancel,
            tracker,
            self.progress.clone(),
            self.result.clone(),
            self.bus.clone(),
        );

        let running = self.running.clone();
        let progress = self.progress.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(worker.run()).await {
                error!("migration worker aborted: {e}");
                let mut snapshot = read_lock(&progress).clone();
                snapshot.state = MigrationState::Failed;
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
    pub fn progress(&self) -> MigrationProgress {
        read_lock(&self.progress).clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MigrationProgress> {
        self.bus.subscribe()
    }

    /// Result of the most recently finished run.
    pub fn last_result(&self) -> Option<MigrationResult> {
        read_lock(&self.result).clone()
    }
}
