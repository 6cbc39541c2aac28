//! The migration worker.
//!
//! One `MigrationWorker` owns a run from start to terminal state: it drives
//! the phase sequence for its mode, delegates to the backup engine and the
//! transfer protocol, and folds their progress into the weighted overall
//! percentage. Cleanup that must happen (service restart, scratch removal)
//! runs on every exit path, including failure and cancellation.

use crate::adapters::{ArchiveFormat, CompressionAdapter, DatabaseAdapter, PreferencesAdapter};
use crate::backup::copier::copy_file_with_metadata;
use crate::backup::manifest::relative_key;
use crate::backup::{
    BackupEngine, BackupManifest, BackupOptions, BackupProgress, BackupStatus, MANIFEST_FILE_NAME,
};
use crate::context::ToolkitContext;
use crate::error::{Result, ToolkitError};
use crate::layout::{DataLayout, PathResolver};
use crate::migrate::phases::{MigrationPhase, PhaseTracker};
use crate::migrate::{
    MigrationConfig, MigrationMode, MigrationProgress, MigrationResult, MigrationState,
};
use crate::net::transfer::{read_frame, receive_file, send_file, write_frame, Frame};
use crate::net::DiscoveryService;
use crate::progress::{read_lock, write_lock, ProgressBus};
use crate::service::ServiceController;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Outer bound on establishing the push connection, retries included.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between connect attempts while the receiver opens its listener.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Name of the library summary exported beside a backup tree.
const LIBRARY_INFO_FILE: &str = "library_info.json";

/// Directory inside the backup destination holding the preference snapshot.
const PREFERENCES_SNAPSHOT_DIR: &str = "preferences";

pub(super) struct MigrationWorker {
    ctx: Arc<ToolkitContext>,
    resolver: Arc<dyn PathResolver>,
    service: Arc<dyn ServiceController>,
    database: Arc<dyn DatabaseAdapter>,
    preferences: Arc<dyn PreferencesAdapter>,
    archiver: Arc<dyn CompressionAdapter>,
    discovery: Option<Arc<DiscoveryService>>,
    config: MigrationConfig,
    cancel: CancellationToken,
    tracker: PhaseTracker,
    shared: Arc<RwLock<MigrationProgress>>,
    result: Arc<RwLock<Option<MigrationResult>>>,
    bus: ProgressBus<MigrationProgress>,
    state: MigrationProgress,
    last_phase: Option<MigrationPhase>,
    /// Overall percentage already earned when the current phase began.
    phase_floor: f64,
    /// Overall percentage the current phase spans.
    phase_span: f64,
    source_label: Option<String>,
    target_label: Option<String>,
}

impl MigrationWorker {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        ctx: Arc<ToolkitContext>,
        resolver: Arc<dyn PathResolver>,
        service: Arc<dyn ServiceController>,
        database: Arc<dyn DatabaseAdapter>,
        preferences: Arc<dyn PreferencesAdapter>,
        archiver: Arc<dyn CompressionAdapter>,
        discovery: Option<Arc<DiscoveryService>>,
        config: MigrationConfig,
        cancel: CancellationToken,
        tracker: PhaseTracker,
        shared: Arc<RwLock<MigrationProgress>>,
        result: Arc<RwLock<Option<MigrationResult>>>,
        bus: ProgressBus<MigrationProgress>,
    ) -> Self {
        let state = MigrationProgress::begin(config.mode);
        MigrationWorker {
            ctx,
            resolver,
            service,
            database,
            preferences,
            archiver,
            discovery,
            config,
            cancel,
            tracker,
            shared,
            result,
            bus,
            state,
            last_phase: None,
            phase_floor: 0.0,
            phase_span: 0.0,
            source_label: None,
            target_label: None,
        }
    }

    pub(super) async fn run(mut self) {
        let started_at = Utc::now();
        info!(mode = %self.config.mode, "migration starting");
        let outcome = match self.config.mode {
            MigrationMode::LocalBackup => self.run_local_backup().await,
            MigrationMode::LocalRestore => self.run_local_restore().await,
            MigrationMode::NetworkPush => self.run_network_push(false).await,
            MigrationMode::FullMigration => self.run_network_push(true).await,
            MigrationMode::NetworkPull => self.run_network_pull().await,
        };

        let finished_at = Utc::now();
        let (state, message) = match &outcome {
            Ok(()) => {
                self.tracker.finish();
                (MigrationState::Completed, format!("{} completed", self.config.mode))
            }
            Err(e) if e.is_cancelled() => {
                (MigrationState::Cancelled, format!("{} cancelled", self.config.mode))
            }
            Err(e) => {
                self.state.errors.push(e.to_string());
                (MigrationState::Failed, format!("{} failed: {e}", self.config.mode))
            }
        };
        match state {
            MigrationState::Completed => info!(
                files = self.state.files_done,
                bytes = self.state.bytes_done,
                warnings = self.state.warnings.len(),
                "{message}"
            ),
            MigrationState::Cancelled => warn!("{message}"),
            _ => error!("{message}"),
        }

        self.state.state = state;
        self.state.message = message;

        // Store the result before the terminal snapshot goes out, so a
        // subscriber that sees the terminal state always finds it.
        let published = read_lock(&self.shared).clone();
        let duration = (finished_at - started_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        *write_lock(&self.result) = Some(MigrationResult {
            mode: self.config.mode,
            success: state == MigrationState::Completed,
            state,
            phase_reached: self.last_phase,
            started_at,
            finished_at,
            duration_secs: duration.as_secs_f64(),
            files_moved: self.state.files_done.max(published.files_done),
            bytes_moved: self.state.bytes_done.max(published.bytes_done),
            source: self.source_label.clone(),
            target: self.target_label.clone(),
            warnings: self.state.warnings.clone(),
            errors: self.state.errors.clone(),
            phase_timings: self.tracker.timings(),
        });
        self.publish();
    }

    // --- flows ----------------------------------------------------------

    async fn run_local_backup(&mut self) -> Result<()> {
        let dest = self.required_path(self.config.dest_path.clone(), "destination")?;
        self.enter(MigrationPhase::Initializing, "preparing backup");
        let layout = self.locate_layout()?;
        self.source_label = Some(layout.data_dir.display().to_string());
        self.target_label = Some(dest.display().to_string());
        tokio::fs::create_dir_all(&dest).await?;

        self.backup_into(&dest, &layout).await
    }

    /// BACKING_UP, UPDATING_PREFERENCES and VERIFYING against `dest`.
    /// Shared by LOCAL_BACKUP and the staging half of the push flows.
    async fn backup_into(&mut self, dest: &Path, layout: &DataLayout) -> Result<()> {
        self.enter(MigrationPhase::BackingUp, "running backup engine");
        self.drive_backup_engine(dest).await?;

        self.enter(MigrationPhase::UpdatingPreferences, "snapshotting preferences");
        let snapshot_dir = dest.join(PREFERENCES_SNAPSHOT_DIR);
        if let Err(e) = self.preferences.backup(&layout.preferences_file, &snapshot_dir) {
            self.warning(format!("preference snapshot failed: {e}"));
        }

        self.enter(MigrationPhase::Verifying, "exporting library summary");
        match self.database.export_summary(&layout.library_db) {
            Ok(summary) => {
                let rendered = serde_json::to_string_pretty(&summary)?;
                tokio::fs::write(dest.join(LIBRARY_INFO_FILE), rendered).await?;
            }
            Err(e) => self.warning(format!("library summary export failed: {e}")),
        }
        Ok(())
    }

    /// Run the backup engine against `dest` and republish its progress as
    /// this phase's sub-percentage until it reaches a terminal status.
    async fn drive_backup_engine(&mut self, dest: &Path) -> Result<()> {
        let engine = BackupEngine::new(
            self.ctx.clone(),
            self.resolver.clone(),
            self.service.clone(),
            self.database.clone(),
            self.preferences.clone(),
            self.archiver.clone(),
        );
        let mut rx = engine.subscribe();
        let mut options = BackupOptions::new(dest);
        options.mode = self.config.effective_backup_mode();
        options.verify = self.config.verify;
        if !engine.start(options) {
            return Err(ToolkitError::Migration("backup engine is busy".to_string()));
        }

        let base_files = self.state.files_done;
        let base_bytes = self.state.bytes_done;
        let mut cancel_forwarded = false;
        let terminal = loop {
            if self.cancel.is_cancelled() && !cancel_forwarded {
                engine.cancel();
                cancel_forwarded = true;
            }
            let snapshot = match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
            {
                Ok(Ok(snapshot)) => snapshot,
                Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) | Err(_) => {
                    let snapshot = engine.progress();
                    if !snapshot.status.is_terminal() {
                        continue;
                    }
                    snapshot
                }
            };
            self.mirror_backup(&snapshot, base_files, base_bytes);
            if snapshot.status.is_terminal() {
                break snapshot;
            }
        };

        self.state.warnings.extend(terminal.warnings.iter().cloned());
        match terminal.status {
            BackupStatus::Completed => {
                self.tracker.update(100.0);
                self.publish();
                Ok(())
            }
            BackupStatus::Cancelled => Err(ToolkitError::Cancelled),
            _ => Err(ToolkitError::Migration(
                terminal
                    .errors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "backup failed".to_string()),
            )),
        }
    }

    fn mirror_backup(&mut self, snapshot: &BackupProgress, base_files: u64, base_bytes: u64) {
        self.state.files_done = base_files + snapshot.files_done;
        self.state.bytes_done = base_bytes + snapshot.bytes_done;
        self.state.files_total = base_files + snapshot.files_total;
        self.state.bytes_total = base_bytes + snapshot.bytes_total;
        if !snapshot.current_file.is_empty() {
            self.state.message = snapshot.current_file.clone();
        }
        self.tracker.update(snapshot.percent());
        self.publish();
    }

    async fn run_local_restore(&mut self) -> Result<()> {
        let source = self.required_path(self.config.source_path.clone(), "source")?;
        self.enter(MigrationPhase::Initializing, "preparing restore");
        self.source_label = Some(source.display().to_string());
        let mappings = self.config.path_mappings.clone();
        let preserve = self.config.preserve_identity;
        self.restore_flow(&source, &mappings, preserve).await
    }

    /// The restore sequence: extract if needed, stop the target service,
    /// replace the tree, remap paths, refresh preferences, restart. Also
    /// invoked on the pull side when the sender requests a remote restore;
    /// there the restore phases carry no weight and only narrate.
    async fn restore_flow(
        &mut self,
        source: &Path,
        mappings: &BTreeMap<String, String>,
        preserve_identity: bool,
    ) -> Result<()> {
        let layout = self.locate_layout()?;
        if self.target_label.is_none() {
            self.target_label = Some(layout.data_dir.display().to_string());
        }

        // Holds the extracted tree for the rest of the flow when the source
        // is an archive.
        let mut extracted: Option<tempfile::TempDir> = None;
        let backup_dir = if source.is_file()
            && self.archiver.detect_format(source) != ArchiveFormat::None
        {
            self.enter(MigrationPhase::Extracting, "extracting archive");
            let scratch = tempfile::tempdir()?;
            let archiver = self.archiver.clone();
            let archive = source.to_path_buf();
            let out = scratch.path().to_path_buf();
            tokio::task::spawn_blocking(move || archiver.decompress(&archive, &out))
                .await
                .map_err(|e| ToolkitError::Migration(format!("extraction aborted: {e}")))??;
            let dir = scratch.path().to_path_buf();
            extracted = Some(scratch);
            dir
        } else {
            self.tracker.skip(MigrationPhase::Extracting);
            self.publish();
            source.to_path_buf()
        };
        let tree_root = resolve_backup_tree(&backup_dir);
        if !tree_root.is_dir() {
            return Err(ToolkitError::SourceNotFound(tree_root));
        }

        let stopped = if self.config.stop_service && self.service.is_running() {
            self.enter(MigrationPhase::StoppingTarget, "stopping target service");
            match self.service.stop() {
                Ok(()) => true,
                Err(e) => {
                    self.warning(format!("service stop failed: {e}"));
                    false
                }
            }
        } else {
            self.tracker.skip(MigrationPhase::StoppingTarget);
            self.publish();
            false
        };

        let outcome = self
            .restore_inner(&tree_root, &layout, mappings, preserve_identity)
            .await;

        // The service restarts on every exit path once this flow stopped it.
        if stopped {
            self.enter(MigrationPhase::StartingTarget, "starting target service");
            if let Err(e) = self.service.start() {
                self.warning(format!("service restart failed: {e}"));
            }
        } else {
            self.tracker.skip(MigrationPhase::StartingTarget);
            self.publish();
        }
        drop(extracted);
        outcome
    }

    async fn restore_inner(
        &mut self,
        tree_root: &Path,
        layout: &DataLayout,
        mappings: &BTreeMap<String, String>,
        preserve_identity: bool,
    ) -> Result<()> {
        self.enter(MigrationPhase::Restoring, "replacing target tree");
        self.copy_restore_tree(tree_root, &layout.data_dir).await?;

        if mappings.is_empty() {
            self.tracker.skip(MigrationPhase::RemappingPaths);
            self.publish();
        } else {
            self.enter(MigrationPhase::RemappingPaths, "remapping media paths");
            let database = self.database.clone();
            let db = layout.library_db.clone();
            let mappings = mappings.clone();
            let changed =
                tokio::task::spawn_blocking(move || database.remap_paths(&db, &mappings))
                    .await
                    .map_err(|e| ToolkitError::Migration(format!("remap aborted: {e}")))??;
            info!(changed, "media paths remapped");
        }

        self.enter(MigrationPhase::UpdatingPreferences, "updating preferences");
        if preserve_identity {
            debug!("keeping transferred machine identity");
        } else {
            match self.preferences.regenerate_identity(&layout.preferences_file) {
                Ok(_) => info!("machine identity regenerated"),
                Err(e) => self.warning(format!("identity regeneration failed: {e}")),
            }
        }
        Ok(())
    }

    /// Replace the target tree with the backup tree: top-level directories
    /// wholesale, files copied with their metadata. Per-file failures become
    /// warnings; cancellation is honored between files.
    async fn copy_restore_tree(&mut self, tree_root: &Path, target: &Path) -> Result<()> {
        let root = tree_root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || list_regular_files(&root))
            .await
            .map_err(|e| ToolkitError::Migration(format!("restore scan aborted: {e}")))?;
        let restore_bytes: u64 = files.iter().map(|(_, size)| size).sum();
        self.state.files_total += files.len() as u64;
        self.state.bytes_total += restore_bytes;
        self.publish();

        tokio::fs::create_dir_all(target).await?;
        for entry in std::fs::read_dir(tree_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let existing = target.join(entry.file_name());
            if existing.is_dir() {
                tokio::fs::remove_dir_all(&existing).await?;
            }
        }

        let mut done_bytes = 0u64;
        for (relative, _size) in files {
            self.check_cancelled()?;
            let from = tree_root.join(&relative);
            let to = target.join(&relative);
            match tokio::task::spawn_blocking(move || copy_file_with_metadata(&from, &to))
                .await
                .map_err(|e| ToolkitError::Migration(format!("restore copy aborted: {e}")))?
            {
                Ok(bytes) => {
                    done_bytes += bytes;
                    self.state.files_done += 1;
                    self.state.bytes_done += bytes;
                    self.state.message = relative.display().to_string();
                }
                Err(e) => {
                    self.warning(format!("cannot restore {}: {e}", relative.display()));
                }
            }
            let ratio = if restore_bytes > 0 {
                done_bytes as f64 / restore_bytes as f64
            } else {
                1.0
            };
            self.tracker.update(ratio * 100.0);
            self.publish();
        }
        Ok(())
    }

    async fn run_network_push(&mut self, remote_restore: bool) -> Result<()> {
        let host = self
            .config
            .target_host
            .clone()
            .ok_or_else(|| ToolkitError::Configuration("no target host".to_string()))?;
        self.enter(MigrationPhase::Initializing, "staging backup");
        let layout = self.locate_layout()?;
        self.source_label = Some(layout.data_dir.display().to_string());
        self.target_label = Some(format!("{host}:{}", self.config.target_port));

        // Scratch staging; removed on every exit path when this binding drops.
        let scratch = tempfile::tempdir()?;
        let staged = self.backup_into(scratch.path(), &layout).await;
        staged?;

        self.enter(MigrationPhase::Connecting, "connecting to target");
        let mut stream = self.connect(&host, self.config.target_port).await?;

        self.enter(MigrationPhase::Transferring, "transferring backup");
        self.send_tree(&mut stream, scratch.path()).await?;
        write_frame(&mut stream, &Frame::Done).await?;
        self.await_ack(&mut stream, "transfer").await?;

        if remote_restore {
            self.enter(MigrationPhase::Restoring, "waiting for remote restore");
            write_frame(
                &mut stream,
                &Frame::Restore {
                    path_mappings: self.config.path_mappings.clone(),
                    preserve_identity: self.config.preserve_identity,
                },
            )
            .await?;
            self.await_ack(&mut stream, "remote restore").await?;
        }

        if let Err(e) = scratch.close() {
            self.warning(format!("scratch directory not removed: {e}"));
        }
        Ok(())
    }

    async fn connect(&mut self, host: &str, port: u16) -> Result<TcpStream> {
        let addr = format!("{host}:{port}");
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            self.check_cancelled()?;
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    info!(peer = %addr, "connected");
                    return Ok(stream);
                }
                Err(e) if Instant::now() < deadline => {
                    // The receiver may still be opening its listener.
                    debug!(peer = %addr, "connect attempt failed: {e}");
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(ToolkitError::Transfer(format!(
                        "could not connect to {addr}: {e}"
                    )));
                }
            }
        }
    }

    /// Stream every regular file under `root` as a session of file frames.
    async fn send_tree(&mut self, stream: &mut TcpStream, root: &Path) -> Result<()> {
        let root_owned = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || list_regular_files(&root_owned))
            .await
            .map_err(|e| ToolkitError::Migration(format!("transfer scan aborted: {e}")))?;
        let total_size: u64 = files.iter().map(|(_, size)| size).sum();
        self.state.files_total += files.len() as u64;
        self.state.bytes_total += total_size;
        self.publish();

        write_frame(
            stream,
            &Frame::Session {
                file_count: files.len() as u64,
                total_size,
                hostname: self.ctx.platform.hostname.clone(),
            },
        )
        .await?;

        for (relative, _size) in files {
            self.check_cancelled()?;
            let name = relative_key(&relative, Path::new(""));
            self.state.message = format!("sending {name}");
            let mut on_chunk = chunk_publisher(
                self.bus.clone(),
                self.shared.clone(),
                self.state.clone(),
                self.phase_floor,
                self.phase_span,
            );
            let sent = send_file(
                stream,
                &root.join(&relative),
                &name,
                &self.cancel,
                &mut on_chunk,
            )
            .await?;
            self.state.files_done += 1;
            self.state.bytes_done += sent;
            let ratio = if self.state.bytes_total > 0 {
                self.state.bytes_done as f64 / self.state.bytes_total as f64
            } else {
                1.0
            };
            self.tracker.update(ratio * 100.0);
            self.publish();
        }
        Ok(())
    }

    async fn await_ack(&mut self, stream: &mut TcpStream, what: &str) -> Result<()> {
        let frame = tokio::select! {
            frame = read_frame(stream) => frame?,
            _ = self.cancel.cancelled() => return Err(ToolkitError::Cancelled),
        };
        match frame {
            Frame::Ack { ok: true, .. } => Ok(()),
            Frame::Ack { ok: false, message } => Err(ToolkitError::Migration(format!(
                "{what} rejected by peer: {message}"
            ))),
            other => Err(ToolkitError::Transfer(format!(
                "expected an ack for {what}, got {other:?}"
            ))),
        }
    }

    async fn run_network_pull(&mut self) -> Result<()> {
        let dest = self.required_path(self.config.dest_path.clone(), "destination")?;
        self.target_label = Some(dest.display().to_string());

        if let Some(host) = self.config.source_host.clone() {
            self.tracker.skip(MigrationPhase::Discovering);
            self.publish();
            self.source_label = Some(host);
        } else {
            self.enter(MigrationPhase::Discovering, "waiting for a partner");
            let partner = self.discover_partner().await?;
            info!(ip = %partner.ip, port = partner.port, "partner found");
            self.source_label = Some(partner.ip.to_string());
        }

        self.enter(MigrationPhase::Connecting, "waiting for the sender");
        let port = self.ctx.config.network.toolkit_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let timeout = Duration::from_secs(self.ctx.config.network.partner_timeout_secs);
        let (mut stream, peer) = tokio::select! {
            accepted = tokio::time::timeout(timeout, listener.accept()) => {
                accepted.map_err(|_| {
                    ToolkitError::Transfer("no incoming connection".to_string())
                })??
            }
            _ = self.cancel.cancelled() => return Err(ToolkitError::Cancelled),
        };
        info!(peer = %peer, "sender connected");

        self.enter(MigrationPhase::Transferring, "receiving backup");
        tokio::fs::create_dir_all(&dest).await?;
        self.receive_session(&mut stream, &dest).await
    }

    async fn discover_partner(&mut self) -> Result<crate::net::NetworkPeer> {
        let discovery = self
            .discovery
            .clone()
            .ok_or_else(|| ToolkitError::Configuration("no discovery service".to_string()))?;
        let timeout = Duration::from_secs(self.ctx.config.network.partner_timeout_secs.max(1));
        let started = Instant::now();
        loop {
            self.check_cancelled()?;
            if let Some(peer) = discovery.find_partner() {
                self.tracker.update(100.0);
                self.publish();
                return Ok(peer);
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(ToolkitError::Migration(
                    "no migration partner found".to_string(),
                ));
            }
            self.tracker
                .update(elapsed.as_secs_f64() / timeout.as_secs_f64() * 100.0);
            self.publish();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = self.cancel.cancelled() => return Err(ToolkitError::Cancelled),
            }
        }
    }

    /// Receive frames into `dest` until the sender is finished. A `restore`
    /// frame runs the local restore flow against the received tree and
    /// reports its outcome back before this side's run ends.
    async fn receive_session(&mut self, stream: &mut TcpStream, dest: &Path) -> Result<()> {
        let mut done = false;
        loop {
            let frame = tokio::select! {
                frame = read_frame(stream) => frame,
                _ = self.cancel.cancelled() => return Err(ToolkitError::Cancelled),
            };
            let frame = match frame {
                Ok(frame) => frame,
                // The sender closing after done is the normal end of session.
                Err(ToolkitError::Io(e))
                    if done && e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(e),
            };
            match frame {
                Frame::Session {
                    file_count,
                    total_size,
                    hostname,
                } => {
                    info!(from = %hostname, file_count, total_size, "session opened");
                    self.state.files_total += file_count;
                    self.state.bytes_total += total_size;
                    if self.source_label.is_none() {
                        self.source_label = Some(hostname);
                    }
                    self.publish();
                }
                Frame::File { name, size } => {
                    self.state.message = format!("receiving {name}");
                    let mut on_chunk = chunk_publisher(
                        self.bus.clone(),
                        self.shared.clone(),
                        self.state.clone(),
                        self.phase_floor,
                        self.phase_span,
                    );
                    receive_file(stream, dest, &name, size, &self.cancel, &mut on_chunk).await?;
                    self.state.files_done += 1;
                    self.state.bytes_done += size;
                    let ratio = if self.state.bytes_total > 0 {
                        self.state.bytes_done as f64 / self.state.bytes_total as f64
                    } else {
                        1.0
                    };
                    self.tracker.update(ratio * 100.0);
                    self.publish();
                }
                Frame::Done => {
                    done = true;
                    write_frame(
                        stream,
                        &Frame::Ack {
                            ok: true,
                            message: format!("received {} files", self.state.files_done),
                        },
                    )
                    .await?;
                }
                Frame::Restore {
                    path_mappings,
                    preserve_identity,
                } => {
                    info!("sender requested a restore of the received tree");
                    let outcome = self
                        .restore_flow(dest, &path_mappings, preserve_identity)
                        .await;
                    let (ok, message) = match &outcome {
                        Ok(()) => (true, "restore completed".to_string()),
                        Err(e) => (false, e.to_string()),
                    };
                    write_frame(stream, &Frame::Ack { ok, message }).await?;
                    outcome?;
                }
                Frame::Ack { .. } => {
                    debug!("ignoring unexpected ack from sender");
                }
            }
        }
        if !done {
            return Err(ToolkitError::Transfer(
                "session ended before the sender finished".to_string(),
            ));
        }
        Ok(())
    }

    // --- plumbing ---------------------------------------------------------

    fn locate_layout(&self) -> Result<DataLayout> {
        self.resolver
            .locate()
            .ok_or_else(|| ToolkitError::Configuration("data directory not located".to_string()))
    }

    fn required_path(&self, path: Option<PathBuf>, what: &str) -> Result<PathBuf> {
        path.ok_or_else(|| ToolkitError::Configuration(format!("no {what} path")))
    }

    fn enter(&mut self, phase: MigrationPhase, message: &str) {
        info!(phase = %phase, "{message}");
        self.tracker.enter(phase);
        self.last_phase = Some(phase);
        self.phase_floor = self.tracker.overall_percent();
        self.phase_span = self.tracker.current_span();
        self.state.message = message.to_string();
        self.publish();
    }

    fn warning(&mut self, message: String) {
        warn!("{message}");
        self.state.warnings.push(message);
        self.publish();
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ToolkitError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn publish(&mut self) {
        self.state.phase = self.tracker.current_phase().or(self.last_phase);
        self.state.phase_percent = self.tracker.phase_percent();
        // Chunk publishers may have advanced the shared snapshot past this
        // worker's own view; never step backwards.
        let published = read_lock(&self.shared).clone();
        self.state.overall_percent = self
            .state
            .overall_percent
            .max(self.tracker.overall_percent())
            .max(published.overall_percent);
        self.state.bytes_done = self.state.bytes_done.max(published.bytes_done);
        if self.state.state == MigrationState::Completed {
            self.state.overall_percent = 100.0;
        }
        let snapshot = self.state.clone();
        *write_lock(&self.shared) = snapshot.clone();
        self.bus.publish(snapshot);
    }
}

/// Per-chunk progress publication for one file transfer. Owns its snapshot
/// so the worker's own state stays untouched until the file completes.
fn chunk_publisher(
    bus: ProgressBus<MigrationProgress>,
    shared: Arc<RwLock<MigrationProgress>>,
    mut snapshot: MigrationProgress,
    floor: f64,
    span: f64,
) -> impl FnMut(u64) + Send {
    move |bytes| {
        snapshot.bytes_done += bytes;
        let ratio = if snapshot.bytes_total > 0 {
            (snapshot.bytes_done as f64 / snapshot.bytes_total as f64).min(1.0)
        } else {
            0.0
        };
        snapshot.phase_percent = ratio * 100.0;
        snapshot.overall_percent = snapshot
            .overall_percent
            .max((floor + span * ratio).min(99.9));
        *write_lock(&shared) = snapshot.clone();
        bus.publish(snapshot.clone());
    }
}

/// Regular files under `root` as (relative path, size), shallow-to-deep.
fn list_regular_files(root: &Path) -> Vec<(PathBuf, u64)> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("transfer scan skipped an entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        files.push((relative.to_path_buf(), size));
    }
    files
}

/// The tree directory inside a backup destination. A manifest names it; a
/// directory without one is treated as the tree itself.
fn resolve_backup_tree(dir: &Path) -> PathBuf {
    if let Some(manifest) = BackupManifest::load(dir) {
        let tree = dir.join(&manifest.data_dir_name);
        if tree.is_dir() {
            return tree;
        }
    }
    // An extracted archive may hold the backup directory one level down.
    if !dir.join(MANIFEST_FILE_NAME).exists() {
        if let Ok(entries) = std::fs::read_dir(dir) {
            let dirs: Vec<PathBuf> = entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .map(|e| e.path())
                .collect();
            if dirs.len() == 1 && dirs[0].join(MANIFEST_FILE_NAME).exists() {
                return resolve_backup_tree(&dirs[0]);
            }
        }
    }
    dir.to_path_buf()
}
