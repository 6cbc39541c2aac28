//! The backup worker.
//!
//! A `BackupRunner` owns one run from start to terminal state. It executes
//! synchronously on a blocking thread; the engine facade wraps it in a task
//! and watches for panics. Modes that stop the service restart it on every
//! exit path, including cancellation and failure.

use crate::adapters::{CompressionAdapter, DatabaseAdapter, PreferencesAdapter};
use crate::backup::copier::{self, copy_file_with_metadata, CopyEvent, TreeCopier};
use crate::backup::manifest::{relative_key, unix_mtime, BackupManifest};
use crate::backup::{BackupMode, BackupOptions, BackupProgress, BackupStatus};
use crate::context::ToolkitContext;
use crate::error::{Result, ToolkitError};
use crate::layout::{DataLayout, PathResolver, DATABASES_DIR};
use crate::progress::{write_lock, ProgressBus};
use crate::service::ServiceController;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(super) struct BackupRunner {
    ctx: Arc<ToolkitContext>,
    resolver: Arc<dyn PathResolver>,
    service: Arc<dyn ServiceController>,
    database: Arc<dyn DatabaseAdapter>,
    preferences: Arc<dyn PreferencesAdapter>,
    archiver: Arc<dyn CompressionAdapter>,
    options: BackupOptions,
    cancel: CancellationToken,
    shared: Arc<RwLock<BackupProgress>>,
    bus: ProgressBus<BackupProgress>,
    state: BackupProgress,
}

impl BackupRunner {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        ctx: Arc<ToolkitContext>,
        resolver: Arc<dyn PathResolver>,
        service: Arc<dyn ServiceController>,
        database: Arc<dyn DatabaseAdapter>,
        preferences: Arc<dyn PreferencesAdapter>,
        archiver: Arc<dyn CompressionAdapter>,
        options: BackupOptions,
        cancel: CancellationToken,
        shared: Arc<RwLock<BackupProgress>>,
        bus: ProgressBus<BackupProgress>,
    ) -> Self {
        BackupRunner {
            ctx,
            resolver,
            service,
            database,
            preferences,
            archiver,
            options,
            cancel,
            shared,
            bus,
            state: BackupProgress::new(),
        }
    }

    pub(super) fn run(mut self) {
        let result = self.execute();
        self.finish(result);
    }

    fn execute(&mut self) -> Result<()> {
        let layout = self
            .resolver
            .locate()
            .ok_or_else(|| ToolkitError::Configuration("data directory not located".to_string()))?;
        if !layout.exists() {
            return Err(ToolkitError::SourceNotFound(layout.data_dir.clone()));
        }

        info!(
            mode = %self.options.mode,
            source = %layout.data_dir.display(),
            dest = %self.options.destination.display(),
            "backup starting"
        );
        self.set_status(BackupStatus::Preparing, "preparing backup");
        std::fs::create_dir_all(&self.options.destination)?;

        let tree_name = layout
            .data_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data".to_string());
        let tree_dir = self.options.destination.join(&tree_name);

        let prior = match self.options.mode {
            BackupMode::Incremental => BackupManifest::load(&self.options.destination),
            _ => None,
        };
        self.compute_totals(&layout, prior.as_ref());

        match self.options.mode {
            BackupMode::Hot => {
                self.set_status(BackupStatus::Copying, "copying live tree");
                self.copy_full(&layout, &tree_dir, None)?;
            }
            BackupMode::Cold => {
                self.with_service_stopped(|this| {
                    this.set_status(BackupStatus::Copying, "copying stopped tree");
                    this.copy_full(&layout, &tree_dir, None)
                })?;
            }
            BackupMode::Smart => {
                self.set_status(BackupStatus::Copying, "copying live tree");
                self.copy_full(&layout, &tree_dir, None)?;
                self.with_service_stopped(|this| this.recopy_critical(&layout, &tree_dir))?;
            }
            BackupMode::Incremental => {
                let message = if prior.is_some() {
                    "copying changed files"
                } else {
                    "no prior manifest, copying full tree"
                };
                self.set_status(BackupStatus::Copying, message);
                self.copy_full(&layout, &tree_dir, prior.as_ref())?;
            }
            BackupMode::DatabaseOnly => {
                self.with_service_stopped(|this| {
                    this.copy_database_set(&layout, &tree_dir)
                })?;
            }
        }
        self.check_cancelled()?;

        let mut manifest = BackupManifest::generate(
            &tree_dir,
            self.options.mode,
            &self.ctx.platform.os,
            &self.ctx.platform.hostname,
        )?;

        if self.options.verify {
            self.verify_tree(&layout, &manifest)?;
        }

        manifest.machine_identifier = self.preferences.machine_identifier(&layout.preferences_file);
        manifest.server_name = self.preferences.server_name(&layout.preferences_file);
        for relative in layout.critical_files() {
            let copied = tree_dir.join(relative);
            if !copied.is_file() {
                continue;
            }
            match file_checksum(&copied) {
                Ok(hex) => {
                    manifest
                        .checksums
                        .insert(relative_key(&copied, &tree_dir), hex);
                }
                Err(e) => self.warning(format!(
                    "could not checksum {}: {e}",
                    relative.display()
                )),
            }
        }
        manifest.save(&self.options.destination)?;

        if self.options.compress {
            self.check_cancelled()?;
            self.compress_tree(&tree_dir, &tree_name)?;
        }
        Ok(())
    }

    fn compute_totals(&mut self, layout: &DataLayout, prior: Option<&BackupManifest>) {
        let exclude = self.ctx.config.backup.exclude_patterns.clone();
        let (mut files, mut bytes) = match self.options.mode {
            BackupMode::DatabaseOnly => {
                let mut files = 0u64;
                let mut bytes = 0u64;
                for path in layout.database_file_set() {
                    if let Ok(meta) = std::fs::metadata(&path) {
                        if meta.is_file() {
                            files += 1;
                            bytes += meta.len();
                        }
                    }
                }
                (files, bytes)
            }
            BackupMode::Incremental => {
                if let Some(manifest) = prior {
                    changed_set(&layout.data_dir, &exclude, manifest)
                } else {
                    let copier = TreeCopier::new(&self.cancel, &exclude, false);
                    copier.scan(&layout.data_dir)
                }
            }
            _ => {
                let copier = TreeCopier::new(&self.cancel, &exclude, false);
                copier.scan(&layout.data_dir)
            }
        };
        if self.options.mode == BackupMode::Smart {
            // Critical files are copied a second time under the stop, so
            // they count twice toward the totals.
            for relative in layout.critical_files() {
                if let Ok(meta) = std::fs::metadata(layout.data_dir.join(relative)) {
                    if meta.is_file() {
                        files += 1;
                        bytes += meta.len();
                    }
                }
            }
        }
        self.state.files_total = files;
        self.state.bytes_total = bytes;
        self.publish();
    }

    fn copy_full(
        &mut self,
        layout: &DataLayout,
        tree_dir: &Path,
        prior: Option<&BackupManifest>,
    ) -> Result<()> {
        let cancel = self.cancel.clone();
        let exclude = self.ctx.config.backup.exclude_patterns.clone();
        let use_mirror = self.ctx.config.backup.use_mirror_tool;
        let copier = TreeCopier::new(&cancel, &exclude, use_mirror);
        let stats = copier.copy_tree(&layout.data_dir, tree_dir, prior, &mut |event| {
            self.apply_copy_event(event)
        })?;
        // The bulk-mirror path reports totals rather than per-file events;
        // reconcile so the counters agree with what landed on disk.
        self.state.files_done = self.state.files_done.max(stats.files_copied);
        self.state.bytes_done = self.state.bytes_done.max(stats.bytes_copied);
        self.publish();
        Ok(())
    }

    fn recopy_critical(&mut self, layout: &DataLayout, tree_dir: &Path) -> Result<()> {
        self.set_status(BackupStatus::Copying, "re-copying critical files");
        for relative in layout.critical_files() {
            self.check_cancelled()?;
            let source = layout.data_dir.join(relative);
            if !source.is_file() {
                continue;
            }
            let target = tree_dir.join(relative);
            let bytes = copy_file_with_metadata(&source, &target).map_err(|e| {
                ToolkitError::Io(std::io::Error::other(format!(
                    "critical file {}: {e}",
                    relative.display()
                )))
            })?;
            self.state.files_done += 1;
            self.state.bytes_done += bytes;
            self.state.current_file = relative.display().to_string();
            self.publish();
        }
        Ok(())
    }

    fn copy_database_set(&mut self, layout: &DataLayout, tree_dir: &Path) -> Result<()> {
        self.set_status(BackupStatus::Copying, "copying databases and preferences");
        for path in layout.database_file_set() {
            self.check_cancelled()?;
            if !path.is_file() {
                continue;
            }
            let relative = match path.strip_prefix(&layout.data_dir) {
                Ok(r) => r.to_path_buf(),
                Err(_) => continue,
            };
            let target = tree_dir.join(&relative);
            let bytes = copy_file_with_metadata(&path, &target).map_err(|e| {
                ToolkitError::Io(std::io::Error::other(format!(
                    "database file {}: {e}",
                    relative.display()
                )))
            })?;
            self.state.files_done += 1;
            self.state.bytes_done += bytes;
            self.state.current_file = relative.display().to_string();
            self.publish();
        }
        Ok(())
    }

    /// Confirm every critical file that exists in the source also landed in
    /// the copied tree, then run the database consistency check. Broader
    /// source/destination drift is only a warning: a live source keeps
    /// moving between copy and verify, and extra files in the tree are
    /// tolerated (incremental runs retain files deleted from the source
    /// since the last run).
    fn verify_tree(&mut self, layout: &DataLayout, manifest: &BackupManifest) -> Result<()> {
        self.set_status(BackupStatus::Verifying, "verifying backup");
        let tree_dir = self.options.destination.join(&manifest.data_dir_name);

        let mut missing = Vec::new();
        for relative in layout.critical_files() {
            if !layout.data_dir.join(relative).is_file() {
                continue;
            }
            if !tree_dir.join(relative).is_file() {
                missing.push(relative.display().to_string());
            }
        }
        if !missing.is_empty() {
            return Err(ToolkitError::Verification(format!(
                "critical files missing from the backup: {}",
                missing.join(", ")
            )));
        }

        let exclude = self.ctx.config.backup.exclude_patterns.clone();
        let mut drifted = 0u64;
        let mut checked = 0u64;

        let mut check = |path: &Path, size: u64| {
            checked += 1;
            let key = relative_key(path, &layout.data_dir);
            let matches = manifest
                .files
                .get(&key)
                .map(|entry| entry.size == size)
                .unwrap_or(false);
            if !matches {
                drifted += 1;
            }
        };

        if self.options.mode == BackupMode::DatabaseOnly {
            for path in layout.database_file_set() {
                if let Ok(meta) = std::fs::metadata(&path) {
                    if meta.is_file() {
                        check(&path, meta.len());
                    }
                }
            }
        } else {
            for entry in copier::walk(&layout.data_dir, &exclude).flatten() {
                if !entry.file_type().is_file() {
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                check(entry.path(), size);
            }
        }

        if drifted > 0 {
            self.warning(format!(
                "{drifted} of {checked} source files changed since the copy"
            ));
        } else {
            debug!(checked, "verification passed");
        }

        let copied_db = self
            .options
            .destination
            .join(&manifest.data_dir_name)
            .join(DATABASES_DIR)
            .join(&self.ctx.config.layout.library_db);
        if copied_db.is_file() {
            match self.database.integrity_check(&copied_db) {
                Ok(verdict) if verdict == "ok" => debug!("database integrity ok"),
                Ok(verdict) => {
                    self.warning(format!("database integrity check reported: {verdict}"))
                }
                Err(e) => self.warning(format!("database integrity check failed: {e}")),
            }
        }
        Ok(())
    }

    fn compress_tree(&mut self, tree_dir: &Path, tree_name: &str) -> Result<()> {
        self.set_status(BackupStatus::Compressing, "compressing backup");
        let extension = self.options.format.extension().ok_or_else(|| {
            ToolkitError::Configuration("no archive format selected".to_string())
        })?;
        let archive = self
            .options
            .destination
            .join(format!("{tree_name}.{extension}"));
        self.archiver
            .compress(tree_dir, &archive, self.options.format)?;
        info!(archive = %archive.display(), "backup compressed");
        if let Err(e) = std::fs::remove_dir_all(tree_dir) {
            self.warning(format!("could not remove uncompressed tree: {e}"));
        }
        Ok(())
    }

    /// Run `f` with the service stopped, then start it again. The restart
    /// happens whether `f` succeeded, failed or was cancelled; a service
    /// that was not running is left alone. Stop and start failures are
    /// recorded as warnings and never decide the run's outcome: a failed
    /// stop degrades the copy to live-tree consistency, and a failed
    /// restart after a good copy still leaves a good backup.
    fn with_service_stopped<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let mut stopped = false;
        if self.service.is_running() {
            self.set_status(BackupStatus::StoppingService, "stopping service");
            match self.service.stop() {
                Ok(()) => {
                    stopped = true;
                    let grace = self.ctx.config.backup.stop_grace_secs;
                    if grace > 0 {
                        std::thread::sleep(Duration::from_secs(grace));
                    }
                }
                Err(e) => {
                    self.warning(format!("service stop failed, copying live data: {e}"));
                }
            }
        } else {
            debug!("service not running, no stop needed");
        }

        let result = f(self);

        if stopped {
            self.set_status(BackupStatus::StartingService, "starting service");
            if let Err(e) = self.service.start() {
                self.warning(format!("service restart failed: {e}"));
            }
        }
        result
    }

    fn apply_copy_event(&mut self, event: CopyEvent) {
        match event {
            CopyEvent::FileCopied { relative, bytes } => {
                self.state.files_done += 1;
                self.state.bytes_done += bytes;
                self.state.current_file = relative.to_string();
                self.publish();
            }
            CopyEvent::FileSkipped { relative } => {
                self.state.current_file = relative.to_string();
            }
            CopyEvent::BytesNudge { bytes } => {
                self.state.bytes_done += bytes;
                self.publish();
            }
            CopyEvent::Warning { message } => {
                self.warning(message);
            }
        }
    }

    fn warning(&mut self, message: String) {
        warn!("{message}");
        self.state.warnings.push(message);
        self.publish();
    }

    fn set_status(&mut self, status: BackupStatus, message: &str) {
        info!(status = ?status, "{message}");
        self.state.status = status;
        self.state.message = message.to_string();
        self.publish();
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(ToolkitError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn publish(&self) {
        let snapshot = self.state.clone();
        *write_lock(&self.shared) = snapshot.clone();
        self.bus.publish(snapshot);
    }

    fn finish(&mut self, result: Result<()>) {
        match result {
            Ok(()) => {
                self.state.status = BackupStatus::Completed;
                self.state.message = "backup completed".to_string();
                info!(
                    files = self.state.files_done,
                    bytes = self.state.bytes_done,
                    warnings = self.state.warnings.len(),
                    "backup completed"
                );
            }
            Err(e) if e.is_cancelled() => {
                self.state.status = BackupStatus::Cancelled;
                self.state.message = "backup cancelled".to_string();
                warn!("backup cancelled");
            }
            Err(e) => {
                self.state.status = BackupStatus::Failed;
                self.state.message = format!("backup failed: {e}");
                self.state.errors.push(e.to_string());
                error!("backup failed: {e}");
            }
        }
        self.publish();
    }
}

/// Files under `root` that a prior manifest does not already cover.
fn changed_set(root: &Path, exclude: &[String], prior: &BackupManifest) -> (u64, u64) {
    let mut files = 0u64;
    let mut bytes = 0u64;
    for entry in copier::walk(root, exclude).flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        let key = relative_key(entry.path(), root);
        if !prior.is_unchanged(&key, meta.len(), unix_mtime(&meta)) {
            files += 1;
            bytes += meta.len();
        }
    }
    (files, bytes)
}

fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut file = std::fs::File::open(path)?;
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{JsonPreferencesStore, SqliteLibraryAdapter, SystemArchiver};
    use crate::backup::tests::FakeService;
    use crate::config::ToolkitConfig;
    use crate::layout::FixedPathResolver;
    use std::fs;
    use std::sync::atomic::Ordering;

    fn make_runner(
        source: &Path,
        dest: &Path,
        mode: BackupMode,
        service: Arc<dyn ServiceController>,
        cancel: CancellationToken,
    ) -> BackupRunner {
        let mut config = ToolkitConfig::default();
        config.backup.use_mirror_tool = false;
        config.backup.stop_grace_secs = 0;
        let mut options = BackupOptions::new(dest);
        options.mode = mode;
        BackupRunner::new(
            Arc::new(ToolkitContext::new(config)),
            Arc::new(FixedPathResolver::new(source)),
            service,
            Arc::new(SqliteLibraryAdapter),
            Arc::new(JsonPreferencesStore),
            Arc::new(SystemArchiver),
            options,
            cancel,
            Arc::new(RwLock::new(BackupProgress::new())),
            ProgressBus::new(),
        )
    }

    /// Service whose stop or start can be made to fail on command.
    struct FlakyService {
        inner: Arc<FakeService>,
        fail_stop: bool,
        fail_start: bool,
    }

    impl ServiceController for FlakyService {
        fn is_running(&self) -> bool {
            self.inner.is_running()
        }

        fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(ToolkitError::ServiceControl("start refused".to_string()));
            }
            self.inner.start()
        }

        fn stop(&self) -> Result<()> {
            if self.fail_stop {
                return Err(ToolkitError::ServiceControl("stop refused".to_string()));
            }
            self.inner.stop()
        }
    }

    /// Service that drops a file into its data directory when it comes up,
    /// the way a real server writes logs and pid files on startup.
    struct TouchOnStartService {
        inner: Arc<FakeService>,
        touch: std::path::PathBuf,
    }

    impl ServiceController for TouchOnStartService {
        fn is_running(&self) -> bool {
            self.inner.is_running()
        }

        fn start(&self) -> Result<()> {
            fs::write(&self.touch, b"pid").map_err(ToolkitError::Io)?;
            self.inner.start()
        }

        fn stop(&self) -> Result<()> {
            self.inner.stop()
        }
    }

    fn seed_layout(root: &Path) {
        fs::create_dir_all(root.join("Databases")).unwrap();
        fs::write(root.join("Preferences.json"), br#"{"FriendlyName":"t"}"#).unwrap();
        fs::write(root.join("Databases/library.db"), vec![7u8; 64]).unwrap();
        fs::write(root.join("other.bin"), vec![1u8; 200]).unwrap();
    }

    #[test]
    fn test_precancelled_cold_run_still_restarts_service() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("media");
        seed_layout(&source);

        let service = FakeService::new(true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut runner = make_runner(
            &source,
            &tmp.path().join("backup"),
            BackupMode::Cold,
            service.clone(),
            cancel,
        );
        let result = runner.execute();
        runner.finish(result);

        assert_eq!(runner.state.status, BackupStatus::Cancelled);
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
        assert_eq!(service.starts.load(Ordering::SeqCst), 1);
        assert!(service.is_running());
    }

    #[test]
    fn test_smart_recopies_critical_files_under_stop() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("media");
        let dest = tmp.path().join("backup");
        seed_layout(&source);

        let service = FakeService::new(true);
        let mut runner = make_runner(
            &source,
            &dest,
            BackupMode::Smart,
            service.clone(),
            CancellationToken::new(),
        );
        let result = runner.execute();
        runner.finish(result);

        assert_eq!(runner.state.status, BackupStatus::Completed);
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
        assert_eq!(service.starts.load(Ordering::SeqCst), 1);
        // Tree copy plus the critical re-copies, nothing more
        assert_eq!(runner.state.files_done, runner.state.files_total);
        assert_eq!(runner.state.bytes_done, runner.state.bytes_total);
        assert!(dest.join("media/Databases/library.db").is_file());
        assert!(dest.join("media/other.bin").is_file());
    }

    #[test]
    fn test_database_only_copies_just_the_database_set() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("media");
        let dest = tmp.path().join("backup");
        seed_layout(&source);
        fs::write(source.join("Databases/library.db-wal"), vec![3u8; 16]).unwrap();

        let service = FakeService::new(true);
        let mut runner = make_runner(
            &source,
            &dest,
            BackupMode::DatabaseOnly,
            service.clone(),
            CancellationToken::new(),
        );
        let result = runner.execute();
        runner.finish(result);

        assert_eq!(runner.state.status, BackupStatus::Completed);
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
        assert!(dest.join("media/Databases/library.db").is_file());
        assert!(dest.join("media/Databases/library.db-wal").is_file());
        assert!(dest.join("media/Preferences.json").is_file());
        assert!(!dest.join("media/other.bin").exists());

        let manifest = BackupManifest::load(&dest).unwrap();
        assert_eq!(manifest.file_count, 3);
    }

    #[test]
    fn test_manifest_carries_identity_and_checksums() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("media");
        let dest = tmp.path().join("backup");
        seed_layout(&source);
        fs::write(
            source.join("Preferences.json"),
            br#"{"FriendlyName":"den","MachineIdentifier":"abc123"}"#,
        )
        .unwrap();

        let mut runner = make_runner(
            &source,
            &dest,
            BackupMode::Hot,
            FakeService::new(false),
            CancellationToken::new(),
        );
        let result = runner.execute();
        runner.finish(result);
        assert_eq!(runner.state.status, BackupStatus::Completed);

        let manifest = BackupManifest::load(&dest).unwrap();
        assert_eq!(manifest.machine_identifier.as_deref(), Some("abc123"));
        assert_eq!(manifest.server_name.as_deref(), Some("den"));
        let checksum = manifest.checksums.get("Databases/library.db").unwrap();
        assert_eq!(checksum.len(), 64);
        assert!(manifest.checksums.contains_key("Preferences.json"));
    }

    #[test]
    fn test_source_drift_after_copy_is_a_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("media");
        let dest = tmp.path().join("backup");
        seed_layout(&source);

        let mut runner = make_runner(
            &source,
            &dest,
            BackupMode::Hot,
            FakeService::new(false),
            CancellationToken::new(),
        );
        assert!(runner.execute().is_ok());

        // A file appears in the source after the copy finished; the backup
        // is still good.
        fs::write(source.join("late.bin"), vec![9u8; 10]).unwrap();
        let layout = FixedPathResolver::new(&source).locate().unwrap();
        let manifest = BackupManifest::generate(
            &dest.join("media"),
            BackupMode::Hot,
            "linux",
            "host01",
        )
        .unwrap();
        runner.verify_tree(&layout, &manifest).unwrap();
        assert!(runner
            .state
            .warnings
            .iter()
            .any(|w| w.contains("changed since the copy")));
    }

    #[test]
    fn test_verify_fails_when_critical_file_missing_from_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("media");
        let dest = tmp.path().join("backup");
        seed_layout(&source);

        let mut runner = make_runner(
            &source,
            &dest,
            BackupMode::Hot,
            FakeService::new(false),
            CancellationToken::new(),
        );
        assert!(runner.execute().is_ok());

        fs::remove_file(dest.join("media/Databases/library.db")).unwrap();
        let layout = FixedPathResolver::new(&source).locate().unwrap();
        let manifest = BackupManifest::generate(
            &dest.join("media"),
            BackupMode::Hot,
            "linux",
            "host01",
        )
        .unwrap();
        let err = runner.verify_tree(&layout, &manifest).unwrap_err();
        assert!(matches!(err, ToolkitError::Verification(_)));
        assert!(err.to_string().contains("Databases/library.db"));
    }

    #[test]
    fn test_cold_run_survives_service_that_touches_source_on_start() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("media");
        let dest = tmp.path().join("backup");
        seed_layout(&source);

        // Real services write logs and pid files into their own data
        // directory the moment they come back up.
        let service = Arc::new(TouchOnStartService {
            inner: FakeService::new(true),
            touch: source.join("started.pid"),
        });
        let mut runner = make_runner(
            &source,
            &dest,
            BackupMode::Cold,
            service.clone(),
            CancellationToken::new(),
        );
        let result = runner.execute();
        runner.finish(result);

        assert_eq!(runner.state.status, BackupStatus::Completed);
        assert!(runner.state.errors.is_empty());
        assert_eq!(service.inner.starts.load(Ordering::SeqCst), 1);
        assert!(source.join("started.pid").is_file());
    }

    #[test]
    fn test_stop_failure_degrades_to_live_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("media");
        let dest = tmp.path().join("backup");
        seed_layout(&source);

        let service = Arc::new(FlakyService {
            inner: FakeService::new(true),
            fail_stop: true,
            fail_start: false,
        });
        let mut runner = make_runner(
            &source,
            &dest,
            BackupMode::Cold,
            service.clone(),
            CancellationToken::new(),
        );
        let result = runner.execute();
        runner.finish(result);

        assert_eq!(runner.state.status, BackupStatus::Completed);
        assert!(runner.state.errors.is_empty());
        assert!(runner
            .state
            .warnings
            .iter()
            .any(|w| w.contains("service stop failed")));
        assert!(dest.join("media/other.bin").is_file());
        // The service was never stopped, so no restart is attempted.
        assert_eq!(service.inner.starts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_restart_failure_after_good_copy_stays_completed() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("media");
        let dest = tmp.path().join("backup");
        seed_layout(&source);

        let service = Arc::new(FlakyService {
            inner: FakeService::new(true),
            fail_stop: false,
            fail_start: true,
        });
        let mut runner = make_runner(
            &source,
            &dest,
            BackupMode::Cold,
            service.clone(),
            CancellationToken::new(),
        );
        let result = runner.execute();
        runner.finish(result);

        assert_eq!(runner.state.status, BackupStatus::Completed);
        assert!(runner.state.errors.is_empty());
        assert!(runner
            .state
            .warnings
            .iter()
            .any(|w| w.contains("service restart failed")));
        assert_eq!(service.inner.stops.load(Ordering::SeqCst), 1);
        assert!(dest.join("media/Databases/library.db").is_file());
    }

    #[test]
    fn test_failed_run_reports_error_and_keeps_partial_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runner = make_runner(
            &tmp.path().join("missing"),
            &tmp.path().join("backup"),
            BackupMode::Hot,
            FakeService::new(false),
            CancellationToken::new(),
        );
        let result = runner.execute();
        runner.finish(result);
        assert_eq!(runner.state.status, BackupStatus::Failed);
        assert_eq!(runner.state.errors.len(), 1);
    }

    #[test]
    fn test_compressed_backup_replaces_tree_with_archive() {
        if which_missing("tar") {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("media");
        let dest = tmp.path().join("backup");
        seed_layout(&source);

        let service = FakeService::new(false);
        let cancel = CancellationToken::new();
        let mut config = ToolkitConfig::default();
        config.backup.use_mirror_tool = false;
        config.backup.stop_grace_secs = 0;
        let mut options = BackupOptions::new(&dest);
        options.mode = BackupMode::Hot;
        options.compress = true;
        let mut runner = BackupRunner::new(
            Arc::new(ToolkitContext::new(config)),
            Arc::new(FixedPathResolver::new(&source)),
            service,
            Arc::new(SqliteLibraryAdapter),
            Arc::new(JsonPreferencesStore),
            Arc::new(SystemArchiver),
            options,
            cancel,
            Arc::new(RwLock::new(BackupProgress::new())),
            ProgressBus::new(),
        );
        let result = runner.execute();
        runner.finish(result);

        assert_eq!(runner.state.status, BackupStatus::Completed);
        assert!(dest.join("media.tar.gz").is_file());
        assert!(!dest.join("media").exists());
        assert!(dest.join(crate::backup::MANIFEST_FILE_NAME).is_file());
    }

    fn which_missing(tool: &str) -> bool {
        std::process::Command::new(tool)
            .arg("--version")
            .output()
            .is_err()
    }
}
