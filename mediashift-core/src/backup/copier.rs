//! Tree copying.
//!
//! Full copies prefer the platform bulk-mirror tool (robocopy on Windows,
//! rsync elsewhere) and fall back to a portable recursive walk when the tool
//! is missing. Incremental copies always take the portable path, which is
//! functionally complete on its own: exclusions, manifest diffing and
//! metadata preservation do not depend on the fast path.

use crate::backup::manifest::{relative_key, unix_mtime, BackupManifest};
use crate::error::{Result, ToolkitError};
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Default, Clone, Copy)]
pub struct CopyStats {
    pub files_copied: u64,
    pub files_skipped: u64,
    pub bytes_copied: u64,
}

/// Copy-loop notifications consumed by the owning worker.
pub enum CopyEvent<'a> {
    FileCopied { relative: &'a str, bytes: u64 },
    FileSkipped { relative: &'a str },
    /// Heartbeat while the bulk-mirror tool runs; carries an estimated
    /// byte increment.
    BytesNudge { bytes: u64 },
    Warning { message: String },
}

pub struct TreeCopier<'a> {
    cancel: &'a CancellationToken,
    exclude: &'a [String],
    use_mirror_tool: bool,
}

impl<'a> TreeCopier<'a> {
    pub fn new(cancel: &'a CancellationToken, exclude: &'a [String], use_mirror_tool: bool) -> Self {
        TreeCopier {
            cancel,
            exclude,
            use_mirror_tool,
        }
    }

    /// Count files and bytes under `root`, honoring the exclusion set.
    pub fn scan(&self, root: &Path) -> (u64, u64) {
        let mut files = 0u64;
        let mut bytes = 0u64;
        for entry in walk(root, self.exclude).flatten() {
            if entry.file_type().is_file() {
                files += 1;
                bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        (files, bytes)
    }

    /// Copy `source` into `dest`.
    ///
    /// With a prior manifest only changed or unrecorded files are copied.
    /// Per-file failures surface as `CopyEvent::Warning` and do not abort;
    /// cancellation is honored between files, never mid-file.
    pub fn copy_tree(
        &self,
        source: &Path,
        dest: &Path,
        prior: Option<&BackupManifest>,
        on_event: &mut dyn FnMut(CopyEvent),
    ) -> Result<CopyStats> {
        if prior.is_none() && self.use_mirror_tool {
            if let Some(stats) = self.mirror_copy(source, dest, on_event)? {
                return Ok(stats);
            }
            debug!("bulk-mirror tool unavailable, using portable copy");
        }
        self.portable_copy(source, dest, prior, on_event)
    }

    fn portable_copy(
        &self,
        source: &Path,
        dest: &Path,
        prior: Option<&BackupManifest>,
        on_event: &mut dyn FnMut(CopyEvent),
    ) -> Result<CopyStats> {
        let mut stats = CopyStats::default();
        std::fs::create_dir_all(dest)?;

        for entry in walk(source, self.exclude) {
            if self.cancel.is_cancelled() {
                return Err(ToolkitError::Cancelled);
            }
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    on_event(CopyEvent::Warning {
                        message: format!("walk error: {e}"),
                    });
                    continue;
                }
            };
            let relative = relative_key(entry.path(), source);
            if relative.is_empty() {
                continue;
            }
            let target = dest.join(entry.path().strip_prefix(source).unwrap_or(entry.path()));

            if entry.file_type().is_dir() {
                if let Err(e) = std::fs::create_dir_all(&target) {
                    on_event(CopyEvent::Warning {
                        message: format!("cannot create {relative}: {e}"),
                    });
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }

            if let Some(manifest) = prior {
                match entry.metadata() {
                    Ok(meta) => {
                        if manifest.is_unchanged(&relative, meta.len(), unix_mtime(&meta)) {
                            stats.files_skipped += 1;
                            on_event(CopyEvent::FileSkipped {
                                relative: &relative,
                            });
                            continue;
                        }
                    }
                    Err(e) => {
                        on_event(CopyEvent::Warning {
                            message: format!("cannot stat {relative}: {e}"),
                        });
                        continue;
                    }
                }
            }

            match copy_file_with_metadata(entry.path(), &target) {
                Ok(bytes) => {
                    stats.files_copied += 1;
                    stats.bytes_copied += bytes;
                    on_event(CopyEvent::FileCopied {
                        relative: &relative,
                        bytes,
                    });
                }
                Err(e) => {
                    on_event(CopyEvent::Warning {
                        message: format!("cannot copy {relative}: {e}"),
                    });
                }
            }
        }

        Ok(stats)
    }

    /// Run the platform bulk-mirror tool. `Ok(None)` means the tool is not
    /// installed and the caller should fall back; a tool that runs and fails
    /// is a hard error.
    fn mirror_copy(
        &self,
        source: &Path,
        dest: &Path,
        on_event: &mut dyn FnMut(CopyEvent),
    ) -> Result<Option<CopyStats>> {
        let (files_total, bytes_total) = self.scan(source);
        std::fs::create_dir_all(dest)?;
        let mut command = mirror_command(source, dest, self.exclude);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut nudged = 0u64;
        let status = loop {
            if self.cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolkitError::Cancelled);
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    std::thread::sleep(Duration::from_secs(1));
                    let step = (bytes_total.saturating_sub(nudged)).min(1024 * 1024);
                    if step > 0 {
                        nudged += step;
                        on_event(CopyEvent::BytesNudge { bytes: step });
                    }
                }
            }
        };

        if !mirror_succeeded(&status) {
            return Err(ToolkitError::Io(std::io::Error::other(format!(
                "bulk-mirror tool exited with {status}"
            ))));
        }
        let remainder = bytes_total.saturating_sub(nudged);
        if remainder > 0 {
            on_event(CopyEvent::BytesNudge { bytes: remainder });
        }
        Ok(Some(CopyStats {
            files_copied: files_total,
            files_skipped: 0,
            bytes_copied: bytes_total,
        }))
    }
}

pub(crate) fn walk<'a>(
    root: &Path,
    exclude: &'a [String],
) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |entry| entry.depth() == 0 || !should_exclude(entry.file_name(), exclude))
}

/// Exclusion rule: a pattern starting with '.' matches a file-name suffix
/// (".log" matches "server.log"), anything else matches a whole path
/// component ("Cache" prunes the Cache directory).
pub fn should_exclude(name: &std::ffi::OsStr, patterns: &[String]) -> bool {
    let name = name.to_string_lossy();
    patterns.iter().any(|pattern| {
        if let Some(suffix) = pattern.strip_prefix('.') {
            name.ends_with(&format!(".{suffix}"))
        } else {
            name == pattern.as_str()
        }
    })
}

/// Copy one file, creating parent directories and carrying the source mtime
/// over so manifest diffs stay valid across runs.
pub fn copy_file_with_metadata(source: &Path, dest: &Path) -> std::io::Result<u64> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = std::fs::copy(source, dest)?;
    match std::fs::metadata(source).and_then(|meta| {
        let modified = meta.modified()?;
        std::fs::File::options()
            .write(true)
            .open(dest)?
            .set_modified(modified)
    }) {
        Ok(()) => {}
        Err(e) => warn!(dest = %dest.display(), "could not carry mtime over: {e}"),
    }
    Ok(bytes)
}

fn mirror_command(source: &Path, dest: &Path, exclude: &[String]) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("robocopy");
        cmd.arg(source).arg(dest);
        cmd.args(["/MIR", "/MT:8", "/R:3", "/W:5"]);
        let dirs: Vec<&String> = exclude.iter().filter(|p| !p.starts_with('.')).collect();
        if !dirs.is_empty() {
            cmd.arg("/XD");
            cmd.args(dirs);
        }
        let files: Vec<String> = exclude
            .iter()
            .filter(|p| p.starts_with('.'))
            .map(|p| format!("*{p}"))
            .collect();
        if !files.is_empty() {
            cmd.arg("/XF");
            cmd.args(files);
        }
        cmd
    } else {
        let mut cmd = Command::new("rsync");
        cmd.args(["-a", "--delete"]);
        for pattern in exclude {
            if pattern.starts_with('.') {
                cmd.arg(format!("--exclude=*{pattern}"));
            } else {
                cmd.arg(format!("--exclude={pattern}"));
            }
        }
        let mut src = source.as_os_str().to_os_string();
        src.push("/");
        cmd.arg(src).arg(dest);
        cmd
    }
}

fn mirror_succeeded(status: &std::process::ExitStatus) -> bool {
    if cfg!(windows) {
        // robocopy exit codes below 8 mean copied/extra/mismatched, not failure
        status.code().is_some_and(|code| code < 8)
    } else {
        status.success()
    }
}
