//! Archive packing via the platform's own tools.
//!
//! Codec work stays out of process: the adapter shells out to `tar`, `zip`
//! and `7z`. A tool that is not installed surfaces as a configuration error
//! at call time, not at startup.

use crate::adapters::CompressionAdapter;
use crate::error::{Result, ToolkitError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    None,
    Zip,
    TarGz,
    TarBz2,
    TarXz,
    SevenZip,
}

impl ArchiveFormat {
    /// Classify a path by extension. Anything unrecognized is `None`,
    /// meaning "treat as a plain directory or file".
    pub fn detect(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if name.ends_with(".tar.bz2") {
            ArchiveFormat::TarBz2
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            ArchiveFormat::TarXz
        } else if name.ends_with(".zip") {
            ArchiveFormat::Zip
        } else if name.ends_with(".7z") {
            ArchiveFormat::SevenZip
        } else {
            ArchiveFormat::None
        }
    }

    pub fn extension(&self) -> Option<&'static str> {
        match self {
            ArchiveFormat::None => None,
            ArchiveFormat::Zip => Some("zip"),
            ArchiveFormat::TarGz => Some("tar.gz"),
            ArchiveFormat::TarBz2 => Some("tar.bz2"),
            ArchiveFormat::TarXz => Some("tar.xz"),
            ArchiveFormat::SevenZip => Some("7z"),
        }
    }
}

impl std::str::FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ArchiveFormat::None),
            "zip" => Ok(ArchiveFormat::Zip),
            "tar.gz" | "targz" | "tgz" => Ok(ArchiveFormat::TarGz),
            "tar.bz2" | "tarbz2" => Ok(ArchiveFormat::TarBz2),
            "tar.xz" | "tarxz" => Ok(ArchiveFormat::TarXz),
            "7z" | "7zip" => Ok(ArchiveFormat::SevenZip),
            other => Err(format!("unknown archive format '{other}'")),
        }
    }
}

pub struct SystemArchiver;

impl SystemArchiver {
    fn run(&self, mut command: Command, tool: &str) -> Result<()> {
        let status = command.status().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ToolkitError::Configuration(format!("'{tool}' is not installed"))
            } else {
                ToolkitError::Io(e)
            }
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(ToolkitError::Io(std::io::Error::other(format!(
                "{tool} exited with {status}"
            ))))
        }
    }
}

impl CompressionAdapter for SystemArchiver {
    fn detect_format(&self, path: &Path) -> ArchiveFormat {
        ArchiveFormat::detect(path)
    }

    fn compress(&self, source_dir: &Path, archive: &Path, format: ArchiveFormat) -> Result<()> {
        if let Some(parent) = archive.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match format {
            ArchiveFormat::None => Err(ToolkitError::Configuration(
                "no archive format selected".to_string(),
            )),
            ArchiveFormat::TarGz | ArchiveFormat::TarBz2 | ArchiveFormat::TarXz => {
                let flag = match format {
                    ArchiveFormat::TarGz => "-czf",
                    ArchiveFormat::TarBz2 => "-cjf",
                    _ => "-cJf",
                };
                let mut cmd = Command::new("tar");
                cmd.arg(flag).arg(archive).arg("-C").arg(source_dir).arg(".");
                self.run(cmd, "tar")
            }
            ArchiveFormat::Zip => {
                let mut cmd = Command::new("zip");
                cmd.current_dir(source_dir)
                    .arg("-qr")
                    .arg(absolute(archive)?)
                    .arg(".");
                self.run(cmd, "zip")
            }
            ArchiveFormat::SevenZip => {
                let mut cmd = Command::new("7z");
                cmd.current_dir(source_dir)
                    .arg("a")
                    .arg(absolute(archive)?)
                    .arg(".");
                self.run(cmd, "7z")
            }
        }
    }

    fn decompress(&self, archive: &Path, dest_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dest_dir)?;
        match ArchiveFormat::detect(archive) {
            ArchiveFormat::None => Err(ToolkitError::Configuration(format!(
                "'{}' is not a recognized archive",
                archive.display()
            ))),
            ArchiveFormat::TarGz | ArchiveFormat::TarBz2 | ArchiveFormat::TarXz => {
                let mut cmd = Command::new("tar");
                cmd.arg("-xf").arg(archive).arg("-C").arg(dest_dir);
                self.run(cmd, "tar")
            }
            ArchiveFormat::Zip => {
                let mut cmd = Command::new("unzip");
                cmd.arg("-q").arg(archive).arg("-d").arg(dest_dir);
                self.run(cmd, "unzip")
            }
            ArchiveFormat::SevenZip => {
                let mut cmd = Command::new("7z");
                let mut out = std::ffi::OsString::from("-o");
                out.push(dest_dir);
                cmd.arg("x").arg(archive).arg(out).arg("-y");
                self.run(cmd, "7z")
            }
        }
    }
}

fn absolute(path: &Path) -> Result<std::path::PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
