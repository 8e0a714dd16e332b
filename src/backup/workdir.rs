//! Per-run working directory (`tmp_dir`).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

use super::BackupTime;

/// Working directory exclusively owned by one backup run.
///
/// The directory is removed by [WorkDir::cleanup], or on drop if the run
/// never got that far.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    removed: bool,
}

impl WorkDir {
    /// Creates `chef_backup-<backup_time>` below `root`.
    ///
    /// Fails if the directory already exists, since it would belong to
    /// another run.
    pub fn create(root: &Path, backup_time: &BackupTime) -> Result<Self, WorkDirError> {
        fs::create_dir_all(root).map_err(|source| WorkDirError::Create {
            path: root.to_path_buf(),
            source,
        })?;

        let path = root.join(format!("chef_backup-{backup_time}"));
        if path.is_relative() {
            log::warn!(target: "backup::workdir", "tmp_dir is relative: {}", path.display());
        }
        fs::create_dir(&path).map_err(|source| WorkDirError::Create {
            path: path.clone(),
            source,
        })?;
        log::debug!(target: "backup::workdir", "Created tmp_dir {}", path.display());

        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Top-level entries of the directory as names relative to it, sorted.
    pub fn entries(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.path)?
            .map(|entry| entry.map(|entry| PathBuf::from(entry.file_name())))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();

        Ok(entries)
    }

    /// Removes the directory and everything in it.
    pub fn cleanup(mut self) -> io::Result<()> {
        self.removed = true;
        log::info!(target: "backup::workdir", "Cleaning up {}", self.path.display());
        fs::remove_dir_all(&self.path)
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.removed {
            return;
        }

        log::warn!(target: "backup::workdir", "Removing abandoned tmp_dir {}", self.path.display());
        if let Err(e) = fs::remove_dir_all(&self.path) {
            log::error!(target: "backup::workdir", "Removing {} failed: {e}", self.path.display());
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum WorkDirError {
    #[display("Unable to create tmp_dir {}: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
}
