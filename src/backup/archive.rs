//! Packaging of the captured data into a tarball and its export.

use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

use super::BackupContext;
use crate::data_map::DataMap;
use crate::shell::{Shell, ShellCommand};

/// Bundles every registered directory and the content of the working
/// directory into `chef-backup-<backup_time>.tgz`.
pub struct TarballPackager<'a> {
    ctx: &'a BackupContext,
}

impl<'a> TarballPackager<'a> {
    pub fn new(ctx: &'a BackupContext) -> Self {
        Self { ctx }
    }

    pub fn tarball_name(&self) -> String {
        format!("chef-backup-{}.tgz", self.ctx.backup_time)
    }

    /// Builds the archive command.
    ///
    /// Inputs are the located data dirs of services, then those of configs,
    /// then the top-level entries of tmp_dir (`tmp_entries`, relative to it).
    /// The command runs inside tmp_dir so member names are relative.
    pub fn command(&self, data_map: &DataMap, tmp_entries: &[PathBuf]) -> ShellCommand {
        let data_dirs = data_map.data_dirs().map(|dir| dir.display().to_string());
        let tmp_entries = tmp_entries.iter().map(|entry| entry.display().to_string());

        ShellCommand::new("tar")
            .arg("-czf")
            .arg(self.tarball_name())
            .args(data_dirs)
            .args(tmp_entries)
            .current_dir(&self.ctx.tmp_dir)
    }

    /// Creates the archive and returns its path.
    pub fn create<S: Shell>(
        &self,
        shell: &S,
        data_map: &DataMap,
        tmp_entries: &[PathBuf],
    ) -> Result<PathBuf, PackagingError> {
        let tarball = self.ctx.tmp_dir.join(self.tarball_name());
        log::info!(target: "backup::archive", "Creating backup tarball {}", tarball.display());

        let command = self.command(data_map, tmp_entries);
        let output = shell.run(&command).map_err(|source| PackagingError::NotRun {
            command: command.to_string(),
            source,
        })?;
        if !output.success {
            return Err(PackagingError::Failed {
                command: command.to_string(),
                output: output.output,
            });
        }

        Ok(tarball)
    }
}

/// Syncs the finished archive to the export directory.
pub struct Exporter<'a> {
    ctx: &'a BackupContext,
}

impl<'a> Exporter<'a> {
    pub fn new(ctx: &'a BackupContext) -> Self {
        Self { ctx }
    }

    /// Copies `tarball` into the export directory, creating it if needed.
    ///
    /// The source is left in place, removing it is up to the cleanup.
    pub fn export<S: Shell>(&self, shell: &S, tarball: &Path) -> Result<PathBuf, ExportError> {
        let export_dir = &self.ctx.export_dir;
        log::info!(target: "backup::archive", "Exporting tarball to {}", export_dir.display());

        let file_name = tarball
            .file_name()
            .ok_or_else(|| ExportError::InvalidTarball(tarball.to_path_buf()))?;

        let mkdir = ShellCommand::new("mkdir")
            .arg("-p")
            .arg(export_dir.display().to_string());
        run(shell, &mkdir)?;

        // checksum, human readable, archive mode, compress in transit
        let rsync = ShellCommand::new("rsync")
            .arg("-chaz")
            .arg(tarball.display().to_string())
            .arg(format!("{}/", export_dir.display()));
        run(shell, &rsync)?;

        Ok(export_dir.join(file_name))
    }
}

fn run<S: Shell>(shell: &S, command: &ShellCommand) -> Result<(), ExportError> {
    let output = shell.run(command).map_err(|source| ExportError::NotRun {
        command: command.to_string(),
        source,
    })?;
    if !output.success {
        return Err(ExportError::Failed {
            command: command.to_string(),
            output: output.output,
        });
    }

    Ok(())
}

#[derive(Debug, Display, Error)]
pub enum PackagingError {
    #[display("Running `{command}` failed: {source}")]
    NotRun { command: String, source: io::Error },
    #[display("`{command}` failed: {output}")]
    Failed { command: String, output: String },
}

#[derive(Debug, Display, Error)]
pub enum ExportError {
    #[display("Not a tarball: {}", _0.display())]
    InvalidTarball(#[error(ignore)] PathBuf),
    #[display("Running `{command}` failed: {source}")]
    NotRun { command: String, source: io::Error },
    #[display("`{command}` failed: {output}")]
    Failed { command: String, output: String },
}
