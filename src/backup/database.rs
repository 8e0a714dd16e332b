//! Dump of the primary database into the working directory.

use std::fs;
use std::io;
use std::path::PathBuf;

use derive_more::{Display, Error};

use super::BackupContext;
use crate::config::DatabaseConfig;
use crate::data_map::DataMap;
use crate::shell::{Shell, ShellCommand};

/// Dumps the database with `pg_dumpall`.
///
/// Only exists for nodes holding data, see [DatabaseDumper::new].
pub struct DatabaseDumper<'a> {
    ctx: &'a BackupContext,
    database: &'a DatabaseConfig,
}

impl<'a> DatabaseDumper<'a> {
    /// Returns [None] on a [frontend](crate::topology::Role::Frontend), which
    /// has no database to dump.
    pub fn new(ctx: &'a BackupContext, database: &'a DatabaseConfig) -> Option<Self> {
        if !ctx.role.holds_data() {
            return None;
        }

        Some(Self { ctx, database })
    }

    /// File the dump is written to.
    pub fn dump_path(&self) -> PathBuf {
        self.ctx
            .tmp_dir
            .join(format!("chef_backup-{}.sql", self.ctx.backup_time))
    }

    /// Dumps the database and records the success in `data_map`.
    ///
    /// The database service has to be registered in `data_map` already.
    /// A partially written dump is removed on failure.
    pub fn dump<S: Shell>(
        &self,
        shell: &S,
        data_map: &mut DataMap,
    ) -> Result<PathBuf, DumpError> {
        let DatabaseConfig {
            service,
            username,
            bin_dir,
        } = self.database;
        if data_map.service(service).is_none() {
            return Err(DumpError::NotRegistered(service.clone()));
        }

        let dump_path = self.dump_path();
        log::info!(target: "backup::database", "Dumping {service} database to {}", dump_path.display());
        log::trace!(target: "backup::database", "Using dbuser '{username}' for backup");

        // the dump runs unprivileged and has to be able to write into tmp_dir
        let chown = ShellCommand::new("chown")
            .arg("-R")
            .arg(username)
            .arg(self.ctx.tmp_dir.display().to_string());
        run(shell, &chown)?;

        let pg_dumpall = ShellCommand::new(bin_dir.join("pg_dumpall").display().to_string())
            .arg("-c")
            .arg("-f")
            .arg(dump_path.display().to_string())
            .run_as(username);
        if let Err(e) = run(shell, &pg_dumpall) {
            self.discard_partial_dump();
            return Err(e);
        }

        data_map
            .record_pg_dump(service, username)
            .map_err(|_| DumpError::NotRegistered(service.clone()))?;
        log::info!(target: "backup::database", "Finished {service} database dump");

        Ok(dump_path)
    }

    fn discard_partial_dump(&self) {
        let dump_path = self.dump_path();
        match fs::remove_file(&dump_path) {
            Ok(()) => {
                log::warn!(target: "backup::database", "Removed partial dump {}", dump_path.display())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                log::error!(target: "backup::database", "Removing partial dump {} failed: {e}", dump_path.display())
            }
        }
    }
}

fn run<S: Shell>(shell: &S, command: &ShellCommand) -> Result<(), DumpError> {
    let output = shell.run(command).map_err(|source| DumpError::NotRun {
        command: command.to_string(),
        source,
    })?;
    if !output.success {
        return Err(DumpError::Failed {
            command: command.to_string(),
            output: output.output,
        });
    }

    Ok(())
}

/// Errors on dumping the database.
#[derive(Debug, Display, Error)]
pub enum DumpError {
    /// The database service wasn't registered before the dump.
    #[display("Database service {_0} is not registered in the data map")]
    NotRegistered(#[error(ignore)] String),
    /// The command couldn't be started.
    #[display("Running `{command}` failed: {source}")]
    NotRun { command: String, source: io::Error },
    /// The command exited unsuccessfully.
    #[display("`{command}` failed: {output}")]
    Failed { command: String, output: String },
}
