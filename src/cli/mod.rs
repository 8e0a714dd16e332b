use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::config::{BackupConfig, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Path of the config file. Created with defaults if it doesn't exist.
    #[arg(long, short = 'c', env = "CHEF_BACKUP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Backup mode, overrides the config file.
    #[arg(long, value_parser = ["online", "offline"])]
    pub mode: Option<String>,

    /// Directory the archive is exported to, overrides the config file.
    #[arg(long, short = 'e')]
    pub export_dir: Option<PathBuf>,

    /// Only back up the config directories.
    #[arg(long)]
    pub config_only: bool,

    /// Log the external commands instead of running them.
    #[arg(long)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub action: Option<Action>,
}

impl Cli {
    /// Applies the command line overrides to `config`.
    pub fn apply(&self, config: &mut BackupConfig) {
        if let Some(mode) = &self.mode {
            config.mode = Some(mode.clone());
        }
        if let Some(export_dir) = &self.export_dir {
            config.export_dir = export_dir.clone();
        }
        config.config_only |= self.config_only;
    }
}

#[derive(Subcommand, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Backup the configs, database and service data of the node. (Default)
    #[default]
    Backup,
}
