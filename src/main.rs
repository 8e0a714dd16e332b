use std::process::ExitCode;

use chef_backup_lib::backup::BackupOrchestrator;
use chef_backup_lib::cli::{Action, Cli};
use chef_backup_lib::config::BackupConfig;
use chef_backup_lib::shell::SystemShell;

use clap::Parser;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    let mut config = match BackupConfig::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);

    if cli.dry_run {
        log::warn!("Running in dry-run mode");
    }

    match cli.action.unwrap_or_default() {
        Action::Backup => {
            let orchestrator = BackupOrchestrator::new(&config, SystemShell::new(cli.dry_run));
            match orchestrator.run() {
                Ok(report) => {
                    for failure in &report.service_failures {
                        log::warn!(target: "backup::services", "{failure}");
                    }
                    if cli.dry_run {
                        log::info!(
                            "Dry run, no archive was written to {}",
                            report.archive.display()
                        );
                    } else {
                        println!("{}", report.archive.display());
                    }
                    ExitCode::SUCCESS
                }
                Err(failure) => {
                    for service_failure in &failure.service_failures {
                        log::warn!(target: "backup::services", "{service_failure}");
                    }
                    log::error!("Backup failed: {failure}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
