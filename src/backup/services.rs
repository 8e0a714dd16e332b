//! Stopping and starting the services of the node.

use std::io;

use derive_more::{Display, Error};

use crate::config::BackupConfig;
use crate::shell::{Shell, ShellCommand};

/// Controls the managed services through the service-control executable.
///
/// Every stop/start is issued per service. A failing service is logged and
/// the batch carries on with the remaining ones.
#[derive(Debug, Clone)]
pub struct ServiceController {
    ctl_command: String,
    services: Vec<String>,
}

impl ServiceController {
    pub fn new(ctl_command: impl Into<String>, services: Vec<String>) -> Self {
        Self {
            ctl_command: ctl_command.into(),
            services,
        }
    }

    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(&config.ctl_command, config.managed_services.clone())
    }

    /// Stops every managed service not in `exclude`.
    ///
    /// The returned guard restarts all services once it is dropped, unless
    /// [StoppedServices::restart] was called before.
    pub fn stop_all<'a, S: Shell>(
        &'a self,
        shell: &'a S,
        exclude: &[&str],
    ) -> StoppedServices<'a, S> {
        log::info!(target: "backup::services", "Stopping services (except {})", exclude.join(", "));

        let failed = self
            .services
            .iter()
            .filter(|service| !exclude.contains(&service.as_str()))
            .filter_map(|service| self.control(shell, "stop", service).err())
            .collect();

        StoppedServices {
            controller: self,
            shell,
            failed,
            restarted: false,
        }
    }

    /// Starts every managed service. Starting a running service is a no-op.
    pub fn start_all<S: Shell>(&self, shell: &S) -> Vec<ServiceControlError> {
        log::info!(target: "backup::services", "Starting services");

        self.services
            .iter()
            .filter_map(|service| self.control(shell, "start", service).err())
            .collect()
    }

    fn control<S: Shell>(
        &self,
        shell: &S,
        action: &str,
        service: &str,
    ) -> Result<(), ServiceControlError> {
        let command = ShellCommand::new(&self.ctl_command).arg(action).arg(service);
        log::debug!(target: "backup::services", "{action} {service}");

        let result = match shell.run(&command) {
            Err(source) => Err(ServiceControlError::NotRun {
                service: service.to_string(),
                source,
            }),
            Ok(output) if !output.success => Err(ServiceControlError::Failed {
                service: service.to_string(),
                command: command.to_string(),
                output: output.output,
            }),
            Ok(_) => Ok(()),
        };

        if let Err(e) = &result {
            log::error!(target: "backup::services", "{e}");
        }
        result
    }
}

/// Services stopped for a backup run.
pub struct StoppedServices<'a, S: Shell> {
    controller: &'a ServiceController,
    shell: &'a S,
    failed: Vec<ServiceControlError>,
    restarted: bool,
}

impl<S: Shell> StoppedServices<'_, S> {
    /// Services that failed to stop.
    pub fn failed(&self) -> &[ServiceControlError] {
        &self.failed
    }

    /// Starts all services again, returning every stop and start failure.
    pub fn restart(mut self) -> Vec<ServiceControlError> {
        self.restarted = true;
        let mut failed = std::mem::take(&mut self.failed);
        failed.extend(self.controller.start_all(self.shell));
        failed
    }
}

impl<S: Shell> Drop for StoppedServices<'_, S> {
    fn drop(&mut self) {
        if !self.restarted {
            log::warn!(target: "backup::services", "Backup aborted, restarting services");
            let failed = self.failed.len() + self.controller.start_all(self.shell).len();
            if failed > 0 {
                log::error!(target: "backup::services", "{failed} services failed to stop or start");
            }
        }
    }
}

/// A single service couldn't be stopped or started.
#[derive(Debug, Display, Error)]
pub enum ServiceControlError {
    #[display("Controlling service {service} failed: {source}")]
    NotRun { service: String, source: io::Error },
    #[display("`{command}` failed for {service}: {output}")]
    Failed {
        service: String,
        command: String,
        output: String,
    },
}

impl ServiceControlError {
    pub fn service(&self) -> &str {
        match self {
            Self::NotRun { service, .. } | Self::Failed { service, .. } => service,
        }
    }
}
