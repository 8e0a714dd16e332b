//! Orchestration of a backup run.
//!
//! A run is a fixed sequence of [Step]s picked from a dispatch table by the
//! [Role] and [Mode] of the node (see [plan]). Two resources are acquired
//! along the way and always released, no matter which step fails:
//!
//! - the working directory, removed by [WorkDir::cleanup],
//! - stopped services, restarted by [StoppedServices].
//!
//! The individual steps live in the sub-modules:
//!
//! - [services]: stopping and starting the managed services.
//! - [database]: dump of the primary database.
//! - [populate]: discovery of config and service directories.
//! - [manifest]: `manifest.json` describing the archive.
//! - [archive]: creation of the tarball and its export.

pub mod archive;
pub mod database;
pub mod manifest;
pub mod populate;
pub mod services;
pub mod workdir;

use std::path::PathBuf;

use chrono::{Local, NaiveDateTime};
use derive_more::{Display, Error, From};

pub use archive::{ExportError, Exporter, PackagingError, TarballPackager};
pub use database::{DatabaseDumper, DumpError};
pub use manifest::{ManifestError, ManifestWriter};
pub use populate::DataMapPopulator;
pub use services::{ServiceControlError, ServiceController, StoppedServices};
pub use workdir::{WorkDir, WorkDirError};

use crate::config::BackupConfig;
use crate::data_map::{DataMap, DataMapError};
use crate::shell::Shell;
use crate::topology::{ConfigurationError, Mode, Role, Topology};

const BACKUP_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

/// Timestamp naming every artifact of one run.
#[derive(Debug, Clone, PartialEq, Eq, Display, serde::Serialize)]
#[display("{_0}")]
pub struct BackupTime(String);

impl BackupTime {
    pub fn now() -> Self {
        Self::at(Local::now().naive_local())
    }

    pub fn at(time: NaiveDateTime) -> Self {
        Self(time.format(BACKUP_TIME_FORMAT).to_string())
    }
}

/// Parameters of one backup run. Fixed once the run started.
#[derive(Debug, Clone)]
pub struct BackupContext {
    pub role: Role,
    pub mode: Mode,
    pub config_only: bool,
    pub tmp_dir: PathBuf,
    pub backup_time: BackupTime,
    pub export_dir: PathBuf,
}

/// A single step of a backup run.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum Step {
    #[display("Registering config and service directories")]
    Populate,
    #[display("Stopping services")]
    StopServices,
    #[display("Dumping database")]
    DumpDatabase,
    #[display("Writing manifest")]
    WriteManifest,
    #[display("Creating tarball")]
    CreateTarball,
    #[display("Starting services")]
    StartServices,
    #[display("Exporting tarball")]
    Export,
    #[display("Cleaning up")]
    Cleanup,
}

const OFFLINE: &[Step] = &[
    Step::Populate,
    Step::StopServices,
    Step::DumpDatabase,
    Step::WriteManifest,
    Step::CreateTarball,
    Step::StartServices,
    Step::Export,
];

const ONLINE: &[Step] = &[
    Step::Populate,
    Step::DumpDatabase,
    Step::WriteManifest,
    Step::CreateTarball,
    Step::Export,
];

const CONFIG_ONLY: &[Step] = &[
    Step::Populate,
    Step::WriteManifest,
    Step::CreateTarball,
    Step::Export,
];

/// Steps of a run on a node with the given topology.
///
/// [Step::Cleanup] is not part of any plan, it runs after every run.
pub fn plan(topology: Topology, config_only: bool) -> &'static [Step] {
    match (topology.role, topology.mode) {
        _ if config_only => CONFIG_ONLY,
        (Role::Frontend, _) => CONFIG_ONLY,
        (Role::Backend | Role::Standalone, Mode::Online) => ONLINE,
        (Role::Backend | Role::Standalone, Mode::Offline) => OFFLINE,
    }
}

/// Outcome of a successful run.
#[derive(Debug)]
pub struct BackupReport {
    /// Location of the archive in the export directory.
    pub archive: PathBuf,
    /// Steps in the order they completed.
    pub steps: Vec<Step>,
    /// Services that failed to stop or start.
    pub service_failures: Vec<ServiceControlError>,
}

/// Runs backups of a node.
pub struct BackupOrchestrator<'a, S: Shell> {
    config: &'a BackupConfig,
    shell: S,
    services: ServiceController,
}

impl<'a, S: Shell> BackupOrchestrator<'a, S> {
    pub fn new(config: &'a BackupConfig, shell: S) -> Self {
        Self {
            config,
            shell,
            services: ServiceController::from_config(config),
        }
    }

    /// Performs one backup run.
    ///
    /// Services stopped by the run are started again and the working
    /// directory is removed before this returns, also on failure.
    pub fn run(&self) -> Result<BackupReport, BackupFailure> {
        // resolve before touching anything
        let topology = Topology::resolve(self.config).map_err(BackupError::from)?;
        let config_only = self.config.config_only;
        let steps = plan(topology, config_only);

        let backup_time = BackupTime::now();
        log::info!(
            target: "backup",
            "Starting {role} backup {backup_time}{config_only}",
            role = topology.role,
            config_only = if config_only { " (config only)" } else { "" }
        );

        let workdir =
            WorkDir::create(&self.config.tmp_root(), &backup_time).map_err(BackupError::from)?;
        let ctx = BackupContext {
            role: topology.role,
            mode: topology.mode,
            config_only,
            tmp_dir: workdir.path().to_path_buf(),
            backup_time,
            export_dir: self.config.export_dir.clone(),
        };

        let mut report = BackupReport {
            archive: PathBuf::new(),
            steps: Vec::with_capacity(steps.len() + 1),
            service_failures: Vec::new(),
        };
        let mut stopped = None;
        let result = self.execute(&ctx, &workdir, steps, &mut report, &mut stopped);

        // an aborted pipeline may still hold services down
        if let Some(stopped) = stopped.take() {
            log::warn!(target: "backup", "Backup aborted, restarting services");
            let failed = stopped.restart();
            if !failed.is_empty() {
                log::error!(
                    target: "backup",
                    "{} service operations failed around the aborted backup",
                    failed.len()
                );
            }
            report.service_failures.extend(failed);
        }

        log::info!(target: "backup", "{}", Step::Cleanup);
        let cleanup = workdir.cleanup();

        match (result, cleanup) {
            (Ok(archive), Ok(())) => {
                report.steps.push(Step::Cleanup);
                report.archive = archive;
                log::info!(target: "backup", "Backup complete: {}", report.archive.display());
                Ok(report)
            }
            (Ok(archive), Err(source)) => {
                log::error!(
                    target: "backup",
                    "Archive exported to {}, but {} was left behind: {source}",
                    archive.display(),
                    ctx.tmp_dir.display()
                );
                Err(BackupFailure {
                    error: BackupError::Cleanup {
                        path: ctx.tmp_dir,
                        source,
                    },
                    service_failures: report.service_failures,
                })
            }
            (Err(error), cleanup) => {
                if let Err(e) = cleanup {
                    log::error!(target: "backup", "Removing {} failed: {e}", ctx.tmp_dir.display());
                }
                log::error!(target: "backup", "Backup aborted: {error}");
                Err(BackupFailure {
                    error,
                    service_failures: report.service_failures,
                })
            }
        }
    }

    fn execute<'s>(
        &'s self,
        ctx: &BackupContext,
        workdir: &WorkDir,
        steps: &[Step],
        report: &mut BackupReport,
        stopped: &mut Option<StoppedServices<'s, S>>,
    ) -> Result<PathBuf, BackupError> {
        let mut data_map = DataMap::new();
        let mut tarball = None;
        let mut exported = None;

        for &step in steps {
            log::info!(target: "backup", "{step}");
            match step {
                Step::Populate => {
                    DataMapPopulator::new(self.config, ctx).populate(&mut data_map)?;
                }
                Step::StopServices => {
                    let exclude = [
                        self.config.database.service.as_str(),
                        self.config.heartbeat_service.as_str(),
                    ];
                    *stopped = Some(self.services.stop_all(&self.shell, &exclude));
                }
                Step::DumpDatabase => {
                    let dumper = DatabaseDumper::new(ctx, &self.config.database)
                        .ok_or(BackupError::NoDatabase(ctx.role))?;
                    dumper.dump(&self.shell, &mut data_map)?;
                }
                Step::WriteManifest => {
                    ManifestWriter::new(ctx).write(&data_map)?;
                }
                Step::CreateTarball => {
                    let entries = workdir.entries().map_err(BackupError::ListTmpDir)?;
                    let packager = TarballPackager::new(ctx);
                    tarball = Some(packager.create(&self.shell, &data_map, &entries)?);
                }
                Step::StartServices => {
                    if let Some(stopped) = stopped.take() {
                        report.service_failures.extend(stopped.restart());
                    }
                }
                Step::Export => {
                    let tarball = tarball.as_deref().ok_or(BackupError::NoTarball)?;
                    exported = Some(Exporter::new(ctx).export(&self.shell, tarball)?);
                }
                Step::Cleanup => {}
            }
            report.steps.push(step);
        }

        exported.ok_or(BackupError::NoTarball)
    }
}

/// Fatal errors of a backup run.
#[derive(Debug, Display, Error, From)]
pub enum BackupError {
    #[display("Invalid configuration: {_0}")]
    Configuration(ConfigurationError),
    #[display("{_0}")]
    WorkDir(WorkDirError),
    #[display("Registering backup data failed: {_0}")]
    DataMap(DataMapError),
    #[display("Database dump failed: {_0}")]
    Dump(DumpError),
    #[display("{_0}")]
    Manifest(ManifestError),
    #[display("Creating the tarball failed: {_0}")]
    Packaging(PackagingError),
    #[display("Exporting the tarball failed: {_0}")]
    Export(ExportError),
    #[from(ignore)]
    #[display("Listing tmp_dir failed: {_0}")]
    ListTmpDir(std::io::Error),
    #[from(ignore)]
    #[display("Removing tmp_dir {} failed: {source}", path.display())]
    Cleanup { path: PathBuf, source: std::io::Error },
    #[from(ignore)]
    #[display("A {_0} node has no database to dump")]
    NoDatabase(#[error(ignore)] Role),
    #[from(ignore)]
    #[display("No tarball was created")]
    NoTarball,
}

/// A failed run together with the services that misbehaved on the way.
#[derive(Debug, Display, Error)]
#[display("{error}")]
pub struct BackupFailure {
    #[error(source)]
    pub error: BackupError,
    /// Services that failed to stop or start, including the restart after
    /// the abort.
    pub service_failures: Vec<ServiceControlError>,
}

impl From<BackupError> for BackupFailure {
    fn from(error: BackupError) -> Self {
        Self {
            error,
            service_failures: Vec::new(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;

    use chrono::NaiveDate;

    use super::*;
    use crate::shell::testing::FakeShell;

    /// Context with a fixed backup time and `tmp_dir` as working directory.
    pub(crate) fn context(tmp_dir: &Path, role: Role, mode: Mode) -> BackupContext {
        let time = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap();

        BackupContext {
            role,
            mode,
            config_only: false,
            tmp_dir: tmp_dir.to_path_buf(),
            backup_time: BackupTime::at(time),
            export_dir: tmp_dir.join("export"),
        }
    }

    struct Node {
        root: tempfile::TempDir,
        config: BackupConfig,
    }

    impl Node {
        fn new(role: &str, mode: Option<&str>) -> Self {
            let root = tempfile::tempdir().unwrap();
            let dir = |path: &str| {
                let dir = root.path().join(path);
                fs::create_dir_all(&dir).unwrap();
                dir
            };
            let config = BackupConfig {
                role: role.into(),
                mode: mode.map(Into::into),
                export_dir: root.path().join("export"),
                tmp_root: Some(root.path().join("tmp")),
                config_root: root.path().join("etc"),
                config_dirs: vec!["X".into(), "not-installed".into()],
                ctl_command: "chef-server-ctl".into(),
                managed_services: ["nginx", "A", "B", "postgresql", "keepalived"]
                    .map(String::from)
                    .to_vec(),
                heartbeat_service: "keepalived".into(),
                stateful_services: ["A", "B", "postgresql"].map(String::from).to_vec(),
                data_dirs: BTreeMap::from([
                    ("A".to_string(), dir("data/A")),
                    ("B".to_string(), dir("data/B")),
                    ("postgresql".to_string(), dir("data/pg")),
                ]),
                version_manifest: None,
                ..Default::default()
            };

            dir("etc/X");
            Self { root, config }
        }

        fn path(&self, path: &str) -> String {
            self.root.path().join(path).display().to_string()
        }

        fn tmp_root_is_empty(&self) -> bool {
            fs::read_dir(self.root.path().join("tmp"))
                .unwrap()
                .next()
                .is_none()
        }
    }

    fn count(shell: &FakeShell, prefix: &str) -> usize {
        shell
            .lines()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    fn stops(shell: &FakeShell) -> Vec<String> {
        shell
            .lines()
            .into_iter()
            .filter_map(|line| line.strip_prefix("chef-server-ctl stop ").map(String::from))
            .collect()
    }

    #[test]
    fn dispatch_table() {
        let topology = |role, mode| Topology { role, mode };

        for mode in [Mode::Online, Mode::Offline] {
            assert_eq!(plan(topology(Role::Frontend, mode), false), CONFIG_ONLY);
            assert_eq!(plan(topology(Role::Backend, mode), true), CONFIG_ONLY);
        }
        for role in [Role::Backend, Role::Standalone] {
            assert_eq!(plan(topology(role, Mode::Online), false), ONLINE);
            assert_eq!(plan(topology(role, Mode::Offline), false), OFFLINE);
        }
    }

    #[test]
    fn services_are_only_stopped_in_offline_plans() {
        for steps in [OFFLINE, ONLINE, CONFIG_ONLY] {
            let stop = steps.iter().position(|s| *s == Step::StopServices);
            let start = steps.iter().position(|s| *s == Step::StartServices);
            match (stop, start) {
                (Some(stop), Some(start)) => assert!(stop < start),
                (None, None) => {}
                _ => panic!("unbalanced plan: {steps:?}"),
            }
            assert!(!steps.contains(&Step::Cleanup));
        }
    }

    #[test]
    fn offline_backend_scenario() {
        let node = Node::new("backend", Some("offline"));
        let shell = FakeShell::new();

        let report = BackupOrchestrator::new(&node.config, &shell).run().unwrap();

        assert_eq!(stops(&shell), ["nginx", "A", "B"]);
        assert_eq!(count(&shell, "chef-server-ctl start"), 5);
        assert_eq!(shell.count_program("pg_dumpall"), 1);
        assert_eq!(shell.count_program("tar"), 1);
        assert_eq!(shell.count_program("rsync"), 1);

        let tar = shell
            .commands()
            .into_iter()
            .find(|c| c.program() == "tar")
            .unwrap();
        let tmp_dir = tar.get_current_dir().unwrap().to_path_buf();
        let args = tar.get_args();
        let name = args[1].clone();
        assert!(name.starts_with("chef-backup-") && name.ends_with(".tgz"));
        let time = &name["chef-backup-".len()..name.len() - ".tgz".len()];
        assert_eq!(
            args[2..],
            [
                node.path("data/A"),
                node.path("data/B"),
                node.path("data/pg"),
                node.path("etc/X"),
                format!("chef_backup-{time}.sql"),
                "manifest.json".to_string(),
            ]
        );
        assert!(tmp_dir.starts_with(node.root.path().join("tmp")));

        // the database is dumped while services are down and restarted
        // before the export
        let lines = shell.lines();
        let position = |prefix: &str| lines.iter().position(|l| l.contains(prefix)).unwrap();
        assert!(position("stop nginx") < position("pg_dumpall"));
        assert!(position("pg_dumpall") < position("tar -czf"));
        assert!(position("tar -czf") < position("start nginx"));
        assert!(position("start nginx") < position("rsync"));

        assert_eq!(
            report.steps,
            [
                Step::Populate,
                Step::StopServices,
                Step::DumpDatabase,
                Step::WriteManifest,
                Step::CreateTarball,
                Step::StartServices,
                Step::Export,
                Step::Cleanup,
            ]
        );
        assert_eq!(report.archive, node.config.export_dir.join(&name));
        assert!(report.service_failures.is_empty());
        assert!(!tmp_dir.exists());
        assert!(node.tmp_root_is_empty());
    }

    #[test]
    fn unset_mode_behaves_offline() {
        for role in ["backend", "standalone"] {
            let node = Node::new(role, None);
            let shell = FakeShell::new();

            BackupOrchestrator::new(&node.config, &shell).run().unwrap();

            assert_eq!(stops(&shell), ["nginx", "A", "B"]);
            assert!(count(&shell, "chef-server-ctl start") >= 1);
            assert_eq!(shell.count_program("pg_dumpall"), 1);
        }
    }

    #[test]
    fn online_never_touches_services() {
        for role in ["backend", "standalone"] {
            let node = Node::new(role, Some("online"));
            let shell = FakeShell::new();

            let report = BackupOrchestrator::new(&node.config, &shell).run().unwrap();

            assert_eq!(shell.count_program("chef-server-ctl"), 0);
            assert_eq!(shell.count_program("pg_dumpall"), 1);
            assert_eq!(shell.count_program("rsync"), 1);
            assert_eq!(report.steps.last(), Some(&Step::Cleanup));
            assert!(node.tmp_root_is_empty());
        }
    }

    #[test]
    fn frontend_never_stops_or_dumps() {
        for mode in [None, Some("online"), Some("offline")] {
            let node = Node::new("frontend", mode);
            let shell = FakeShell::new();

            BackupOrchestrator::new(&node.config, &shell).run().unwrap();

            assert_eq!(shell.count_program("chef-server-ctl"), 0);
            assert_eq!(shell.count_program("pg_dumpall"), 0);
            assert_eq!(shell.count_program("chown"), 0);

            let tar = shell
                .commands()
                .into_iter()
                .find(|c| c.program() == "tar")
                .unwrap();
            assert_eq!(
                tar.get_args()[2..],
                [node.path("etc/X"), "manifest.json".to_string()]
            );
            assert!(node.tmp_root_is_empty());
        }
    }

    #[test]
    fn config_only_skips_services_and_dump() {
        let mut node = Node::new("standalone", Some("offline"));
        node.config.config_only = true;
        let shell = FakeShell::new();

        BackupOrchestrator::new(&node.config, &shell).run().unwrap();

        assert_eq!(shell.count_program("chef-server-ctl"), 0);
        assert_eq!(shell.count_program("pg_dumpall"), 0);
        assert_eq!(shell.count_program("tar"), 1);
    }

    #[test]
    fn failed_dump_restarts_services_and_cleans_up() {
        let node = Node::new("backend", Some("offline"));
        let shell = FakeShell::new().fail_program("pg_dumpall");

        let err = BackupOrchestrator::new(&node.config, &shell)
            .run()
            .unwrap_err();

        assert!(matches!(err.error, BackupError::Dump(DumpError::Failed { .. })));
        assert_eq!(count(&shell, "chef-server-ctl start"), 5);
        assert_eq!(shell.count_program("tar"), 0);
        assert_eq!(shell.count_program("rsync"), 0);
        assert!(node.tmp_root_is_empty());
    }

    #[test]
    fn failed_tarball_restarts_services_and_cleans_up() {
        let node = Node::new("standalone", None);
        let shell = FakeShell::new().fail_program("tar");

        let err = BackupOrchestrator::new(&node.config, &shell)
            .run()
            .unwrap_err();

        assert!(matches!(err.error, BackupError::Packaging(_)));
        assert_eq!(count(&shell, "chef-server-ctl start"), 5);
        assert_eq!(shell.count_program("rsync"), 0);
        assert!(node.tmp_root_is_empty());
    }

    #[test]
    fn failed_export_still_cleans_up() {
        let node = Node::new("backend", Some("offline"));
        let shell = FakeShell::new().fail_program("rsync");

        let err = BackupOrchestrator::new(&node.config, &shell)
            .run()
            .unwrap_err();

        assert!(matches!(err.error, BackupError::Export(_)));
        // restarted once before the export, not again
        assert_eq!(count(&shell, "chef-server-ctl start"), 5);
        assert!(node.tmp_root_is_empty());
    }

    #[test]
    fn failed_service_control_is_reported_not_fatal() {
        let node = Node::new("backend", Some("offline"));
        let shell = FakeShell::new().fail_with_arg("chef-server-ctl", "A");

        let report = BackupOrchestrator::new(&node.config, &shell).run().unwrap();

        assert_eq!(
            report
                .service_failures
                .iter()
                .map(ServiceControlError::service)
                .collect::<Vec<_>>(),
            ["A", "A"]
        );
        assert_eq!(shell.count_program("rsync"), 1);
    }

    #[test]
    fn aborted_run_reports_service_failures() {
        let node = Node::new("backend", Some("offline"));
        let shell = FakeShell::new()
            .fail_program("pg_dumpall")
            .fail_with_arg("chef-server-ctl", "A");

        let err = BackupOrchestrator::new(&node.config, &shell)
            .run()
            .unwrap_err();

        assert!(matches!(err.error, BackupError::Dump(_)));
        assert_eq!(
            err.service_failures
                .iter()
                .map(ServiceControlError::service)
                .collect::<Vec<_>>(),
            ["A", "A"]
        );
        assert_eq!(count(&shell, "chef-server-ctl start"), 5);
    }

    #[test]
    fn failed_cleanup_fails_an_exported_run() {
        let node = Node::new("standalone", Some("online"));
        // swap tmp_dir for a plain file once it's packaged
        let shell = FakeShell::new().on_success("tar", |tar| {
            let tmp_dir = tar.get_current_dir().unwrap();
            fs::remove_dir_all(tmp_dir).unwrap();
            fs::write(tmp_dir, "").unwrap();
        });

        let err = BackupOrchestrator::new(&node.config, &shell)
            .run()
            .unwrap_err();

        assert!(matches!(
            err.error,
            BackupError::Cleanup { ref path, .. } if path.is_file()
        ));
        assert_eq!(shell.count_program("rsync"), 1);
    }

    #[test]
    fn unknown_role_fails_before_any_side_effect() {
        let node = Node::new("tier", Some("offline"));
        let shell = FakeShell::new();

        let err = BackupOrchestrator::new(&node.config, &shell)
            .run()
            .unwrap_err();

        assert!(matches!(err.error, BackupError::Configuration(_)));
        assert!(shell.commands().is_empty());
        assert!(!node.root.path().join("tmp").exists());
    }

    #[test]
    fn missing_database_entry_aborts_with_cleanup() {
        let mut node = Node::new("backend", Some("online"));
        node.config.stateful_services = vec!["A".into()];
        let shell = FakeShell::new();

        let err = BackupOrchestrator::new(&node.config, &shell)
            .run()
            .unwrap_err();

        assert!(matches!(err.error, BackupError::Dump(DumpError::NotRegistered(_))));
        assert!(node.tmp_root_is_empty());
    }
}
