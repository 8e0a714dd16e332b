//! Configuration of a backup run, read from a TOML file.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/chef-backup/config.toml";

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Everything a backup run needs to know about the node.
pub struct BackupConfig {
    /// Role of the node: `frontend`, `backend` or `standalone`.
    pub role: String,

    /// Backup mode: `online` or `offline`. Absent means offline.
    pub mode: Option<String>,

    /// Only back up the config directories.
    pub config_only: bool,

    /// Directory the finished archive is synced to.
    pub export_dir: PathBuf,

    /// Parent of the per-run working directory.
    ///
    /// Defaults to the temp dir of the system.
    pub tmp_root: Option<PathBuf>,

    /// Directory holding the config directories.
    pub config_root: PathBuf,

    /// Names of the config directories below [`config_root`](Self::config_root).
    pub config_dirs: Vec<String>,

    /// Executable controlling the services, invoked as `<ctl> stop|start <service>`.
    pub ctl_command: String,

    /// Services managed by [`ctl_command`](Self::ctl_command).
    pub managed_services: Vec<String>,

    /// Cluster membership/VIP service, never stopped.
    pub heartbeat_service: String,

    /// Services holding state that has to end up in the archive.
    pub stateful_services: Vec<String>,

    /// JSON version manifest of the installed product.
    pub version_manifest: Option<PathBuf>,

    /// Data directories of the [stateful services](Self::stateful_services).
    ///
    /// A stateful service without an entry is backed up as "not located".
    pub data_dirs: BTreeMap<String, PathBuf>,

    /// The database to dump.
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
/// Connection details of the primary database.
pub struct DatabaseConfig {
    /// Name of the database service. Never stopped.
    pub service: String,

    /// Database superuser the dump runs as.
    pub username: String,

    /// Directory containing `pg_dumpall`.
    pub bin_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            service: "postgresql".into(),
            username: "opscode-pgsql".into(),
            bin_dir: "/opt/opscode/embedded/bin".into(),
        }
    }
}

const STATEFUL_SERVICES: [&str; 5] = [
    "bookshelf",
    "opscode-solr4",
    "postgresql",
    "rabbitmq",
    "redis_lb",
];

const CONFIG_DIRS: [&str; 5] = [
    "opscode",
    "opscode-analytics",
    "opscode-manage",
    "opscode-push-jobs-server",
    "opscode-reporting",
];

const MANAGED_SERVICES: [&str; 10] = [
    "bookshelf",
    "keepalived",
    "nginx",
    "oc_bifrost",
    "oc_id",
    "opscode-erchef",
    "opscode-solr4",
    "postgresql",
    "rabbitmq",
    "redis_lb",
];

impl Default for BackupConfig {
    fn default() -> Self {
        let data_dirs = STATEFUL_SERVICES
            .iter()
            .map(|service| {
                let dir = PathBuf::from("/var/opt/opscode").join(service);
                (service.to_string(), dir)
            })
            .collect();

        Self {
            role: "standalone".into(),
            mode: None,
            config_only: false,
            export_dir: "/var/opt/chef-backup".into(),
            tmp_root: None,
            config_root: "/etc".into(),
            config_dirs: CONFIG_DIRS.map(String::from).to_vec(),
            ctl_command: "chef-server-ctl".into(),
            managed_services: MANAGED_SERVICES.map(String::from).to_vec(),
            heartbeat_service: "keepalived".into(),
            stateful_services: STATEFUL_SERVICES.map(String::from).to_vec(),
            data_dirs,
            database: DatabaseConfig::default(),
            version_manifest: Some("/opt/opscode/version-manifest.json".into()),
        }
    }
}

impl BackupConfig {
    /// Reads the config file at `path`.
    ///
    /// A missing file yields the default configuration, which is then written
    /// to `path` so it can be adjusted for the next run.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigFileError> {
        match std::fs::read_to_string(path) {
            Ok(config_str) => Ok(toml::from_str(&config_str)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(
                    target: "config",
                    "Writing default config to {} because it doesn't exist yet",
                    path.display()
                );
                let default_config = Self::default();
                let config_str = toml::to_string_pretty(&default_config)?;
                let written = path
                    .parent()
                    .map_or(Ok(()), std::fs::create_dir_all)
                    .and_then(|()| std::fs::write(path, config_str));
                if let Err(e) = written {
                    log::warn!(
                        target: "config",
                        "Writing default config to {} failed: {e}",
                        path.display()
                    );
                }

                Ok(default_config)
            }
            Err(e) => Err(ConfigFileError::Read(e)),
        }
    }

    /// Location of a config directory.
    pub fn config_dir(&self, name: &str) -> PathBuf {
        self.config_root.join(name)
    }

    /// Data directory of a stateful service, if known.
    pub fn data_dir(&self, service: &str) -> Option<&Path> {
        self.data_dirs.get(service).map(PathBuf::as_path)
    }

    /// Parent of the per-run working directory.
    pub fn tmp_root(&self) -> PathBuf {
        self.tmp_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Reading or parsing the config file failed.
#[derive(Debug, Display, Error, From)]
pub enum ConfigFileError {
    #[display("Reading the config file failed: {_0}")]
    Read(io::Error),
    #[display("Parsing the config file failed: {_0}")]
    Parse(toml::de::Error),
    #[display("Serializing the default config failed: {_0}")]
    Serialize(toml::ser::Error),
}
