//! Registry of everything a backup run captured.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

/// A stateful service known to the backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServiceEntry {
    /// Where the service keeps its data. [None] if it couldn't be located.
    pub data_dir: Option<PathBuf>,

    /// Whether a database dump of this service succeeded.
    #[serde(default)]
    pub pg_dump_success: bool,

    /// User the database dump ran as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// A config directory known to the backup.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfigEntry {
    pub data_dir: PathBuf,
}

/// Installed version of a product.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionEntry {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// Services, config directories and versions captured by a backup run.
///
/// Names are unique within each registry. Entries are only ever added, an
/// attempt to register a name twice is an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DataMap {
    services: BTreeMap<String, ServiceEntry>,
    configs: BTreeMap<String, ConfigEntry>,
    #[serde(default)]
    versions: BTreeMap<String, VersionEntry>,
}

impl DataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(
        &mut self,
        name: &str,
        data_dir: Option<PathBuf>,
    ) -> Result<(), DataMapError> {
        match self.services.entry(name.to_string()) {
            Entry::Occupied(_) => Err(DataMapError::DuplicateService(name.to_string())),
            Entry::Vacant(entry) => {
                log::trace!(target: "data_map", "Registered service {name}: {data_dir:?}");
                entry.insert(ServiceEntry {
                    data_dir,
                    ..Default::default()
                });
                Ok(())
            }
        }
    }

    pub fn add_config(&mut self, name: &str, data_dir: PathBuf) -> Result<(), DataMapError> {
        match self.configs.entry(name.to_string()) {
            Entry::Occupied(_) => Err(DataMapError::DuplicateConfig(name.to_string())),
            Entry::Vacant(entry) => {
                log::trace!(target: "data_map", "Registered config {name}: {}", data_dir.display());
                entry.insert(ConfigEntry { data_dir });
                Ok(())
            }
        }
    }

    pub fn add_version(
        &mut self,
        project: &str,
        version: VersionEntry,
    ) -> Result<(), DataMapError> {
        match self.versions.entry(project.to_string()) {
            Entry::Occupied(_) => Err(DataMapError::DuplicateVersion(project.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(version);
                Ok(())
            }
        }
    }

    /// Marks the dump of an already registered service as successful.
    pub fn record_pg_dump(&mut self, service: &str, username: &str) -> Result<(), DataMapError> {
        let entry = self
            .services
            .get_mut(service)
            .ok_or_else(|| DataMapError::UnknownService(service.to_string()))?;
        entry.pg_dump_success = true;
        entry.username = Some(username.to_string());
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    pub fn services(&self) -> &BTreeMap<String, ServiceEntry> {
        &self.services
    }

    pub fn configs(&self) -> &BTreeMap<String, ConfigEntry> {
        &self.configs
    }

    pub fn versions(&self) -> &BTreeMap<String, VersionEntry> {
        &self.versions
    }

    /// Every located data directory: services first, then configs, each
    /// ordered by name.
    pub fn data_dirs(&self) -> impl Iterator<Item = &Path> {
        let services = self
            .services
            .values()
            .filter_map(|service| service.data_dir.as_deref());
        let configs = self.configs.values().map(|config| config.data_dir.as_path());

        services.chain(configs)
    }
}

#[derive(Debug, Display, Error)]
pub enum DataMapError {
    #[display("Service {_0} is already registered")]
    DuplicateService(#[error(ignore)] String),
    #[display("Config {_0} is already registered")]
    DuplicateConfig(#[error(ignore)] String),
    #[display("Version of {_0} is already registered")]
    DuplicateVersion(#[error(ignore)] String),
    #[display("Service {_0} is not registered")]
    UnknownService(#[error(ignore)] String),
}
