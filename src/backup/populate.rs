//! Discovery of the directories a node has to back up.

use std::fs;
use std::path::Path;

use serde_json::Value;

use super::BackupContext;
use crate::config::BackupConfig;
use crate::data_map::{DataMap, DataMapError, VersionEntry};

/// Project the product version is recorded under.
const PRODUCT: &str = "chef-server";

/// Registers config directories and, on nodes holding data, the stateful
/// services in a [DataMap].
pub struct DataMapPopulator<'a> {
    config: &'a BackupConfig,
    ctx: &'a BackupContext,
}

impl<'a> DataMapPopulator<'a> {
    pub fn new(config: &'a BackupConfig, ctx: &'a BackupContext) -> Self {
        Self { config, ctx }
    }

    /// Registers what exists on this node.
    ///
    /// Config directories that aren't installed are skipped. Stateful
    /// services are always registered, without a data dir if theirs is
    /// unknown or missing.
    pub fn populate(&self, data_map: &mut DataMap) -> Result<(), DataMapError> {
        for name in &self.config.config_dirs {
            let config_dir = self.config.config_dir(name);
            if !config_dir.is_dir() {
                log::debug!(target: "backup::populate", "Skipping {name}, {} doesn't exist", config_dir.display());
                continue;
            }
            data_map.add_config(name, config_dir)?;
        }

        if self.ctx.role.holds_data() && !self.ctx.config_only {
            for service in &self.config.stateful_services {
                let data_dir = match self.config.data_dir(service) {
                    Some(dir) if dir.is_dir() => Some(dir.to_path_buf()),
                    Some(dir) => {
                        log::warn!(target: "backup::populate", "Data directory {} of {service} doesn't exist", dir.display());
                        None
                    }
                    None => {
                        log::warn!(target: "backup::populate", "No data directory known for {service}");
                        None
                    }
                };
                data_map.add_service(service, data_dir)?;
            }
        }

        if let Some(version) = self
            .config
            .version_manifest
            .as_deref()
            .and_then(read_version_manifest)
        {
            data_map.add_version(PRODUCT, version)?;
        }

        log::debug!(
            target: "backup::populate",
            "Registered {} services and {} configs",
            data_map.services().len(),
            data_map.configs().len()
        );
        Ok(())
    }
}

/// Reads `build_version` and `build_git_revision` of an omnibus version
/// manifest. Unreadable manifests are logged and skipped.
fn read_version_manifest(path: &Path) -> Option<VersionEntry> {
    let manifest = match fs::read(path) {
        Ok(manifest) => manifest,
        Err(e) => {
            log::warn!(target: "backup::populate", "Reading version manifest {} failed: {e}", path.display());
            return None;
        }
    };

    let manifest: Value = match serde_json::from_slice(&manifest) {
        Ok(manifest) => manifest,
        Err(e) => {
            log::warn!(target: "backup::populate", "Version manifest {} is invalid: {e}", path.display());
            return None;
        }
    };

    let version = manifest.get("build_version").and_then(Value::as_str)?;
    let revision = manifest
        .get("build_git_revision")
        .and_then(Value::as_str)
        .map(String::from);

    Some(VersionEntry {
        version: version.to_string(),
        revision,
    })
}
