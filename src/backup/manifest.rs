//! `manifest.json` shipped inside every archive.

use std::fs;
use std::io;
use std::path::PathBuf;

use derive_more::{Display, Error, From};

use super::{BackupContext, BackupTime};
use crate::data_map::DataMap;
use crate::topology::{Mode, Role};

pub const MANIFEST_NAME: &str = "manifest.json";

/// Snapshot of a [DataMap] plus metadata of the run.
#[derive(Debug, serde::Serialize)]
pub struct Manifest<'a> {
    pub strategy: &'static str,
    pub backup_time: &'a BackupTime,
    pub role: Role,
    /// Only meaningful on nodes holding data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    pub config_only: bool,
    #[serde(flatten)]
    pub data_map: &'a DataMap,
}

impl<'a> Manifest<'a> {
    pub fn new(ctx: &'a BackupContext, data_map: &'a DataMap) -> Self {
        Self {
            strategy: "tar",
            backup_time: &ctx.backup_time,
            role: ctx.role,
            mode: ctx.role.holds_data().then_some(ctx.mode),
            config_only: ctx.config_only,
            data_map,
        }
    }
}

/// Writes the [Manifest] into the working directory.
pub struct ManifestWriter<'a> {
    ctx: &'a BackupContext,
}

impl<'a> ManifestWriter<'a> {
    pub fn new(ctx: &'a BackupContext) -> Self {
        Self { ctx }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.ctx.tmp_dir.join(MANIFEST_NAME)
    }

    /// Writes the pretty-printed manifest, replacing any existing file.
    pub fn write(&self, data_map: &DataMap) -> Result<PathBuf, ManifestError> {
        let path = self.manifest_path();
        log::info!(target: "backup::manifest", "Writing manifest to {}", path.display());

        let manifest = Manifest::new(self.ctx, data_map);
        let json = serde_json::to_string_pretty(&manifest)?;
        fs::write(&path, json).map_err(|source| ManifestError::Write {
            path: path.clone(),
            source,
        })?;

        Ok(path)
    }
}

#[derive(Debug, Display, Error, From)]
pub enum ManifestError {
    #[from]
    #[display("Serializing the manifest failed: {_0}")]
    Serialize(serde_json::Error),
    #[display("Writing the manifest to {} failed: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}
