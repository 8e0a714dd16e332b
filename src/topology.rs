//! Classification of the node a backup runs on.

use std::str::FromStr;

use derive_more::{Display, Error};

use crate::config::BackupConfig;

/// Position of the node in the Chef Server topology.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Serves the API, holds no primary data.
    #[display("frontend")]
    Frontend,
    /// Holds the database and the stateful services.
    #[display("backend")]
    Backend,
    /// Frontend and backend on a single node.
    #[display("standalone")]
    Standalone,
}

impl Role {
    /// Whether the node holds the database and stateful service data.
    pub fn holds_data(self) -> bool {
        matches!(self, Self::Backend | Self::Standalone)
    }
}

impl FromStr for Role {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "frontend" => Ok(Self::Frontend),
            "backend" => Ok(Self::Backend),
            "standalone" => Ok(Self::Standalone),
            other => Err(ConfigurationError::UnknownRole(other.to_string())),
        }
    }
}

/// Whether services are taken down for the backup.
#[derive(Copy, Clone, Debug, Display, Default, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Services keep running, the database is dumped live.
    #[display("online")]
    Online,
    /// Non-essential services are stopped for the duration of the capture.
    #[default]
    #[display("offline")]
    Offline,
}

impl FromStr for Mode {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            other => Err(ConfigurationError::UnknownMode(other.to_string())),
        }
    }
}

/// Resolved [Role] and [Mode] of this node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub role: Role,
    pub mode: Mode,
}

impl Topology {
    /// Resolves the topology from the configuration. No side effects.
    ///
    /// An absent (or empty) mode means [Mode::Offline].
    pub fn resolve(config: &BackupConfig) -> Result<Self, ConfigurationError> {
        let role = config.role.parse()?;
        let mode = match config.mode.as_deref().map(str::trim) {
            None | Some("") => Mode::default(),
            Some(mode) => mode.parse()?,
        };

        log::debug!(target: "topology", "Resolved node as {role} in {mode} mode");
        Ok(Self { role, mode })
    }
}

/// The configuration doesn't describe a valid node.
#[derive(Debug, Display, Error)]
pub enum ConfigurationError {
    #[display("Unknown role '{_0}', expected one of frontend, backend, standalone")]
    UnknownRole(#[error(ignore)] String),
    #[display("Unknown backup mode '{_0}', expected online or offline")]
    UnknownMode(#[error(ignore)] String),
}
