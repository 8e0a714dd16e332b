//! Library to backup a [Chef Server][chef] node.
//!
//! A backup run stops the services of the node (unless it runs online),
//! dumps the database, records everything it captured in a [`DataMap`],
//! writes a manifest and bundles it all into a single tarball which is then
//! synced to an export directory. The orchestration lives in [`backup`].
//!
//! [chef]: https://docs.chef.io/server/
//! [`DataMap`]: data_map::DataMap

#![forbid(unsafe_code)]

pub mod backup;
pub mod cli;
pub mod config;
pub mod data_map;
pub mod shell;
pub mod topology;
