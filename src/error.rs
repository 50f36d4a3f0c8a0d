//! Fatal configuration errors. Everything else in the pipeline is
//! best-effort and stays local to the component that hit it.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("elevated privileges required (run as root/Administrator)")]
    MissingPrivileges,

    #[error("scanner binary failed to start: {path}: {source}")]
    ScannerSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("port table {path} unreadable: {source}")]
    PortTableRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("port table {path} malformed: '{token}' is not a port")]
    PortTableMalformed { path: PathBuf, token: String },
}
