//! Daemon error type

use std::io;
use std::path::PathBuf;

use gpsstats_driver::{HostError, OrchestratorError};
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Logging setup failed: {0}")]
    Logging(#[source] io::Error),

    #[error("Cannot drop privileges: {0}")]
    Privileges(String),

    #[error("Event loop: {0}")]
    Host(#[from] HostError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}
