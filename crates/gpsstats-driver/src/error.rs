//! Driver error types

use gpsstats_link::LinkError;
use thiserror::Error;

use crate::host::ConnId;

#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The supervisor is halted and stays disconnected until rebuilt
    #[error("{conn} connection halted: {source}")]
    Fatal {
        conn: ConnId,
        #[source]
        source: LinkError,
    },
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Fresh links could not be built from the configuration
    #[error("Configuration rejected: {0}")]
    Config(String),
}
