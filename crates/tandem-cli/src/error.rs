use std::io;

use tandem_core::client::{ClientConfigError, SyncError, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tandem_core::Error),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Config(#[from] ClientConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),
    #[error("Manual resolution needs --data")]
    MissingResolvedData,
    #[error("No local data for {0}")]
    NotFound(String),
    #[error("Could not find a data directory; pass --store or set TANDEM_STORE_PATH")]
    NoDataDir,
}
