use std::io;

use thiserror::Error;

/// The error taxonomy for the deployment engine (see DESIGN.md §7).
///
/// Workers never propagate the transient variants (`Permission`, `Network`) up
/// past their own retry loop; they retry up to `retry_count` and otherwise push a
/// formatted line into the failure sink. Everything else is fatal to the run.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Message(String),

    #[error("permission error: {0}")]
    Permission(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("failed to download remote index: {0}")]
    DownloadFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("deployment cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl DeployError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        DeployError::Config(msg.into())
    }

    pub fn message<S: Into<String>>(msg: S) -> Self {
        DeployError::Message(msg.into())
    }

    pub fn permission<S: Into<String>>(msg: S) -> Self {
        DeployError::Permission(msg.into())
    }

    pub fn network<S: Into<String>>(msg: S) -> Self {
        DeployError::Network(msg.into())
    }

    /// True for errors a worker should retry rather than give up on immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeployError::Network(_) | DeployError::Permission(_))
    }
}

pub type Result<T> = std::result::Result<T, DeployError>;
