// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

use crate::remote::TaskError;

#[derive(Error, Debug)]
pub enum ChunkdagError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Cycle detected in DAG: {0}")]
    DagCycle(String),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// A work item kept failing until the failure ceiling was crossed.
    ///
    /// Displayed verbatim so callers see the remote error exactly as the
    /// work function produced it.
    #[error(transparent)]
    TaskFailed(#[from] TaskError),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChunkdagError {
    /// The remote error that aborted a dispatch, if that is what this is.
    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            ChunkdagError::TaskFailed(err) => Some(err),
            _ => None,
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ChunkdagError>;
