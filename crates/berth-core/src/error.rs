//! Error types for worker collaborators.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("volume driver error: {0}")]
    Driver(String),

    #[error("container engine error: {0}")]
    Engine(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
