//! Orchestration errors.

use berth_core::Handle;
use berth_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// A volume is recorded as created but the driver no longer has it.
    #[error("volume {handle} disappeared from worker {worker}")]
    CreatedVolumeNotFound { handle: Handle, worker: String },

    /// A created container's volume is gone from the driver.
    #[error("volume {handle} mounted in a container is missing from worker {worker}")]
    MountedVolumeMissing { handle: Handle, worker: String },

    /// A container is recorded as created but the engine no longer has it.
    #[error("container not found: {handle}")]
    ContainerNotFound { handle: Handle },

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("failed to create volume {handle}: {source}")]
    VolumeMaterialization {
        handle: Handle,
        #[source]
        source: Box<WorkerError>,
    },

    #[error("resource type {0} is not provided by this worker")]
    UnknownResourceType(String),

    #[error("base resource type {0} is not registered for this worker")]
    BaseResourceTypeNotFound(String),

    #[error("malformed image metadata: {0}")]
    MalformedMetadata(#[source] serde_json::Error),

    #[error("file {path} not found in volume {handle}")]
    FileNotFound { handle: Handle, path: String },

    #[error("multiple inputs mounted at {0}")]
    DuplicateMountPath(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<WorkerError>,
    },

    #[error(transparent)]
    Core(berth_core::Error),

    #[error(transparent)]
    Store(#[from] DbError),
}

impl WorkerError {
    pub fn context(self, context: impl Into<String>) -> Self {
        WorkerError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through context and materialization
    /// wrappers.
    pub fn root(&self) -> &WorkerError {
        match self {
            WorkerError::Context { source, .. } => source.root(),
            WorkerError::VolumeMaterialization { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<berth_core::Error> for WorkerError {
    fn from(err: berth_core::Error) -> Self {
        match err {
            berth_core::Error::ExecutableNotFound(path) => WorkerError::ExecutableNotFound(path),
            berth_core::Error::ContainerNotFound(handle) => WorkerError::ContainerNotFound {
                handle: Handle::from(handle),
            },
            other => WorkerError::Core(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_looks_through_wrappers() {
        let err = WorkerError::VolumeMaterialization {
            handle: Handle::from("v1"),
            source: Box::new(WorkerError::Core(berth_core::Error::Driver("disk full".into()))),
        }
        .context("find or create container on worker w1");

        assert!(matches!(
            err.root(),
            WorkerError::Core(berth_core::Error::Driver(_))
        ));
        assert_eq!(
            err.to_string(),
            "find or create container on worker w1: failed to create volume v1: volume driver error: disk full"
        );
    }

    #[test]
    fn test_engine_errors_map_to_typed_variants() {
        let err: WorkerError = berth_core::Error::ExecutableNotFound("/bin/nope".into()).into();
        assert!(matches!(err, WorkerError::ExecutableNotFound(_)));

        let err: WorkerError = berth_core::Error::ContainerNotFound("c1".into()).into();
        assert!(matches!(err, WorkerError::ContainerNotFound { .. }));
    }
}
