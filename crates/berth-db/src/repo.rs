//! Repository traits and implementations.

pub mod cache;
pub mod container;
pub mod volume;
pub mod worker;

pub use cache::{PgTaskCacheRepo, TaskCache, TaskCacheRepo, WorkerTaskCache};
pub use container::{
    ContainerMetadata, ContainerOwner, ContainerRecord, ContainerRepo, ContainerState,
    PgContainerRepo,
};
pub use volume::{PgVolumeRepo, VolumeRecord, VolumeRepo, VolumeState};
pub use worker::{
    PgWorkerResourceRepo, WorkerBaseResourceType, WorkerResourceCerts, WorkerResourceRepo,
};
