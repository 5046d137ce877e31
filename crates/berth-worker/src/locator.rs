//! How each kind of volume is found and recorded in the store.

use async_trait::async_trait;
use berth_core::Handle;
use berth_db::{
    DbResult, VolumeRecord, VolumeRepo, WorkerBaseResourceType, WorkerResourceCerts,
};

/// Finds or records the bookkeeping entry for one logical volume.
#[async_trait]
pub(crate) trait VolumeLocator: Send + Sync {
    async fn find(&self, volumes: &dyn VolumeRepo) -> DbResult<Option<VolumeRecord>>;

    async fn create(&self, volumes: &dyn VolumeRepo) -> DbResult<VolumeRecord>;
}

/// A volume mounted at a path in a container.
pub(crate) struct ContainerVolume<'a> {
    pub team_id: Option<i32>,
    pub worker_name: &'a str,
    pub container: &'a Handle,
    pub mount_path: &'a str,
}

#[async_trait]
impl<'a> VolumeLocator for ContainerVolume<'a> {
    async fn find(&self, volumes: &dyn VolumeRepo) -> DbResult<Option<VolumeRecord>> {
        volumes
            .find_container_volume(self.container, self.mount_path)
            .await
    }

    async fn create(&self, volumes: &dyn VolumeRepo) -> DbResult<VolumeRecord> {
        volumes
            .create_container_volume(
                self.team_id,
                self.worker_name,
                self.container,
                self.mount_path,
            )
            .await
    }
}

/// A copy-on-write child of a local volume, mounted in a container.
pub(crate) struct CowVolume<'a> {
    pub parent: &'a VolumeRecord,
    pub container: &'a Handle,
    pub mount_path: &'a str,
}

#[async_trait]
impl<'a> VolumeLocator for CowVolume<'a> {
    async fn find(&self, volumes: &dyn VolumeRepo) -> DbResult<Option<VolumeRecord>> {
        volumes
            .find_container_volume(self.container, self.mount_path)
            .await
    }

    async fn create(&self, volumes: &dyn VolumeRepo) -> DbResult<VolumeRecord> {
        volumes
            .create_child_volume(self.parent, self.container, self.mount_path)
            .await
    }
}

pub(crate) struct BaseResourceTypeVolume<'a>(pub &'a WorkerBaseResourceType);

#[async_trait]
impl<'a> VolumeLocator for BaseResourceTypeVolume<'a> {
    async fn find(&self, volumes: &dyn VolumeRepo) -> DbResult<Option<VolumeRecord>> {
        volumes.find_base_resource_type_volume(self.0).await
    }

    async fn create(&self, volumes: &dyn VolumeRepo) -> DbResult<VolumeRecord> {
        volumes.create_base_resource_type_volume(self.0).await
    }
}

pub(crate) struct ResourceCertsVolume<'a>(pub &'a WorkerResourceCerts);

#[async_trait]
impl<'a> VolumeLocator for ResourceCertsVolume<'a> {
    async fn find(&self, volumes: &dyn VolumeRepo) -> DbResult<Option<VolumeRecord>> {
        volumes.find_resource_certs_volume(self.0).await
    }

    async fn create(&self, volumes: &dyn VolumeRepo) -> DbResult<VolumeRecord> {
        volumes.create_resource_certs_volume(self.0).await
    }
}

/// A remote resource cache streamed onto this worker.
pub(crate) struct StreamedResourceCacheVolume<'a> {
    pub team_id: Option<i32>,
    pub worker_name: &'a str,
    pub resource_cache_id: i64,
    pub source_worker: &'a str,
}

#[async_trait]
impl<'a> VolumeLocator for StreamedResourceCacheVolume<'a> {
    async fn find(&self, volumes: &dyn VolumeRepo) -> DbResult<Option<VolumeRecord>> {
        volumes
            .find_resource_cache_volume(self.worker_name, self.resource_cache_id)
            .await
    }

    async fn create(&self, volumes: &dyn VolumeRepo) -> DbResult<VolumeRecord> {
        volumes
            .create_streamed_resource_cache_volume(
                self.team_id,
                self.worker_name,
                self.resource_cache_id,
                self.source_worker,
            )
            .await
    }
}

/// A volume with no lookup key. Every call creates a new record.
pub(crate) struct UnkeyedVolume<'a> {
    pub team_id: Option<i32>,
    pub worker_name: &'a str,
}

#[async_trait]
impl<'a> VolumeLocator for UnkeyedVolume<'a> {
    async fn find(&self, _volumes: &dyn VolumeRepo) -> DbResult<Option<VolumeRecord>> {
        Ok(None)
    }

    async fn create(&self, volumes: &dyn VolumeRepo) -> DbResult<VolumeRecord> {
        volumes.create_volume(self.team_id, self.worker_name).await
    }
}
