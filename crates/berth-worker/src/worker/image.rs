//! Resolving a container's root filesystem.

use berth_core::{Handle, VolumeSpec};
use tracing::debug;

use super::Worker;
use crate::locator::BaseResourceTypeVolume;
use crate::{ContainerSpec, FetchedImage, ImageMetadata, ImageSpec, Result, WorkerError};

pub(crate) const IMAGE_MOUNT_PATH: &str = "/";

const IMAGE_METADATA_FILE: &str = "metadata.json";

impl Worker {
    pub(super) async fn fetch_image(
        &self,
        container: &Handle,
        spec: &ContainerSpec,
    ) -> Result<FetchedImage> {
        match &spec.image {
            ImageSpec::Url { url, privileged } => Ok(FetchedImage {
                metadata: ImageMetadata::default(),
                url: url.clone(),
                privileged: *privileged,
            }),

            ImageSpec::Artifact { volume, privileged } => {
                let parent = self
                    .local_parent(
                        container,
                        Some(spec.team_id),
                        volume,
                        IMAGE_MOUNT_PATH,
                        *privileged,
                    )
                    .await?;
                let rootfs = self
                    .cow_volume(container, &parent, IMAGE_MOUNT_PATH, *privileged)
                    .await?;

                let raw = self.streamer.stream_file(volume, IMAGE_METADATA_FILE).await?;
                let metadata: ImageMetadata =
                    serde_json::from_slice(&raw).map_err(WorkerError::MalformedMetadata)?;

                debug!(artifact = %volume.handle(), rootfs = %rootfs.handle(), "Fetched artifact image");
                Ok(FetchedImage {
                    metadata,
                    url: format!("raw://{}/rootfs", rootfs.path()),
                    privileged: *privileged,
                })
            }

            ImageSpec::ResourceType(name) => {
                let resource_type = self
                    .info
                    .resource_type(name)
                    .ok_or_else(|| WorkerError::UnknownResourceType(name.clone()))?;
                let base = self
                    .store
                    .worker_resources
                    .find_base_resource_type(self.name(), name)
                    .await?
                    .ok_or_else(|| WorkerError::BaseResourceTypeNotFound(name.clone()))?;
                let privileged = resource_type.privileged;

                let imported = self
                    .find_or_create_volume(
                        VolumeSpec::import(base.image.clone(), false, privileged),
                        &BaseResourceTypeVolume(&base),
                        None,
                    )
                    .await?;
                let rootfs = self
                    .cow_volume(container, &imported, IMAGE_MOUNT_PATH, privileged)
                    .await?;

                debug!(resource_type = %name, rootfs = %rootfs.handle(), "Fetched base resource type image");
                Ok(FetchedImage {
                    metadata: ImageMetadata::default(),
                    url: format!("raw://{}", rootfs.path()),
                    privileged,
                })
            }
        }
    }
}
