//! Volume composition for a new container.

use berth_core::{BindMount, BindMountMode, Handle, VolumeSpec};
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::HashSet;
use tracing::{debug, warn};

use super::Worker;
use crate::locator::{ContainerVolume, CowVolume, ResourceCertsVolume, StreamedResourceCacheVolume};
use crate::paths::{clean_path, resolve};
use crate::{ContainerSpec, Result, Volume, VolumeMount, WorkerError};

pub(crate) const SCRATCH_PATH: &str = "/scratch";

pub(crate) const CERTS_PATH: &str = "/etc/ssl/certs";

/// Mount path prefix for volumes that hold streamed content but are only
/// used as copy-on-write parents.
pub(crate) const STREAMED_VOLUME_PREFIX: &str = "streamed-no-mount:";

impl Worker {
    /// Create every volume a new container mounts.
    ///
    /// Returns scratch first, then the working directory if it got its own
    /// volume, then inputs, outputs and caches ordered by mount path.
    pub(super) async fn create_volumes(
        &self,
        container: &Handle,
        spec: &ContainerSpec,
        privileged: bool,
    ) -> Result<Vec<VolumeMount>> {
        let team_id = Some(spec.team_id);

        let scratch = self
            .container_volume(container, team_id, SCRATCH_PATH, privileged)
            .await?;

        let mut mounted: HashSet<String> = HashSet::new();
        let mut destinations = Vec::with_capacity(spec.inputs.len());
        for input in &spec.inputs {
            let destination = clean_path(&input.destination_path);
            if !mounted.insert(destination.clone()) {
                return Err(WorkerError::DuplicateMountPath(destination));
            }
            destinations.push(destination);
        }

        // Remote inputs stream concurrently. The first failure ends the
        // collection, dropping every transfer still in flight.
        let mut parents: Vec<(usize, Volume)> =
            stream::iter(spec.inputs.iter().zip(&destinations).enumerate())
                .map(|(index, (input, destination))| async move {
                    self.local_parent(container, team_id, &input.artifact, destination, privileged)
                        .await
                        .map(|parent| (index, parent))
                })
                .buffer_unordered(self.settings.stream_concurrency.max(1))
                .try_collect()
                .await?;
        parents.sort_by_key(|(index, _)| *index);

        let mut mounts = Vec::new();
        for ((_, parent), destination) in parents.iter().zip(destinations) {
            let volume = self
                .cow_volume(container, parent, &destination, privileged)
                .await?;
            mounts.push(VolumeMount {
                volume,
                mount_path: destination,
            });
        }

        for (name, path) in &spec.outputs {
            let path = clean_path(path);
            if !mounted.insert(path.clone()) {
                debug!(output = %name, path = %path, "Output shares a mount with an input");
                continue;
            }
            let volume = self
                .container_volume(container, team_id, &path, privileged)
                .await?;
            mounts.push(VolumeMount {
                volume,
                mount_path: path,
            });
        }

        for cache in &spec.caches {
            let cache_path = clean_path(cache);
            let mount_path = resolve(&spec.dir, cache);
            if !mounted.insert(mount_path.clone()) {
                warn!(cache = %cache, path = %mount_path, "Cache path is already mounted");
                continue;
            }

            let volume = match self.task_cache_volume(spec, &cache_path).await? {
                Some(cached) => {
                    self.cow_volume(container, &cached, &mount_path, privileged)
                        .await?
                }
                None => {
                    self.container_volume(container, team_id, &mount_path, privileged)
                        .await?
                }
            };
            mounts.push(VolumeMount { volume, mount_path });
        }

        mounts.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));

        let mut result = vec![VolumeMount {
            volume: scratch,
            mount_path: SCRATCH_PATH.to_string(),
        }];

        let workdir = clean_path(&spec.dir);
        if !spec.dir.is_empty() && !mounted.contains(&workdir) {
            let volume = self
                .container_volume(container, team_id, &workdir, privileged)
                .await?;
            result.push(VolumeMount {
                volume,
                mount_path: workdir,
            });
        }

        result.extend(mounts);
        Ok(result)
    }

    /// Bind mounts for the composed volumes, plus the worker's certificates
    /// when requested.
    pub(super) async fn bind_mounts(
        &self,
        mounts: &[VolumeMount],
        spec: &ContainerSpec,
    ) -> Result<Vec<BindMount>> {
        let mut bind_mounts: Vec<BindMount> = mounts
            .iter()
            .map(|mount| BindMount {
                src_path: mount.volume.path().to_string(),
                dst_path: mount.mount_path.clone(),
                mode: BindMountMode::ReadWrite,
            })
            .collect();

        if spec.certs_bind_mount {
            if let Some(certs) = self.certs_volume().await? {
                bind_mounts.push(BindMount {
                    src_path: certs.path().to_string(),
                    dst_path: CERTS_PATH.to_string(),
                    mode: BindMountMode::ReadOnly,
                });
            }
        }

        Ok(bind_mounts)
    }

    async fn certs_volume(&self) -> Result<Option<Volume>> {
        let Some(certs) = self
            .store
            .worker_resources
            .find_resource_certs(self.name())
            .await?
        else {
            return Ok(None);
        };

        let volume = self
            .find_or_create_volume(
                VolumeSpec::import(certs.certs_path.clone(), true, false),
                &ResourceCertsVolume(&certs),
                None,
            )
            .await?;
        Ok(Some(volume))
    }

    pub(super) async fn container_volume(
        &self,
        container: &Handle,
        team_id: Option<i32>,
        mount_path: &str,
        privileged: bool,
    ) -> Result<Volume> {
        self.find_or_create_volume(
            VolumeSpec::empty(privileged),
            &ContainerVolume {
                team_id,
                worker_name: self.name(),
                container,
                mount_path,
            },
            None,
        )
        .await
    }

    pub(super) async fn cow_volume(
        &self,
        container: &Handle,
        parent: &Volume,
        mount_path: &str,
        privileged: bool,
    ) -> Result<Volume> {
        self.find_or_create_volume(
            VolumeSpec::new(parent.cow_strategy(), privileged),
            &CowVolume {
                parent: parent.record(),
                container,
                mount_path,
            },
            None,
        )
        .await
    }

    /// A volume on this worker with the content of `artifact`, suitable as a
    /// copy-on-write parent.
    ///
    /// Local artifacts are used as is. Resource caches already on this
    /// worker are reused. Anything else is streamed in once.
    pub(super) async fn local_parent(
        &self,
        container: &Handle,
        team_id: Option<i32>,
        artifact: &Volume,
        mount_path: &str,
        privileged: bool,
    ) -> Result<Volume> {
        if artifact.worker_name() == self.name() {
            return Ok(artifact.clone());
        }

        if let Some(resource_cache_id) = artifact.resource_cache_id() {
            if let Some(local) = self.resource_cache_volume(resource_cache_id).await? {
                debug!(
                    artifact = %artifact.handle(),
                    volume = %local.handle(),
                    "Using resource cache already on this worker"
                );
                return Ok(local);
            }

            if self.settings.cache_streamed_volumes {
                // Resource caches are never privileged; children get the
                // container's privilege.
                return self
                    .find_or_create_volume(
                        VolumeSpec::empty(false),
                        &StreamedResourceCacheVolume {
                            team_id,
                            worker_name: self.name(),
                            resource_cache_id,
                            source_worker: artifact.worker_name(),
                        },
                        Some(artifact),
                    )
                    .await;
            }
        }

        let streamed_path = format!("{}{}", STREAMED_VOLUME_PREFIX, mount_path);
        self.find_or_create_volume(
            VolumeSpec::empty(privileged),
            &ContainerVolume {
                team_id,
                worker_name: self.name(),
                container,
                mount_path: &streamed_path,
            },
            Some(artifact),
        )
        .await
    }

    async fn resource_cache_volume(&self, resource_cache_id: i64) -> Result<Option<Volume>> {
        let Some(record) = self
            .store
            .volumes
            .find_resource_cache_volume(self.name(), resource_cache_id)
            .await?
        else {
            return Ok(None);
        };
        if !record.is_created() {
            return Ok(None);
        }
        let Some(driver_volume) = self.driver.lookup_volume(&record.handle).await? else {
            return Ok(None);
        };
        Ok(Some(Volume::new(record, driver_volume)))
    }

    /// The task cache for `cache_path`, if this worker has one.
    async fn task_cache_volume(
        &self,
        spec: &ContainerSpec,
        cache_path: &str,
    ) -> Result<Option<Volume>> {
        let (Some(job_id), Some(step_name)) = (spec.job_id, spec.step_name.as_deref()) else {
            return Ok(None);
        };

        let Some(task_cache) = self
            .store
            .task_caches
            .find_task_cache(job_id, step_name, cache_path)
            .await?
        else {
            return Ok(None);
        };
        let Some(worker_cache) = self
            .store
            .task_caches
            .find_worker_task_cache(self.name(), task_cache.id)
            .await?
        else {
            return Ok(None);
        };
        let Some(record) = self
            .store
            .volumes
            .find_task_cache_volume(&worker_cache)
            .await?
        else {
            return Ok(None);
        };
        if !record.is_created() {
            return Ok(None);
        }

        match self.driver.lookup_volume(&record.handle).await? {
            Some(driver_volume) => Ok(Some(Volume::new(record, driver_volume))),
            None => {
                warn!(volume = %record.handle, path = cache_path, "Task cache volume is missing");
                Ok(None)
            }
        }
    }
}
