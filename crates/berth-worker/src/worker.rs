//! Worker: finds or creates containers and the volumes they mount.
//!
//! Every volume and container has a bookkeeping record and a live
//! counterpart on the driver or engine. The worker reconciles the two after
//! crashes, de-duplicates concurrent creation of the same logical volume and
//! streams content in from other workers when an input is not local.

mod compose;
mod image;

use berth_core::{
    ContainerEngine, EngineContainer, EngineContainerSpec, Handle, MetricsSink, NoopMetrics,
    VolumeDriver, VolumeSpec, WorkerInfo, WorkerSettings,
};
use berth_db::{
    ContainerMetadata, ContainerOwner, ContainerRecord, ContainerState, LockId, Store,
    VolumeRecord, VolumeState,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::container::USER_PROPERTY;
use crate::locator::{UnkeyedVolume, VolumeLocator};
use crate::paths::clean_path;
use crate::{Container, ContainerSpec, Result, Streamer, Volume, VolumeMount, WorkerError};

pub(crate) use compose::STREAMED_VOLUME_PREFIX;
pub(crate) use image::IMAGE_MOUNT_PATH;

/// A worker node as seen by the orchestration layer.
pub struct Worker {
    info: WorkerInfo,
    settings: WorkerSettings,
    engine: Arc<dyn ContainerEngine>,
    driver: Arc<dyn VolumeDriver>,
    store: Store,
    streamer: Arc<dyn Streamer>,
    metrics: Arc<dyn MetricsSink>,
}

impl Worker {
    pub fn new(
        info: WorkerInfo,
        settings: WorkerSettings,
        engine: Arc<dyn ContainerEngine>,
        driver: Arc<dyn VolumeDriver>,
        store: Store,
        streamer: Arc<dyn Streamer>,
    ) -> Self {
        Self {
            info,
            settings,
            engine,
            driver,
            store,
            streamer,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Record the base resource types and certificates this worker provides.
    pub async fn register(&self) -> Result<()> {
        self.store
            .worker_resources
            .save_worker_resources(&self.info)
            .await?;
        info!(
            worker = %self.info.name,
            resource_types = self.info.resource_types.len(),
            "Registered worker resources"
        );
        Ok(())
    }

    /// Find the container for `owner`, creating it with its image and
    /// volumes if needed.
    ///
    /// A container recorded as created whose engine container is gone is an
    /// error; it is never recreated.
    #[tracing::instrument(skip_all, fields(worker = %self.info.name, owner = %owner))]
    pub async fn find_or_create_container(
        &self,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<(Container, Vec<VolumeMount>)> {
        self.find_or_create_container_inner(owner, metadata, spec)
            .await
            .map_err(|e| e.context(format!("find or create container on worker {}", self.name())))
    }

    async fn find_or_create_container_inner(
        &self,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
        spec: &ContainerSpec,
    ) -> Result<(Container, Vec<VolumeMount>)> {
        let record = match self.store.containers.find_container(self.name(), owner).await? {
            Some(record) => record,
            None => {
                debug!("Creating container record");
                self.store
                    .containers
                    .create_container(self.name(), owner, metadata)
                    .await?
            }
        };

        let existing = self.engine.lookup(&record.handle).await?;

        if record.is_created() {
            debug!(container = %record.handle, "Found created container");
            let engine_container = existing.ok_or_else(|| WorkerError::ContainerNotFound {
                handle: record.handle.clone(),
            })?;
            let mounts = self.container_mounts(&record.handle).await?;
            return Ok((Container::new(record, engine_container), mounts));
        }

        let (engine_container, mounts) = match existing {
            Some(engine_container) => {
                debug!(container = %record.handle, "Engine container already exists");
                (engine_container, None)
            }
            None => match self.create_engine_container(&record, spec).await {
                Ok((engine_container, mounts)) => (engine_container, Some(mounts)),
                Err(e) => {
                    error!(container = %record.handle, error = %e, "Failed to create container");
                    self.mark_container_failed(&record).await;
                    return Err(e);
                }
            },
        };

        if let Err(e) = self.store.containers.mark_container_created(record.id).await {
            error!(container = %record.handle, error = %e, "Failed to mark container created");
            if let Err(destroy_err) = self.engine.destroy(&record.handle).await {
                warn!(container = %record.handle, error = %destroy_err, "Failed to destroy container");
            }
            return Err(e.into());
        }

        self.metrics.container_created();
        info!(container = %record.handle, "Created container");

        let mounts = match mounts {
            Some(mounts) => mounts,
            None => self.container_mounts(&record.handle).await?,
        };
        let record = ContainerRecord {
            state: ContainerState::Created,
            ..record
        };
        Ok((Container::new(record, engine_container), mounts))
    }

    async fn create_engine_container(
        &self,
        record: &ContainerRecord,
        spec: &ContainerSpec,
    ) -> Result<(Arc<dyn EngineContainer>, Vec<VolumeMount>)> {
        let image = self.fetch_image(&record.handle, spec).await?;
        let mounts = self
            .create_volumes(&record.handle, spec, image.privileged)
            .await?;
        let bind_mounts = self.bind_mounts(&mounts, spec).await?;

        let mut env = image.metadata.env.clone();
        env.extend(spec.env.iter().cloned());
        env.extend(self.info.proxy_env());

        let mut properties = BTreeMap::new();
        properties.insert(USER_PROPERTY.to_string(), image.metadata.user.clone());

        debug!(container = %record.handle, rootfs = %image.url, "Creating engine container");
        let engine_container = self
            .engine
            .create(EngineContainerSpec {
                handle: record.handle.clone(),
                rootfs_url: image.url,
                privileged: image.privileged,
                bind_mounts,
                limits: spec.limits,
                env,
                properties,
            })
            .await?;

        Ok((engine_container, mounts))
    }

    async fn mark_container_failed(&self, record: &ContainerRecord) {
        if let Err(e) = self.store.containers.mark_container_failed(record.id).await {
            error!(container = %record.handle, error = %e, "Failed to mark container failed");
        }
        self.metrics.container_failed();
    }

    /// Mounts of an existing container, rebuilt from its volume records.
    async fn container_mounts(&self, container: &Handle) -> Result<Vec<VolumeMount>> {
        let records = self.store.volumes.find_volumes_for_container(container).await?;

        let mut mounts = Vec::new();
        for record in records {
            let Some(mount_path) = record.mount_path.clone() else {
                continue;
            };
            // Streamed parents and the image volume are not bind mounts.
            if mount_path.starts_with(STREAMED_VOLUME_PREFIX) || mount_path == IMAGE_MOUNT_PATH {
                continue;
            }

            let driver_volume = self.driver.lookup_volume(&record.handle).await?.ok_or_else(|| {
                WorkerError::MountedVolumeMissing {
                    handle: record.handle.clone(),
                    worker: self.name().to_string(),
                }
            })?;
            mounts.push(VolumeMount {
                volume: Volume::new(record, driver_volume),
                mount_path,
            });
        }
        Ok(mounts)
    }

    /// Look up a created volume on this worker by handle.
    pub async fn lookup_volume(&self, handle: &Handle) -> Result<Option<Volume>> {
        let Some(record) = self.store.volumes.find_volume(handle).await? else {
            return Ok(None);
        };
        if !record.is_created() {
            return Ok(None);
        }
        let Some(driver_volume) = self.driver.lookup_volume(handle).await? else {
            return Ok(None);
        };
        Ok(Some(Volume::new(record, driver_volume)))
    }

    /// Create an empty volume to hold an artifact produced outside a
    /// container, e.g. an upload.
    pub async fn create_volume_for_artifact(&self, team_id: i32) -> Result<Volume> {
        self.find_or_create_volume(
            VolumeSpec::empty(false),
            &UnkeyedVolume {
                team_id: Some(team_id),
                worker_name: self.name(),
            },
            None,
        )
        .await
    }

    /// Mark `volume` as holding a resource cache. Returns `false` if another
    /// volume on this worker already holds it.
    pub async fn initialize_resource_cache(
        &self,
        volume: &Volume,
        resource_cache_id: i64,
    ) -> Result<bool> {
        volume.set_privileged(false).await?;
        let initialized = self
            .store
            .volumes
            .initialize_resource_cache(volume.record().id, resource_cache_id)
            .await?;
        debug!(volume = %volume.handle(), resource_cache_id, initialized, "Initialized resource cache");
        Ok(initialized)
    }

    pub async fn initialize_streamed_resource_cache(
        &self,
        volume: &Volume,
        resource_cache_id: i64,
        source_worker: &str,
    ) -> Result<bool> {
        volume.set_privileged(false).await?;
        let initialized = self
            .store
            .volumes
            .initialize_streamed_resource_cache(volume.record().id, resource_cache_id, source_worker)
            .await?;
        debug!(
            volume = %volume.handle(),
            resource_cache_id,
            source_worker,
            initialized,
            "Initialized streamed resource cache"
        );
        Ok(initialized)
    }

    /// Make `volume` the task cache for a job step's cache path.
    ///
    /// A copy-on-write volume cannot outlive its parent, so one is first
    /// copied into a fresh import volume which becomes the cache instead.
    pub async fn initialize_task_cache(
        &self,
        volume: &Volume,
        job_id: i64,
        step_name: &str,
        path: &str,
        privileged: bool,
    ) -> Result<()> {
        let path = clean_path(path);
        let task_cache = self
            .store
            .task_caches
            .find_or_create_task_cache(job_id, step_name, &path)
            .await?;
        let worker_cache = self
            .store
            .task_caches
            .find_or_create_worker_task_cache(self.name(), task_cache.id)
            .await?;

        let cache_volume = if volume.record().parent_handle.is_none() {
            volume.clone()
        } else {
            debug!(volume = %volume.handle(), path = %volume.path(), "Importing task cache volume");
            self.find_or_create_volume(
                VolumeSpec::import(volume.path(), false, privileged),
                &UnkeyedVolume {
                    team_id: volume.record().team_id,
                    worker_name: self.name(),
                },
                None,
            )
            .await?
        };

        self.store
            .volumes
            .initialize_task_cache(cache_volume.record().id, &worker_cache)
            .await?;
        Ok(())
    }

    /// Find or create one logical volume.
    ///
    /// Creation is serialized per record by an advisory lock. A caller that
    /// loses the race sleeps for the retry interval and starts over; once the
    /// winner marks the record created, everyone returns the same volume.
    /// `fill`, when given, is streamed into the new volume while the lock is
    /// still held.
    pub(crate) async fn find_or_create_volume(
        &self,
        spec: VolumeSpec,
        locator: &dyn VolumeLocator,
        fill: Option<&Volume>,
    ) -> Result<Volume> {
        loop {
            let record = match locator.find(self.store.volumes.as_ref()).await? {
                Some(record) => record,
                None => locator.create(self.store.volumes.as_ref()).await?,
            };

            if record.is_created() {
                return self.created_volume(record).await;
            }

            let Some(lock) = self
                .store
                .locks
                .acquire(LockId::VolumeCreating(record.id))
                .await?
            else {
                debug!(
                    volume = %record.handle,
                    retry_in = ?self.settings.lock_retry_interval,
                    "Volume is being created elsewhere, waiting"
                );
                sleep(self.settings.lock_retry_interval).await;
                continue;
            };

            let result = self.materialize_volume(&spec, &record, fill).await;

            if let Err(e) = lock.release().await {
                warn!(volume = %record.handle, error = %e, "Failed to release volume lock");
            }

            match result? {
                Some(volume) => return Ok(volume),
                // The record failed while we waited for the lock.
                None => continue,
            }
        }
    }

    async fn created_volume(&self, record: VolumeRecord) -> Result<Volume> {
        let driver_volume = self
            .driver
            .lookup_volume(&record.handle)
            .await?
            .ok_or_else(|| WorkerError::CreatedVolumeNotFound {
                handle: record.handle.clone(),
                worker: self.name().to_string(),
            })?;
        Ok(Volume::new(record, driver_volume))
    }

    /// Materialize a creating record. Must be called with its lock held.
    async fn materialize_volume(
        &self,
        spec: &VolumeSpec,
        record: &VolumeRecord,
        fill: Option<&Volume>,
    ) -> Result<Option<Volume>> {
        let Some(current) = self.store.volumes.find_volume(&record.handle).await? else {
            return Ok(None);
        };
        if current.is_created() {
            debug!(volume = %current.handle, "Volume was created while waiting for lock");
            return self.created_volume(current).await.map(Some);
        }

        // A lookup failure says nothing about the volume, so the record stays
        // creating for the next attempt.
        let existing = self.driver.lookup_volume(&current.handle).await?;
        let (driver_volume, materialized) = match existing {
            Some(driver_volume) => (driver_volume, false),
            None => match self.driver.create_volume(&current.handle, spec).await {
                Ok(driver_volume) => (driver_volume, true),
                Err(e) => return Err(self.fail_volume(&current, e.into()).await),
            },
        };

        let volume = Volume::new(
            VolumeRecord {
                state: VolumeState::Created,
                ..current
            },
            driver_volume,
        );

        if let Some(source) = fill {
            if let Err(e) = self.streamer.stream(source, &volume).await {
                return Err(self.fail_volume(volume.record(), e).await);
            }
        }

        self.store
            .volumes
            .mark_volume_created(volume.record().id)
            .await?;
        if materialized {
            self.metrics.volume_created();
        }
        debug!(volume = %volume.handle(), path = %volume.path(), materialized, "Created volume");

        Ok(Some(volume))
    }

    async fn fail_volume(&self, record: &VolumeRecord, cause: WorkerError) -> WorkerError {
        error!(volume = %record.handle, error = %cause, "Failed to create volume");
        if let Err(e) = self.store.volumes.mark_volume_failed(record.id).await {
            error!(volume = %record.handle, error = %e, "Failed to mark volume failed");
        }
        self.metrics.volume_failed();
        WorkerError::VolumeMaterialization {
            handle: record.handle.clone(),
            source: Box::new(cause),
        }
    }
}
