//! In-memory bookkeeping store.
//!
//! Implements every repository with the same convergence rules as the
//! Postgres store. Used for tests and single-node development.

use async_trait::async_trait;
use berth_core::{Handle, WorkerInfo};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    ContainerMetadata, ContainerOwner, ContainerRecord, ContainerRepo, ContainerState, DbError,
    DbResult, Lock, LockFactory, LockId, TaskCache, TaskCacheRepo, VolumeRecord, VolumeRepo,
    VolumeState, WorkerBaseResourceType, WorkerResourceCerts, WorkerResourceRepo,
    WorkerTaskCache,
};

#[derive(Default)]
struct State {
    next_id: i64,
    volumes: Vec<VolumeRecord>,
    containers: Vec<ContainerRecord>,
    task_caches: Vec<TaskCache>,
    worker_task_caches: Vec<WorkerTaskCache>,
    base_resource_types: Vec<WorkerBaseResourceType>,
    resource_certs: Vec<WorkerResourceCerts>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn new_volume(&mut self, worker_name: &str, team_id: Option<i32>) -> VolumeRecord {
        VolumeRecord {
            id: self.next_id(),
            handle: Handle::generate(),
            worker_name: worker_name.to_string(),
            team_id,
            state: VolumeState::Creating,
            parent_handle: None,
            container_handle: None,
            mount_path: None,
            resource_cache_id: None,
            worker_task_cache_id: None,
            worker_base_resource_type_id: None,
            worker_resource_certs_id: None,
            source_worker: None,
            created_at: Utc::now(),
        }
    }

    fn find_volume_by<F>(&self, pred: F) -> Option<VolumeRecord>
    where
        F: Fn(&VolumeRecord) -> bool,
    {
        self.volumes
            .iter()
            .find(|v| v.state != VolumeState::Failed && pred(v))
            .cloned()
    }

    /// Insert `volume` unless a non-failed record matching `same_key` exists.
    fn insert_volume_or_existing<F>(&mut self, volume: VolumeRecord, same_key: F) -> VolumeRecord
    where
        F: Fn(&VolumeRecord) -> bool,
    {
        if let Some(existing) = self.find_volume_by(same_key) {
            return existing;
        }
        self.volumes.push(volume.clone());
        volume
    }

    fn volume_mut(&mut self, id: i64) -> DbResult<&mut VolumeRecord> {
        self.volumes
            .iter_mut()
            .find(|v| v.id == id)
            .ok_or_else(|| DbError::NotFound(format!("volume {}", id)))
    }

    fn set_resource_cache(
        &mut self,
        id: i64,
        resource_cache_id: i64,
        source_worker: Option<&str>,
    ) -> DbResult<bool> {
        let volume = self
            .volumes
            .iter()
            .find(|v| v.id == id && v.state == VolumeState::Created)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("created volume {}", id)))?;

        let taken = self.volumes.iter().any(|v| {
            v.id != id
                && v.state != VolumeState::Failed
                && v.worker_name == volume.worker_name
                && v.resource_cache_id == Some(resource_cache_id)
        });
        if taken {
            return Ok(false);
        }

        let volume = self.volume_mut(id)?;
        volume.resource_cache_id = Some(resource_cache_id);
        if let Some(source) = source_worker {
            volume.source_worker = Some(source.to_string());
        }
        Ok(true)
    }
}

/// Bookkeeping store held entirely in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    locks: Arc<Mutex<HashSet<LockId>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the guard cannot leave the vectors torn.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every volume record, including failed ones.
    pub fn volumes(&self) -> Vec<VolumeRecord> {
        self.state().volumes.clone()
    }

    /// Snapshot of every container record, including failed ones.
    pub fn containers(&self) -> Vec<ContainerRecord> {
        self.state().containers.clone()
    }

    pub fn is_locked(&self, id: LockId) -> bool {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }
}

#[async_trait]
impl VolumeRepo for MemoryStore {
    async fn find_volume(&self, handle: &Handle) -> DbResult<Option<VolumeRecord>> {
        Ok(self.state().find_volume_by(|v| &v.handle == handle))
    }

    async fn create_volume(
        &self,
        team_id: Option<i32>,
        worker_name: &str,
    ) -> DbResult<VolumeRecord> {
        let mut state = self.state();
        let volume = state.new_volume(worker_name, team_id);
        state.volumes.push(volume.clone());
        Ok(volume)
    }

    async fn find_container_volume(
        &self,
        container: &Handle,
        mount_path: &str,
    ) -> DbResult<Option<VolumeRecord>> {
        Ok(self.state().find_volume_by(|v| {
            v.container_handle.as_deref() == Some(container.as_str())
                && v.mount_path.as_deref() == Some(mount_path)
        }))
    }

    async fn create_container_volume(
        &self,
        team_id: Option<i32>,
        worker_name: &str,
        container: &Handle,
        mount_path: &str,
    ) -> DbResult<VolumeRecord> {
        let mut state = self.state();
        let mut volume = state.new_volume(worker_name, team_id);
        volume.container_handle = Some(container.to_string());
        volume.mount_path = Some(mount_path.to_string());
        Ok(state.insert_volume_or_existing(volume, |v| {
            v.container_handle.as_deref() == Some(container.as_str())
                && v.mount_path.as_deref() == Some(mount_path)
        }))
    }

    async fn create_child_volume(
        &self,
        parent: &VolumeRecord,
        container: &Handle,
        mount_path: &str,
    ) -> DbResult<VolumeRecord> {
        let mut state = self.state();
        let mut volume = state.new_volume(&parent.worker_name, parent.team_id);
        volume.parent_handle = Some(parent.handle.to_string());
        volume.container_handle = Some(container.to_string());
        volume.mount_path = Some(mount_path.to_string());
        Ok(state.insert_volume_or_existing(volume, |v| {
            v.container_handle.as_deref() == Some(container.as_str())
                && v.mount_path.as_deref() == Some(mount_path)
        }))
    }

    async fn find_volumes_for_container(
        &self,
        container: &Handle,
    ) -> DbResult<Vec<VolumeRecord>> {
        let mut volumes: Vec<VolumeRecord> = self
            .state()
            .volumes
            .iter()
            .filter(|v| {
                v.state == VolumeState::Created
                    && v.container_handle.as_deref() == Some(container.as_str())
            })
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.mount_path.cmp(&b.mount_path));
        Ok(volumes)
    }

    async fn find_base_resource_type_volume(
        &self,
        base: &WorkerBaseResourceType,
    ) -> DbResult<Option<VolumeRecord>> {
        Ok(self
            .state()
            .find_volume_by(|v| v.worker_base_resource_type_id == Some(base.id)))
    }

    async fn create_base_resource_type_volume(
        &self,
        base: &WorkerBaseResourceType,
    ) -> DbResult<VolumeRecord> {
        let mut state = self.state();
        let mut volume = state.new_volume(&base.worker_name, None);
        volume.worker_base_resource_type_id = Some(base.id);
        Ok(state.insert_volume_or_existing(volume, |v| {
            v.worker_base_resource_type_id == Some(base.id)
        }))
    }

    async fn find_resource_certs_volume(
        &self,
        certs: &WorkerResourceCerts,
    ) -> DbResult<Option<VolumeRecord>> {
        Ok(self
            .state()
            .find_volume_by(|v| v.worker_resource_certs_id == Some(certs.id)))
    }

    async fn create_resource_certs_volume(
        &self,
        certs: &WorkerResourceCerts,
    ) -> DbResult<VolumeRecord> {
        let mut state = self.state();
        let mut volume = state.new_volume(&certs.worker_name, None);
        volume.worker_resource_certs_id = Some(certs.id);
        Ok(state.insert_volume_or_existing(volume, |v| {
            v.worker_resource_certs_id == Some(certs.id)
        }))
    }

    async fn find_task_cache_volume(
        &self,
        cache: &WorkerTaskCache,
    ) -> DbResult<Option<VolumeRecord>> {
        Ok(self
            .state()
            .find_volume_by(|v| v.worker_task_cache_id == Some(cache.id)))
    }

    async fn find_resource_cache_volume(
        &self,
        worker_name: &str,
        resource_cache_id: i64,
    ) -> DbResult<Option<VolumeRecord>> {
        Ok(self.state().find_volume_by(|v| {
            v.worker_name == worker_name && v.resource_cache_id == Some(resource_cache_id)
        }))
    }

    async fn create_streamed_resource_cache_volume(
        &self,
        team_id: Option<i32>,
        worker_name: &str,
        resource_cache_id: i64,
        source_worker: &str,
    ) -> DbResult<VolumeRecord> {
        let mut state = self.state();
        let mut volume = state.new_volume(worker_name, team_id);
        volume.resource_cache_id = Some(resource_cache_id);
        volume.source_worker = Some(source_worker.to_string());
        Ok(state.insert_volume_or_existing(volume, |v| {
            v.worker_name == worker_name && v.resource_cache_id == Some(resource_cache_id)
        }))
    }

    async fn mark_volume_created(&self, id: i64) -> DbResult<()> {
        let mut state = self.state();
        let volume = state.volume_mut(id)?;
        if volume.state == VolumeState::Failed {
            return Err(DbError::InvalidState(format!(
                "volume {} is failed or missing",
                id
            )));
        }
        volume.state = VolumeState::Created;
        Ok(())
    }

    async fn mark_volume_failed(&self, id: i64) -> DbResult<()> {
        let mut state = self.state();
        state.volume_mut(id)?.state = VolumeState::Failed;
        Ok(())
    }

    async fn initialize_resource_cache(&self, id: i64, resource_cache_id: i64) -> DbResult<bool> {
        self.state().set_resource_cache(id, resource_cache_id, None)
    }

    async fn initialize_streamed_resource_cache(
        &self,
        id: i64,
        resource_cache_id: i64,
        source_worker: &str,
    ) -> DbResult<bool> {
        self.state()
            .set_resource_cache(id, resource_cache_id, Some(source_worker))
    }

    async fn initialize_task_cache(&self, id: i64, cache: &WorkerTaskCache) -> DbResult<()> {
        let mut state = self.state();
        if !state
            .volumes
            .iter()
            .any(|v| v.id == id && v.state == VolumeState::Created)
        {
            return Err(DbError::NotFound(format!("created volume {}", id)));
        }
        for volume in state.volumes.iter_mut() {
            if volume.id != id && volume.worker_task_cache_id == Some(cache.id) {
                volume.worker_task_cache_id = None;
            }
        }
        state.volume_mut(id)?.worker_task_cache_id = Some(cache.id);
        Ok(())
    }
}

#[async_trait]
impl ContainerRepo for MemoryStore {
    async fn find_container(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
    ) -> DbResult<Option<ContainerRecord>> {
        let key = owner.key();
        Ok(self
            .state()
            .containers
            .iter()
            .find(|c| {
                c.worker_name == worker_name
                    && c.owner_key == key
                    && c.state != ContainerState::Failed
            })
            .cloned())
    }

    async fn create_container(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> DbResult<ContainerRecord> {
        let key = owner.key();
        let mut state = self.state();
        if let Some(existing) = state.containers.iter().find(|c| {
            c.worker_name == worker_name && c.owner_key == key && c.state != ContainerState::Failed
        }) {
            return Ok(existing.clone());
        }

        let container = ContainerRecord {
            id: state.next_id(),
            handle: owner.new_handle(),
            worker_name: worker_name.to_string(),
            owner_key: key,
            state: ContainerState::Creating,
            metadata: metadata.clone(),
            created_at: Utc::now(),
        };
        state.containers.push(container.clone());
        Ok(container)
    }

    async fn mark_container_created(&self, id: i64) -> DbResult<()> {
        let mut state = self.state();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DbError::NotFound(format!("container {}", id)))?;
        if container.state == ContainerState::Failed {
            return Err(DbError::InvalidState(format!(
                "container {} is failed or missing",
                id
            )));
        }
        container.state = ContainerState::Created;
        Ok(())
    }

    async fn mark_container_failed(&self, id: i64) -> DbResult<()> {
        let mut state = self.state();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DbError::NotFound(format!("container {}", id)))?;
        container.state = ContainerState::Failed;
        Ok(())
    }
}

#[async_trait]
impl TaskCacheRepo for MemoryStore {
    async fn find_task_cache(
        &self,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> DbResult<Option<TaskCache>> {
        Ok(self
            .state()
            .task_caches
            .iter()
            .find(|c| c.job_id == job_id && c.step_name == step_name && c.path == path)
            .cloned())
    }

    async fn find_or_create_task_cache(
        &self,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> DbResult<TaskCache> {
        let mut state = self.state();
        if let Some(existing) = state
            .task_caches
            .iter()
            .find(|c| c.job_id == job_id && c.step_name == step_name && c.path == path)
        {
            return Ok(existing.clone());
        }
        let cache = TaskCache {
            id: state.next_id(),
            job_id,
            step_name: step_name.to_string(),
            path: path.to_string(),
        };
        state.task_caches.push(cache.clone());
        Ok(cache)
    }

    async fn find_worker_task_cache(
        &self,
        worker_name: &str,
        task_cache_id: i64,
    ) -> DbResult<Option<WorkerTaskCache>> {
        Ok(self
            .state()
            .worker_task_caches
            .iter()
            .find(|c| c.worker_name == worker_name && c.task_cache_id == task_cache_id)
            .cloned())
    }

    async fn find_or_create_worker_task_cache(
        &self,
        worker_name: &str,
        task_cache_id: i64,
    ) -> DbResult<WorkerTaskCache> {
        let mut state = self.state();
        if let Some(existing) = state
            .worker_task_caches
            .iter()
            .find(|c| c.worker_name == worker_name && c.task_cache_id == task_cache_id)
        {
            return Ok(existing.clone());
        }
        let cache = WorkerTaskCache {
            id: state.next_id(),
            worker_name: worker_name.to_string(),
            task_cache_id,
        };
        state.worker_task_caches.push(cache.clone());
        Ok(cache)
    }
}

#[async_trait]
impl WorkerResourceRepo for MemoryStore {
    async fn save_worker_resources(&self, info: &WorkerInfo) -> DbResult<()> {
        let mut state = self.state();

        for rt in &info.resource_types {
            state.base_resource_types.retain(|b| {
                !(b.worker_name == info.name
                    && b.name == rt.type_name
                    && (b.image != rt.image_path
                        || b.version != rt.version
                        || b.privileged != rt.privileged))
            });
            let exists = state
                .base_resource_types
                .iter()
                .any(|b| b.worker_name == info.name && b.name == rt.type_name);
            if !exists {
                let base = WorkerBaseResourceType {
                    id: state.next_id(),
                    worker_name: info.name.clone(),
                    name: rt.type_name.clone(),
                    image: rt.image_path.clone(),
                    version: rt.version.clone(),
                    privileged: rt.privileged,
                };
                state.base_resource_types.push(base);
            }
        }

        match &info.certs_path {
            Some(certs_path) => {
                state
                    .resource_certs
                    .retain(|c| !(c.worker_name == info.name && &c.certs_path != certs_path));
                if !state.resource_certs.iter().any(|c| c.worker_name == info.name) {
                    let certs = WorkerResourceCerts {
                        id: state.next_id(),
                        worker_name: info.name.clone(),
                        certs_path: certs_path.clone(),
                    };
                    state.resource_certs.push(certs);
                }
            }
            None => state.resource_certs.retain(|c| c.worker_name != info.name),
        }
        Ok(())
    }

    async fn find_base_resource_type(
        &self,
        worker_name: &str,
        name: &str,
    ) -> DbResult<Option<WorkerBaseResourceType>> {
        Ok(self
            .state()
            .base_resource_types
            .iter()
            .find(|b| b.worker_name == worker_name && b.name == name)
            .cloned())
    }

    async fn find_resource_certs(
        &self,
        worker_name: &str,
    ) -> DbResult<Option<WorkerResourceCerts>> {
        Ok(self
            .state()
            .resource_certs
            .iter()
            .find(|c| c.worker_name == worker_name)
            .cloned())
    }
}

struct MemoryLock {
    id: LockId,
    locks: Arc<Mutex<HashSet<LockId>>>,
}

#[async_trait]
impl Lock for MemoryLock {
    async fn release(self: Box<Self>) -> DbResult<()> {
        // Dropping removes the entry.
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

#[async_trait]
impl LockFactory for MemoryStore {
    async fn acquire(&self, id: LockId) -> DbResult<Option<Box<dyn Lock>>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if !locks.insert(id) {
            return Ok(None);
        }
        Ok(Some(Box::new(MemoryLock {
            id,
            locks: self.locks.clone(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::WorkerResourceType;

    #[tokio::test]
    async fn test_create_container_volume_converges() {
        let store = MemoryStore::new();
        let container = Handle::from("c1");

        let first = store
            .create_container_volume(Some(1), "w1", &container, "/scratch")
            .await
            .unwrap();
        let second = store
            .create_container_volume(Some(1), "w1", &container, "/scratch")
            .await
            .unwrap();
        assert_eq!(first.handle, second.handle);
        assert_eq!(store.volumes().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_volume_is_replaced() {
        let store = MemoryStore::new();
        let container = Handle::from("c1");

        let first = store
            .create_container_volume(None, "w1", &container, "/out")
            .await
            .unwrap();
        store.mark_volume_failed(first.id).await.unwrap();

        assert!(
            store
                .find_container_volume(&container, "/out")
                .await
                .unwrap()
                .is_none()
        );

        let second = store
            .create_container_volume(None, "w1", &container, "/out")
            .await
            .unwrap();
        assert_ne!(first.handle, second.handle);
        assert!(store.mark_volume_created(first.id).await.is_err());
    }

    #[tokio::test]
    async fn test_child_volume_records_parent() {
        let store = MemoryStore::new();
        let parent = store.create_volume(Some(3), "w1").await.unwrap();
        let child = store
            .create_child_volume(&parent, &Handle::from("c1"), "/in")
            .await
            .unwrap();

        assert_eq!(child.parent(), Some(parent.handle.clone()));
        assert_eq!(child.team_id, Some(3));
        assert_eq!(child.worker_name, "w1");
    }

    #[tokio::test]
    async fn test_resource_cache_initialized_once_per_worker() {
        let store = MemoryStore::new();
        let a = store.create_volume(None, "w1").await.unwrap();
        let b = store.create_volume(None, "w1").await.unwrap();
        store.mark_volume_created(a.id).await.unwrap();
        store.mark_volume_created(b.id).await.unwrap();

        assert!(store.initialize_resource_cache(a.id, 9).await.unwrap());
        assert!(!store.initialize_resource_cache(b.id, 9).await.unwrap());

        let found = store.find_resource_cache_volume("w1", 9).await.unwrap();
        assert_eq!(found.map(|v| v.id), Some(a.id));
    }

    #[tokio::test]
    async fn test_task_cache_moves_to_new_volume() {
        let store = MemoryStore::new();
        let cache = store.find_or_create_task_cache(1, "build", "/cache").await.unwrap();
        let worker_cache = store
            .find_or_create_worker_task_cache("w1", cache.id)
            .await
            .unwrap();

        let old = store.create_volume(None, "w1").await.unwrap();
        let new = store.create_volume(None, "w1").await.unwrap();
        store.mark_volume_created(old.id).await.unwrap();
        store.mark_volume_created(new.id).await.unwrap();

        store.initialize_task_cache(old.id, &worker_cache).await.unwrap();
        store.initialize_task_cache(new.id, &worker_cache).await.unwrap();

        let holder = store.find_task_cache_volume(&worker_cache).await.unwrap();
        assert_eq!(holder.map(|v| v.id), Some(new.id));
    }

    #[tokio::test]
    async fn test_container_create_converges_per_owner() {
        let store = MemoryStore::new();
        let owner = ContainerOwner::BuildStep {
            build_id: 1,
            plan_id: "p1".to_string(),
            team_id: 1,
        };
        let metadata = ContainerMetadata::default();

        let first = store.create_container("w1", &owner, &metadata).await.unwrap();
        let second = store.create_container("w1", &owner, &metadata).await.unwrap();
        assert_eq!(first.handle, second.handle);

        // Same owner on another worker is a different container.
        let other = store.create_container("w2", &owner, &metadata).await.unwrap();
        assert_ne!(first.handle, other.handle);
    }

    #[tokio::test]
    async fn test_base_resource_type_changes_get_new_id() {
        let store = MemoryStore::new();
        let mut info = WorkerInfo::new("w1");
        info.resource_types.push(WorkerResourceType {
            type_name: "git".to_string(),
            image_path: "/opt/git".to_string(),
            version: "1".to_string(),
            privileged: false,
        });
        store.save_worker_resources(&info).await.unwrap();
        let v1 = store.find_base_resource_type("w1", "git").await.unwrap().unwrap();

        store.save_worker_resources(&info).await.unwrap();
        let same = store.find_base_resource_type("w1", "git").await.unwrap().unwrap();
        assert_eq!(v1.id, same.id);

        info.resource_types[0].version = "2".to_string();
        store.save_worker_resources(&info).await.unwrap();
        let v2 = store.find_base_resource_type("w1", "git").await.unwrap().unwrap();
        assert_ne!(v1.id, v2.id);
        assert_eq!(v2.version, "2");
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let id = LockId::VolumeCreating(1);

        let lock = store.acquire(id).await.unwrap().unwrap();
        assert!(store.acquire(id).await.unwrap().is_none());
        assert!(store.is_locked(id));

        lock.release().await.unwrap();
        assert!(!store.is_locked(id));
        assert!(store.acquire(id).await.unwrap().is_some());
    }
}
