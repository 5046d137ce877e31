//! Bookkeeping store for Berth.
//!
//! Provides repository traits with PostgreSQL and in-memory implementations,
//! plus the advisory locks used while materializing volumes.

pub mod error;
pub mod lock;
pub mod memory;
pub mod repo;

pub use error::{DbError, DbResult};
pub use lock::{Lock, LockFactory, LockId, PgLockFactory};
pub use memory::MemoryStore;
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Every repository the worker needs, behind shared trait objects.
#[derive(Clone)]
pub struct Store {
    pub volumes: Arc<dyn VolumeRepo>,
    pub containers: Arc<dyn ContainerRepo>,
    pub task_caches: Arc<dyn TaskCacheRepo>,
    pub worker_resources: Arc<dyn WorkerResourceRepo>,
    pub locks: Arc<dyn LockFactory>,
}

impl Store {
    /// Connect the repositories through a pool and the locks through their
    /// own dedicated session.
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        let pool = create_pool(database_url).await?;
        let locks = PgLockFactory::connect(database_url).await?;
        Ok(Self::postgres(pool, locks))
    }

    pub fn postgres(pool: PgPool, locks: PgLockFactory) -> Self {
        Self {
            volumes: Arc::new(PgVolumeRepo::new(pool.clone())),
            containers: Arc::new(PgContainerRepo::new(pool.clone())),
            task_caches: Arc::new(PgTaskCacheRepo::new(pool.clone())),
            worker_resources: Arc::new(PgWorkerResourceRepo::new(pool)),
            locks: Arc::new(locks),
        }
    }

    pub fn memory(store: MemoryStore) -> Self {
        Self {
            volumes: Arc::new(store.clone()),
            containers: Arc::new(store.clone()),
            task_caches: Arc::new(store.clone()),
            worker_resources: Arc::new(store.clone()),
            locks: Arc::new(store),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::Handle;

    fn database_url() -> String {
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set")
    }

    async fn test_store() -> Store {
        let pool = create_pool(&database_url()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        Store::connect(&database_url()).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_pg_container_volume_is_unique_per_mount() {
        let store = test_store().await;
        let container = Handle::generate();

        let first = store
            .volumes
            .create_container_volume(Some(1), "pg-worker", &container, "/scratch")
            .await
            .unwrap();
        let second = store
            .volumes
            .create_container_volume(Some(1), "pg-worker", &container, "/scratch")
            .await
            .unwrap();
        assert_eq!(first.handle, second.handle);

        store.volumes.mark_volume_failed(first.id).await.unwrap();
        let replacement = store
            .volumes
            .create_container_volume(Some(1), "pg-worker", &container, "/scratch")
            .await
            .unwrap();
        assert_ne!(replacement.handle, first.handle);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_pg_advisory_lock_is_exclusive() {
        let store = test_store().await;
        let volume = store.volumes.create_volume(None, "pg-worker").await.unwrap();
        let id = LockId::VolumeCreating(volume.id);

        let held = store.locks.acquire(id).await.unwrap().unwrap();
        assert!(store.locks.acquire(id).await.unwrap().is_none());

        held.release().await.unwrap();
        let again = store.locks.acquire(id).await.unwrap().unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_pg_child_volume_records_parent() {
        let store = test_store().await;
        let parent = store.volumes.create_volume(Some(1), "pg-worker").await.unwrap();
        store.volumes.mark_volume_created(parent.id).await.unwrap();

        let container = Handle::generate();
        let child = store
            .volumes
            .create_child_volume(&parent, &container, "/input")
            .await
            .unwrap();
        assert_eq!(child.parent(), Some(parent.handle.clone()));
        assert_eq!(child.mount_path.as_deref(), Some("/input"));

        store.volumes.mark_volume_created(child.id).await.unwrap();
        let mounted = store.volumes.find_volumes_for_container(&container).await.unwrap();
        assert_eq!(mounted.len(), 1);
        assert_eq!(mounted[0].handle, child.handle);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_pg_held_locks_do_not_use_pool_connections() {
        let pool = create_pool(&database_url()).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let max = pool.options().get_max_connections() as usize;
        let locks = PgLockFactory::connect(&database_url()).await.unwrap();
        let store = Store::postgres(pool, locks.clone());

        let mut held = Vec::new();
        for _ in 0..max * 2 {
            let volume = store.volumes.create_volume(None, "pg-worker").await.unwrap();
            let lock = store
                .locks
                .acquire(LockId::VolumeCreating(volume.id))
                .await
                .unwrap()
                .unwrap();
            held.push((volume, lock));
        }
        assert_eq!(locks.held(), max * 2);

        // Every holder can still reach the store while all locks are held.
        for (volume, _) in &held {
            store.volumes.mark_volume_created(volume.id).await.unwrap();
        }

        for (_, lock) in held {
            lock.release().await.unwrap();
        }
        assert_eq!(locks.held(), 0);
    }
}
