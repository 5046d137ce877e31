//! Volume repository.
//!
//! Every volume record is keyed by what it is for: a mount path in a
//! container, a base resource type, a resource cache on a worker, and so on.
//! Creating a record for a key that already has a non-failed record returns
//! that record, so concurrent requesters converge on a single handle.

use async_trait::async_trait;
use berth_core::Handle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult, WorkerBaseResourceType, WorkerResourceCerts, WorkerTaskCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "volume_state", rename_all = "lowercase")]
pub enum VolumeState {
    Creating,
    Created,
    Failed,
}

/// Bookkeeping record for a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct VolumeRecord {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub handle: Handle,
    pub worker_name: String,
    pub team_id: Option<i32>,
    pub state: VolumeState,
    pub parent_handle: Option<String>,
    pub container_handle: Option<String>,
    pub mount_path: Option<String>,
    pub resource_cache_id: Option<i64>,
    pub worker_task_cache_id: Option<i64>,
    pub worker_base_resource_type_id: Option<i64>,
    pub worker_resource_certs_id: Option<i64>,
    pub source_worker: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl VolumeRecord {
    pub fn is_created(&self) -> bool {
        self.state == VolumeState::Created
    }

    pub fn parent(&self) -> Option<Handle> {
        self.parent_handle.clone().map(Handle::from)
    }
}

#[async_trait]
pub trait VolumeRepo: Send + Sync {
    /// Find a non-failed volume by handle.
    async fn find_volume(&self, handle: &Handle) -> DbResult<Option<VolumeRecord>>;

    /// Create a volume not tied to any key (artifacts, task cache imports).
    async fn create_volume(&self, team_id: Option<i32>, worker_name: &str)
    -> DbResult<VolumeRecord>;

    async fn find_container_volume(
        &self,
        container: &Handle,
        mount_path: &str,
    ) -> DbResult<Option<VolumeRecord>>;

    async fn create_container_volume(
        &self,
        team_id: Option<i32>,
        worker_name: &str,
        container: &Handle,
        mount_path: &str,
    ) -> DbResult<VolumeRecord>;

    /// Create a copy-on-write child of `parent` mounted in a container.
    async fn create_child_volume(
        &self,
        parent: &VolumeRecord,
        container: &Handle,
        mount_path: &str,
    ) -> DbResult<VolumeRecord>;

    /// Created volumes belonging to a container, ordered by mount path.
    async fn find_volumes_for_container(&self, container: &Handle)
    -> DbResult<Vec<VolumeRecord>>;

    async fn find_base_resource_type_volume(
        &self,
        base: &WorkerBaseResourceType,
    ) -> DbResult<Option<VolumeRecord>>;

    async fn create_base_resource_type_volume(
        &self,
        base: &WorkerBaseResourceType,
    ) -> DbResult<VolumeRecord>;

    async fn find_resource_certs_volume(
        &self,
        certs: &WorkerResourceCerts,
    ) -> DbResult<Option<VolumeRecord>>;

    async fn create_resource_certs_volume(
        &self,
        certs: &WorkerResourceCerts,
    ) -> DbResult<VolumeRecord>;

    async fn find_task_cache_volume(
        &self,
        cache: &WorkerTaskCache,
    ) -> DbResult<Option<VolumeRecord>>;

    /// Find the non-failed volume holding a resource cache on a worker.
    async fn find_resource_cache_volume(
        &self,
        worker_name: &str,
        resource_cache_id: i64,
    ) -> DbResult<Option<VolumeRecord>>;

    /// Create the volume a remote resource cache is streamed into.
    async fn create_streamed_resource_cache_volume(
        &self,
        team_id: Option<i32>,
        worker_name: &str,
        resource_cache_id: i64,
        source_worker: &str,
    ) -> DbResult<VolumeRecord>;

    async fn mark_volume_created(&self, id: i64) -> DbResult<()>;

    async fn mark_volume_failed(&self, id: i64) -> DbResult<()>;

    /// Mark a volume as holding a resource cache. Returns `false` if another
    /// volume on the worker already holds it.
    async fn initialize_resource_cache(&self, id: i64, resource_cache_id: i64) -> DbResult<bool>;

    async fn initialize_streamed_resource_cache(
        &self,
        id: i64,
        resource_cache_id: i64,
        source_worker: &str,
    ) -> DbResult<bool>;

    /// Make a volume the current holder of a worker task cache, releasing
    /// any previous holder.
    async fn initialize_task_cache(&self, id: i64, cache: &WorkerTaskCache) -> DbResult<()>;
}

/// PostgreSQL implementation of VolumeRepo.
pub struct PgVolumeRepo {
    pool: PgPool,
}

impl PgVolumeRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(&self, sql: &str, bind: i64) -> DbResult<Option<VolumeRecord>> {
        let volume = sqlx::query_as::<_, VolumeRecord>(sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await?;
        Ok(volume)
    }

    async fn set_resource_cache(
        &self,
        id: i64,
        resource_cache_id: i64,
        source_worker: Option<&str>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE volumes
            SET resource_cache_id = $2, source_worker = COALESCE($3, source_worker)
            WHERE id = $1 AND state = 'created'
            "#,
        )
        .bind(id)
        .bind(resource_cache_id)
        .bind(source_worker)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                Err(DbError::NotFound(format!("created volume {}", id)))
            }
            Ok(_) => Ok(true),
            Err(e) if crate::error::is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl VolumeRepo for PgVolumeRepo {
    async fn find_volume(&self, handle: &Handle) -> DbResult<Option<VolumeRecord>> {
        let volume = sqlx::query_as::<_, VolumeRecord>(
            "SELECT * FROM volumes WHERE handle = $1 AND state <> 'failed'",
        )
        .bind(handle.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(volume)
    }

    async fn create_volume(
        &self,
        team_id: Option<i32>,
        worker_name: &str,
    ) -> DbResult<VolumeRecord> {
        let volume = sqlx::query_as::<_, VolumeRecord>(
            r#"
            INSERT INTO volumes (handle, worker_name, team_id, state, created_at)
            VALUES ($1, $2, $3, 'creating', NOW())
            RETURNING *
            "#,
        )
        .bind(Handle::generate().as_str())
        .bind(worker_name)
        .bind(team_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(volume)
    }

    async fn find_container_volume(
        &self,
        container: &Handle,
        mount_path: &str,
    ) -> DbResult<Option<VolumeRecord>> {
        let volume = sqlx::query_as::<_, VolumeRecord>(
            r#"
            SELECT * FROM volumes
            WHERE container_handle = $1 AND mount_path = $2 AND state <> 'failed'
            "#,
        )
        .bind(container.as_str())
        .bind(mount_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(volume)
    }

    async fn create_container_volume(
        &self,
        team_id: Option<i32>,
        worker_name: &str,
        container: &Handle,
        mount_path: &str,
    ) -> DbResult<VolumeRecord> {
        let inserted = sqlx::query_as::<_, VolumeRecord>(
            r#"
            INSERT INTO volumes (handle, worker_name, team_id, state, container_handle, mount_path, created_at)
            VALUES ($1, $2, $3, 'creating', $4, $5, NOW())
            ON CONFLICT (container_handle, mount_path)
                WHERE state <> 'failed' AND container_handle IS NOT NULL
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Handle::generate().as_str())
        .bind(worker_name)
        .bind(team_id)
        .bind(container.as_str())
        .bind(mount_path)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(volume) => Ok(volume),
            None => self
                .find_container_volume(container, mount_path)
                .await?
                .ok_or_else(|| {
                    DbError::Duplicate(format!("volume for {} in {}", mount_path, container))
                }),
        }
    }

    async fn create_child_volume(
        &self,
        parent: &VolumeRecord,
        container: &Handle,
        mount_path: &str,
    ) -> DbResult<VolumeRecord> {
        let inserted = sqlx::query_as::<_, VolumeRecord>(
            r#"
            INSERT INTO volumes (handle, worker_name, team_id, state, parent_handle, container_handle, mount_path, created_at)
            VALUES ($1, $2, $3, 'creating', $4, $5, $6, NOW())
            ON CONFLICT (container_handle, mount_path)
                WHERE state <> 'failed' AND container_handle IS NOT NULL
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Handle::generate().as_str())
        .bind(&parent.worker_name)
        .bind(parent.team_id)
        .bind(parent.handle.as_str())
        .bind(container.as_str())
        .bind(mount_path)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(volume) => Ok(volume),
            None => self
                .find_container_volume(container, mount_path)
                .await?
                .ok_or_else(|| {
                    DbError::Duplicate(format!("volume for {} in {}", mount_path, container))
                }),
        }
    }

    async fn find_volumes_for_container(
        &self,
        container: &Handle,
    ) -> DbResult<Vec<VolumeRecord>> {
        let volumes = sqlx::query_as::<_, VolumeRecord>(
            r#"
            SELECT * FROM volumes
            WHERE container_handle = $1 AND state = 'created'
            ORDER BY mount_path
            "#,
        )
        .bind(container.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(volumes)
    }

    async fn find_base_resource_type_volume(
        &self,
        base: &WorkerBaseResourceType,
    ) -> DbResult<Option<VolumeRecord>> {
        self.find_one(
            "SELECT * FROM volumes WHERE worker_base_resource_type_id = $1 AND state <> 'failed'",
            base.id,
        )
        .await
    }

    async fn create_base_resource_type_volume(
        &self,
        base: &WorkerBaseResourceType,
    ) -> DbResult<VolumeRecord> {
        let inserted = sqlx::query_as::<_, VolumeRecord>(
            r#"
            INSERT INTO volumes (handle, worker_name, state, worker_base_resource_type_id, created_at)
            VALUES ($1, $2, 'creating', $3, NOW())
            ON CONFLICT (worker_base_resource_type_id)
                WHERE state <> 'failed' AND worker_base_resource_type_id IS NOT NULL
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Handle::generate().as_str())
        .bind(&base.worker_name)
        .bind(base.id)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(volume) => Ok(volume),
            None => self
                .find_base_resource_type_volume(base)
                .await?
                .ok_or_else(|| DbError::Duplicate(format!("base resource type volume {}", base.name))),
        }
    }

    async fn find_resource_certs_volume(
        &self,
        certs: &WorkerResourceCerts,
    ) -> DbResult<Option<VolumeRecord>> {
        self.find_one(
            "SELECT * FROM volumes WHERE worker_resource_certs_id = $1 AND state <> 'failed'",
            certs.id,
        )
        .await
    }

    async fn create_resource_certs_volume(
        &self,
        certs: &WorkerResourceCerts,
    ) -> DbResult<VolumeRecord> {
        let inserted = sqlx::query_as::<_, VolumeRecord>(
            r#"
            INSERT INTO volumes (handle, worker_name, state, worker_resource_certs_id, created_at)
            VALUES ($1, $2, 'creating', $3, NOW())
            ON CONFLICT (worker_resource_certs_id)
                WHERE state <> 'failed' AND worker_resource_certs_id IS NOT NULL
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Handle::generate().as_str())
        .bind(&certs.worker_name)
        .bind(certs.id)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(volume) => Ok(volume),
            None => self
                .find_resource_certs_volume(certs)
                .await?
                .ok_or_else(|| {
                    DbError::Duplicate(format!("resource certs volume on {}", certs.worker_name))
                }),
        }
    }

    async fn find_task_cache_volume(
        &self,
        cache: &WorkerTaskCache,
    ) -> DbResult<Option<VolumeRecord>> {
        self.find_one(
            "SELECT * FROM volumes WHERE worker_task_cache_id = $1 AND state <> 'failed'",
            cache.id,
        )
        .await
    }

    async fn find_resource_cache_volume(
        &self,
        worker_name: &str,
        resource_cache_id: i64,
    ) -> DbResult<Option<VolumeRecord>> {
        let volume = sqlx::query_as::<_, VolumeRecord>(
            r#"
            SELECT * FROM volumes
            WHERE worker_name = $1 AND resource_cache_id = $2 AND state <> 'failed'
            "#,
        )
        .bind(worker_name)
        .bind(resource_cache_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(volume)
    }

    async fn create_streamed_resource_cache_volume(
        &self,
        team_id: Option<i32>,
        worker_name: &str,
        resource_cache_id: i64,
        source_worker: &str,
    ) -> DbResult<VolumeRecord> {
        let inserted = sqlx::query_as::<_, VolumeRecord>(
            r#"
            INSERT INTO volumes (handle, worker_name, team_id, state, resource_cache_id, source_worker, created_at)
            VALUES ($1, $2, $3, 'creating', $4, $5, NOW())
            ON CONFLICT (worker_name, resource_cache_id)
                WHERE state <> 'failed' AND resource_cache_id IS NOT NULL
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Handle::generate().as_str())
        .bind(worker_name)
        .bind(team_id)
        .bind(resource_cache_id)
        .bind(source_worker)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(volume) => Ok(volume),
            None => self
                .find_resource_cache_volume(worker_name, resource_cache_id)
                .await?
                .ok_or_else(|| {
                    DbError::Duplicate(format!(
                        "resource cache {} volume on {}",
                        resource_cache_id, worker_name
                    ))
                }),
        }
    }

    async fn mark_volume_created(&self, id: i64) -> DbResult<()> {
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE volumes SET state = 'created'
            WHERE id = $1 AND state IN ('creating', 'created')
            RETURNING id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        updated
            .map(|_| ())
            .ok_or_else(|| DbError::InvalidState(format!("volume {} is failed or missing", id)))
    }

    async fn mark_volume_failed(&self, id: i64) -> DbResult<()> {
        sqlx::query("UPDATE volumes SET state = 'failed' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn initialize_resource_cache(&self, id: i64, resource_cache_id: i64) -> DbResult<bool> {
        self.set_resource_cache(id, resource_cache_id, None).await
    }

    async fn initialize_streamed_resource_cache(
        &self,
        id: i64,
        resource_cache_id: i64,
        source_worker: &str,
    ) -> DbResult<bool> {
        self.set_resource_cache(id, resource_cache_id, Some(source_worker))
            .await
    }

    async fn initialize_task_cache(&self, id: i64, cache: &WorkerTaskCache) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE volumes SET worker_task_cache_id = NULL WHERE worker_task_cache_id = $1 AND id <> $2",
        )
        .bind(cache.id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let done = sqlx::query(
            "UPDATE volumes SET worker_task_cache_id = $2 WHERE id = $1 AND state = 'created'",
        )
        .bind(id)
        .bind(cache.id)
        .execute(&mut *tx)
        .await?;

        if done.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("created volume {}", id)));
        }

        tx.commit().await?;
        Ok(())
    }
}
