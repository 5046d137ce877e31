//! Task cache repository.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::DbResult;

/// A cache directory declared by a task step of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TaskCache {
    pub id: i64,
    pub job_id: i64,
    pub step_name: String,
    pub path: String,
}

/// A task cache as it exists on one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerTaskCache {
    pub id: i64,
    pub worker_name: String,
    pub task_cache_id: i64,
}

#[async_trait]
pub trait TaskCacheRepo: Send + Sync {
    async fn find_task_cache(
        &self,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> DbResult<Option<TaskCache>>;

    async fn find_or_create_task_cache(
        &self,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> DbResult<TaskCache>;

    async fn find_worker_task_cache(
        &self,
        worker_name: &str,
        task_cache_id: i64,
    ) -> DbResult<Option<WorkerTaskCache>>;

    async fn find_or_create_worker_task_cache(
        &self,
        worker_name: &str,
        task_cache_id: i64,
    ) -> DbResult<WorkerTaskCache>;
}

/// PostgreSQL implementation of TaskCacheRepo.
pub struct PgTaskCacheRepo {
    pool: PgPool,
}

impl PgTaskCacheRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskCacheRepo for PgTaskCacheRepo {
    async fn find_task_cache(
        &self,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> DbResult<Option<TaskCache>> {
        let cache = sqlx::query_as::<_, TaskCache>(
            "SELECT * FROM task_caches WHERE job_id = $1 AND step_name = $2 AND path = $3",
        )
        .bind(job_id)
        .bind(step_name)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cache)
    }

    async fn find_or_create_task_cache(
        &self,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> DbResult<TaskCache> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let cache = sqlx::query_as::<_, TaskCache>(
            r#"
            INSERT INTO task_caches (job_id, step_name, path)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_id, step_name, path) DO UPDATE SET job_id = EXCLUDED.job_id
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(step_name)
        .bind(path)
        .fetch_one(&self.pool)
        .await?;
        Ok(cache)
    }

    async fn find_worker_task_cache(
        &self,
        worker_name: &str,
        task_cache_id: i64,
    ) -> DbResult<Option<WorkerTaskCache>> {
        let cache = sqlx::query_as::<_, WorkerTaskCache>(
            "SELECT * FROM worker_task_caches WHERE worker_name = $1 AND task_cache_id = $2",
        )
        .bind(worker_name)
        .bind(task_cache_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cache)
    }

    async fn find_or_create_worker_task_cache(
        &self,
        worker_name: &str,
        task_cache_id: i64,
    ) -> DbResult<WorkerTaskCache> {
        let cache = sqlx::query_as::<_, WorkerTaskCache>(
            r#"
            INSERT INTO worker_task_caches (worker_name, task_cache_id)
            VALUES ($1, $2)
            ON CONFLICT (worker_name, task_cache_id) DO UPDATE SET worker_name = EXCLUDED.worker_name
            RETURNING *
            "#,
        )
        .bind(worker_name)
        .bind(task_cache_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(cache)
    }
}
