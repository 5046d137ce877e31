//! Worker resource repository: base resource types and certificates a worker
//! advertises.

use async_trait::async_trait;
use berth_core::WorkerInfo;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;

use crate::DbResult;

/// A base resource type installed on a worker.
///
/// A change of image, version or privilege gets a new id, so volumes
/// imported from an older install are never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerBaseResourceType {
    pub id: i64,
    pub worker_name: String,
    pub name: String,
    pub image: String,
    pub version: String,
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerResourceCerts {
    pub id: i64,
    pub worker_name: String,
    pub certs_path: String,
}

#[async_trait]
pub trait WorkerResourceRepo: Send + Sync {
    /// Record the resource types and certificates a worker advertises.
    async fn save_worker_resources(&self, info: &WorkerInfo) -> DbResult<()>;

    async fn find_base_resource_type(
        &self,
        worker_name: &str,
        name: &str,
    ) -> DbResult<Option<WorkerBaseResourceType>>;

    async fn find_resource_certs(&self, worker_name: &str)
    -> DbResult<Option<WorkerResourceCerts>>;
}

/// PostgreSQL implementation of WorkerResourceRepo.
pub struct PgWorkerResourceRepo {
    pool: PgPool,
}

impl PgWorkerResourceRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkerResourceRepo for PgWorkerResourceRepo {
    async fn save_worker_resources(&self, info: &WorkerInfo) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        for rt in &info.resource_types {
            sqlx::query(
                r#"
                DELETE FROM worker_base_resource_types
                WHERE worker_name = $1 AND name = $2
                  AND (image <> $3 OR version <> $4 OR privileged <> $5)
                "#,
            )
            .bind(&info.name)
            .bind(&rt.type_name)
            .bind(&rt.image_path)
            .bind(&rt.version)
            .bind(rt.privileged)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO worker_base_resource_types (worker_name, name, image, version, privileged)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (worker_name, name) DO NOTHING
                "#,
            )
            .bind(&info.name)
            .bind(&rt.type_name)
            .bind(&rt.image_path)
            .bind(&rt.version)
            .bind(rt.privileged)
            .execute(&mut *tx)
            .await?;
        }

        match &info.certs_path {
            Some(certs_path) => {
                sqlx::query(
                    "DELETE FROM worker_resource_certs WHERE worker_name = $1 AND certs_path <> $2",
                )
                .bind(&info.name)
                .bind(certs_path)
                .execute(&mut *tx)
                .await?;

                sqlx::query(
                    r#"
                    INSERT INTO worker_resource_certs (worker_name, certs_path)
                    VALUES ($1, $2)
                    ON CONFLICT (worker_name) DO NOTHING
                    "#,
                )
                .bind(&info.name)
                .bind(certs_path)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM worker_resource_certs WHERE worker_name = $1")
                    .bind(&info.name)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        debug!(worker = %info.name, resource_types = info.resource_types.len(), "Saved worker resources");
        Ok(())
    }

    async fn find_base_resource_type(
        &self,
        worker_name: &str,
        name: &str,
    ) -> DbResult<Option<WorkerBaseResourceType>> {
        let base = sqlx::query_as::<_, WorkerBaseResourceType>(
            "SELECT * FROM worker_base_resource_types WHERE worker_name = $1 AND name = $2",
        )
        .bind(worker_name)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(base)
    }

    async fn find_resource_certs(
        &self,
        worker_name: &str,
    ) -> DbResult<Option<WorkerResourceCerts>> {
        let certs = sqlx::query_as::<_, WorkerResourceCerts>(
            "SELECT * FROM worker_resource_certs WHERE worker_name = $1",
        )
        .bind(worker_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(certs)
    }
}
