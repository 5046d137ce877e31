//! Container repository.

use async_trait::async_trait;
use berth_core::Handle;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "container_state", rename_all = "lowercase")]
pub enum ContainerState {
    Creating,
    Created,
    Failed,
}

/// Who a container belongs to. At most one non-failed container exists per
/// owner on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ContainerOwner {
    /// The container is addressed by a caller-chosen handle.
    #[display("handle:{_0}")]
    FixedHandle(Handle),
    /// The container runs one step of a build.
    #[display("build:{build_id}:{plan_id}:{team_id}")]
    BuildStep {
        build_id: i64,
        plan_id: String,
        team_id: i32,
    },
}

impl ContainerOwner {
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Handle a new container for this owner gets.
    pub fn new_handle(&self) -> Handle {
        match self {
            ContainerOwner::FixedHandle(handle) => handle.clone(),
            ContainerOwner::BuildStep { .. } => Handle::generate(),
        }
    }
}

/// Descriptive data kept alongside a container for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub step_name: Option<String>,
    pub step_type: Option<String>,
    pub build_id: Option<i64>,
    pub build_name: Option<String>,
    pub pipeline_name: Option<String>,
    pub job_name: Option<String>,
    pub working_directory: Option<String>,
    pub user: Option<String>,
}

/// Bookkeeping record for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContainerRecord {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub handle: Handle,
    pub worker_name: String,
    pub owner_key: String,
    pub state: ContainerState,
    #[sqlx(json)]
    pub metadata: ContainerMetadata,
    pub created_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn is_created(&self) -> bool {
        self.state == ContainerState::Created
    }
}

#[async_trait]
pub trait ContainerRepo: Send + Sync {
    /// Find the non-failed container for an owner on a worker.
    async fn find_container(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
    ) -> DbResult<Option<ContainerRecord>>;

    /// Create a container record in the creating state, or return the
    /// existing non-failed one for the owner.
    async fn create_container(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> DbResult<ContainerRecord>;

    async fn mark_container_created(&self, id: i64) -> DbResult<()>;

    async fn mark_container_failed(&self, id: i64) -> DbResult<()>;
}

/// PostgreSQL implementation of ContainerRepo.
pub struct PgContainerRepo {
    pool: PgPool,
}

impl PgContainerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContainerRepo for PgContainerRepo {
    async fn find_container(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
    ) -> DbResult<Option<ContainerRecord>> {
        let container = sqlx::query_as::<_, ContainerRecord>(
            r#"
            SELECT * FROM containers
            WHERE worker_name = $1 AND owner_key = $2 AND state <> 'failed'
            "#,
        )
        .bind(worker_name)
        .bind(owner.key())
        .fetch_optional(&self.pool)
        .await?;
        Ok(container)
    }

    async fn create_container(
        &self,
        worker_name: &str,
        owner: &ContainerOwner,
        metadata: &ContainerMetadata,
    ) -> DbResult<ContainerRecord> {
        let inserted = sqlx::query_as::<_, ContainerRecord>(
            r#"
            INSERT INTO containers (handle, worker_name, owner_key, state, metadata, created_at)
            VALUES ($1, $2, $3, 'creating', $4, NOW())
            ON CONFLICT (worker_name, owner_key) WHERE state <> 'failed'
            DO NOTHING
            RETURNING *
            "#,
        )
        .bind(owner.new_handle().as_str())
        .bind(worker_name)
        .bind(owner.key())
        .bind(sqlx::types::Json(metadata))
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(container) => Ok(container),
            None => self
                .find_container(worker_name, owner)
                .await?
                .ok_or_else(|| DbError::Duplicate(format!("container for {}", owner))),
        }
    }

    async fn mark_container_created(&self, id: i64) -> DbResult<()> {
        let updated: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE containers SET state = 'created'
            WHERE id = $1 AND state IN ('creating', 'created')
            RETURNING id
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        updated
            .map(|_| ())
            .ok_or_else(|| DbError::InvalidState(format!("container {} is failed or missing", id)))
    }

    async fn mark_container_failed(&self, id: i64) -> DbResult<()> {
        sqlx::query("UPDATE containers SET state = 'failed' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_keys_are_distinct() {
        let fixed = ContainerOwner::FixedHandle(Handle::from("abc"));
        let step = ContainerOwner::BuildStep {
            build_id: 42,
            plan_id: "plan-1".to_string(),
            team_id: 7,
        };
        assert_eq!(fixed.key(), "handle:abc");
        assert_eq!(step.key(), "build:42:plan-1:7");
    }

    #[test]
    fn test_fixed_owner_keeps_handle() {
        let fixed = ContainerOwner::FixedHandle(Handle::from("abc"));
        assert_eq!(fixed.new_handle(), Handle::from("abc"));

        let step = ContainerOwner::BuildStep {
            build_id: 1,
            plan_id: "p".to_string(),
            team_id: 1,
        };
        assert_ne!(step.new_handle(), step.new_handle());
    }
}
