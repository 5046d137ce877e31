//! Advisory locks.
//!
//! Locks are try-only: `acquire` never blocks, it returns `None` when someone
//! else holds the lock and the caller decides how to wait.

use async_trait::async_trait;
use derive_more::Display;
use sqlx::{Connection, PgConnection};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use crate::DbResult;

/// Identifies what a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum LockId {
    /// Held while a volume record is being materialized on its worker.
    #[display("volume-creating:{_0}")]
    VolumeCreating(i64),
}

const VOLUME_CREATING_CLASS: i64 = 1;

impl LockId {
    /// Single 64-bit key for `pg_try_advisory_lock`. The top byte carries the
    /// lock class.
    pub fn key(&self) -> i64 {
        match self {
            LockId::VolumeCreating(id) => (VOLUME_CREATING_CLASS << 56) | (id & 0x00FF_FFFF_FFFF_FFFF),
        }
    }
}

/// A held lock.
#[async_trait]
pub trait Lock: Send {
    async fn release(self: Box<Self>) -> DbResult<()>;
}

#[async_trait]
pub trait LockFactory: Send + Sync {
    /// Try to take the lock. `None` means it is held elsewhere.
    async fn acquire(&self, id: LockId) -> DbResult<Option<Box<dyn Lock>>>;
}

/// Session-level Postgres advisory locks, all taken on one dedicated
/// connection.
///
/// Holding a lock never ties up a connection from the store pool, so any
/// number of volumes can be materialized at once. Postgres lets a session
/// take the same advisory lock twice, so locks held through this factory are
/// also tracked here.
#[derive(Clone)]
pub struct PgLockFactory {
    session: Arc<LockSession>,
}

impl PgLockFactory {
    pub async fn connect(database_url: &str) -> DbResult<Self> {
        let conn = PgConnection::connect(database_url).await?;
        Ok(Self {
            session: Arc::new(LockSession {
                conn: tokio::sync::Mutex::new(conn),
                held: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Number of locks currently held through this factory.
    pub fn held(&self) -> usize {
        self.session.held().len()
    }
}

#[async_trait]
impl LockFactory for PgLockFactory {
    async fn acquire(&self, id: LockId) -> DbResult<Option<Box<dyn Lock>>> {
        if !self.session.held().insert(id) {
            return Ok(None);
        }
        let mut reservation = Reservation {
            id,
            session: &self.session,
            armed: true,
        };

        if !self.session.try_lock(id).await? {
            return Ok(None);
        }

        reservation.armed = false;
        Ok(Some(Box::new(PgLock {
            id,
            session: Some(self.session.clone()),
        })))
    }
}

struct LockSession {
    conn: tokio::sync::Mutex<PgConnection>,
    held: Mutex<HashSet<LockId>>,
}

impl LockSession {
    fn held(&self) -> MutexGuard<'_, HashSet<LockId>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn try_lock(&self, id: LockId) -> DbResult<bool> {
        let mut conn = self.conn.lock().await;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(id.key())
            .fetch_one(&mut *conn)
            .await?;
        Ok(acquired)
    }

    async fn unlock(&self, id: LockId) -> DbResult<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(id.key())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

/// Forgets an in-process claim unless the database lock was taken.
struct Reservation<'a> {
    id: LockId,
    session: &'a LockSession,
    armed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.held().remove(&self.id);
        }
    }
}

pub struct PgLock {
    id: LockId,
    session: Option<Arc<LockSession>>,
}

#[async_trait]
impl Lock for PgLock {
    async fn release(mut self: Box<Self>) -> DbResult<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let result = session.unlock(self.id).await;
        // The session still holds the lock if unlocking failed.
        if result.is_ok() {
            session.held().remove(&self.id);
        }
        result
    }
}

impl Drop for PgLock {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let id = self.id;
        warn!(lock = %id, "Lock dropped without release, unlocking in the background");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match session.unlock(id).await {
                        Ok(()) => {
                            session.held().remove(&id);
                        }
                        Err(e) => warn!(lock = %id, error = %e, "Failed to unlock dropped lock"),
                    }
                });
            }
            Err(_) => warn!(lock = %id, "No runtime to unlock dropped lock, it stays held"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_keys_are_class_tagged() {
        let key = LockId::VolumeCreating(42).key();
        assert_eq!(key >> 56, VOLUME_CREATING_CLASS);
        assert_eq!(key & 0xFFFF, 42);
        assert_ne!(key, LockId::VolumeCreating(43).key());
    }
}
