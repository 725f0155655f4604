//! Workflow locks on Postgres session advisory locks.
//!
//! Each lease owns a connection detached from the pool and holds
//! `pg_try_advisory_lock` on it. Release unlocks and closes the connection;
//! abandoning a lease drops the connection, and the server frees the lock
//! when the session ends. A crashed worker therefore never leaves a lock
//! behind.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Connection, PgConnection};
use tracing::debug;

use crate::error::Result;
use crate::lock::{LeaseRelease, LockBackend, LockScope, WorkflowKind, WorkflowLease};

/// Stable 64-bit advisory lock key for a scope string.
pub fn advisory_key(scope: &LockScope) -> i64 {
    let digest = Sha256::digest(scope.as_str().as_bytes());
    let mut key = [0u8; 8];
    key.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(key)
}

#[async_trait]
impl LockBackend for super::Db {
    async fn try_acquire(
        &self,
        scope: &LockScope,
        kind: WorkflowKind,
        holder_id: &str,
    ) -> Result<Option<WorkflowLease>> {
        let key = advisory_key(scope);
        let mut conn = self.pool().acquire().await?.detach();

        let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut conn)
            .await?;

        if !acquired {
            conn.close().await?;
            return Ok(None);
        }

        debug!(scope = %scope, key, holder = holder_id, "advisory lock acquired");
        Ok(Some(WorkflowLease::new(
            scope.clone(),
            kind,
            holder_id,
            Box::new(PgAdvisoryRelease { conn, key }),
        )))
    }
}

struct PgAdvisoryRelease {
    conn: PgConnection,
    key: i64,
}

#[async_trait]
impl LeaseRelease for PgAdvisoryRelease {
    async fn release(self: Box<Self>) -> Result<()> {
        let PgAdvisoryRelease { mut conn, key } = *self;
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        Ok(())
    }

    fn abandon(self: Box<Self>) {
        // Dropping the session connection ends the session, which frees
        // every advisory lock it held.
        drop(self);
    }
}
