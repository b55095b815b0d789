//! Postgres advisory locks.
//!
//! Named, cooperative, database-scoped locks used for single-flight work:
//! OAuth refresh, idempotent enqueue and single-runner-per-type. Each guard
//! owns a connection detached from the pool, so the session lock can never
//! leak back into the pool; dropping the guard closes the session and the
//! server releases the lock on all exit paths.

use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::{Connection, PgConnection, PgPool};
use tracing::warn;

/// Map a lock name to the bigint key space `pg_advisory_lock` expects.
pub fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

pub struct AdvisoryLockGuard {
    conn: PgConnection,
    key: i64,
    name: String,
}

impl AdvisoryLockGuard {
    /// Unlock and close the session gracefully. Dropping the guard without
    /// calling this still releases the lock when the connection closes.
    pub async fn release(mut self) -> Result<()> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut self.conn)
            .await
            .with_context(|| format!("unlock {}", self.name))?;
        if !released {
            warn!(lock = %self.name, "advisory unlock returned false");
        }
        self.conn.close().await.ok();
        Ok(())
    }
}

/// Try to take the named lock without waiting. `None` means another session
/// holds it.
pub async fn try_acquire(pool: &PgPool, name: &str) -> Result<Option<AdvisoryLockGuard>> {
    let key = lock_key(name);
    let mut conn = pool
        .acquire()
        .await
        .with_context(|| format!("acquire connection for lock {}", name))?
        .detach();

    let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
        .bind(key)
        .fetch_one(&mut conn)
        .await?;

    if locked {
        Ok(Some(AdvisoryLockGuard {
            conn,
            key,
            name: name.to_string(),
        }))
    } else {
        conn.close().await.ok();
        Ok(None)
    }
}

/// Poll for the named lock for up to `timeout`.
pub async fn acquire(
    pool: &PgPool,
    name: &str,
    timeout: Duration,
) -> Result<Option<AdvisoryLockGuard>> {
    let started = std::time::Instant::now();
    loop {
        if let Some(guard) = try_acquire(pool, name).await? {
            return Ok(Some(guard));
        }
        if started.elapsed() >= timeout {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

pub struct LockOutcome<T> {
    /// False when the lock could not be acquired within the timeout; the
    /// protected section still ran, unserialized.
    pub acquired: bool,
    pub value: T,
}

/// Run `f` under the named lock when possible. Failing to acquire is not
/// fatal: the section still runs and the caller is told via `acquired`.
pub async fn with_lock<T, F, Fut>(
    pool: &PgPool,
    name: &str,
    timeout: Duration,
    f: F,
) -> Result<LockOutcome<T>>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let guard = match acquire(pool, name, timeout).await {
        Ok(guard) => guard,
        Err(e) => {
            warn!(lock = %name, error = %e, "advisory lock acquisition errored");
            None
        }
    };
    let acquired = guard.is_some();
    if !acquired {
        warn!(lock = %name, "running without advisory lock");
    }

    let value = f().await;

    if let Some(guard) = guard {
        if let Err(e) = guard.release().await {
            warn!(lock = %name, error = %e, "advisory lock release failed");
        }
    }

    value.map(|value| LockOutcome { acquired, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_stable_and_distinct() {
        assert_eq!(lock_key("oauth_refresh"), lock_key("oauth_refresh"));
        assert_ne!(lock_key("oauth_refresh"), lock_key("runner:all"));
    }
}
