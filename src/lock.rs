/// Global lock module
///
/// Operator-controlled pause switch for the scheduler. The coordinator
/// checks it before a run and between harvests; administrators flip it via
/// the /pause and /resume commands. Last write wins, no fairness semantics.
/// Injected as a trait so tests can substitute an in-memory flag.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::sync::atomic::{AtomicBool, Ordering};

const LOCK_KEY: &str = "scheduler_locked";

#[async_trait]
pub trait GlobalLock: Send + Sync {
    async fn is_locked(&self) -> Result<bool>;
    async fn lock(&self) -> Result<()>;
    async fn unlock(&self) -> Result<()>;
}

/// Lock state persisted in the settings table, shared across restarts.
pub struct PgLock {
    pool: PgPool,
}

impl PgLock {
    pub fn new(pool: PgPool) -> Self {
        PgLock { pool }
    }

    async fn set(&self, value: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(LOCK_KEY)
        .bind(if value { "true" } else { "false" })
        .execute(&self.pool)
        .await
        .context("Failed to write scheduler lock")?;
        Ok(())
    }
}

#[async_trait]
impl GlobalLock for PgLock {
    async fn is_locked(&self) -> Result<bool> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = $1")
            .bind(LOCK_KEY)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read scheduler lock")?;

        Ok(match row {
            Some(row) => row.try_get::<String, _>("value")? == "true",
            None => false,
        })
    }

    async fn lock(&self) -> Result<()> {
        self.set(true).await
    }

    async fn unlock(&self) -> Result<()> {
        self.set(false).await
    }
}

/// Process-local lock used by tests and dry runs.
#[derive(Default)]
pub struct MemoryLock {
    locked: AtomicBool,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn locked(locked: bool) -> Self {
        MemoryLock {
            locked: AtomicBool::new(locked),
        }
    }
}

#[async_trait]
impl GlobalLock for MemoryLock {
    async fn is_locked(&self) -> Result<bool> {
        Ok(self.locked.load(Ordering::SeqCst))
    }

    async fn lock(&self) -> Result<()> {
        self.locked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_lock_toggles() {
        let lock = MemoryLock::new();
        assert!(!lock.is_locked().await.unwrap());
        lock.lock().await.unwrap();
        assert!(lock.is_locked().await.unwrap());
        lock.unlock().await.unwrap();
        assert!(!lock.is_locked().await.unwrap());
    }
}
