// Standard library imports
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

// External crate imports
use async_trait::async_trait;
use rand::Rng;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use xxhash_rust::xxh3::xxh3_64;

// Internal crate imports
use crate::error::DbInfraError;
use crate::infra::db::diagnostics::migration_counters;

pub fn pg_lock_id(key: &str) -> i64 {
    xxh3_64(key.as_bytes()) as i64
}

/// MySQL caps lock names at 64 characters; hash long keys down.
pub fn mysql_lock_name(key: &str) -> String {
    format!("migrate:{:016x}", xxh3_64(key.as_bytes()))
}

// ============================================================================
// MigrationLock Trait and Implementations
// ============================================================================

enum Held {
    Postgres {
        admin_pool: DatabaseConnection,
        lock_key: i64,
    },
    MySql {
        admin_pool: DatabaseConnection,
        lock_name: String,
    },
    SqliteFile {
        file: File,
        lock_path: PathBuf,
    },
    InMemory,
}

/// A held migration lock.
///
/// Database-level locks are session scoped: if the holding process dies the
/// server ends the session and the lock goes with it. File locks are dropped
/// by the OS when the handle closes.
pub struct Guard {
    held: Option<Held>,
}

impl Guard {
    fn new(held: Held) -> Self {
        Self { held: Some(held) }
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Release the lock. Idempotent; unlock failures are logged, not returned,
    /// unless the unlock result cannot be read at all.
    pub async fn release(mut self) -> Result<(), DbInfraError> {
        match self.held.take() {
            Some(held) => release_held(held).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard").field("held", &self.is_held()).finish()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };

        match held {
            // Closing the handle releases the OS lock.
            Held::SqliteFile { .. } | Held::InMemory => {}
            remote => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    debug!("migration guard dropped while held; releasing in background");
                    handle.spawn(async move {
                        if let Err(e) = release_held(remote).await {
                            warn!(error = %e, "background migration lock release failed");
                        }
                    });
                }
                Err(_) => {
                    warn!("migration guard dropped outside a runtime; lock ends with the session");
                }
            },
        }
    }
}

async fn release_held(held: Held) -> Result<(), DbInfraError> {
    match held {
        Held::SqliteFile { file, lock_path } => {
            use fs4::fs_std::FileExt;

            match FileExt::unlock(&file) {
                Ok(()) => {
                    debug!(lock_path = %lock_path.display(), "SQLite file lock released");
                }
                Err(e) => {
                    // The handle is dropped right after, which releases the lock anyway.
                    debug!(
                        error = %e,
                        lock_path = %lock_path.display(),
                        "SQLite file unlock returned error (may be benign)"
                    );
                }
            }
            Ok(())
        }
        Held::InMemory => Ok(()),
        Held::Postgres {
            admin_pool,
            lock_key,
        } => {
            let stmt = Statement::from_sql_and_values(
                DatabaseBackend::Postgres,
                "SELECT pg_advisory_unlock($1) AS unlocked",
                vec![lock_key.into()],
            );

            match admin_pool.query_one(stmt).await {
                Ok(Some(row)) => {
                    let unlocked: bool = row.try_get("", "unlocked").map_err(|e| {
                        DbInfraError::config(format!("failed to read unlock result: {e}"))
                    })?;
                    if !unlocked {
                        warn!(
                            code = "PG_UNLOCK_FALSE",
                            lock_key = lock_key,
                            "Advisory lock unlock returned false"
                        );
                    }
                }
                Ok(None) => {
                    warn!(lock_key = lock_key, "No result from advisory lock unlock query");
                }
                Err(e) => {
                    warn!(error = %e, lock_key = lock_key, "Failed to unlock advisory lock");
                }
            }
            Ok(())
        }
        Held::MySql {
            admin_pool,
            lock_name,
        } => {
            let stmt = Statement::from_sql_and_values(
                DatabaseBackend::MySql,
                "SELECT RELEASE_LOCK(?) AS released",
                vec![lock_name.clone().into()],
            );

            match admin_pool.query_one(stmt).await {
                Ok(Some(row)) => {
                    let released: Option<i64> = row.try_get("", "released").map_err(|e| {
                        DbInfraError::config(format!("failed to read release result: {e}"))
                    })?;
                    if released != Some(1) {
                        warn!(
                            code = "MYSQL_RELEASE_NOT_OWNED",
                            lock_name = %lock_name,
                            released = ?released,
                            "Named lock release did not report ownership"
                        );
                    }
                }
                Ok(None) => {
                    warn!(lock_name = %lock_name, "No result from RELEASE_LOCK query");
                }
                Err(e) => {
                    warn!(error = %e, lock_name = %lock_name, "Failed to release named lock");
                }
            }
            Ok(())
        }
    }
}

/// Cross-process mutual exclusion for a whole migration run.
#[async_trait]
pub trait MigrationLock: Send + Sync {
    /// Try to acquire the lock (non-blocking).
    /// Returns Some(Guard) if acquired, None if already held by another process.
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError>;
}

/// PostgreSQL session-level advisory lock on the admin pool.
pub struct PgAdvisoryLock {
    admin_pool: DatabaseConnection,
    lock_key: i64,
}

impl PgAdvisoryLock {
    /// INVARIANT: the admin pool is configured with **min=max=1** so every
    /// checkout reuses the session that holds the advisory lock, including the
    /// per-migration transactions.
    pub fn new(admin_pool: DatabaseConnection, key: &str) -> Self {
        Self {
            admin_pool,
            lock_key: pg_lock_id(key),
        }
    }
}

#[async_trait]
impl MigrationLock for PgAdvisoryLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        let lock_stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_try_advisory_lock($1) AS locked",
            vec![self.lock_key.into()],
        );

        let result = self
            .admin_pool
            .query_one(lock_stmt)
            .await
            .map_err(|e| DbInfraError::config(format!("failed to acquire advisory lock: {e}")))?;

        let locked: bool = match result {
            Some(row) => row
                .try_get("", "locked")
                .map_err(|e| DbInfraError::config(format!("failed to read lock result: {e}")))?,
            None => {
                return Err(DbInfraError::config(
                    "pg_try_advisory_lock returned no row",
                ))
            }
        };

        if !locked {
            return Ok(None);
        }

        Ok(Some(Guard::new(Held::Postgres {
            admin_pool: self.admin_pool.clone(),
            lock_key: self.lock_key,
        })))
    }
}

/// MySQL/MariaDB named lock (`GET_LOCK` with a zero wait).
pub struct MySqlNamedLock {
    admin_pool: DatabaseConnection,
    lock_name: String,
}

impl MySqlNamedLock {
    /// Same single-session invariant as [`PgAdvisoryLock::new`].
    pub fn new(admin_pool: DatabaseConnection, key: &str) -> Self {
        Self {
            admin_pool,
            lock_name: mysql_lock_name(key),
        }
    }
}

#[async_trait]
impl MigrationLock for MySqlNamedLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::MySql,
            "SELECT GET_LOCK(?, 0) AS locked",
            vec![self.lock_name.clone().into()],
        );

        let row = self
            .admin_pool
            .query_one(stmt)
            .await
            .map_err(|e| DbInfraError::config(format!("failed to acquire named lock: {e}")))?
            .ok_or_else(|| DbInfraError::config("GET_LOCK returned no row"))?;

        // 1 = acquired, 0 = held elsewhere, NULL = server error
        let locked: Option<i64> = row
            .try_get("", "locked")
            .map_err(|e| DbInfraError::config(format!("failed to read lock result: {e}")))?;

        match locked {
            Some(1) => Ok(Some(Guard::new(Held::MySql {
                admin_pool: self.admin_pool.clone(),
                lock_name: self.lock_name.clone(),
            }))),
            Some(_) => Ok(None),
            None => Err(DbInfraError::config(format!(
                "GET_LOCK('{}') returned NULL",
                self.lock_name
            ))),
        }
    }
}

/// OS-level exclusive lock on `<db>.migrate.lock` for file-backed SQLite.
pub struct SqliteFileLock {
    lock_path: PathBuf,
}

impl SqliteFileLock {
    /// Takes a normalized lock file path (all processes must resolve the same on-disk lock file).
    pub fn new(lock_path: &Path) -> Self {
        Self {
            lock_path: lock_path.to_path_buf(),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

#[async_trait]
impl MigrationLock for SqliteFileLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        use fs4::fs_std::FileExt;

        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DbInfraError::config(format!(
                        "failed to create lock file parent directory: {e}"
                    ))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| DbInfraError::config(format!("failed to open lock file: {e}")))?;

        // Ok(true) = acquired, Ok(false) = would block
        match FileExt::try_lock_exclusive(&file) {
            Ok(true) => {
                debug!(lock_path = %self.lock_path.display(), "SQLite file lock acquired");
                Ok(Some(Guard::new(Held::SqliteFile {
                    file,
                    lock_path: self.lock_path.clone(),
                })))
            }
            Ok(false) => {
                debug!(
                    lock_path = %self.lock_path.display(),
                    "SQLite file lock contended (would block)"
                );
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!(
                    lock_path = %self.lock_path.display(),
                    "SQLite file lock contended (would block error)"
                );
                Ok(None)
            }
            Err(e) => Err(DbInfraError::config(format!(
                "failed to acquire SQLite file lock: {e}"
            ))),
        }
    }
}

/// No-op lock for in-process databases, which only one process can reach.
pub struct InMemoryLock;

#[async_trait]
impl MigrationLock for InMemoryLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, DbInfraError> {
        Ok(Some(Guard::new(Held::InMemory)))
    }
}

/// Poll `lock` with capped exponential backoff until it is acquired, `timeout`
/// elapses ([`DbInfraError::LockTimeout`]) or `cancellation` fires.
pub async fn acquire_with_backoff(
    lock: &mut dyn MigrationLock,
    timeout: Duration,
    cancellation: &CancellationToken,
) -> Result<Guard, DbInfraError> {
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        if let Some(guard) = lock.try_acquire().await? {
            migration_counters::add_lock_acquire_attempts(attempts as usize);
            migration_counters::lock_acquired();
            trace!(
                lock = "won",
                attempts = attempts,
                elapsed_ms = start.elapsed().as_millis()
            );
            return Ok(guard);
        }

        if start.elapsed() >= timeout {
            migration_counters::add_lock_acquire_attempts(attempts as usize);
            migration_counters::lock_acquire_timeout();
            return Err(DbInfraError::LockTimeout {
                elapsed: start.elapsed(),
                attempts,
            });
        }

        let base_delay_ms = (5u64 << attempts.saturating_sub(1).min(16)).min(80);
        let jitter_ms = rand::rng().random::<u64>() % 4;
        let delay_ms = base_delay_ms + jitter_ms;

        trace!(
            lock = "backoff",
            attempts = attempts,
            delay_ms = delay_ms,
            elapsed_ms = start.elapsed().as_millis()
        );
        migration_counters::lock_backoff_event();

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            _ = cancellation.cancelled() => {
                info!(
                    elapsed_ms = start.elapsed().as_millis(),
                    attempts = attempts,
                    "Migration cancelled during acquire backoff"
                );
                return Err(DbInfraError::Cancelled {
                    message: format!(
                        "cancelled during lock acquire backoff after {}ms",
                        start.elapsed().as_millis()
                    ),
                });
            }
        }
    }
}
