use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use migration::{MigrationCommand, MigrationRegistry};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::db::{sqlite_lock_path, DbKind, DbSettings};
use crate::config::ledger::LedgerConfig;
use crate::error::DbInfraError;
use crate::infra::db::diagnostics::migration_counters;
use crate::infra::db::hooks::{NoopHook, PgReloadTypes, PostMigrateHook};
use crate::infra::db::locking::{
    InMemoryLock, MigrationLock, MySqlNamedLock, PgAdvisoryLock, SqliteFileLock,
};
use crate::infra::db::runner::{MigrationReport, MigrationRunner, MigrationStatus, RunnerOptions};
use crate::infra::db::version_store::VersionStore;

/// Prefix for lock keys; see [`lock_key`].
const LOCK_KEY_PREFIX: &str = "schema-migrator:migrate";

#[derive(Debug)]
pub enum MigrationOutcome {
    Migrated(MigrationReport),
    Status(Vec<MigrationStatus>),
}

fn get_db_engine(db_kind: DbKind) -> &'static str {
    match db_kind {
        DbKind::Postgres => "postgresql",
        DbKind::MySql => "mysql",
        DbKind::SqliteFile | DbKind::SqliteMemory => "sqlite",
    }
}

async fn retry_connection<T, F, Fut>(
    mut connect_fn: F,
    max_attempts: u32,
    interval_ms: u64,
) -> Result<T, DbInfraError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbInfraError>>,
{
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match connect_fn().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        "connection_retry=success attempts={} interval_ms={}",
                        attempt, interval_ms
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                last_error = Some(e);
                if attempt < max_attempts {
                    warn!(
                        "connection_retry=failed attempt={} max_attempts={} interval_ms={}",
                        attempt, max_attempts, interval_ms
                    );
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| {
        DbInfraError::config("no error recorded after max attempts (this should not happen)")
    }))
}

/// Single-connection pool used for the lock and every migration transaction.
pub async fn build_admin_pool(settings: &DbSettings) -> Result<DatabaseConnection, DbInfraError> {
    let db_kind = settings.db_kind()?;

    let mut opt = ConnectOptions::new(settings.migration_connection_string.clone());
    opt.min_connections(1)
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(2))
        .sqlx_logging(true);

    let pool = match db_kind {
        DbKind::Postgres | DbKind::MySql => {
            retry_connection(
                || {
                    let opt_clone = opt.clone();
                    async move {
                        Database::connect(opt_clone).await.map_err(|e| {
                            DbInfraError::config(format!(
                                "failed to connect to {} (admin pool): {}",
                                get_db_engine(db_kind),
                                e
                            ))
                        })
                    }
                },
                5,
                500,
            )
            .await?
        }
        DbKind::SqliteFile | DbKind::SqliteMemory => Database::connect(opt)
            .await
            .map_err(|e| {
                DbInfraError::config(format!("failed to connect to database (admin pool): {}", e))
            })?,
    };

    if matches!(db_kind, DbKind::SqliteFile) {
        setup_sqlite_file_prerequisites(&pool).await?;
    }

    Ok(pool)
}

/// Sanitize database URL by masking password in connection strings.
/// Used for generating lock keys and logging.
pub fn sanitize_db_url(url: &str) -> String {
    let Some((auth_part, host_part)) = url.rsplit_once('@') else {
        return url.to_string();
    };
    let Some(scheme_end) = auth_part.find("://") else {
        return url.to_string();
    };
    match auth_part[scheme_end + 3..].find(':') {
        Some(colon_pos) => {
            let user_end = scheme_end + 3 + colon_pos;
            format!("{}:***@{}", &auth_part[..user_end], host_part)
        }
        None => url.to_string(),
    }
}

/// Connect with `settings` and run `command` against `registry`.
pub async fn orchestrate_migration(
    settings: &DbSettings,
    registry: MigrationRegistry,
    command: MigrationCommand,
    cancellation_token: CancellationToken,
) -> Result<MigrationOutcome, DbInfraError> {
    settings.validate()?;

    let admin_pool = build_admin_pool(settings).await?;

    let result = orchestrate_migration_internal(
        &admin_pool,
        settings,
        registry,
        command,
        cancellation_token,
    )
    .await;

    if let Err(e) = admin_pool.close().await {
        warn!(error = %e, "failed to close admin pool");
    }
    result
}

pub async fn orchestrate_migration_internal(
    pool: &DatabaseConnection,
    settings: &DbSettings,
    registry: MigrationRegistry,
    command: MigrationCommand,
    cancellation_token: CancellationToken,
) -> Result<MigrationOutcome, DbInfraError> {
    let db_kind = settings.db_kind()?;

    info!(
        "migrate=start command={:?} db_kind={:?} engine={} url={}",
        command,
        db_kind,
        get_db_engine(db_kind),
        sanitize_db_url(&settings.migration_connection_string)
    );

    let store = VersionStore::new(pool.clone(), settings.ledger.clone());
    let lock = lock_for(pool, settings, db_kind).await?;
    let mut runner = MigrationRunner::new(pool.clone(), Arc::new(registry), store, lock)
        .with_hook(hook_for(settings, db_kind))
        .with_options(RunnerOptions {
            lock_timeout: settings.lock_timeout(),
            body_timeout: settings.body_timeout(),
        })
        .with_cancellation_token(cancellation_token);

    let result = match command {
        MigrationCommand::Status => runner.status().await.map(MigrationOutcome::Status),
        MigrationCommand::Up => runner.migrate().await.map(MigrationOutcome::Migrated),
    };

    if let Err(ref e) = result {
        let error_msg = e.to_string();
        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            error!("sqlite_busy op=migrate err={:?}", e);
        }
    }

    info!("migrate=done");
    migration_counters::log_snapshot("migrate_orchestration");

    result
}

/// Lock key shared by every runner migrating the same ledger, whatever URL
/// spelling (host alias, user, query options) it connected with.
///
/// Postgres advisory locks are already scoped to the connected database, so
/// the ledger name is enough there. MySQL named locks are server-wide and
/// SQLite uses a file lock, so `database` qualifies the key when known.
fn lock_key(ledger: &LedgerConfig, database: Option<&str>) -> String {
    match database {
        Some(database) => format!("{}:{}:{}", LOCK_KEY_PREFIX, database, ledger.qualified_name()),
        None => format!("{}:{}", LOCK_KEY_PREFIX, ledger.qualified_name()),
    }
}

async fn current_mysql_database(pool: &DatabaseConnection) -> Result<String, DbInfraError> {
    let row = pool
        .query_one(Statement::from_string(
            DbBackend::MySql,
            "SELECT DATABASE() AS db",
        ))
        .await?
        .ok_or_else(|| DbInfraError::config("SELECT DATABASE() returned no row"))?;
    row.try_get::<Option<String>>("", "db")?
        .ok_or_else(|| DbInfraError::config("MySQL connection string names no database"))
}

async fn lock_for(
    pool: &DatabaseConnection,
    settings: &DbSettings,
    db_kind: DbKind,
) -> Result<Box<dyn MigrationLock>, DbInfraError> {
    Ok(match db_kind {
        DbKind::Postgres => {
            let key = lock_key(&settings.ledger, None);
            Box::new(PgAdvisoryLock::new(pool.clone(), &key))
        }
        DbKind::MySql => {
            let database = current_mysql_database(pool).await?;
            let key = lock_key(&settings.ledger, Some(&database));
            Box::new(MySqlNamedLock::new(pool.clone(), &key))
        }
        DbKind::SqliteFile => {
            let lock_path = sqlite_lock_path(&settings.migration_connection_string)?;
            Box::new(SqliteFileLock::new(&lock_path))
        }
        DbKind::SqliteMemory => Box::new(InMemoryLock),
    })
}

fn hook_for(settings: &DbSettings, db_kind: DbKind) -> Box<dyn PostMigrateHook> {
    match db_kind {
        DbKind::Postgres => Box::new(PgReloadTypes::new(settings.ledger.schema_name.clone())),
        _ => Box::new(NoopHook),
    }
}

async fn setup_sqlite_file_prerequisites(pool: &DatabaseConnection) -> Result<(), DbInfraError> {
    pool.execute(Statement::from_string(
        DbBackend::Sqlite,
        "PRAGMA journal_mode = WAL;",
    ))
    .await
    .map_err(|e| DbInfraError::config(format!("failed to set journal_mode: {}", e)))?;

    pool.execute(Statement::from_string(
        DbBackend::Sqlite,
        "PRAGMA synchronous = NORMAL;",
    ))
    .await
    .map_err(|e| DbInfraError::config(format!("failed to set synchronous: {}", e)))?;

    Ok(())
}
