//! Postgres-only behavior: advisory locking across sessions, transactional
//! DDL rollback, custom ledger schemas and the composite-type hook.
//!
//! Run against a scratch database:
//!   PG_TEST_URL=postgres://postgres@localhost:5432/scratch \
//!     cargo test -p db-infra --test db_infra_tests --features pg-tests postgres

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use db_infra::config::db::DbSettings;
use db_infra::infra::db::{MigrationLock, PgAdvisoryLock, PgReloadTypes};
use db_infra::{build_admin_pool, orchestrate_migration, DbInfraError, MigrationOutcome, VersionStore};
use futures::future::join_all;
use migration::{MigrationCommand, MigrationRegistry};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use test_support::{unique_str, ScriptedMigration};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn pg_url() -> String {
    std::env::var("PG_TEST_URL").expect("PG_TEST_URL must point at a scratch Postgres database")
}

/// Same database, different connection string.
fn other_spelling(url: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}application_name=migrator_b")
}

fn scratch_schema() -> String {
    unique_str("mig").replace('-', "_").to_lowercase()
}

fn settings(url: &str, schema: &str) -> DbSettings {
    let mut settings = DbSettings::new(url);
    settings.ledger.schema_name = schema.to_string();
    settings.lock_timeout_ms = 15_000;
    settings
}

fn registry_from(migrations: &[ScriptedMigration]) -> MigrationRegistry {
    let mut registry = MigrationRegistry::new();
    for m in migrations {
        registry.register(m.clone()).expect("unique ids");
    }
    registry
}

async fn relation_exists(pool: &DatabaseConnection, schema: &str, name: &str) -> bool {
    pool.query_one(Statement::from_sql_and_values(
        DatabaseBackend::Postgres,
        "SELECT COUNT(*) AS cnt FROM information_schema.tables \
         WHERE table_schema = $1 AND table_name = $2",
        vec![schema.into(), name.into()],
    ))
    .await
    .ok()
    .flatten()
    .and_then(|row| row.try_get::<i64>("", "cnt").ok())
    .unwrap_or(0)
        > 0
}

async fn applied(settings: &DbSettings) -> Vec<i64> {
    let pool = build_admin_pool(settings).await.expect("pool");
    let store = VersionStore::new(pool, settings.ledger.clone());
    store
        .applied_ids()
        .await
        .expect("ledger")
        .into_iter()
        .map(|id| id.value())
        .collect()
}

async fn drop_schema(schema: &str) {
    let pool = build_admin_pool(&DbSettings::new(pg_url())).await.expect("pool");
    let _ = pool
        .execute_unprepared(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
        .await;
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore)]
async fn pg_burst_across_url_spellings_applies_each_migration_once() {
    let url = pg_url();
    let schema = scratch_schema();

    let migrations = vec![
        ScriptedMigration::new(1, "create widgets and widget_dims")
            .delayed(Duration::from_millis(500))
            .sql(&format!("CREATE TABLE \"{schema}\".widgets (id integer PRIMARY KEY)"))
            .sql(&format!("CREATE TYPE \"{schema}\".widget_dims AS (w integer, h integer)")),
        ScriptedMigration::new(2, "create gadgets")
            .sql(&format!("CREATE TABLE \"{schema}\".gadgets (id integer PRIMARY KEY)")),
    ];
    let counters: Vec<_> = migrations.iter().map(ScriptedMigration::runs).collect();

    let n = 4usize;
    tracing::info!("pg_contention: launching {n} runners over two url spellings");
    let futs = (0..n).map(|i| {
        let url = if i % 2 == 0 { url.clone() } else { other_spelling(&url) };
        let settings = settings(&url, &schema);
        let registry = registry_from(&migrations);
        async move {
            timeout(
                Duration::from_secs(20),
                orchestrate_migration(
                    &settings,
                    registry,
                    MigrationCommand::Up,
                    CancellationToken::new(),
                ),
            )
            .await
        }
    });

    let mut applied_total = 0usize;
    for r in join_all(futs).await {
        match r.expect("timeout").expect("migrate ok") {
            MigrationOutcome::Migrated(report) => applied_total += report.applied.len(),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(applied_total, 2);
    for runs in counters {
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
    assert_eq!(applied(&settings(&url, &schema)).await, vec![1, 2]);

    drop_schema(&schema).await;
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore)]
async fn pg_failed_migration_rolls_back_its_ddl() {
    let url = pg_url();
    let schema = scratch_schema();
    let settings = settings(&url, &schema);
    let fail = Arc::new(AtomicBool::new(true));

    let migrations = vec![ScriptedMigration::new(1, "create widgets")
        .sql(&format!("CREATE TABLE \"{schema}\".widgets (id integer PRIMARY KEY)"))
        .fail_when(fail.clone())];

    let err = orchestrate_migration(
        &settings,
        registry_from(&migrations),
        MigrationCommand::Up,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, DbInfraError::MigrationFailed { .. }), "{err:?}");
    let pool = build_admin_pool(&settings).await.unwrap();
    assert!(!relation_exists(&pool, &schema, "widgets").await);
    assert!(applied(&settings).await.is_empty());

    fail.store(false, Ordering::SeqCst);
    orchestrate_migration(
        &settings,
        registry_from(&migrations),
        MigrationCommand::Up,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(relation_exists(&pool, &schema, "widgets").await);
    assert_eq!(applied(&settings).await, vec![1]);

    drop_schema(&schema).await;
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore)]
async fn pg_custom_ledger_schema_is_created_on_first_run() {
    let url = pg_url();
    let schema = scratch_schema();
    let settings = settings(&url, &schema);
    let pool = build_admin_pool(&settings).await.unwrap();

    let store = VersionStore::new(pool.clone(), settings.ledger.clone());
    assert!(!store.ledger_exists().await.unwrap());

    orchestrate_migration(
        &settings,
        registry_from(&[ScriptedMigration::new(1, "noop")]),
        MigrationCommand::Up,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(store.ledger_exists().await.unwrap());
    assert!(relation_exists(&pool, &schema, "version_info").await);
    assert_eq!(applied(&settings).await, vec![1]);

    drop_schema(&schema).await;
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore)]
async fn pg_advisory_lock_excludes_other_sessions() {
    let url = pg_url();
    let key = unique_str("pg-lock");
    let session_a = build_admin_pool(&DbSettings::new(url.clone())).await.unwrap();
    let session_b = build_admin_pool(&DbSettings::new(other_spelling(&url))).await.unwrap();

    let mut lock_a = PgAdvisoryLock::new(session_a, &key);
    let mut lock_b = PgAdvisoryLock::new(session_b, &key);

    let guard = lock_a.try_acquire().await.unwrap().expect("first session wins");
    assert!(lock_b.try_acquire().await.unwrap().is_none());

    guard.release().await.unwrap();

    let guard_b = lock_b.try_acquire().await.unwrap();
    assert!(guard_b.is_some(), "lock should be free after release");
    if let Some(guard) = guard_b {
        guard.release().await.unwrap();
    }
}

#[tokio::test]
#[cfg_attr(not(feature = "pg-tests"), ignore)]
async fn pg_reload_types_sees_types_on_the_search_path() {
    let url = pg_url();
    let schema = scratch_schema();
    let pool = build_admin_pool(&DbSettings::new(url)).await.unwrap();

    pool.execute_unprepared(&format!("CREATE SCHEMA \"{schema}\""))
        .await
        .unwrap();
    pool.execute_unprepared(&format!("SET search_path TO \"{schema}\""))
        .await
        .unwrap();
    pool.execute_unprepared("CREATE TYPE line_item AS (sku text, quantity integer)")
        .await
        .unwrap();

    // The ledger schema is the default, yet the type lives on the search path.
    let types = PgReloadTypes::new("public")
        .composite_types(&pool)
        .await
        .unwrap();
    assert!(types.contains(&"line_item".to_string()), "{types:?}");

    drop_schema(&schema).await;
}
