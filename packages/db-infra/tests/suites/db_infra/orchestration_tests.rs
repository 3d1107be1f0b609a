use db_infra::config::db::{load_settings, RuntimeEnv};
use db_infra::{orchestrate_migration, DbInfraError, MigrationOutcome, MigrationState};
use migration::MigrationCommand;
use tokio_util::sync::CancellationToken;

use crate::common::{file_pool, file_settings, ledger_versions, table_exists};

const PROJECT_IDS: [i64; 3] = [20250823000001, 20250823000002, 20250823000003];

#[tokio::test]
async fn project_migrations_apply_to_sqlite_file() {
    let dir = tempfile::tempdir().unwrap();
    let settings = file_settings(dir.path());
    let registry = migration::registry().unwrap();

    let outcome = orchestrate_migration(
        &settings,
        registry,
        MigrationCommand::Up,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let MigrationOutcome::Migrated(report) = outcome else {
        panic!("expected a migration report, got {outcome:?}");
    };
    let applied: Vec<i64> = report.applied.iter().map(|id| id.value()).collect();
    assert_eq!(applied, PROJECT_IDS);

    let pool = file_pool(&settings).await;
    assert_eq!(ledger_versions(&pool).await, PROJECT_IDS);
    assert!(table_exists(&pool, "users").await);
    assert!(table_exists(&pool, "orders").await);
}

#[tokio::test]
async fn status_after_up_reports_all_applied() {
    let dir = tempfile::tempdir().unwrap();
    let settings = file_settings(dir.path());

    orchestrate_migration(
        &settings,
        migration::registry().unwrap(),
        MigrationCommand::Up,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let outcome = orchestrate_migration(
        &settings,
        migration::registry().unwrap(),
        MigrationCommand::Status,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let MigrationOutcome::Status(status) = outcome else {
        panic!("expected status, got {outcome:?}");
    };
    assert_eq!(status.len(), 3);
    assert!(status.iter().all(|s| s.state == MigrationState::Applied));
}

#[tokio::test]
async fn settings_file_drives_a_full_run() {
    let dir = tempfile::tempdir().unwrap();
    let db_file = dir.path().join("app.db");
    let json = format!(
        r#"{{
            "DbSettings": {{
                "MigrationConnectionString": "sqlite://{}?mode=rwc",
                "LockTimeoutMs": 2000,
                "Ledger": {{ "TableName": "schema_versions" }}
            }}
        }}"#,
        db_file.display()
    );
    std::fs::write(dir.path().join("appsettings.Testing.json"), json).unwrap();

    let env = RuntimeEnv::new("Testing").unwrap();
    let settings = load_settings(&env, dir.path()).unwrap();

    orchestrate_migration(
        &settings,
        migration::registry().unwrap(),
        MigrationCommand::Up,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let pool = file_pool(&settings).await;
    assert!(table_exists(&pool, "schema_versions").await);
    assert!(!table_exists(&pool, "version_info").await);
    assert!(dir.path().join("app.db.migrate.lock").exists());
}

#[tokio::test]
async fn invalid_settings_fail_before_connecting() {
    let mut settings = file_settings(std::env::temp_dir().as_path());
    settings.body_timeout_ms = 0;

    let err = orchestrate_migration(
        &settings,
        migration::registry().unwrap(),
        MigrationCommand::Up,
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, DbInfraError::Config { .. }), "{err:?}");
}
