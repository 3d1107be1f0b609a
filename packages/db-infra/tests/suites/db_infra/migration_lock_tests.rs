use std::time::Duration;

use db_infra::infra::db::{acquire_with_backoff, InMemoryLock, MigrationLock, SqliteFileLock};
use db_infra::{DbInfraError, RunnerOptions};
use tokio_util::sync::CancellationToken;

use crate::common::{
    file_lock, file_pool, file_settings, ledger_versions, registry_of, runner_with_lock,
    standard_migrations, table_exists,
};

fn lock_in(dir: &std::path::Path) -> SqliteFileLock {
    SqliteFileLock::new(&dir.join("app.db.migrate.lock"))
}

#[tokio::test]
async fn sqlite_file_lock_is_exclusive_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = lock_in(dir.path());
    let mut second = lock_in(dir.path());

    let guard = first.try_acquire().await.unwrap().expect("first acquire");
    assert!(guard.is_held());
    assert!(second.try_acquire().await.unwrap().is_none());

    guard.release().await.unwrap();

    let again = second.try_acquire().await.unwrap();
    assert!(again.is_some(), "lock should be free after release");
}

#[tokio::test]
async fn dropping_guard_releases_sqlite_file_lock() {
    let dir = tempfile::tempdir().unwrap();
    let mut first = lock_in(dir.path());
    let mut second = lock_in(dir.path());

    let guard = first.try_acquire().await.unwrap().expect("first acquire");
    drop(guard);

    assert!(second.try_acquire().await.unwrap().is_some());
}

#[tokio::test]
async fn sqlite_file_lock_creates_missing_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let nested = dir.path().join("a").join("b").join("db.migrate.lock");
    let mut lock = SqliteFileLock::new(&nested);

    let guard = lock.try_acquire().await.unwrap();

    assert!(guard.is_some());
    assert!(nested.exists());
}

#[tokio::test]
async fn in_memory_lock_always_acquires() {
    let mut lock = InMemoryLock;
    let a = lock.try_acquire().await.unwrap();
    let b = lock.try_acquire().await.unwrap();
    assert!(a.is_some() && b.is_some());
}

#[tokio::test]
async fn acquire_times_out_while_another_holder_keeps_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let _held = lock_in(dir.path())
        .try_acquire()
        .await
        .unwrap()
        .expect("holder");

    let mut contender = lock_in(dir.path());
    let err = acquire_with_backoff(
        &mut contender,
        Duration::from_millis(200),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    match err {
        DbInfraError::LockTimeout { elapsed, attempts } => {
            assert!(elapsed >= Duration::from_millis(200));
            assert!(attempts > 1, "expected retries, got {attempts}");
        }
        other => panic!("expected LockTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn acquire_succeeds_once_holder_releases() {
    let dir = tempfile::tempdir().unwrap();
    let held = lock_in(dir.path())
        .try_acquire()
        .await
        .unwrap()
        .expect("holder");

    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        held.release().await.unwrap();
    });

    let mut contender = lock_in(dir.path());
    let guard = acquire_with_backoff(
        &mut contender,
        Duration::from_secs(5),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    releaser.await.unwrap();

    assert!(guard.is_held());
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let _held = lock_in(dir.path())
        .try_acquire()
        .await
        .unwrap()
        .expect("holder");

    let token = CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        })
    };

    let mut contender = lock_in(dir.path());
    let err = acquire_with_backoff(&mut contender, Duration::from_secs(30), &token)
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, DbInfraError::Cancelled { .. }), "{err:?}");
}

#[tokio::test]
async fn runner_gives_up_without_touching_schema_when_lock_is_held() {
    let dir = tempfile::tempdir().unwrap();
    let settings = file_settings(dir.path());
    let pool = file_pool(&settings).await;

    let _held = file_lock(&settings)
        .try_acquire()
        .await
        .unwrap()
        .expect("holder");

    let mut runner = runner_with_lock(
        &pool,
        registry_of(standard_migrations()),
        Box::new(file_lock(&settings)),
    )
    .with_options(RunnerOptions {
        lock_timeout: Duration::from_millis(200),
        body_timeout: Duration::from_secs(30),
    });

    let err = runner.migrate().await.unwrap_err();

    assert!(matches!(err, DbInfraError::LockTimeout { .. }), "{err:?}");
    assert!(err.is_retryable());
    assert!(!table_exists(&pool, "version_info").await);
    assert!(!table_exists(&pool, "widgets").await);
}

#[tokio::test]
async fn runner_releases_lock_after_failure() {
    let dir = tempfile::tempdir().unwrap();
    let settings = file_settings(dir.path());
    let pool = file_pool(&settings).await;

    let broken = test_support::ScriptedMigration::new(1, "broken").sql("NOT VALID SQL");
    let mut runner = runner_with_lock(
        &pool,
        registry_of([broken]),
        Box::new(file_lock(&settings)),
    );
    runner.migrate().await.unwrap_err();

    assert!(ledger_versions(&pool).await.is_empty());
    let guard = file_lock(&settings).try_acquire().await.unwrap();
    assert!(guard.is_some(), "lock must not outlive a failed run");
}
