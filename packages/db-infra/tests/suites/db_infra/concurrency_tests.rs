use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::join_all;
use test_support::ScriptedMigration;
use tokio::time::timeout;

use crate::common::{
    file_lock, file_pool, file_settings, ledger_versions, registry_of, runner_with_lock,
};

#[tokio::test]
async fn concurrent_runners_apply_each_migration_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let settings = file_settings(dir.path());

    // A slow first step keeps the winner inside its run while the others wait.
    let migrations = vec![
        ScriptedMigration::new(1, "create widgets")
            .delayed(Duration::from_millis(300))
            .sql("CREATE TABLE widgets (id INTEGER PRIMARY KEY)"),
        ScriptedMigration::new(2, "create gadgets")
            .sql("CREATE TABLE gadgets (id INTEGER PRIMARY KEY)"),
        ScriptedMigration::new(3, "seed widgets").sql("INSERT INTO widgets (id) VALUES (1)"),
    ];
    let counters: Vec<_> = migrations.iter().map(ScriptedMigration::runs).collect();
    let registry = registry_of(migrations);

    let n = 5usize;
    tracing::info!("sqlite_contention: launching {n} concurrent runners");

    let mut pools = Vec::with_capacity(n);
    for _ in 0..n {
        pools.push(file_pool(&settings).await);
    }

    let futs = pools.iter().map(|pool| {
        let registry = registry.clone();
        let settings = settings.clone();
        async move {
            let mut runner = runner_with_lock(pool, registry, Box::new(file_lock(&settings)));
            timeout(Duration::from_secs(10), runner.migrate()).await
        }
    });
    let results = join_all(futs).await;

    let mut applied_total = 0usize;
    for r in results {
        let report = r.expect("timeout").expect("migrate ok");
        applied_total += report.applied.len();
    }

    assert_eq!(applied_total, 3, "each migration applied by exactly one runner");
    for runs in counters {
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
    assert_eq!(ledger_versions(&pools[0]).await, vec![1, 2, 3]);
}

#[tokio::test]
async fn burst_after_completion_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let settings = file_settings(dir.path());
    let migrations = vec![
        ScriptedMigration::new(1, "create widgets")
            .sql("CREATE TABLE widgets (id INTEGER PRIMARY KEY)"),
    ];
    let runs = migrations[0].runs();
    let registry = registry_of(migrations);

    let pool = file_pool(&settings).await;
    runner_with_lock(&pool, registry.clone(), Box::new(file_lock(&settings)))
        .migrate()
        .await
        .unwrap();

    let futs = (0..3).map(|_| {
        let registry = registry.clone();
        let settings = settings.clone();
        async move {
            let pool = file_pool(&settings).await;
            runner_with_lock(&pool, registry, Box::new(file_lock(&settings)))
                .migrate()
                .await
        }
    });

    for result in join_all(futs).await {
        assert!(result.expect("migrate ok").is_noop());
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(ledger_versions(&pool).await, vec![1]);
}
