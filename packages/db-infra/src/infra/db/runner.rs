use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use migration::{Migration, MigrationId, MigrationRegistry, SchemaManager};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, TransactionTrait};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::config::db::{DEFAULT_BODY_TIMEOUT_MS, DEFAULT_LOCK_TIMEOUT_MS};
use crate::error::DbInfraError;
use crate::infra::db::diagnostics::migration_counters;
use crate::infra::db::hooks::{NoopHook, PostMigrateHook};
use crate::infra::db::locking::{acquire_with_backoff, MigrationLock};
use crate::infra::db::version_store::VersionStore;

/// Lifecycle of one migration within a run. `Applied` is persisted; `Failed`
/// leaves the migration pending for the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Applying,
    Applied,
    Failed,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::Pending => "pending",
            MigrationState::Applying => "applying",
            MigrationState::Applied => "applied",
            MigrationState::Failed => "failed",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub id: MigrationId,
    pub description: String,
    pub state: MigrationState,
    pub applied_on: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Applied by this run, ascending.
    pub applied: Vec<MigrationId>,
    /// Already present in the ledger when the run started.
    pub already_applied: usize,
    pub elapsed: Duration,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    pub lock_timeout: Duration,
    pub body_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            body_timeout: Duration::from_millis(DEFAULT_BODY_TIMEOUT_MS),
        }
    }
}

/// Applies pending migrations, one transaction per migration, while holding
/// the cross-process migration lock.
pub struct MigrationRunner {
    conn: DatabaseConnection,
    registry: Arc<MigrationRegistry>,
    store: VersionStore,
    lock: Box<dyn MigrationLock>,
    hook: Box<dyn PostMigrateHook>,
    options: RunnerOptions,
    cancellation: CancellationToken,
}

impl MigrationRunner {
    pub fn new(
        conn: DatabaseConnection,
        registry: Arc<MigrationRegistry>,
        store: VersionStore,
        lock: Box<dyn MigrationLock>,
    ) -> Self {
        Self {
            conn,
            registry,
            store,
            lock,
            hook: Box::new(NoopHook),
            options: RunnerOptions::default(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_hook(mut self, hook: Box<dyn PostMigrateHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    /// Bring the database up to the newest registered migration.
    ///
    /// Safe to re-run after any failure: the pending set is recomputed from
    /// the ledger, so a run resumes at the first unapplied migration.
    pub async fn migrate(&mut self) -> Result<MigrationReport, DbInfraError> {
        let start = Instant::now();
        info!(
            migrate = "start",
            registered = self.registry.len(),
            ledger = %self.store.ledger().qualified_name()
        );

        if self.is_up_to_date().await? {
            info!("migrate=skipped up_to_date=true");
            self.run_post_migrate_hook().await;
            return Ok(MigrationReport {
                applied: Vec::new(),
                already_applied: self.registry.len(),
                elapsed: start.elapsed(),
            });
        }

        let guard = acquire_with_backoff(
            self.lock.as_mut(),
            self.options.lock_timeout,
            &self.cancellation,
        )
        .await?;

        let result = self.run_body().await;

        if let Err(release_err) = guard.release().await {
            warn!(error = %release_err, "Failed to release migration guard");
        }

        let mut report = result?;
        report.elapsed = start.elapsed();

        info!(
            migrate = "done",
            applied = report.applied.len(),
            already_applied = report.already_applied,
            elapsed_ms = report.elapsed.as_millis()
        );

        self.run_post_migrate_hook().await;
        Ok(report)
    }

    /// Registered migrations with their ledger state, ascending. Takes no lock
    /// and never creates the ledger.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>, DbInfraError> {
        let records = if self.store.ledger_exists().await? {
            self.store.applied_records().await?
        } else {
            Vec::new()
        };

        let applied: BTreeMap<MigrationId, OffsetDateTime> =
            records.iter().map(|r| (r.id, r.applied_on)).collect();
        self.warn_unknown_applied(applied.keys().copied());

        Ok(self
            .registry
            .list_ordered()
            .map(|m| {
                let applied_on = applied.get(&m.id()).copied();
                MigrationStatus {
                    id: m.id(),
                    description: m.description().to_string(),
                    state: if applied_on.is_some() {
                        MigrationState::Applied
                    } else {
                        MigrationState::Pending
                    },
                    applied_on,
                }
            })
            .collect())
    }

    async fn is_up_to_date(&self) -> Result<bool, DbInfraError> {
        migration_counters::schema_check();

        let Some(applied) = self.store.try_applied_ids().await? else {
            migration_counters::fast_path_miss();
            trace!(fastpath = "miss", reason = "ledger_missing");
            return Ok(false);
        };

        let pending = self.registry.ids().filter(|id| !applied.contains(id)).count();
        if pending == 0 {
            migration_counters::fast_path_hit();
            trace!(fastpath = "hit", applied_count = applied.len());
            Ok(true)
        } else {
            migration_counters::fast_path_miss();
            trace!(
                fastpath = "miss",
                applied_count = applied.len(),
                pending = pending,
                reason = "pending_migrations"
            );
            Ok(false)
        }
    }

    /// Body under the lock. Dropping the body future on timeout or
    /// cancellation drops the in-flight transaction uncommitted.
    async fn run_body(&self) -> Result<MigrationReport, DbInfraError> {
        let body_timeout = self.options.body_timeout;

        tokio::select! {
            biased;

            result = self.apply_pending() => result,
            _ = tokio::time::sleep(body_timeout) => {
                migration_counters::migration_body_timeout();
                info!(
                    timeout_ms = body_timeout.as_millis(),
                    "Migration body timeout - in-flight migration rolled back"
                );
                Err(DbInfraError::Cancelled {
                    message: format!(
                        "migration body execution timed out after {}ms",
                        body_timeout.as_millis()
                    ),
                })
            }
            _ = self.cancellation.cancelled() => {
                migration_counters::migration_cancelled();
                info!("Migration cancelled during body execution - in-flight migration rolled back");
                Err(DbInfraError::Cancelled {
                    message: "cancelled during body execution".to_string(),
                })
            }
        }
    }

    async fn apply_pending(&self) -> Result<MigrationReport, DbInfraError> {
        self.store.ensure_schema().await?;

        let applied = self.store.applied_ids().await?;
        self.warn_unknown_applied(applied.iter().copied());

        let pending: Vec<&dyn Migration> = self
            .registry
            .list_ordered()
            .filter(|m| !applied.contains(&m.id()))
            .collect();

        info!(
            migrate = "plan",
            pending = pending.len(),
            already_applied = applied.len()
        );

        let mut report = MigrationReport {
            already_applied: applied.len(),
            ..MigrationReport::default()
        };

        for migration in pending {
            self.apply_one(migration).await?;
            report.applied.push(migration.id());
        }

        self.verify_ledger().await?;
        Ok(report)
    }

    async fn apply_one(&self, migration: &dyn Migration) -> Result<(), DbInfraError> {
        let id = migration.id();
        let started = Instant::now();
        info!(
            migration_id = %id,
            description = migration.description(),
            state = %MigrationState::Applying
        );

        match self.apply_in_transaction(migration).await {
            Ok(()) => {
                migration_counters::migration_applied();
                info!(
                    migration_id = %id,
                    state = %MigrationState::Applied,
                    elapsed_ms = started.elapsed().as_millis()
                );
                Ok(())
            }
            Err(cause) => {
                migration_counters::migration_failed();
                let backend = self.conn.get_database_backend();
                if has_transactional_ddl(backend) {
                    error!(
                        migration_id = %id,
                        state = %MigrationState::Failed,
                        error = %cause,
                        "migration rolled back; later migrations not attempted"
                    );
                } else {
                    error!(
                        migration_id = %id,
                        state = %MigrationState::Failed,
                        backend = ?backend,
                        error = %cause,
                        "migration failed; DDL before the failure was committed implicitly, manual repair needed"
                    );
                }
                Err(failure_error(backend, id, cause))
            }
        }
    }

    async fn apply_in_transaction(&self, migration: &dyn Migration) -> Result<(), DbInfraError> {
        let txn = self.conn.begin().await?;

        let outcome = async {
            let manager = SchemaManager::new(&txn);
            migration.up(&manager).await?;
            self.store
                .record_applied(&txn, migration.id(), migration.description())
                .await
        }
        .await;

        match outcome {
            Ok(()) => {
                txn.commit().await?;
                Ok(())
            }
            Err(e) => {
                // Best-effort rollback; preserve original error
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(
                        migration_id = %migration.id(),
                        error = %rollback_err,
                        "rollback after failed migration returned error"
                    );
                }
                Err(e)
            }
        }
    }

    async fn verify_ledger(&self) -> Result<(), DbInfraError> {
        let applied = self.store.applied_ids().await?;
        let missing: Vec<MigrationId> = self
            .registry
            .ids()
            .filter(|id| !applied.contains(id))
            .collect();

        info!(
            migrate = "counts",
            expected_count = self.registry.len(),
            applied_count = applied.len()
        );

        if !missing.is_empty() {
            migration_counters::postcheck_mismatch();
            return Err(DbInfraError::Verification {
                message: format!(
                    "{} registered migration(s) missing from the ledger after the run: {:?}",
                    missing.len(),
                    missing.iter().map(|id| id.value()).collect::<Vec<_>>()
                ),
            });
        }
        Ok(())
    }

    /// Ledger rows the registry does not know come from a newer build. They
    /// are left untouched.
    fn warn_unknown_applied(&self, applied: impl Iterator<Item = MigrationId>) {
        let unknown: BTreeSet<MigrationId> =
            applied.filter(|id| !self.registry.contains(*id)).collect();
        for id in &unknown {
            warn!(migration_id = %id, "unknown_applied: ledger row has no registered migration");
        }
    }

    async fn run_post_migrate_hook(&self) {
        let hook = self.hook.name();
        match self.hook.run(&self.conn).await {
            Ok(()) => trace!(hook = hook, "post-migration hook done"),
            Err(e) => {
                migration_counters::hook_failed();
                warn!(hook = hook, error = %e, "post-migration hook failed");
            }
        }
    }
}

/// MySQL commits every DDL statement on its own; a rollback there only
/// undoes data changes.
fn has_transactional_ddl(backend: DatabaseBackend) -> bool {
    !matches!(backend, DatabaseBackend::MySql)
}

fn failure_error(backend: DatabaseBackend, id: MigrationId, cause: DbInfraError) -> DbInfraError {
    let cause = Box::new(cause);
    if has_transactional_ddl(backend) {
        DbInfraError::MigrationFailed { id, cause }
    } else {
        DbInfraError::PartialApply { id, cause }
    }
}
