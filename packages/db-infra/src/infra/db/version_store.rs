use std::collections::BTreeSet;

use migration::MigrationId;
use sea_orm::sea_query::{
    Alias, ColumnDef, Expr, Index, IntoTableRef, Order, Query, Table, TableRef,
};
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, DbErr, SqlErr, Statement,
};
use time::OffsetDateTime;
use tracing::debug;

use crate::config::ledger::{
    LedgerConfig, APPLIED_ON_COLUMN, DESCRIPTION_COLUMN, VERSION_COLUMN,
};
use crate::error::DbInfraError;

/// One successfully applied migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    pub id: MigrationId,
    pub description: String,
    pub applied_on: OffsetDateTime,
}

/// Durable ledger of applied migrations.
///
/// Rows are only ever inserted here; nothing in the runner updates or deletes
/// them.
pub struct VersionStore {
    conn: DatabaseConnection,
    ledger: LedgerConfig,
}

impl VersionStore {
    pub fn new(conn: DatabaseConnection, ledger: LedgerConfig) -> Self {
        Self { conn, ledger }
    }

    pub fn ledger(&self) -> &LedgerConfig {
        &self.ledger
    }

    fn backend(&self) -> DatabaseBackend {
        self.conn.get_database_backend()
    }

    /// Schema qualification only exists on Postgres; MySQL's "schema" is the
    /// connected database and SQLite has none.
    fn table_ref(&self) -> TableRef {
        match self.backend() {
            DatabaseBackend::Postgres => (
                Alias::new(&self.ledger.schema_name),
                Alias::new(&self.ledger.table_name),
            )
                .into_table_ref(),
            _ => Alias::new(&self.ledger.table_name).into_table_ref(),
        }
    }

    /// Create the ledger table and its unique index when absent.
    ///
    /// Uses `IF NOT EXISTS` DDL throughout; a concurrent creator winning the
    /// race on the system catalogs is treated as success.
    pub async fn ensure_schema(&self) -> Result<(), DbInfraError> {
        let backend = self.backend();

        if backend == DatabaseBackend::Postgres && self.ledger.owns_schema() {
            let sql = format!(
                "CREATE SCHEMA IF NOT EXISTS \"{}\"",
                self.ledger.schema_name
            );
            self.execute_ddl(Statement::from_string(backend, sql)).await?;
        }

        let mut create_table = Table::create();
        create_table
            .table(self.table_ref())
            .if_not_exists()
            .col(
                ColumnDef::new(Alias::new(VERSION_COLUMN))
                    .big_integer()
                    .not_null(),
            )
            .col(ColumnDef::new(Alias::new(DESCRIPTION_COLUMN)).text().null())
            .col(
                ColumnDef::new(Alias::new(APPLIED_ON_COLUMN))
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            );

        let mut unique_version = Index::create();
        unique_version
            .name(&self.ledger.unique_index_name)
            .table(self.table_ref())
            .col(Alias::new(VERSION_COLUMN))
            .unique();

        if backend == DatabaseBackend::MySql {
            // MySQL lacks CREATE INDEX IF NOT EXISTS; declare the key inline.
            create_table.index(&mut unique_version);
            self.execute_ddl(backend.build(&create_table)).await?;
        } else {
            self.execute_ddl(backend.build(&create_table)).await?;
            unique_version.if_not_exists();
            self.execute_ddl(backend.build(&unique_version)).await?;
        }

        debug!(ledger = %self.ledger.qualified_name(), "version ledger ready");
        Ok(())
    }

    async fn execute_ddl(&self, stmt: Statement) -> Result<(), DbInfraError> {
        match self.conn.execute(stmt).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                debug!(error = %e, "ledger DDL raced with another creator");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn ledger_exists(&self) -> Result<bool, DbInfraError> {
        let backend = self.backend();
        let stmt = match backend {
            DatabaseBackend::Postgres => Statement::from_sql_and_values(
                backend,
                "SELECT COUNT(*) AS cnt FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2",
                vec![
                    self.ledger.schema_name.clone().into(),
                    self.ledger.table_name.clone().into(),
                ],
            ),
            DatabaseBackend::MySql => Statement::from_sql_and_values(
                backend,
                "SELECT COUNT(*) AS cnt FROM information_schema.tables \
                 WHERE table_schema = DATABASE() AND table_name = ?",
                vec![self.ledger.table_name.clone().into()],
            ),
            DatabaseBackend::Sqlite => Statement::from_sql_and_values(
                backend,
                "SELECT COUNT(*) AS cnt FROM sqlite_master WHERE type = 'table' AND name = ?",
                vec![self.ledger.table_name.clone().into()],
            ),
        };

        let count = match self.conn.query_one(stmt).await? {
            Some(row) => row.try_get::<i64>("", "cnt")?,
            None => 0,
        };
        Ok(count > 0)
    }

    /// Identifiers already recorded. Runs as a plain statement, i.e. at the
    /// server's default isolation (read committed or stronger).
    pub async fn applied_ids(&self) -> Result<BTreeSet<MigrationId>, DbInfraError> {
        let select = Query::select()
            .column(Alias::new(VERSION_COLUMN))
            .from(self.table_ref())
            .to_owned();

        let rows = self.conn.query_all(self.backend().build(&select)).await?;
        rows.iter()
            .map(|row| {
                row.try_get::<i64>("", VERSION_COLUMN)
                    .map(MigrationId::from)
                    .map_err(DbInfraError::from)
            })
            .collect()
    }

    /// Like [`applied_ids`](Self::applied_ids) but `None` when the ledger has
    /// not been created yet.
    pub async fn try_applied_ids(&self) -> Result<Option<BTreeSet<MigrationId>>, DbInfraError> {
        if !self.ledger_exists().await? {
            return Ok(None);
        }
        self.applied_ids().await.map(Some)
    }

    /// Full ledger rows, ascending by identifier.
    pub async fn applied_records(&self) -> Result<Vec<VersionRecord>, DbInfraError> {
        let select = Query::select()
            .columns([VERSION_COLUMN, DESCRIPTION_COLUMN, APPLIED_ON_COLUMN].map(Alias::new))
            .from(self.table_ref())
            .order_by(Alias::new(VERSION_COLUMN), Order::Asc)
            .to_owned();

        let rows = self.conn.query_all(self.backend().build(&select)).await?;
        rows.iter()
            .map(|row| -> Result<VersionRecord, DbErr> {
                Ok(VersionRecord {
                    id: MigrationId::from(row.try_get::<i64>("", VERSION_COLUMN)?),
                    description: row
                        .try_get::<Option<String>>("", DESCRIPTION_COLUMN)?
                        .unwrap_or_default(),
                    applied_on: row.try_get::<OffsetDateTime>("", APPLIED_ON_COLUMN)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(DbInfraError::from)
    }

    /// Insert one ledger row on `conn`, normally the migration's own
    /// transaction. `applied_on` is left to the column default, so the
    /// database server's clock stamps it. A second row for the same
    /// identifier fails with [`DbInfraError::DuplicateMigration`].
    pub async fn record_applied<C>(
        &self,
        conn: &C,
        id: MigrationId,
        description: &str,
    ) -> Result<(), DbInfraError>
    where
        C: ConnectionTrait,
    {
        let mut insert = Query::insert();
        insert
            .into_table(self.table_ref())
            .columns([VERSION_COLUMN, DESCRIPTION_COLUMN].map(Alias::new));
        insert
            .values([id.value().into(), description.into()])
            .map_err(|e| DbInfraError::config(format!("failed to build ledger insert: {e}")))?;

        let stmt = conn.get_database_backend().build(&insert);
        match conn.execute(stmt).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(DbInfraError::DuplicateMigration { id })
            }
            Err(e) => Err(e.into()),
        }
    }
}
