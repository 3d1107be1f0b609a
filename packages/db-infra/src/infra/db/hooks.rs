//! Best-effort steps that run after a successful migration run.

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tracing::{debug, info};

use crate::error::DbInfraError;

/// Runs once the schema is consistent and the migration lock is released.
/// The runner logs failures and never propagates them.
#[async_trait]
pub trait PostMigrateHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, conn: &DatabaseConnection) -> Result<(), DbInfraError>;
}

pub struct NoopHook;

#[async_trait]
impl PostMigrateHook for NoopHook {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn run(&self, _conn: &DatabaseConnection) -> Result<(), DbInfraError> {
        Ok(())
    }
}

/// Lists the free-standing composite types the migration session can see
/// (its `search_path` schemas plus the ledger schema) and logs them. Clients
/// that cache type layouts must reconnect to pick up changes; this hook only
/// reports which types exist after the run.
pub struct PgReloadTypes {
    schema: String,
}

impl PgReloadTypes {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }

    /// Composite type names, ordered by schema then name.
    pub async fn composite_types<C>(&self, conn: &C) -> Result<Vec<String>, DbInfraError>
    where
        C: ConnectionTrait,
    {
        if conn.get_database_backend() != DatabaseBackend::Postgres {
            return Err(DbInfraError::config(
                "pg_reload_types requires a Postgres connection",
            ));
        }

        // Free-standing composite types only; every table also owns a row type.
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT t.typname AS name \
             FROM pg_type t \
             JOIN pg_namespace n ON n.oid = t.typnamespace \
             JOIN pg_class c ON c.oid = t.typrelid \
             WHERE (n.nspname = ANY(current_schemas(false)) OR n.nspname = $1) \
               AND t.typtype = 'c' AND c.relkind = 'c' \
             ORDER BY n.nspname, t.typname",
            vec![self.schema.clone().into()],
        );

        let rows = conn.query_all(stmt).await?;
        rows.iter()
            .map(|row| row.try_get::<String>("", "name").map_err(DbInfraError::from))
            .collect()
    }
}

#[async_trait]
impl PostMigrateHook for PgReloadTypes {
    fn name(&self) -> &'static str {
        "pg_reload_types"
    }

    async fn run(&self, conn: &DatabaseConnection) -> Result<(), DbInfraError> {
        let names = self.composite_types(conn).await?;
        info!(
            hook = self.name(),
            ledger_schema = %self.schema,
            composite_types = names.len(),
            types = ?names,
            "composite types after migration"
        );
        Ok(())
    }
}

/// Executes fixed refresh statements in order, stopping at the first failure.
pub struct SqlStatementsHook {
    statements: Vec<String>,
}

impl SqlStatementsHook {
    pub fn new(statements: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PostMigrateHook for SqlStatementsHook {
    fn name(&self) -> &'static str {
        "sql_statements"
    }

    async fn run(&self, conn: &DatabaseConnection) -> Result<(), DbInfraError> {
        for sql in &self.statements {
            debug!(hook = self.name(), sql = %sql, "running refresh statement");
            conn.execute_unprepared(sql).await?;
        }
        Ok(())
    }
}
