//! Migration catalog: the `Migration` contract, the ordered registry and this
//! project's schema scripts.

pub use sea_orm_migration::prelude::{sea_orm, sea_query, DbErr, SchemaManager};

mod registry;

mod m20250823_000001_create_users; // keep filename + module name in sync
mod m20250823_000002_add_email_index;
mod m20250823_000003_create_orders;

pub use registry::{Migration, MigrationId, MigrationRegistry, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationCommand {
    Up,
    Status,
}

/// Explicit registration list for every schema change this project ships.
/// Registration order does not matter; the registry orders by identifier.
pub fn registry() -> Result<MigrationRegistry, RegistryError> {
    let mut registry = MigrationRegistry::new();
    registry
        .register(m20250823_000001_create_users::CreateUsers)?
        .register(m20250823_000002_add_email_index::AddEmailIndex)?
        .register(m20250823_000003_create_orders::CreateOrders)?;

    tracing::debug!(
        registered = registry.len(),
        last = ?registry.last_id(),
        "migration registry built"
    );
    Ok(registry)
}
