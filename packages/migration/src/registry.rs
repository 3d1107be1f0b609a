use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use sea_orm_migration::prelude::{DbErr, SchemaManager};
use thiserror::Error;

/// Globally unique, monotonically ordered migration identifier
/// (conventionally `yyyymmddNNNNNN`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationId(i64);

impl MigrationId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i64 {
        self.0
    }
}

impl From<i64> for MigrationId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A single forward schema change.
///
/// `up` receives a schema manager bound to the transaction the runner opened
/// for this migration alone; the runner records the ledger row in the same
/// transaction and commits both together.
#[async_trait]
pub trait Migration: Send + Sync {
    fn id(&self) -> MigrationId;

    fn description(&self) -> &str;

    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr>;

    /// Rollback step. Never invoked by the runner.
    async fn down(&self, _manager: &SchemaManager) -> Result<(), DbErr> {
        Err(DbErr::Migration(format!(
            "migration {} does not define a down step",
            self.id()
        )))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate migration identifier {id}: '{existing}' is already registered, cannot add '{incoming}'")]
    DuplicateIdentifier {
        id: MigrationId,
        existing: String,
        incoming: String,
    },
}

/// Catalog of available migrations keyed by identifier.
#[derive(Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<MigrationId, Box<dyn Migration>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M>(&mut self, migration: M) -> Result<&mut Self, RegistryError>
    where
        M: Migration + 'static,
    {
        self.register_boxed(Box::new(migration))
    }

    pub fn register_boxed(
        &mut self,
        migration: Box<dyn Migration>,
    ) -> Result<&mut Self, RegistryError> {
        let id = migration.id();
        if let Some(existing) = self.migrations.get(&id) {
            return Err(RegistryError::DuplicateIdentifier {
                id,
                existing: existing.description().to_string(),
                incoming: migration.description().to_string(),
            });
        }
        self.migrations.insert(id, migration);
        Ok(self)
    }

    /// Ascending by identifier. Each call starts a fresh pass over the catalog.
    pub fn list_ordered(&self) -> impl Iterator<Item = &dyn Migration> + '_ {
        self.migrations.values().map(|m| m.as_ref())
    }

    pub fn ids(&self) -> impl Iterator<Item = MigrationId> + '_ {
        self.migrations.keys().copied()
    }

    pub fn get(&self, id: MigrationId) -> Option<&dyn Migration> {
        self.migrations.get(&id).map(|m| m.as_ref())
    }

    pub fn contains(&self, id: MigrationId) -> bool {
        self.migrations.contains_key(&id)
    }

    pub fn last_id(&self) -> Option<MigrationId> {
        self.migrations.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.migrations.iter().map(|(id, m)| (id, m.description())))
            .finish()
    }
}
