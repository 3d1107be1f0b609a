use sea_orm_migration::prelude::*;

use crate::m20250823_000001_create_users::Users;
use crate::{Migration, MigrationId};

pub struct AddEmailIndex;

const INDEX_NAME: &str = "ux_users_email";

#[async_trait::async_trait]
impl Migration for AddEmailIndex {
    fn id(&self) -> MigrationId {
        MigrationId::new(20250823000002)
    }

    fn description(&self) -> &str {
        "add_email_index"
    }

    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_index(
                Index::create()
                    .name(INDEX_NAME)
                    .table(Users::Table)
                    .col(Users::Email)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name(INDEX_NAME).table(Users::Table).to_owned())
            .await
    }
}
