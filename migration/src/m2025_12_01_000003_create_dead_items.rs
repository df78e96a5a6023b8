//! Migration to create the dead_items table.
//!
//! Records that exhausted their retry budget are parked here for operator
//! inspection instead of being dropped silently.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(DeadItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeadItems::ExternalId)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeadItems::Snapshot).json().not_null())
                    .col(
                        ColumnDef::new(DeadItems::AttemptCount)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(DeadItems::LastError).text().not_null())
                    .col(ColumnDef::new(DeadItems::FailedAt).timestamp().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeadItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum DeadItems {
    Table,
    ExternalId,
    Snapshot,
    AttemptCount,
    LastError,
    FailedAt,
}
