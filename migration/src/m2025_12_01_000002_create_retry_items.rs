//! Migration to create the retry_items table.
//!
//! One row per record whose CRM sync failed, keyed by the record's external
//! id so re-enqueueing replaces the snapshot instead of stacking duplicates.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RetryItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RetryItems::ExternalId)
                            .text()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(RetryItems::Snapshot).json().not_null())
                    .col(
                        ColumnDef::new(RetryItems::EnqueuedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RetryItems::AttemptCount)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(RetryItems::NextAttemptAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RetryItems::LastError).text().not_null())
                    .col(
                        ColumnDef::new(RetryItems::UpdatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Index for picking due items in next_attempt_at order.
        manager
            .create_index(
                Index::create()
                    .name("idx_retry_items_next_attempt")
                    .table(RetryItems::Table)
                    .col(RetryItems::NextAttemptAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_retry_items_next_attempt")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(RetryItems::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RetryItems {
    Table,
    ExternalId,
    Snapshot,
    EnqueuedAt,
    AttemptCount,
    NextAttemptAt,
    LastError,
    UpdatedAt,
}
